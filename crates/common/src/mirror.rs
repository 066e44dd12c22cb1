//! Mirror configuration and runtime status types.
//!
//! A mirror is a named source→destination replication job. Its configuration
//! is created by the control plane and never mutated by the engine; runtime
//! state lives in the catalog.

use std::{
    collections::BTreeSet,
    fmt,
    str::FromStr,
};

use serde::{
    Deserialize,
    Serialize,
};

use crate::errors::ErrorMetadata;

/// Unique identifier of a mirror. Arbitrary printable names are allowed; the
/// replication-object names derived from it pass through
/// [`sanitize_ident`](crate::identifiers::sanitize_ident).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MirrorName(String);

impl MirrorName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for MirrorName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > 255 || s.contains('\0') {
            anyhow::bail!(ErrorMetadata::config(
                "InvalidMirrorName",
                format!("invalid mirror name {s:?}"),
            ));
        }
        Ok(MirrorName(s.to_owned()))
    }
}

impl fmt::Display for MirrorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One replicated table: where it comes from and where it lands.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMapping {
    pub source_schema: String,
    pub source_table: String,
    pub destination_schema: String,
    pub destination_table: String,
    #[serde(default)]
    pub partition_key: Option<String>,
    #[serde(default)]
    pub excluded_columns: Vec<String>,
}

impl TableMapping {
    pub fn source_ref(&self) -> String {
        format!("{}.{}", self.source_schema, self.source_table)
    }

    pub fn destination_ref(&self) -> String {
        format!("{}.{}", self.destination_schema, self.destination_table)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
pub enum ResyncStrategy {
    /// Truncate destinations and refill; destination data has a visible gap.
    #[default]
    Truncate,
    /// Rebuild through `_resync` shadow tables and swap atomically.
    Swap,
}

/// Per-mirror settings, all overridable in the mirror config. Defaults match
/// the documented configuration table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
pub struct SyncOptions {
    pub max_batch_size: usize,
    pub idle_timeout_seconds: u64,
    pub standby_status_interval_seconds: u64,
    pub snapshot_rows_per_partition: u64,
    /// Partitions of one table copied concurrently.
    pub snapshot_parallel_workers: usize,
    pub snapshot_tables_in_parallel: usize,
    pub resync_strategy: ResyncStrategy,
    pub replicate_indexes: bool,
    pub replicate_foreign_keys: bool,
    /// When false the mirror skips the snapshot phase and starts streaming
    /// from the slot's creation point.
    pub initial_snapshot: bool,
    /// Whether Terminate also drops the destination tables.
    pub drop_destination_tables: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            idle_timeout_seconds: 60,
            standby_status_interval_seconds: 10,
            snapshot_rows_per_partition: 250_000,
            snapshot_parallel_workers: 8,
            snapshot_tables_in_parallel: 4,
            resync_strategy: ResyncStrategy::Truncate,
            replicate_indexes: true,
            replicate_foreign_keys: true,
            initial_snapshot: true,
            drop_destination_tables: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
}

impl SslMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
        }
    }
}

impl FromStr for SslMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "disable" => SslMode::Disable,
            "prefer" => SslMode::Prefer,
            "require" => SslMode::Require,
            other => anyhow::bail!("unknown ssl mode {other:?}"),
        })
    }
}

/// A stored database endpoint. Password handling and TLS negotiation details
/// belong to the control plane; the engine only turns this into a driver
/// config.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: i64,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    #[serde(default)]
    pub ssl_mode: SslMode,
}

impl PeerConfig {
    pub fn pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .user(&self.username)
            .password(&self.password)
            .dbname(&self.database)
            .ssl_mode(match self.ssl_mode {
                SslMode::Disable => tokio_postgres::config::SslMode::Disable,
                SslMode::Prefer => tokio_postgres::config::SslMode::Prefer,
                SslMode::Require => tokio_postgres::config::SslMode::Require,
            });
        config
    }
}

/// Immutable definition of a mirror. Created once by the control plane;
/// the engine only reads it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorConfig {
    pub name: MirrorName,
    pub source_peer: PeerConfig,
    pub destination_peer: PeerConfig,
    pub table_mappings: Vec<TableMapping>,
    #[serde(default)]
    pub options: SyncOptions,
}

impl MirrorConfig {
    /// Control-plane validation run before any workflow starts.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.table_mappings.is_empty() {
            anyhow::bail!(ErrorMetadata::config(
                "EmptyTableMapping",
                format!("mirror {} maps no tables", self.name),
            ));
        }
        let mut seen = BTreeSet::new();
        for mapping in &self.table_mappings {
            if !seen.insert((&mapping.source_schema, &mapping.source_table)) {
                anyhow::bail!(ErrorMetadata::config(
                    "DuplicateTableMapping",
                    format!(
                        "mirror {} maps {} more than once",
                        self.name,
                        mapping.source_ref(),
                    ),
                ));
            }
        }
        Ok(())
    }

    pub fn mapping_for_source(&self, schema: &str, table: &str) -> Option<&TableMapping> {
        self.table_mappings
            .iter()
            .find(|m| m.source_schema == schema && m.source_table == table)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
pub enum MirrorStatus {
    Created,
    SettingUp,
    Snapshot,
    Running,
    Pausing,
    Paused,
    Resyncing,
    SyncingSchema,
    Terminating,
    Terminated,
    Failed,
}

impl MirrorStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, MirrorStatus::Terminated)
    }
}

impl fmt::Display for MirrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MirrorStatus::Created => "created",
            MirrorStatus::SettingUp => "setting_up",
            MirrorStatus::Snapshot => "snapshot",
            MirrorStatus::Running => "running",
            MirrorStatus::Pausing => "pausing",
            MirrorStatus::Paused => "paused",
            MirrorStatus::Resyncing => "resyncing",
            MirrorStatus::SyncingSchema => "syncing_schema",
            MirrorStatus::Terminating => "terminating",
            MirrorStatus::Terminated => "terminated",
            MirrorStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for MirrorStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "created" => MirrorStatus::Created,
            "setting_up" => MirrorStatus::SettingUp,
            "snapshot" => MirrorStatus::Snapshot,
            "running" => MirrorStatus::Running,
            "pausing" => MirrorStatus::Pausing,
            "paused" => MirrorStatus::Paused,
            "resyncing" => MirrorStatus::Resyncing,
            "syncing_schema" => MirrorStatus::SyncingSchema,
            "terminating" => MirrorStatus::Terminating,
            "terminated" => MirrorStatus::Terminated,
            "failed" => MirrorStatus::Failed,
            other => anyhow::bail!("unknown mirror status {other:?}"),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableStatus {
    Pending,
    Copying,
    Synced,
    Resyncing,
    Error,
}

impl fmt::Display for TableStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TableStatus::Pending => "pending",
            TableStatus::Copying => "copying",
            TableStatus::Synced => "synced",
            TableStatus::Resyncing => "resyncing",
            TableStatus::Error => "error",
        };
        f.write_str(s)
    }
}

impl FromStr for TableStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => TableStatus::Pending,
            "copying" => TableStatus::Copying,
            "synced" => TableStatus::Synced,
            "resyncing" => TableStatus::Resyncing,
            "error" => TableStatus::Error,
            other => anyhow::bail!("unknown table status {other:?}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn mapping(schema: &str, table: &str) -> TableMapping {
        TableMapping {
            source_schema: schema.to_owned(),
            source_table: table.to_owned(),
            destination_schema: schema.to_owned(),
            destination_table: table.to_owned(),
            partition_key: None,
            excluded_columns: vec![],
        }
    }

    fn peer(name: &str) -> PeerConfig {
        PeerConfig {
            id: 1,
            name: name.to_owned(),
            host: "localhost".to_owned(),
            port: 5432,
            username: "postgres".to_owned(),
            password: "postgres".to_owned(),
            database: "app".to_owned(),
            ssl_mode: SslMode::Disable,
        }
    }

    #[test]
    fn validate_rejects_duplicate_mappings() {
        let config = MirrorConfig {
            name: MirrorName::from_str("m1").unwrap(),
            source_peer: peer("src"),
            destination_peer: peer("dst"),
            table_mappings: vec![mapping("public", "accounts"), mapping("public", "accounts")],
            options: SyncOptions::default(),
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn validate_rejects_empty_mappings() {
        let config = MirrorConfig {
            name: MirrorName::from_str("m1").unwrap(),
            source_peer: peer("src"),
            destination_peer: peer("dst"),
            table_mappings: vec![],
            options: SyncOptions::default(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn sync_options_defaults_match_documented_table() {
        let options = SyncOptions::default();
        assert_eq!(options.max_batch_size, 1000);
        assert_eq!(options.idle_timeout_seconds, 60);
        assert_eq!(options.standby_status_interval_seconds, 10);
        assert_eq!(options.snapshot_rows_per_partition, 250_000);
        assert_eq!(options.snapshot_parallel_workers, 8);
        assert_eq!(options.snapshot_tables_in_parallel, 4);
        assert_eq!(options.resync_strategy, ResyncStrategy::Truncate);
        assert!(options.replicate_indexes);
        assert!(options.replicate_foreign_keys);
    }

    #[test]
    fn sync_options_deserializes_partial_overrides() {
        let options: SyncOptions = serde_json::from_str(r#"{"max_batch_size": 50}"#).unwrap();
        assert_eq!(options.max_batch_size, 50);
        assert_eq!(options.idle_timeout_seconds, 60);
    }

    #[test]
    fn statuses_roundtrip_through_text() {
        for status in [
            MirrorStatus::Created,
            MirrorStatus::SettingUp,
            MirrorStatus::Snapshot,
            MirrorStatus::Running,
            MirrorStatus::Pausing,
            MirrorStatus::Paused,
            MirrorStatus::Resyncing,
            MirrorStatus::SyncingSchema,
            MirrorStatus::Terminating,
            MirrorStatus::Terminated,
            MirrorStatus::Failed,
        ] {
            assert_eq!(
                MirrorStatus::from_str(&status.to_string()).unwrap(),
                status
            );
        }
        for status in [
            TableStatus::Pending,
            TableStatus::Copying,
            TableStatus::Synced,
            TableStatus::Resyncing,
            TableStatus::Error,
        ] {
            assert_eq!(TableStatus::from_str(&status.to_string()).unwrap(), status);
        }
    }
}
