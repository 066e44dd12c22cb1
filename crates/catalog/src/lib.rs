//! Catalog store: the engine's persisted state.
//!
//! Mirror definitions, per-mirror runtime state (replication cursor, batch
//! id, status, error counters), per-table sync progress, captured foreign
//! key/index definitions, an append-only event log, and peers. The event log
//! is observability only; the engine writes it and never reads it back.

mod connection;
mod sql;

use std::{
    str::FromStr,
    sync::Arc,
};

use anyhow::Context as _;
use chrono::{
    DateTime,
    Utc,
};
use common::{
    errors::ErrorMetadata,
    mirror::PeerConfig,
    Lsn,
    MirrorConfig,
    MirrorName,
    MirrorStatus,
    TableStatus,
};
use serde_json::Value as JsonValue;

pub use crate::connection::{
    CatalogConnection,
    CatalogPool,
};
use crate::sql::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

impl EventLevel {
    fn as_str(self) -> &'static str {
        match self {
            EventLevel::Info => "INFO",
            EventLevel::Warn => "WARN",
            EventLevel::Error => "ERROR",
        }
    }
}

/// One row of `mirror_state`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MirrorStateRow {
    pub mirror_name: String,
    pub slot_name: Option<String>,
    pub publication_name: Option<String>,
    pub last_lsn: Lsn,
    pub last_sync_batch_id: i64,
    pub status: MirrorStatus,
    pub error_message: Option<String>,
    pub error_count: i32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableSyncRow {
    pub table_name: String,
    pub status: TableStatus,
    pub rows_synced: i64,
    pub rows_inserted: i64,
    pub rows_updated: i64,
    pub error_message: Option<String>,
}

#[derive(Clone, Debug)]
pub struct CapturedForeignKey {
    pub def: schema::ForeignKeyDef,
    pub dropped_at: Option<DateTime<Utc>>,
    pub recreated_at: Option<DateTime<Utc>>,
}

pub struct CatalogStore {
    pool: Arc<CatalogPool>,
}

impl CatalogStore {
    /// Connects and idempotently creates the catalog schema and tables.
    pub async fn new(
        config: tokio_postgres::Config,
        schema_name: Option<&str>,
    ) -> anyhow::Result<Self> {
        let pool = CatalogPool::new(config, schema_name.unwrap_or("bunny_catalog"))?;
        let store = CatalogStore { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        for statement in INIT_SQL {
            conn.batch_execute(statement).await?;
        }
        Ok(())
    }

    async fn conn(&self) -> anyhow::Result<CatalogConnection<'_>> {
        self.pool.get_connection().await
    }

    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    // ------------------------------------------------------------------
    // Mirrors
    // ------------------------------------------------------------------

    /// Registers a new mirror in `Created` status. Duplicate names are a
    /// configuration error surfaced synchronously to the control plane.
    pub async fn insert_mirror(&self, config: &MirrorConfig) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        let config_json = serde_json::to_value(config)?;
        let inserted = conn
            .execute(
                INSERT_MIRROR_SQL,
                &[
                    &config.name.as_str(),
                    &config.source_peer.id,
                    &config.destination_peer.id,
                    &config_json,
                    &MirrorStatus::Created.to_string(),
                ],
            )
            .await?;
        if inserted == 0 {
            anyhow::bail!(ErrorMetadata::config(
                "DuplicateMirror",
                format!("mirror {} already exists", config.name),
            ));
        }
        conn.execute(
            INIT_MIRROR_STATE_SQL,
            &[
                &config.name.as_str(),
                &MirrorStatus::Created.to_string(),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn get_mirror(&self, name: &MirrorName) -> anyhow::Result<Option<MirrorConfig>> {
        let mut conn = self.conn().await?;
        let Some(row) = conn.query_opt(GET_MIRROR_SQL, &[&name.as_str()]).await? else {
            return Ok(None);
        };
        let config_json: JsonValue = row.try_get(0)?;
        Ok(Some(serde_json::from_value(config_json)?))
    }

    /// Removes a mirror and everything it owns, in one transaction.
    pub async fn delete_mirror(&self, name: &MirrorName) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        let mut txn = conn.transaction().await?;
        for statement in DELETE_MIRROR_CASCADE_SQL {
            txn.execute(statement, &[&name.as_str()]).await?;
        }
        txn.commit().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Mirror runtime state
    // ------------------------------------------------------------------

    pub async fn get_state(&self, name: &MirrorName) -> anyhow::Result<Option<MirrorStateRow>> {
        let mut conn = self.conn().await?;
        let Some(row) = conn.query_opt(GET_STATE_SQL, &[&name.as_str()]).await? else {
            return Ok(None);
        };
        Ok(Some(MirrorStateRow {
            mirror_name: row.try_get(0)?,
            slot_name: row.try_get(1)?,
            publication_name: row.try_get(2)?,
            last_lsn: Lsn::from_i64(row.try_get(3)?),
            last_sync_batch_id: row.try_get(4)?,
            status: MirrorStatus::from_str(row.try_get(5)?)?,
            error_message: row.try_get(6)?,
            error_count: row.try_get(7)?,
        }))
    }

    pub async fn set_replication_objects(
        &self,
        name: &MirrorName,
        slot_name: &str,
        publication_name: &str,
    ) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        conn.execute(
            SET_REPLICATION_OBJECTS_SQL,
            &[&name.as_str(), &slot_name, &publication_name],
        )
        .await?;
        Ok(())
    }

    /// Moves both the `mirrors` row and the `mirror_state` row to `status`.
    pub async fn set_status(&self, name: &MirrorName, status: MirrorStatus) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        let status = status.to_string();
        conn.execute(SET_MIRROR_STATUS_SQL, &[&name.as_str(), &status])
            .await?;
        conn.execute(SET_STATE_STATUS_SQL, &[&name.as_str(), &status])
            .await?;
        Ok(())
    }

    /// Advances the replication cursor. `last_lsn` is monotonic
    /// non-decreasing by construction (`GREATEST`); the batch id increments
    /// only when the batch produced output.
    pub async fn advance_cursor(
        &self,
        name: &MirrorName,
        lsn: Lsn,
        produced_output: bool,
    ) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        let bump: i64 = if produced_output { 1 } else { 0 };
        let updated = conn
            .execute(ADVANCE_CURSOR_SQL, &[&name.as_str(), &lsn.to_i64(), &bump])
            .await?;
        anyhow::ensure!(
            updated == 1,
            ErrorMetadata::fatal(
                "MirrorStateMissing",
                format!("mirror_state row for {name} vanished"),
            ),
        );
        Ok(())
    }

    /// Resets the cursor after a full-mirror swap resync so CDC restarts
    /// cleanly from the new slot position.
    pub async fn reset_cursor(&self, name: &MirrorName) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        conn.execute(RESET_CURSOR_SQL, &[&name.as_str()]).await?;
        Ok(())
    }

    pub async fn record_error(&self, name: &MirrorName, message: &str) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        conn.execute(RECORD_ERROR_SQL, &[&name.as_str(), &message])
            .await?;
        Ok(())
    }

    pub async fn clear_error(&self, name: &MirrorName) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        conn.execute(CLEAR_ERROR_SQL, &[&name.as_str()]).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Per-table sync status
    // ------------------------------------------------------------------

    pub async fn set_table_status(
        &self,
        name: &MirrorName,
        table: &str,
        status: TableStatus,
    ) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        conn.execute(
            UPSERT_TABLE_STATUS_SQL,
            &[&name.as_str(), &table, &status.to_string()],
        )
        .await?;
        Ok(())
    }

    /// Accumulates row counters for a table; also stamps `last_synced_at`.
    pub async fn record_table_progress(
        &self,
        name: &MirrorName,
        table: &str,
        rows_synced: i64,
        rows_inserted: i64,
        rows_updated: i64,
    ) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        conn.execute(
            RECORD_TABLE_PROGRESS_SQL,
            &[
                &name.as_str(),
                &table,
                &rows_synced,
                &rows_inserted,
                &rows_updated,
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn set_table_error(
        &self,
        name: &MirrorName,
        table: &str,
        message: &str,
    ) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        conn.execute(
            SET_TABLE_ERROR_SQL,
            &[&name.as_str(), &table, &message],
        )
        .await?;
        Ok(())
    }

    pub async fn list_table_statuses(&self, name: &MirrorName) -> anyhow::Result<Vec<TableSyncRow>> {
        let mut conn = self.conn().await?;
        let rows = conn.query(LIST_TABLE_STATUS_SQL, &[&name.as_str()]).await?;
        let mut statuses = Vec::with_capacity(rows.len());
        for row in rows {
            statuses.push(TableSyncRow {
                table_name: row.try_get(0)?,
                status: TableStatus::from_str(row.try_get(1)?)?,
                rows_synced: row.try_get(2)?,
                rows_inserted: row.try_get(3)?,
                rows_updated: row.try_get(4)?,
                error_message: row.try_get(5)?,
            });
        }
        Ok(statuses)
    }

    // ------------------------------------------------------------------
    // Captured foreign keys and indexes
    // ------------------------------------------------------------------

    /// Records a foreign key before it is dropped so it can be recreated
    /// later. Captured definitions are never deleted while the mirror
    /// exists.
    pub async fn capture_foreign_key(
        &self,
        name: &MirrorName,
        fk: &schema::ForeignKeyDef,
    ) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        conn.execute(
            CAPTURE_FOREIGN_KEY_SQL,
            &[
                &name.as_str(),
                &fk.table_ref(),
                &fk.constraint_name,
                &fk.definition,
                &format!("{}.{}", fk.referenced_schema, fk.referenced_table),
                &fk.on_delete,
                &fk.on_update,
                &fk.is_deferrable,
                &fk.initially_deferred,
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn mark_foreign_key_recreated(
        &self,
        name: &MirrorName,
        table_ref: &str,
        constraint: &str,
    ) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        conn.execute(
            MARK_FOREIGN_KEY_RECREATED_SQL,
            &[&name.as_str(), &table_ref, &constraint],
        )
        .await?;
        Ok(())
    }

    pub async fn list_captured_foreign_keys(
        &self,
        name: &MirrorName,
    ) -> anyhow::Result<Vec<CapturedForeignKey>> {
        let mut conn = self.conn().await?;
        let rows = conn
            .query(LIST_CAPTURED_FOREIGN_KEYS_SQL, &[&name.as_str()])
            .await?;
        let mut fks = Vec::with_capacity(rows.len());
        for row in rows {
            let table_ref: String = row.try_get(0)?;
            let target_ref: String = row.try_get(4)?;
            let (table_schema, table_name) = split_ref(&table_ref)?;
            let (referenced_schema, referenced_table) = split_ref(&target_ref)?;
            fks.push(CapturedForeignKey {
                def: schema::ForeignKeyDef {
                    constraint_name: row.try_get(1)?,
                    table_schema,
                    table_name,
                    referenced_schema,
                    referenced_table,
                    definition: row.try_get(2)?,
                    on_delete: row.try_get(3)?,
                    on_update: row.try_get(5)?,
                    is_deferrable: row.try_get(6)?,
                    initially_deferred: row.try_get(7)?,
                },
                dropped_at: row.try_get(8)?,
                recreated_at: row.try_get(9)?,
            });
        }
        Ok(fks)
    }

    pub async fn capture_index(
        &self,
        name: &MirrorName,
        index: &schema::IndexDef,
    ) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        conn.execute(
            CAPTURE_INDEX_SQL,
            &[
                &name.as_str(),
                &index.schema,
                &index.table,
                &index.name,
                &index.definition,
                &index.is_unique,
                &index.is_primary,
                &index.index_type,
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn list_captured_indexes(
        &self,
        name: &MirrorName,
    ) -> anyhow::Result<Vec<schema::IndexDef>> {
        let mut conn = self.conn().await?;
        let rows = conn
            .query(LIST_CAPTURED_INDEXES_SQL, &[&name.as_str()])
            .await?;
        let mut indexes = Vec::with_capacity(rows.len());
        for row in rows {
            indexes.push(schema::IndexDef {
                schema: row.try_get(0)?,
                table: row.try_get(1)?,
                name: row.try_get(2)?,
                definition: row.try_get(3)?,
                is_unique: row.try_get(4)?,
                is_primary: row.try_get(5)?,
                index_type: row.try_get(6)?,
            });
        }
        Ok(indexes)
    }

    // ------------------------------------------------------------------
    // Event log and peers
    // ------------------------------------------------------------------

    /// Append-only; failures are swallowed after logging since losing an
    /// event must never fail the operation that emitted it.
    pub async fn log_event(
        &self,
        name: &MirrorName,
        level: EventLevel,
        message: &str,
        details: Option<JsonValue>,
    ) {
        let result = async {
            let mut conn = self.conn().await?;
            conn.execute(
                INSERT_EVENT_SQL,
                &[&name.as_str(), &level.as_str(), &message, &details],
            )
            .await?;
            anyhow::Ok(())
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(mirror = %name, "failed to append mirror event: {e:#}");
        }
    }

    pub async fn upsert_peer(&self, peer: &PeerConfig) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        conn.execute(
            UPSERT_PEER_SQL,
            &[
                &peer.id,
                &peer.name,
                &peer.host,
                &(peer.port as i32),
                &peer.username,
                &peer.password,
                &peer.database,
                &peer.ssl_mode.as_str(),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn get_peer(&self, peer_id: i64) -> anyhow::Result<Option<PeerConfig>> {
        let mut conn = self.conn().await?;
        let Some(row) = conn.query_opt(GET_PEER_SQL, &[&peer_id]).await? else {
            return Ok(None);
        };
        let ssl_mode: String = row.try_get(7)?;
        Ok(Some(PeerConfig {
            id: row.try_get(0)?,
            name: row.try_get(1)?,
            host: row.try_get(2)?,
            port: row.try_get::<_, i32>(3)? as u16,
            username: row.try_get(4)?,
            password: row.try_get(5)?,
            database: row.try_get(6)?,
            ssl_mode: ssl_mode.parse()?,
        }))
    }
}

fn split_ref(qualified: &str) -> anyhow::Result<(String, String)> {
    qualified
        .split_once('.')
        .map(|(s, t)| (s.to_owned(), t.to_owned()))
        .with_context(|| format!("malformed table reference {qualified:?}"))
}
