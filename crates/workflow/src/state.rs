use catalog::MirrorStateRow;
use common::{
    Lsn,
    MirrorStatus,
    SyncOptions,
};
use serde::{
    Deserialize,
    Serialize,
};

use crate::signal::MirrorSignal;

/// The per-iteration view of a mirror workflow. Every iteration starts from
/// what was persisted, makes progress, and persists again before suspending;
/// a crash re-enters from the last persisted state. Served verbatim by the
/// `FlowState` query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
pub struct WorkflowState {
    pub status: MirrorStatus,
    pub slot_name: Option<String>,
    pub publication_name: Option<String>,
    pub last_committed_lsn: Lsn,
    pub last_batch_id: i64,
    pub active_signal: Option<MirrorSignal>,
    pub resync_table: Option<String>,
    pub error_count: u32,
    pub error_message: Option<String>,
    /// Set after RetryNow / SyncSchema: the next setup recreates the slot
    /// but must not re-run the initial snapshot.
    #[serde(default)]
    pub skip_snapshot: bool,
    pub sync_options: SyncOptions,
}

impl WorkflowState {
    pub fn new(sync_options: SyncOptions) -> Self {
        WorkflowState {
            status: MirrorStatus::Created,
            slot_name: None,
            publication_name: None,
            last_committed_lsn: Lsn::ZERO,
            last_batch_id: 0,
            active_signal: None,
            resync_table: None,
            error_count: 0,
            error_message: None,
            skip_snapshot: false,
            sync_options,
        }
    }

    /// Re-hydrates an iteration's state from the catalog row.
    pub fn from_catalog(row: &MirrorStateRow, sync_options: SyncOptions) -> Self {
        WorkflowState {
            status: row.status,
            slot_name: row.slot_name.clone(),
            publication_name: row.publication_name.clone(),
            last_committed_lsn: row.last_lsn,
            last_batch_id: row.last_sync_batch_id,
            active_signal: None,
            resync_table: None,
            error_count: row.error_count.max(0) as u32,
            error_message: row.error_message.clone(),
            skip_snapshot: false,
            sync_options,
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn state_json_roundtrips(state in any::<WorkflowState>()) {
            let json = serde_json::to_string(&state).unwrap();
            prop_assert_eq!(serde_json::from_str::<WorkflowState>(&json).unwrap(), state);
        }
    }

    #[test]
    fn skip_snapshot_defaults_off_for_old_payloads() {
        let json = serde_json::json!({
            "status": "running",
            "slot_name": "bunny_slot_m1",
            "publication_name": "bunny_pub_m1",
            "last_committed_lsn": 42,
            "last_batch_id": 7,
            "active_signal": null,
            "resync_table": null,
            "error_count": 0,
            "error_message": null,
            "sync_options": SyncOptions::default(),
        });
        let state: WorkflowState = serde_json::from_value(json).unwrap();
        assert!(!state.skip_snapshot);
        assert_eq!(state.last_batch_id, 7);
    }
}
