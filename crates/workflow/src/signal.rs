use std::fmt;

use serde::{
    Deserialize,
    Serialize,
};

/// Operator signals delivered to a running mirror workflow. Single-writer
/// semantics: the workflow owns the receiving end and is the only mutator of
/// its `active_signal`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
pub enum MirrorSignal {
    Pause,
    Resume,
    Terminate,
    Resync,
    ResyncTable(String),
    /// Clears error counters and re-enters setup immediately. The recreated
    /// slot starts at the current WAL end, so changes during the outage are
    /// skipped; operators invoke this to accept that trade.
    RetryNow,
    SyncSchema,
}

impl fmt::Display for MirrorSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirrorSignal::Pause => f.write_str("pause"),
            MirrorSignal::Resume => f.write_str("resume"),
            MirrorSignal::Terminate => f.write_str("terminate"),
            MirrorSignal::Resync => f.write_str("resync"),
            MirrorSignal::ResyncTable(table) => write!(f, "resync_table({table})"),
            MirrorSignal::RetryNow => f.write_str("retry_now"),
            MirrorSignal::SyncSchema => f.write_str("sync_schema"),
        }
    }
}
