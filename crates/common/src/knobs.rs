//! Process-level tunables. Per-mirror settings live in
//! [`SyncOptions`](crate::mirror::SyncOptions); everything here is an
//! operational limit that can be overridden with an environment variable.

use std::{
    num::NonZeroUsize,
    sync::LazyLock,
    time::Duration,
};

use crate::env::env_config;

/// Upper bound on any single statement round-trip to a source, destination,
/// or catalog database. Hung connections are abandoned past this.
pub static POSTGRES_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("POSTGRES_TIMEOUT_SECONDS", 30)));

/// How long to wait after terminating a backend that holds a replication
/// slot active before attempting to drop the slot.
pub static SLOT_DROP_TERMINATE_WAIT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("SLOT_DROP_TERMINATE_WAIT_MS", 500)));

/// Interval of the `SELECT 1` heartbeat that keeps a snapshot session's
/// exporting transaction alive.
pub static SNAPSHOT_SESSION_KEEPALIVE: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("SNAPSHOT_SESSION_KEEPALIVE_SECONDS", 30)));

/// Attempt cap for retrying transient I/O failures inside one activity
/// before the error surfaces to the workflow.
pub static TRANSIENT_ERROR_MAX_ATTEMPTS: LazyLock<u32> =
    LazyLock::new(|| env_config("TRANSIENT_ERROR_MAX_ATTEMPTS", 5));

/// Initial backoff for transient-error retries; grows exponentially with
/// jitter up to [`TRANSIENT_ERROR_MAX_BACKOFF`].
pub static TRANSIENT_ERROR_INITIAL_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("TRANSIENT_ERROR_INITIAL_BACKOFF_MS", 500)));

pub static TRANSIENT_ERROR_MAX_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("TRANSIENT_ERROR_MAX_BACKOFF_SECONDS", 10)));

/// Granularity of WAL stream reads. Bounds how long the CDC loop can take to
/// notice cancellation, so it must stay at or below the standby timeout.
pub static CDC_RECEIVE_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("CDC_RECEIVE_TIMEOUT_SECONDS", 10)));

/// How many times a malformed WAL batch is re-read before the mirror is
/// transitioned to Failed.
pub static DECODE_ERROR_MAX_ATTEMPTS: LazyLock<u32> =
    LazyLock::new(|| env_config("DECODE_ERROR_MAX_ATTEMPTS", 3));

/// Unit of the workflow-level backoff applied when the CDC engine exits with
/// an error: sleep `min(error_count, WORKFLOW_BACKOFF_CAP) * unit`.
pub static WORKFLOW_BACKOFF_UNIT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("WORKFLOW_BACKOFF_UNIT_SECONDS", 60)));

pub static WORKFLOW_BACKOFF_CAP: LazyLock<u32> =
    LazyLock::new(|| env_config("WORKFLOW_BACKOFF_CAP", 10));

pub static CATALOG_MAX_CONNECTIONS: LazyLock<usize> =
    LazyLock::new(|| env_config("CATALOG_MAX_CONNECTIONS", 8));

/// Per-connection cap on cached prepared statements, bounding server-side
/// memory.
pub static MAX_CACHED_STATEMENTS: LazyLock<NonZeroUsize> = LazyLock::new(|| {
    env_config("MAX_CACHED_STATEMENTS", NonZeroUsize::new(256).unwrap())
});

/// Parked catalog connections older than this are dropped the next time the
/// pool touches its idle stack.
pub static CATALOG_INACTIVE_CONNECTION_LIFETIME: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_secs(env_config("CATALOG_INACTIVE_CONNECTION_LIFETIME_SECONDS", 300))
});
