//! The process-local snapshot-session registry.
//!
//! A snapshot session is a long-lived source connection holding open the
//! REPEATABLE READ transaction that exported a snapshot; the exported
//! identifier is only valid while that transaction lives. The registry is
//! the one piece of cross-activity shared mutable state in the process and
//! maps each mirror to at most one session.

use std::{
    collections::HashMap,
    sync::Arc,
};

use anyhow::Context as _;
use common::{
    knobs::SNAPSHOT_SESSION_KEEPALIVE,
    MirrorName,
};
use parking_lot::RwLock;
use pg_source::{
    simple_query_opt,
    CreatedSlot,
    ReplicationClient,
    SourceConnection,
};
use tokio_postgres::Client;
use tokio_util::task::AbortOnDropHandle;

enum SessionConnection {
    /// Session opened on the replication connection that created the slot.
    Replication(ReplicationClient),
    /// Plain connection exporting a fresh snapshot (swap resyncs).
    Regular(SourceConnection),
}

impl SessionConnection {
    fn client(&self) -> &Client {
        match self {
            SessionConnection::Replication(conn) => &conn.client,
            SessionConnection::Regular(conn) => &conn.client,
        }
    }
}

pub struct SessionHandle {
    pub mirror: MirrorName,
    pub snapshot_id: String,
    connection: tokio::sync::Mutex<Option<SessionConnection>>,
    _keepalive: AbortOnDropHandle<()>,
}

impl SessionHandle {
    fn new(mirror: MirrorName, snapshot_id: String, connection: SessionConnection) -> Arc<Self> {
        let connection = tokio::sync::Mutex::new(Some(connection));
        Arc::new_cyclic(|weak: &std::sync::Weak<SessionHandle>| {
            let weak = weak.clone();
            let keepalive = AbortOnDropHandle::new(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(*SNAPSHOT_SESSION_KEEPALIVE).await;
                    let Some(handle) = weak.upgrade() else { break };
                    let guard = handle.connection.lock().await;
                    let Some(conn) = guard.as_ref() else { break };
                    // Touching the open transaction keeps the exported
                    // snapshot pinned.
                    if let Err(e) = conn.client().simple_query("SELECT 1").await {
                        tracing::warn!(
                            mirror = %handle.mirror,
                            "snapshot session keepalive failed: {e}",
                        );
                    }
                }
            }));
            SessionHandle {
                mirror,
                snapshot_id,
                connection,
                _keepalive: keepalive,
            }
        })
    }

    /// Ends the session: commits the (read-only) exporting transaction and
    /// drops the connection. Idempotent.
    pub async fn end(&self) {
        let Some(conn) = self.connection.lock().await.take() else {
            return;
        };
        if let Err(e) = simple_query_opt(conn.client(), "COMMIT;").await {
            tracing::warn!(mirror = %self.mirror, "ending snapshot session: {e:#}");
        }
        tracing::info!(mirror = %self.mirror, "snapshot session ended");
    }
}

#[derive(Default)]
pub struct SnapshotSessionRegistry {
    inner: RwLock<HashMap<MirrorName, Arc<SessionHandle>>>,
}

impl SnapshotSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the replication slot on `repl` and registers the session
    /// holding its exported snapshot open.
    pub async fn begin_with_slot(
        &self,
        mirror: &MirrorName,
        repl: ReplicationClient,
        slot: &str,
    ) -> anyhow::Result<(Arc<SessionHandle>, CreatedSlot)> {
        let created = pg_source::create_slot_with_snapshot(&repl, slot)
            .await
            .context("creating slot for snapshot session")?;
        let handle = SessionHandle::new(
            mirror.clone(),
            created.snapshot_id.clone(),
            SessionConnection::Replication(repl),
        );
        self.register(mirror, handle.clone())?;
        Ok((handle, created))
    }

    /// Exports a fresh snapshot on a plain connection and registers the
    /// session, for shadow-table rebuilds that need no slot.
    pub async fn begin_standalone(
        &self,
        mirror: &MirrorName,
        conn: SourceConnection,
    ) -> anyhow::Result<Arc<SessionHandle>> {
        let snapshot_id = pg_source::export_snapshot(&conn.client)
            .await
            .context("exporting standalone snapshot")?;
        let handle = SessionHandle::new(
            mirror.clone(),
            snapshot_id,
            SessionConnection::Regular(conn),
        );
        self.register(mirror, handle.clone())?;
        Ok(handle)
    }

    fn register(&self, mirror: &MirrorName, handle: Arc<SessionHandle>) -> anyhow::Result<()> {
        let mut inner = self.inner.write();
        anyhow::ensure!(
            !inner.contains_key(mirror),
            "mirror {mirror} already has an active snapshot session",
        );
        inner.insert(mirror.clone(), handle);
        Ok(())
    }

    pub fn get(&self, mirror: &MirrorName) -> Option<Arc<SessionHandle>> {
        self.inner.read().get(mirror).cloned()
    }

    /// Removes and ends the mirror's session, if any. Runs on every workflow
    /// completion path, success or not.
    pub async fn end(&self, mirror: &MirrorName) {
        let handle = self.inner.write().remove(mirror);
        if let Some(handle) = handle {
            handle.end().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn get_on_empty_registry_is_none() {
        let registry = SnapshotSessionRegistry::new();
        let mirror = MirrorName::from_str("m1").unwrap();
        assert!(registry.get(&mirror).is_none());
    }
}
