//! Mirror workflow engine: one durable state machine per mirror, plus the
//! control-plane facade the administration layer drives
//! (`start` / `signal` / `query`).

mod resync;
mod signal;
mod state;
mod workflow;

use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use anyhow::Context as _;
use catalog::CatalogStore;
use common::{
    errors::ErrorMetadata,
    MirrorConfig,
    MirrorName,
    MirrorStatus,
};
use parking_lot::RwLock;
use snapshot::SnapshotSessionRegistry;
use tokio::{
    sync::{
        mpsc,
        watch,
    },
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

pub use crate::{
    signal::MirrorSignal,
    state::WorkflowState,
};
use crate::workflow::MirrorWorkflow;

struct MirrorHandle {
    signal_tx: mpsc::UnboundedSender<MirrorSignal>,
    state_rx: watch::Receiver<WorkflowState>,
    task: JoinHandle<()>,
}

/// Owns every running mirror workflow in the process.
pub struct MirrorEngine {
    catalog: Arc<CatalogStore>,
    registry: Arc<SnapshotSessionRegistry>,
    mirrors: RwLock<HashMap<MirrorName, MirrorHandle>>,
    shutdown: CancellationToken,
}

impl MirrorEngine {
    pub fn new(catalog: Arc<CatalogStore>) -> Self {
        MirrorEngine {
            catalog,
            registry: Arc::new(SnapshotSessionRegistry::new()),
            mirrors: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Begins (or continues after a restart) the workflow for a mirror.
    /// Configuration problems are returned synchronously; no workflow starts
    /// for an invalid config.
    pub async fn start(&self, config: MirrorConfig) -> anyhow::Result<()> {
        config.validate()?;
        if self.mirrors.read().contains_key(&config.name) {
            anyhow::bail!(ErrorMetadata::config(
                "MirrorAlreadyRunning",
                format!("mirror {} already has a running workflow", config.name),
            ));
        }

        let state = match self.catalog.get_state(&config.name).await? {
            None => {
                self.catalog.insert_mirror(&config).await?;
                WorkflowState::new(config.options.clone())
            },
            Some(row) if row.status.is_terminal() => {
                anyhow::bail!(ErrorMetadata::config(
                    "MirrorTerminated",
                    format!("mirror {} was terminated; delete it before reusing the name", config.name),
                ));
            },
            Some(row) => WorkflowState::from_catalog(&row, config.options.clone()),
        };

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(state.clone());
        let name = config.name.clone();
        let workflow = MirrorWorkflow::new(
            config,
            self.catalog.clone(),
            self.registry.clone(),
            signal_rx,
            state_tx,
            state,
            self.shutdown.clone(),
        );
        let task = tokio::spawn(workflow.run());
        self.mirrors.write().insert(
            name.clone(),
            MirrorHandle {
                signal_tx,
                state_rx,
                task,
            },
        );
        tracing::info!(mirror = %name, "mirror workflow launched");
        Ok(())
    }

    /// Delivers an operator signal. A signal to a finished or missing
    /// workflow is a conflict; if the catalog still claims the mirror is
    /// live, the catalog is repaired to Terminated first.
    pub async fn signal(&self, name: &MirrorName, signal: MirrorSignal) -> anyhow::Result<()> {
        let send_result = {
            let mirrors = self.mirrors.read();
            mirrors.get(name).map(|h| h.signal_tx.send(signal.clone()))
        };
        match send_result {
            Some(Ok(())) => Ok(()),
            Some(Err(_)) => {
                // The workflow ran to completion; its receiver is gone.
                anyhow::bail!(ErrorMetadata::signal_conflict(
                    "WorkflowFinished",
                    format!("mirror {name} is no longer running; cannot deliver {signal}"),
                ));
            },
            None => {
                self.reconcile_missing_workflow(name).await?;
                anyhow::bail!(ErrorMetadata::signal_conflict(
                    "WorkflowMissing",
                    format!("no workflow for mirror {name}"),
                ));
            },
        }
    }

    /// The `FlowState` query, served from in-memory state at whatever
    /// suspension point the workflow last published.
    pub fn query(&self, name: &MirrorName) -> anyhow::Result<WorkflowState> {
        let mirrors = self.mirrors.read();
        let handle = mirrors.get(name).with_context(|| {
            ErrorMetadata::not_found("MirrorNotFound", format!("no workflow for mirror {name}"))
        })?;
        let state = handle.state_rx.borrow().clone();
        Ok(state)
    }

    /// If the catalog says a mirror is live but no workflow exists (e.g.
    /// after a crash with no restart for it), repair the catalog.
    async fn reconcile_missing_workflow(&self, name: &MirrorName) -> anyhow::Result<()> {
        let Some(row) = self.catalog.get_state(name).await? else {
            anyhow::bail!(ErrorMetadata::not_found(
                "MirrorNotFound",
                format!("mirror {name} does not exist"),
            ));
        };
        if !row.status.is_terminal() {
            tracing::warn!(
                mirror = %name,
                status = %row.status,
                "catalog claims a live mirror with no workflow; repairing to terminated",
            );
            self.catalog.set_status(name, MirrorStatus::Terminated).await?;
        }
        Ok(())
    }

    /// Stops every workflow, leaving persisted state for the next process.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<(MirrorName, MirrorHandle)> =
            self.mirrors.write().drain().collect();
        for (name, handle) in handles {
            if tokio::time::timeout(Duration::from_secs(30), handle.task)
                .await
                .is_err()
            {
                tracing::warn!(mirror = %name, "workflow did not stop within grace period");
            }
        }
    }
}
