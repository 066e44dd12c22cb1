//! The per-mirror durable state machine.
//!
//! Each iteration reads from persisted state, makes progress, persists, and
//! either completes or re-enters (continue-as-new). A crash re-enters from
//! the last persisted state: setup is idempotent, the snapshot phase
//! truncates before refilling, and CDC resumes from the committed cursor.

use std::sync::Arc;

use anyhow::Context as _;
use catalog::{
    CatalogStore,
    EventLevel,
};
use common::{
    errors::ErrorMetadataAnyhowExt,
    knobs::{
        DECODE_ERROR_MAX_ATTEMPTS,
        WORKFLOW_BACKOFF_CAP,
        WORKFLOW_BACKOFF_UNIT,
    },
    MirrorConfig,
    MirrorName,
    MirrorStatus,
};
use pg_destination::DestinationConnection;
use snapshot::SnapshotSessionRegistry;
use tokio::sync::{
    mpsc,
    watch,
};
use tokio_util::sync::CancellationToken;

use crate::{
    resync,
    signal::MirrorSignal,
    state::WorkflowState,
};

/// What a signal handler decided about the workflow's future.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Disposition {
    Continue,
    Done,
}

/// The branch one iteration takes, from the persisted status plus any
/// pending signal.
#[derive(Debug, PartialEq, Eq)]
enum PhaseDecision {
    Pause,
    Setup,
    Snapshot,
    Stream,
    ParkPaused,
    ParkFailed,
    Cleanup,
    Done,
}

fn decide(status: MirrorStatus, active_signal: Option<&MirrorSignal>) -> PhaseDecision {
    if matches!(active_signal, Some(MirrorSignal::Pause)) {
        return PhaseDecision::Pause;
    }
    match status {
        MirrorStatus::Created
        | MirrorStatus::SettingUp
        | MirrorStatus::Resyncing
        | MirrorStatus::SyncingSchema => PhaseDecision::Setup,
        MirrorStatus::Snapshot => PhaseDecision::Snapshot,
        MirrorStatus::Running => PhaseDecision::Stream,
        MirrorStatus::Pausing => PhaseDecision::Pause,
        MirrorStatus::Paused => PhaseDecision::ParkPaused,
        MirrorStatus::Failed => PhaseDecision::ParkFailed,
        MirrorStatus::Terminating => PhaseDecision::Cleanup,
        MirrorStatus::Terminated => PhaseDecision::Done,
    }
}

pub(crate) struct MirrorWorkflow {
    pub(crate) config: MirrorConfig,
    pub(crate) catalog: Arc<CatalogStore>,
    pub(crate) registry: Arc<SnapshotSessionRegistry>,
    pub(crate) signals: mpsc::UnboundedReceiver<MirrorSignal>,
    pub(crate) state_tx: watch::Sender<WorkflowState>,
    pub(crate) state: WorkflowState,
    pub(crate) shutdown: CancellationToken,
    decode_failures: u32,
}

impl MirrorWorkflow {
    pub(crate) fn new(
        config: MirrorConfig,
        catalog: Arc<CatalogStore>,
        registry: Arc<SnapshotSessionRegistry>,
        signals: mpsc::UnboundedReceiver<MirrorSignal>,
        state_tx: watch::Sender<WorkflowState>,
        state: WorkflowState,
        shutdown: CancellationToken,
    ) -> Self {
        MirrorWorkflow {
            config,
            catalog,
            registry,
            signals,
            state_tx,
            state,
            shutdown,
            decode_failures: 0,
        }
    }

    fn name(&self) -> &MirrorName {
        &self.config.name
    }

    pub(crate) fn publish(&self) {
        self.state_tx.send_replace(self.state.clone());
    }

    pub(crate) async fn set_status(&mut self, status: MirrorStatus) -> anyhow::Result<()> {
        if self.state.status != status {
            tracing::info!(mirror = %self.config.name, from = %self.state.status, to = %status, "status transition");
        }
        self.state.status = status;
        self.catalog.set_status(&self.config.name, status).await?;
        self.publish();
        Ok(())
    }

    pub(crate) async fn run(mut self) {
        tracing::info!(mirror = %self.config.name, "mirror workflow started");
        loop {
            if self.shutdown.is_cancelled() {
                // Process shutdown: leave persisted state as-is so the next
                // start re-enters where we left off.
                break;
            }
            match self.run_iteration().await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    if !self.handle_iteration_error(e).await {
                        break;
                    }
                },
            }
        }
        self.registry.end(&self.config.name).await;
        tracing::info!(mirror = %self.config.name, "mirror workflow exited");
    }

    /// One continue-as-new iteration. `Ok(true)` re-enters, `Ok(false)` is
    /// terminal.
    async fn run_iteration(&mut self) -> anyhow::Result<bool> {
        self.publish();
        match decide(self.state.status, self.state.active_signal.as_ref()) {
            PhaseDecision::Pause => self.paused().await,
            PhaseDecision::Setup => {
                self.setup().await?;
                Ok(true)
            },
            PhaseDecision::Snapshot => {
                self.snapshot_phase().await?;
                Ok(true)
            },
            PhaseDecision::Stream => self.stream_phase().await,
            PhaseDecision::ParkPaused => self.parked(MirrorStatus::Paused).await,
            PhaseDecision::ParkFailed => self.parked(MirrorStatus::Failed).await,
            PhaseDecision::Cleanup => {
                self.cleanup().await?;
                Ok(false)
            },
            PhaseDecision::Done => Ok(false),
        }
    }

    /// Phase-level error handling: record, back off (signal-interruptible),
    /// re-enter. Returns false only when a signal during backoff terminated
    /// the mirror.
    async fn handle_iteration_error(&mut self, e: anyhow::Error) -> bool {
        tracing::error!(mirror = %self.config.name, "workflow iteration failed: {e:#}");
        self.state.error_count += 1;
        self.state.error_message = Some(format!("{e:#}"));
        if let Err(persist_err) = self
            .catalog
            .record_error(&self.config.name, &format!("{e:#}"))
            .await
        {
            tracing::error!("failed to record mirror error: {persist_err:#}");
        }
        self.catalog
            .log_event(
                &self.config.name,
                EventLevel::Error,
                &format!("iteration failed: {e:#}"),
                None,
            )
            .await;
        self.publish();
        self.backoff_wait().await
    }

    /// Sleeps `min(error_count, cap) * unit`, waking early for signals.
    /// RetryNow zeroes the counter and skips the remaining wait.
    async fn backoff_wait(&mut self) -> bool {
        let multiplier = self.state.error_count.min(*WORKFLOW_BACKOFF_CAP);
        let delay = *WORKFLOW_BACKOFF_UNIT * multiplier;
        tracing::info!(
            mirror = %self.config.name,
            error_count = self.state.error_count,
            "backing off for {}s",
            delay.as_secs(),
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.shutdown.cancelled() => true,
            signal = self.signals.recv() => match signal {
                Some(signal) => match self.dispatch_signal(signal).await {
                    Ok(Disposition::Continue) => true,
                    Ok(Disposition::Done) => false,
                    Err(e) => {
                        tracing::error!("signal handling during backoff failed: {e:#}");
                        true
                    },
                },
                None => false,
            },
        }
    }

    // ------------------------------------------------------------------
    // Setup
    // ------------------------------------------------------------------

    /// Creates destination shapes, the publication, and the replication
    /// slot. Idempotent: existing objects are reused, except a stale slot
    /// from a half-finished first setup, which is recreated so the snapshot
    /// gets a usable exported snapshot.
    async fn setup(&mut self) -> anyhow::Result<()> {
        self.set_status(MirrorStatus::SettingUp).await?;
        let source_config = self.config.source_peer.pg_config();
        let source = pg_source::connect("setup", &source_config).await?;
        let destination =
            DestinationConnection::connect("setup", &self.config.destination_peer.pg_config())
                .await?;

        for mapping in &self.config.table_mappings {
            let shape = schema::introspect_table(
                &source.client,
                &mapping.source_schema,
                &mapping.source_table,
            )
            .await?
            .with_context(|| {
                common::errors::ErrorMetadata::config(
                    "SourceTableMissing",
                    format!("source table {} does not exist", mapping.source_ref()),
                )
            })?;
            let shape = shape.without_columns(&mapping.excluded_columns);
            destination
                .create_table_from_schema(
                    &shape,
                    &mapping.destination_schema,
                    &mapping.destination_table,
                )
                .await?;
        }

        let publication = pg_source::publication_name(self.name());
        let tables: Vec<(String, String)> = self
            .config
            .table_mappings
            .iter()
            .map(|m| (m.source_schema.clone(), m.source_table.clone()))
            .collect();
        pg_source::create_publication(&source.client, &publication, &tables).await?;

        let slot = pg_source::slot_name(self.name());
        let want_snapshot = self.config.options.initial_snapshot && !self.state.skip_snapshot;
        let fresh_mirror = self.state.last_committed_lsn == common::Lsn::ZERO
            && self.state.last_batch_id == 0;

        let mut slot_present = pg_source::slot_exists(&source.client, &slot).await?;
        if slot_present && want_snapshot && fresh_mirror {
            // A slot without its exported snapshot (left by a crashed first
            // setup) cannot seed the copy; recreate it.
            tracing::warn!(mirror = %self.config.name, slot, "recreating stale slot before snapshot");
            pg_source::drop_slot(&source.client, &slot).await?;
            slot_present = false;
        }

        let run_snapshot = want_snapshot && fresh_mirror && !slot_present;
        if !slot_present {
            let repl =
                pg_source::connect_replication("setup_slot", &source_config).await?;
            let (_session, created) = self
                .registry
                .begin_with_slot(self.name(), repl, &slot)
                .await?;
            self.catalog
                .advance_cursor(self.name(), created.consistent_point, false)
                .await?;
            if created.consistent_point > self.state.last_committed_lsn {
                self.state.last_committed_lsn = created.consistent_point;
            }
            if !run_snapshot {
                // The exported snapshot is not needed; release the session
                // (and its transaction) right away.
                self.registry.end(self.name()).await;
            }
        }

        self.catalog
            .set_replication_objects(self.name(), &slot, &publication)
            .await?;
        self.state.slot_name = Some(slot);
        self.state.publication_name = Some(publication);
        self.state.skip_snapshot = false;
        self.set_status(if run_snapshot {
            MirrorStatus::Snapshot
        } else {
            MirrorStatus::Running
        })
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Snapshot
    // ------------------------------------------------------------------

    async fn snapshot_phase(&mut self) -> anyhow::Result<()> {
        let Some(session) = self.registry.get(self.name()) else {
            // The session is process-local; after a crash it is gone and the
            // exported snapshot with it. Rebuild from scratch.
            tracing::warn!(
                mirror = %self.config.name,
                "snapshot session lost, re-entering setup",
            );
            let source = pg_source::connect("snapshot_recover", &self.config.source_peer.pg_config())
                .await?;
            if let Some(slot) = self.state.slot_name.clone() {
                pg_source::drop_slot(&source.client, &slot).await?;
            }
            self.catalog.reset_cursor(self.name()).await?;
            self.state.last_committed_lsn = common::Lsn::ZERO;
            self.state.last_batch_id = 0;
            self.set_status(MirrorStatus::Created).await?;
            return Ok(());
        };
        let snapshot_id = session.snapshot_id.clone();

        let outcome = {
            let catalog = self.catalog.clone();
            let config = self.config.clone();
            let snapshot_run = snapshot::run_snapshot(&catalog, &config, &snapshot_id);
            tokio::pin!(snapshot_run);
            tokio::select! {
                result = &mut snapshot_run => SnapshotOutcome::Finished(result),
                signal = self.signals.recv() => SnapshotOutcome::Interrupted(signal),
                _ = self.shutdown.cancelled() => return Ok(()),
            }
        };
        match outcome {
            SnapshotOutcome::Finished(result) => {
                self.registry.end(self.name()).await;
                result?;
                self.set_status(MirrorStatus::Running).await?;
            },
            SnapshotOutcome::Interrupted(None) => {
                anyhow::bail!("signal channel closed during snapshot");
            },
            SnapshotOutcome::Interrupted(Some(signal)) => {
                // The copy was abandoned mid-flight; the next snapshot run
                // re-truncates, so dropping it here is safe.
                tracing::info!(mirror = %self.config.name, %signal, "snapshot interrupted by signal");
                self.dispatch_signal(signal).await?;
            },
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Continuous CDC
    // ------------------------------------------------------------------

    async fn stream_phase(&mut self) -> anyhow::Result<bool> {
        self.set_status(MirrorStatus::Running).await?;
        let slot = self
            .state
            .slot_name
            .clone()
            .unwrap_or_else(|| pg_source::slot_name(self.name()));
        let publication = self
            .state
            .publication_name
            .clone()
            .unwrap_or_else(|| pg_source::publication_name(self.name()));
        // Re-read the cursor so this iteration starts from what was last
        // persisted, not from possibly stale in-memory state.
        if let Some(row) = self.catalog.get_state(self.name()).await? {
            self.state.last_committed_lsn = row.last_lsn;
            self.state.last_batch_id = row.last_sync_batch_id;
        }
        let start_lsn = self.state.last_committed_lsn;

        let repl =
            pg_source::connect_replication("cdc", &self.config.source_peer.pg_config()).await?;
        let cancel = CancellationToken::new();
        let outcome = {
            let catalog = self.catalog.clone();
            let config = self.config.clone();
            let params = cdc::CdcParams {
                config: &config,
                catalog: &*catalog,
                slot,
                publication,
                start_lsn,
            };
            let cdc_run = cdc::run_cdc(params, repl, cancel.clone());
            tokio::pin!(cdc_run);
            tokio::select! {
                result = &mut cdc_run => StreamOutcome::CdcExited(result),
                signal = self.signals.recv() => {
                    // Stop pulling, then let the engine finish its in-flight
                    // batch: the destination transaction either commits
                    // (advancing the cursor) or rolls back, never half.
                    cancel.cancel();
                    let result = cdc_run.await;
                    StreamOutcome::Signalled(signal, result)
                },
                _ = self.shutdown.cancelled() => {
                    cancel.cancel();
                    let _ = cdc_run.await;
                    return Ok(true);
                },
            }
        };

        match outcome {
            StreamOutcome::CdcExited(Ok(())) => Ok(true),
            StreamOutcome::CdcExited(Err(e)) => self.cdc_error(e).await,
            StreamOutcome::Signalled(None, _) => Ok(false),
            StreamOutcome::Signalled(Some(signal), result) => {
                if let Err(e) = result {
                    if !e.is_transient() {
                        tracing::warn!("CDC exited uncleanly during signal handling: {e:#}");
                    }
                }
                match self.dispatch_signal(signal).await? {
                    Disposition::Continue => Ok(true),
                    Disposition::Done => Ok(false),
                }
            },
        }
    }

    /// CDC exit with an error: decode failures are bounded and then fail the
    /// mirror; everything else takes the linear phase-level backoff.
    async fn cdc_error(&mut self, e: anyhow::Error) -> anyhow::Result<bool> {
        if e.is_decode() {
            self.decode_failures += 1;
            if self.decode_failures >= *DECODE_ERROR_MAX_ATTEMPTS {
                tracing::error!(mirror = %self.config.name, "persistent decode failure: {e:#}");
                self.catalog
                    .record_error(self.name(), &format!("{e:#}"))
                    .await?;
                self.catalog
                    .log_event(
                        self.name(),
                        EventLevel::Error,
                        &format!("mirror failed after repeated decode errors: {e:#}"),
                        None,
                    )
                    .await;
                self.state.error_message = Some(format!("{e:#}"));
                self.set_status(MirrorStatus::Failed).await?;
                return Ok(true);
            }
        } else {
            self.decode_failures = 0;
        }
        Ok(self.handle_iteration_error(e).await)
    }

    // ------------------------------------------------------------------
    // Paused / Failed parking
    // ------------------------------------------------------------------

    async fn paused(&mut self) -> anyhow::Result<bool> {
        self.state.active_signal = None;
        self.set_status(MirrorStatus::Pausing).await?;
        self.parked(MirrorStatus::Paused).await
    }

    /// Blocks on the signal channel in a holding state (`Paused` or
    /// `Failed`) until a signal that leaves it arrives; everything else is
    /// ignored.
    async fn parked(&mut self, status: MirrorStatus) -> anyhow::Result<bool> {
        self.set_status(status).await?;
        loop {
            let signal = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(true),
                signal = self.signals.recv() => match signal {
                    Some(signal) => signal,
                    None => return Ok(false),
                },
            };
            match signal {
                MirrorSignal::Resume if status == MirrorStatus::Paused => {
                    let next = if self.registry.get(self.name()).is_some() {
                        // Snapshot was interrupted by the pause; its session
                        // is still pinned.
                        MirrorStatus::Snapshot
                    } else if self.state.slot_name.is_some() {
                        MirrorStatus::Running
                    } else {
                        MirrorStatus::Created
                    };
                    self.catalog
                        .log_event(self.name(), EventLevel::Info, "mirror resumed", None)
                        .await;
                    self.set_status(next).await?;
                    return Ok(true);
                },
                MirrorSignal::Terminate => {
                    self.cleanup().await?;
                    return Ok(false);
                },
                MirrorSignal::Resync => {
                    return match self.dispatch_signal(MirrorSignal::Resync).await? {
                        Disposition::Continue => Ok(true),
                        Disposition::Done => Ok(false),
                    };
                },
                MirrorSignal::RetryNow if status == MirrorStatus::Failed => {
                    return match self.dispatch_signal(MirrorSignal::RetryNow).await? {
                        Disposition::Continue => Ok(true),
                        Disposition::Done => Ok(false),
                    };
                },
                other => {
                    tracing::warn!(mirror = %self.config.name, signal = %other, "signal ignored in {status}");
                    self.catalog
                        .log_event(
                            self.name(),
                            EventLevel::Warn,
                            &format!("signal {other} ignored while {status}"),
                            None,
                        )
                        .await;
                },
            }
        }
    }

    // ------------------------------------------------------------------
    // Signal dispatch
    // ------------------------------------------------------------------

    pub(crate) async fn dispatch_signal(
        &mut self,
        signal: MirrorSignal,
    ) -> anyhow::Result<Disposition> {
        tracing::info!(mirror = %self.config.name, %signal, "handling signal");
        self.catalog
            .log_event(
                self.name(),
                EventLevel::Info,
                &format!("signal received: {signal}"),
                None,
            )
            .await;
        match signal {
            MirrorSignal::Pause => {
                self.state.active_signal = Some(MirrorSignal::Pause);
                Ok(Disposition::Continue)
            },
            MirrorSignal::Resume => {
                tracing::warn!(mirror = %self.config.name, "resume ignored: mirror is not paused");
                Ok(Disposition::Continue)
            },
            MirrorSignal::Terminate => {
                self.cleanup().await?;
                Ok(Disposition::Done)
            },
            MirrorSignal::Resync => {
                resync::resync_mirror(self).await?;
                Ok(Disposition::Continue)
            },
            MirrorSignal::ResyncTable(table) => {
                self.state.resync_table = Some(table.clone());
                self.publish();
                resync::resync_table(self, &table).await?;
                self.state.resync_table = None;
                self.set_status(MirrorStatus::Running).await?;
                Ok(Disposition::Continue)
            },
            MirrorSignal::RetryNow => {
                self.retry_now().await?;
                Ok(Disposition::Continue)
            },
            MirrorSignal::SyncSchema => {
                self.set_status(MirrorStatus::SyncingSchema).await?;
                self.sync_schema().await?;
                self.recreate_replication_objects("schema sync").await?;
                Ok(Disposition::Continue)
            },
        }
    }

    /// RetryNow: zero the error counters and rebuild the replication objects
    /// immediately. The recreated slot begins at the current WAL end.
    async fn retry_now(&mut self) -> anyhow::Result<()> {
        self.catalog.clear_error(self.name()).await?;
        self.state.error_count = 0;
        self.state.error_message = None;
        self.decode_failures = 0;
        self.recreate_replication_objects("retry-now").await
    }

    /// Shared tail of RetryNow and SyncSchema: drop slot + publication and
    /// re-enter setup without another initial snapshot. Changes between the
    /// old cursor and the new slot's start are skipped; that window is
    /// documented behavior and recorded in the event log.
    async fn recreate_replication_objects(&mut self, why: &str) -> anyhow::Result<()> {
        self.registry.end(self.name()).await;
        let source = pg_source::connect("recreate", &self.config.source_peer.pg_config()).await?;
        if let Some(slot) = self.state.slot_name.clone() {
            pg_source::drop_slot(&source.client, &slot).await?;
        }
        if let Some(publication) = self.state.publication_name.clone() {
            pg_source::drop_publication(&source.client, &publication).await?;
        }
        self.catalog
            .log_event(
                self.name(),
                EventLevel::Warn,
                &format!(
                    "{why}: replication slot recreated; changes after cursor {} and before the \
                     new slot's start are skipped",
                    self.state.last_committed_lsn,
                ),
                Some(serde_json::json!({
                    "reason": why,
                    "old_cursor": self.state.last_committed_lsn.to_string(),
                })),
            )
            .await;
        self.state.slot_name = None;
        self.state.publication_name = None;
        self.state.skip_snapshot = true;
        self.set_status(MirrorStatus::Created).await?;
        Ok(())
    }

    /// Applies additive schema drift for every mapping: ADD COLUMN, CREATE
    /// INDEX, ADD CONSTRAINT. Drops and type changes are reported to the
    /// event log only.
    async fn sync_schema(&mut self) -> anyhow::Result<()> {
        let source = pg_source::connect("sync_schema", &self.config.source_peer.pg_config()).await?;
        let destination =
            DestinationConnection::connect("sync_schema", &self.config.destination_peer.pg_config())
                .await?;
        for mapping in &self.config.table_mappings {
            let Some(source_shape) = schema::introspect_table(
                &source.client,
                &mapping.source_schema,
                &mapping.source_table,
            )
            .await?
            else {
                self.catalog
                    .log_event(
                        self.name(),
                        EventLevel::Warn,
                        &format!("source table {} vanished", mapping.source_ref()),
                        None,
                    )
                    .await;
                continue;
            };
            let source_shape = source_shape.without_columns(&mapping.excluded_columns);
            let Some(dest_shape) = schema::introspect_table(
                destination.client(),
                &mapping.destination_schema,
                &mapping.destination_table,
            )
            .await?
            else {
                destination
                    .create_table_from_schema(
                        &source_shape,
                        &mapping.destination_schema,
                        &mapping.destination_table,
                    )
                    .await?;
                continue;
            };

            let source_indexes = schema::list_indexes(
                &source.client,
                &mapping.source_schema,
                &mapping.source_table,
            )
            .await?;
            let dest_indexes = schema::list_indexes(
                destination.client(),
                &mapping.destination_schema,
                &mapping.destination_table,
            )
            .await?;
            let source_fks = schema::list_foreign_keys(
                &source.client,
                &mapping.source_schema,
                &mapping.source_table,
            )
            .await?;
            let dest_fks = schema::list_foreign_keys(
                destination.client(),
                &mapping.destination_schema,
                &mapping.destination_table,
            )
            .await?;

            let delta = schema::compare(
                &source_shape,
                &dest_shape,
                &source_indexes,
                &dest_indexes,
                &source_fks,
                &dest_fks,
            );
            if delta.is_empty() {
                continue;
            }
            for column in &delta.added_columns {
                destination
                    .add_column(
                        &mapping.destination_schema,
                        &mapping.destination_table,
                        column,
                    )
                    .await?;
                tracing::info!(
                    mirror = %self.config.name,
                    table = %mapping.destination_ref(),
                    column = column.name,
                    "added column on destination",
                );
            }
            if self.config.options.replicate_indexes {
                for index in &delta.added_indexes {
                    destination
                        .create_index(
                            index,
                            &mapping.destination_schema,
                            &mapping.destination_table,
                            true,
                        )
                        .await?;
                }
            }
            if self.config.options.replicate_foreign_keys {
                for fk in &delta.added_fks {
                    // The captured definition references tables by their
                    // source names; it only transfers when the mapping keeps
                    // those names.
                    let identity_mapped = mapping.source_schema == mapping.destination_schema
                        && mapping.source_table == mapping.destination_table;
                    if identity_mapped {
                        destination
                            .create_foreign_key(
                                fk,
                                &mapping.destination_schema,
                                &mapping.destination_table,
                                false,
                            )
                            .await?;
                    } else {
                        self.catalog
                            .log_event(
                                self.name(),
                                EventLevel::Warn,
                                &format!(
                                    "foreign key {} not applied: {} is mapped to a different \
                                     destination name",
                                    fk.constraint_name,
                                    mapping.source_ref(),
                                ),
                                None,
                            )
                            .await;
                    }
                }
            }
            if delta.has_manual_changes() {
                self.catalog
                    .log_event(
                        self.name(),
                        EventLevel::Warn,
                        &format!(
                            "schema drift on {} requires operator action",
                            mapping.source_ref(),
                        ),
                        serde_json::to_value(&delta).ok(),
                    )
                    .await;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Terminate
    // ------------------------------------------------------------------

    /// Terminate cleanup: replication objects dropped, optionally the
    /// destination tables, catalog marked Terminated. Source-side failures
    /// are logged but do not keep the mirror alive.
    pub(crate) async fn cleanup(&mut self) -> anyhow::Result<()> {
        self.set_status(MirrorStatus::Terminating).await?;
        self.registry.end(self.name()).await;

        match pg_source::connect("cleanup", &self.config.source_peer.pg_config()).await {
            Ok(source) => {
                let slot = self
                    .state
                    .slot_name
                    .clone()
                    .unwrap_or_else(|| pg_source::slot_name(self.name()));
                if let Err(e) = pg_source::drop_slot(&source.client, &slot).await {
                    tracing::warn!("failed to drop slot during terminate: {e:#}");
                }
                let publication = self
                    .state
                    .publication_name
                    .clone()
                    .unwrap_or_else(|| pg_source::publication_name(self.name()));
                if let Err(e) = pg_source::drop_publication(&source.client, &publication).await {
                    tracing::warn!("failed to drop publication during terminate: {e:#}");
                }
            },
            Err(e) => {
                self.catalog
                    .log_event(
                        self.name(),
                        EventLevel::Error,
                        &format!("terminate could not reach the source to drop objects: {e:#}"),
                        None,
                    )
                    .await;
            },
        }

        if self.config.options.drop_destination_tables {
            let destination = DestinationConnection::connect(
                "cleanup",
                &self.config.destination_peer.pg_config(),
            )
            .await?;
            for mapping in &self.config.table_mappings {
                destination
                    .drop_table(&mapping.destination_schema, &mapping.destination_table)
                    .await?;
            }
        }

        self.catalog
            .log_event(self.name(), EventLevel::Info, "mirror terminated", None)
            .await;
        self.set_status(MirrorStatus::Terminated).await?;
        Ok(())
    }
}

enum SnapshotOutcome {
    Finished(anyhow::Result<()>),
    Interrupted(Option<MirrorSignal>),
}

enum StreamOutcome {
    CdcExited(anyhow::Result<()>),
    Signalled(Option<MirrorSignal>, anyhow::Result<()>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_signal_wins_over_any_phase() {
        for status in [
            MirrorStatus::Created,
            MirrorStatus::Snapshot,
            MirrorStatus::Running,
            MirrorStatus::Terminating,
        ] {
            assert_eq!(
                decide(status, Some(&MirrorSignal::Pause)),
                PhaseDecision::Pause,
            );
        }
    }

    #[test]
    fn setup_states_re_enter_setup() {
        for status in [
            MirrorStatus::Created,
            MirrorStatus::SettingUp,
            MirrorStatus::Resyncing,
            MirrorStatus::SyncingSchema,
        ] {
            assert_eq!(decide(status, None), PhaseDecision::Setup);
        }
    }

    #[test]
    fn lifecycle_states_map_to_their_phases() {
        assert_eq!(decide(MirrorStatus::Snapshot, None), PhaseDecision::Snapshot);
        assert_eq!(decide(MirrorStatus::Running, None), PhaseDecision::Stream);
        assert_eq!(decide(MirrorStatus::Pausing, None), PhaseDecision::Pause);
        assert_eq!(decide(MirrorStatus::Paused, None), PhaseDecision::ParkPaused);
        assert_eq!(decide(MirrorStatus::Failed, None), PhaseDecision::ParkFailed);
        assert_eq!(
            decide(MirrorStatus::Terminating, None),
            PhaseDecision::Cleanup,
        );
        assert_eq!(decide(MirrorStatus::Terminated, None), PhaseDecision::Done);
    }

    #[test]
    fn non_pause_signals_do_not_divert_the_phase() {
        assert_eq!(
            decide(MirrorStatus::Running, Some(&MirrorSignal::RetryNow)),
            PhaseDecision::Stream,
        );
    }
}
