//! The CDC engine: tails the WAL, batches change records, applies each batch
//! in one destination transaction, and advances the committed LSN.
//!
//! Exactly-once hinges on two pieces: all applies of a batch commit
//! atomically on the destination, and the replication cursor only advances
//! after that commit. A crash between the two re-emits the batch, which the
//! idempotent per-record statements absorb.

use std::{
    collections::{
        HashMap,
        HashSet,
    },
    sync::Arc,
    time::Duration,
};

use anyhow::Context as _;
use catalog::{
    CatalogStore,
    EventLevel,
};
use common::{
    errors::{
        ErrorMetadata,
        ErrorMetadataAnyhowExt,
    },
    knobs::{
        TRANSIENT_ERROR_INITIAL_BACKOFF,
        TRANSIENT_ERROR_MAX_ATTEMPTS,
        TRANSIENT_ERROR_MAX_BACKOFF,
    },
    retry::RetryDelay,
    ChangeOp,
    ChangeRecord,
    Lsn,
    MirrorConfig,
};
use pg_destination::{
    build_apply,
    ApplyStatement,
    DestinationConnection,
    TableApplyInfo,
};
use pg_source::{
    ReplicationClient,
    WalStream,
};
use tokio_util::sync::CancellationToken;

pub struct CdcParams<'a> {
    pub config: &'a MirrorConfig,
    pub catalog: &'a CatalogStore,
    pub slot: String,
    pub publication: String,
    pub start_lsn: Lsn,
}

#[derive(Default)]
struct BatchCounters {
    /// table → (synced, inserted, updated)
    per_table: HashMap<String, (i64, i64, i64)>,
}

impl BatchCounters {
    fn record(&mut self, table: &str, op: ChangeOp) {
        let entry = self.per_table.entry(table.to_owned()).or_default();
        entry.0 += 1;
        match op {
            ChangeOp::Insert => entry.1 += 1,
            ChangeOp::Update => entry.2 += 1,
            // A delete is a synced row without an insert/update category.
            ChangeOp::Delete => {},
        }
    }
}

/// Runs continuous CDC until cancelled (returns `Ok`) or a non-recoverable
/// error surfaces (`Err`; the workflow decides between backoff and Failed).
pub async fn run_cdc(
    params: CdcParams<'_>,
    repl: ReplicationClient,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let CdcParams {
        config,
        catalog,
        slot,
        publication,
        start_lsn,
    } = params;
    let options = &config.options;

    let server_version = pg_source::server_version_num(&repl.client).await?;
    let mut stream = WalStream::start(
        &repl,
        &slot,
        &publication,
        start_lsn,
        server_version,
        Duration::from_secs(options.standby_status_interval_seconds),
    )
    .await?;
    let destination_config = config.destination_peer.pg_config();
    let mut destination = DestinationConnection::connect("cdc_apply", &destination_config).await?;

    // Memoized per sync run; repopulated lazily after SyncSchema re-enters.
    let mut apply_info: HashMap<String, Option<Arc<TableApplyInfo>>> = HashMap::new();
    let mut errored_tables: HashSet<String> = HashSet::new();
    let idle_timeout = Duration::from_secs(options.idle_timeout_seconds);
    let mut committed = start_lsn;

    loop {
        let batch = stream
            .pull_changes(options.max_batch_size, idle_timeout, &cancel)
            .await?;

        if batch.records.is_empty() {
            if cancel.is_cancelled() {
                tracing::info!(mirror = %config.name, "CDC cancelled, exiting");
                return Ok(());
            }
            // Nothing to apply, but the standby position still moves so the
            // server can trim WAL.
            if batch.last_lsn > committed {
                catalog
                    .advance_cursor(&config.name, batch.last_lsn, false)
                    .await?;
                committed = batch.last_lsn;
                stream.confirm(committed);
                stream.send_status().await;
            }
            continue;
        }

        let mut statements: Vec<ApplyStatement> = Vec::with_capacity(batch.records.len());
        let mut counters = BatchCounters::default();
        for record in &batch.records {
            let table_ref = record.qualified_table();
            if errored_tables.contains(&table_ref) {
                continue;
            }
            let Some(mapping) = config.mapping_for_source(&record.schema, &record.table) else {
                tracing::trace!(table = %table_ref, "skipping record for unmapped table");
                continue;
            };
            let info = match lookup_apply_info(
                &mut apply_info,
                &destination,
                &table_ref,
                mapping,
            )
            .await?
            {
                Some(info) => info,
                None => continue,
            };
            match build_apply(
                record,
                &info,
                &mapping.destination_schema,
                &mapping.destination_table,
            ) {
                Ok(Some(statement)) => {
                    statements.push(statement);
                    counters.record(&table_ref, record.op);
                },
                Ok(None) => {},
                Err(e) if e.is_record_rejected() => {
                    mark_table_errored(catalog, config, &mut errored_tables, &table_ref, &e).await;
                },
                Err(e) => return Err(e),
            }
        }

        apply_with_retry(&mut destination, &destination_config, &statements).await?;

        // Only after the destination commit does the cursor move; the batch
        // id increments only when the batch produced output.
        catalog
            .advance_cursor(&config.name, batch.last_lsn, !statements.is_empty())
            .await
            .map_err(|e| {
                e.context(ErrorMetadata::fatal(
                    "CursorPersistFailed",
                    "could not persist replication cursor",
                ))
            })?;
        if batch.last_lsn > committed {
            committed = batch.last_lsn;
        }
        stream.confirm(committed);
        stream.send_status().await;

        for (table, (synced, inserted, updated)) in counters.per_table {
            catalog
                .record_table_progress(&config.name, &table, synced, inserted, updated)
                .await?;
        }
        tracing::debug!(
            mirror = %config.name,
            records = batch.records.len(),
            applied = statements.len(),
            last_lsn = %batch.last_lsn,
            "applied CDC batch",
        );
    }
}

async fn lookup_apply_info(
    cache: &mut HashMap<String, Option<Arc<TableApplyInfo>>>,
    destination: &DestinationConnection,
    table_ref: &str,
    mapping: &common::mirror::TableMapping,
) -> anyhow::Result<Option<Arc<TableApplyInfo>>> {
    if let Some(cached) = cache.get(table_ref) {
        return Ok(cached.clone());
    }
    let shape = schema::introspect_table(
        destination.client(),
        &mapping.destination_schema,
        &mapping.destination_table,
    )
    .await?;
    let info = match shape {
        Some(shape) => Some(Arc::new(TableApplyInfo {
            primary_key: shape.primary_key.clone(),
            column_types: shape
                .columns
                .iter()
                .map(|c| (c.name.clone(), c.data_type.clone()))
                .collect(),
        })),
        None => {
            tracing::warn!(
                table = table_ref,
                destination = %mapping.destination_ref(),
                "destination table missing, discarding its records",
            );
            None
        },
    };
    cache.insert(table_ref.to_owned(), info.clone());
    Ok(info)
}

async fn mark_table_errored(
    catalog: &CatalogStore,
    config: &MirrorConfig,
    errored_tables: &mut HashSet<String>,
    table_ref: &str,
    error: &anyhow::Error,
) {
    if !errored_tables.insert(table_ref.to_owned()) {
        return;
    }
    tracing::error!(mirror = %config.name, table = table_ref, "record rejected: {error:#}");
    if let Err(e) = catalog
        .set_table_error(&config.name, table_ref, &format!("{error:#}"))
        .await
    {
        tracing::error!("failed to mark table errored: {e:#}");
    }
    catalog
        .log_event(
            &config.name,
            EventLevel::Error,
            &format!("table {table_ref} entered error state: {error:#}"),
            None,
        )
        .await;
}

/// Applies a batch, reconnecting and retrying on transient destination
/// failures. Safe to retry because every statement is idempotent.
async fn apply_with_retry(
    destination: &mut DestinationConnection,
    destination_config: &tokio_postgres::Config,
    statements: &[ApplyStatement],
) -> anyhow::Result<()> {
    if statements.is_empty() {
        return Ok(());
    }
    let mut delay = RetryDelay::new(*TRANSIENT_ERROR_INITIAL_BACKOFF, *TRANSIENT_ERROR_MAX_BACKOFF);
    loop {
        match destination.apply_batch(statements).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_transient() && delay.attempts() + 1 < *TRANSIENT_ERROR_MAX_ATTEMPTS => {
                let wait = delay.next_delay();
                tracing::warn!(
                    "batch apply failed transiently, reconnecting in {}ms: {e:#}",
                    wait.as_millis(),
                );
                tokio::time::sleep(wait).await;
                *destination =
                    DestinationConnection::connect("cdc_apply", destination_config).await?;
            },
            Err(e) => return Err(e.context("applying CDC batch")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_classify_ops() {
        let mut counters = BatchCounters::default();
        counters.record("public.accounts", ChangeOp::Insert);
        counters.record("public.accounts", ChangeOp::Update);
        counters.record("public.accounts", ChangeOp::Delete);
        counters.record("public.orders", ChangeOp::Insert);
        let accounts = counters.per_table["public.accounts"];
        assert_eq!(accounts, (3, 1, 1));
        let orders = counters.per_table["public.orders"];
        assert_eq!(orders, (1, 1, 0));
    }
}
