//! Orchestration of a full snapshot: FK capture/drop, truncation, parallel
//! table copies, then index and FK restoration.

use anyhow::Context as _;
use catalog::{
    CatalogStore,
    EventLevel,
};
use common::{
    MirrorConfig,
    TableStatus,
};
use futures::{
    stream::FuturesUnordered,
    StreamExt as _,
};
use pg_destination::DestinationConnection;

use crate::copy::copy_table;

/// Runs the snapshot phase for every mapped table under the given exported
/// snapshot identifier. The destination tables must already exist; they are
/// truncated here, which is what makes partition copies idempotent under
/// re-run.
pub async fn run_snapshot(
    catalog: &CatalogStore,
    config: &MirrorConfig,
    snapshot_id: &str,
) -> anyhow::Result<()> {
    let source_config = config.source_peer.pg_config();
    let destination_config = config.destination_peer.pg_config();
    let destination = DestinationConnection::connect("snapshot_setup", &destination_config).await?;
    let source = pg_source::connect("snapshot_setup", &source_config).await?;

    // Referencing constraints block both the truncate and the refill; they
    // are captured for later recreation and dropped first.
    if config.options.replicate_foreign_keys {
        for mapping in &config.table_mappings {
            let fks = schema::list_foreign_keys(
                destination.client(),
                &mapping.destination_schema,
                &mapping.destination_table,
            )
            .await?;
            for fk in fks {
                catalog.capture_foreign_key(&config.name, &fk).await?;
                destination
                    .drop_foreign_key(&fk.table_schema, &fk.table_name, &fk.constraint_name)
                    .await?;
                tracing::info!(
                    mirror = %config.name,
                    constraint = fk.constraint_name,
                    "captured and dropped destination foreign key",
                );
            }
        }
    }

    // Secondary indexes slow the bulk load; capture the source definitions
    // and rebuild after the data lands.
    if config.options.replicate_indexes {
        for mapping in &config.table_mappings {
            let indexes = schema::list_indexes(
                &source.client,
                &mapping.source_schema,
                &mapping.source_table,
            )
            .await?;
            for index in indexes.iter().filter(|i| !i.is_primary) {
                catalog.capture_index(&config.name, index).await?;
            }
            let dest_indexes = schema::list_indexes(
                destination.client(),
                &mapping.destination_schema,
                &mapping.destination_table,
            )
            .await?;
            for index in dest_indexes.iter().filter(|i| !i.is_primary) {
                destination
                    .drop_index(&mapping.destination_schema, &index.name)
                    .await?;
            }
        }
    }

    for mapping in &config.table_mappings {
        destination
            .truncate_cascade(&mapping.destination_schema, &mapping.destination_table)
            .await?;
        catalog
            .set_table_status(&config.name, &mapping.source_ref(), TableStatus::Pending)
            .await?;
    }

    let parallelism = config.options.snapshot_tables_in_parallel.max(1);
    let mut remaining = config.table_mappings.iter();
    let mut pending = FuturesUnordered::new();
    for mapping in remaining.by_ref().take(parallelism) {
        pending.push(copy_future(
            catalog,
            config,
            &source_config,
            &destination_config,
            snapshot_id,
            mapping,
        ));
    }
    let mut results = Vec::with_capacity(config.table_mappings.len());
    while let Some((mapping, result)) = pending.next().await {
        results.push((mapping, result));
        if let Some(next_mapping) = remaining.next() {
            pending.push(copy_future(
                catalog,
                config,
                &source_config,
                &destination_config,
                snapshot_id,
                next_mapping,
            ));
        }
    }

    let mut first_error = None;
    for (mapping, result) in results {
        if let Err(e) = result {
            catalog
                .set_table_error(&config.name, &mapping.source_ref(), &format!("{e:#}"))
                .await?;
            catalog
                .log_event(
                    &config.name,
                    EventLevel::Error,
                    &format!("snapshot of {} failed: {e:#}", mapping.source_ref()),
                    None,
                )
                .await;
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e.context("snapshot failed"));
    }

    // Indexes come back before foreign keys so validation scans are
    // index-assisted.
    if config.options.replicate_indexes {
        for index in catalog.list_captured_indexes(&config.name).await? {
            let mapping = config
                .mapping_for_source(&index.schema, &index.table)
                .with_context(|| format!("no mapping for captured index on {}", index.table))?;
            destination
                .create_index(
                    &index,
                    &mapping.destination_schema,
                    &mapping.destination_table,
                    false,
                )
                .await?;
        }
    }
    if config.options.replicate_foreign_keys {
        for captured in catalog.list_captured_foreign_keys(&config.name).await? {
            if captured.recreated_at.is_some() {
                continue;
            }
            let fk = &captured.def;
            destination
                .create_foreign_key(fk, &fk.table_schema, &fk.table_name, false)
                .await?;
            catalog
                .mark_foreign_key_recreated(&config.name, &fk.table_ref(), &fk.constraint_name)
                .await?;
        }
    }

    catalog
        .log_event(
            &config.name,
            EventLevel::Info,
            "initial snapshot complete",
            None,
        )
        .await;
    Ok(())
}

async fn snapshot_one_table(
    catalog: &CatalogStore,
    config: &MirrorConfig,
    source_config: &tokio_postgres::Config,
    destination_config: &tokio_postgres::Config,
    snapshot_id: &str,
    mapping: &common::mirror::TableMapping,
) -> anyhow::Result<()> {
    let table_ref = mapping.source_ref();
    catalog
        .set_table_status(&config.name, &table_ref, TableStatus::Copying)
        .await?;

    let source = pg_source::connect("snapshot_table", source_config).await?;
    let shape = schema::introspect_table(
        &source.client,
        &mapping.source_schema,
        &mapping.source_table,
    )
    .await?
    .with_context(|| format!("source table {table_ref} does not exist"))?;
    drop(source);
    let shape = shape.without_columns(&mapping.excluded_columns);
    let columns: Vec<String> = shape.column_names().map(str::to_owned).collect();

    let rows = copy_table(
        source_config,
        destination_config,
        snapshot_id,
        mapping,
        &columns,
        None,
        config.options.snapshot_rows_per_partition,
        config.options.snapshot_parallel_workers,
    )
    .await?;

    catalog
        .record_table_progress(&config.name, &table_ref, rows as i64, rows as i64, 0)
        .await?;
    catalog
        .set_table_status(&config.name, &table_ref, TableStatus::Synced)
        .await?;
    tracing::info!(mirror = %config.name, table = %table_ref, rows, "table snapshot complete");
    Ok(())
}
