//! Resync protocols: truncate-and-refill, and the zero-downtime shadow-table
//! swap. Shadow tables are named `<table>_resync`; a failure before the swap
//! drops the shadow and leaves the live table untouched.

use std::sync::Arc;

use anyhow::Context as _;
use catalog::{
    CatalogStore,
    EventLevel,
};
use common::{
    errors::ErrorMetadata,
    identifiers::MAX_IDENTIFIER_LEN,
    mirror::{
        ResyncStrategy,
        TableMapping,
    },
    MirrorName,
    MirrorStatus,
    SyncOptions,
    TableStatus,
};
use pg_destination::DestinationConnection;
use pg_source::SourceConnection;

use crate::workflow::MirrorWorkflow;

fn shadow_name(table: &str) -> String {
    let mut name = format!("{table}_resync");
    name.truncate(MAX_IDENTIFIER_LEN);
    name
}

fn shadow_index_name(index: &str) -> String {
    let mut name = format!("{index}_resync");
    name.truncate(MAX_IDENTIFIER_LEN);
    name
}

pub(crate) async fn resync_mirror(wf: &mut MirrorWorkflow) -> anyhow::Result<()> {
    match wf.config.options.resync_strategy {
        ResyncStrategy::Truncate => truncate_resync(wf).await,
        ResyncStrategy::Swap => swap_resync(wf).await,
    }
}

/// Truncate-and-refill: drop the replication objects and re-enter setup; the
/// fresh setup recreates the slot with a new exported snapshot, and the
/// snapshot phase performs the truncation and refill. The destination has a
/// visible window of absent data.
async fn truncate_resync(wf: &mut MirrorWorkflow) -> anyhow::Result<()> {
    wf.set_status(MirrorStatus::Resyncing).await?;
    wf.registry.end(&wf.config.name).await;
    let source = pg_source::connect("resync", &wf.config.source_peer.pg_config()).await?;
    if let Some(slot) = wf.state.slot_name.take() {
        pg_source::drop_slot(&source.client, &slot).await?;
    }
    if let Some(publication) = wf.state.publication_name.take() {
        pg_source::drop_publication(&source.client, &publication).await?;
    }
    wf.catalog.reset_cursor(&wf.config.name).await?;
    wf.state.last_committed_lsn = common::Lsn::ZERO;
    wf.state.last_batch_id = 0;
    wf.state.skip_snapshot = false;
    wf.set_status(MirrorStatus::Created).await?;
    Ok(())
}

/// Full-mirror swap: recreate the slot first so the fresh snapshot and the
/// new streaming position meet at one consistent point, build every shadow
/// under that snapshot, then swap them all and reset the catalog cursor so
/// CDC restarts cleanly.
async fn swap_resync(wf: &mut MirrorWorkflow) -> anyhow::Result<()> {
    wf.set_status(MirrorStatus::Resyncing).await?;
    let name = wf.config.name.clone();
    let catalog = wf.catalog.clone();
    let options = wf.config.options.clone();
    let source_config = wf.config.source_peer.pg_config();
    let destination_config = wf.config.destination_peer.pg_config();

    wf.registry.end(&name).await;
    let source = pg_source::connect("resync", &source_config).await?;
    let slot = pg_source::slot_name(&name);
    pg_source::drop_slot(&source.client, &slot).await?;
    let repl = pg_source::connect_replication("resync_slot", &source_config).await?;
    let (session, created) = wf.registry.begin_with_slot(&name, repl, &slot).await?;
    let snapshot_id = session.snapshot_id.clone();

    let result = async {
        let mut destination =
            DestinationConnection::connect("resync", &destination_config).await?;
        let mut prepared = Vec::new();
        for mapping in &wf.config.table_mappings {
            let shadow = build_shadow(
                &catalog,
                &name,
                &source,
                &destination,
                &source_config,
                &destination_config,
                &snapshot_id,
                mapping,
                &options,
            )
            .await?;
            prepared.push((mapping.clone(), shadow));
        }
        for (mapping, shadow) in prepared {
            swap_into_place(&catalog, &name, &mut destination, &mapping, shadow).await?;
        }
        anyhow::Ok(())
    }
    .await;
    wf.registry.end(&name).await;
    result?;

    catalog.reset_cursor(&name).await?;
    catalog
        .advance_cursor(&name, created.consistent_point, false)
        .await?;
    wf.state.last_committed_lsn = created.consistent_point;
    wf.state.last_batch_id = 0;
    wf.state.slot_name = Some(slot);
    catalog
        .log_event(&name, EventLevel::Info, "swap resync complete", None)
        .await;
    wf.set_status(MirrorStatus::Running).await?;
    Ok(())
}

/// Single-table resync sub-flow; CDC resumes from the existing cursor
/// afterwards, and idempotent applies absorb the overlap between the fresh
/// snapshot and the stream.
pub(crate) async fn resync_table(wf: &mut MirrorWorkflow, table_ref: &str) -> anyhow::Result<()> {
    wf.set_status(MirrorStatus::Resyncing).await?;
    let mapping = wf
        .config
        .table_mappings
        .iter()
        .find(|m| m.source_ref() == table_ref)
        .cloned()
        .with_context(|| {
            ErrorMetadata::not_found(
                "TableNotMapped",
                format!("table {table_ref} is not mapped by mirror {}", wf.config.name),
            )
        })?;
    let name = wf.config.name.clone();
    let catalog = wf.catalog.clone();
    let options = wf.config.options.clone();
    let source_config = wf.config.source_peer.pg_config();
    let destination_config = wf.config.destination_peer.pg_config();

    catalog
        .set_table_status(&name, table_ref, TableStatus::Resyncing)
        .await?;
    let source = pg_source::connect("resync_table", &source_config).await?;
    let session_conn = pg_source::connect("resync_snapshot", &source_config).await?;
    let session = wf.registry.begin_standalone(&name, session_conn).await?;
    let snapshot_id = session.snapshot_id.clone();

    let result = async {
        let mut destination =
            DestinationConnection::connect("resync_table", &destination_config).await?;
        match options.resync_strategy {
            ResyncStrategy::Swap => {
                let shadow = build_shadow(
                    &catalog,
                    &name,
                    &source,
                    &destination,
                    &source_config,
                    &destination_config,
                    &snapshot_id,
                    &mapping,
                    &options,
                )
                .await?;
                swap_into_place(&catalog, &name, &mut destination, &mapping, shadow).await?;
            },
            ResyncStrategy::Truncate => {
                refill_table(
                    &catalog,
                    &name,
                    &source,
                    &destination,
                    &source_config,
                    &destination_config,
                    &snapshot_id,
                    &mapping,
                    &options,
                )
                .await?;
            },
        }
        anyhow::Ok(())
    }
    .await;
    wf.registry.end(&name).await;
    if let Err(e) = result {
        catalog
            .set_table_error(&name, table_ref, &format!("{e:#}"))
            .await?;
        return Err(e);
    }
    catalog
        .log_event(
            &name,
            EventLevel::Info,
            &format!("table {table_ref} resynced"),
            None,
        )
        .await;
    Ok(())
}

struct PreparedShadow {
    shadow_table: String,
    /// Source secondary indexes, built on the shadow under suffixed names
    /// and renamed into place after the swap.
    indexes: Vec<schema::IndexDef>,
    rows: u64,
}

/// Steps 1-3 of the swap protocol: create the shadow with the same column
/// shape and primary key, copy source rows into it under the exported
/// snapshot, and build its indexes. On failure the shadow is dropped and the
/// table marked Error; the live table is untouched.
async fn build_shadow(
    catalog: &Arc<CatalogStore>,
    name: &MirrorName,
    source: &SourceConnection,
    destination: &DestinationConnection,
    source_config: &tokio_postgres::Config,
    destination_config: &tokio_postgres::Config,
    snapshot_id: &str,
    mapping: &TableMapping,
    options: &SyncOptions,
) -> anyhow::Result<PreparedShadow> {
    let table_ref = mapping.source_ref();
    catalog
        .set_table_status(name, &table_ref, TableStatus::Resyncing)
        .await?;
    let shadow_table = shadow_name(&mapping.destination_table);

    let result = async {
        let shape = schema::introspect_table(
            &source.client,
            &mapping.source_schema,
            &mapping.source_table,
        )
        .await?
        .with_context(|| format!("source table {table_ref} does not exist"))?;
        let shape = shape.without_columns(&mapping.excluded_columns);
        let columns: Vec<String> = shape.column_names().map(str::to_owned).collect();

        // A stale shadow from an earlier failed attempt would poison the
        // copy.
        destination
            .drop_table(&mapping.destination_schema, &shadow_table)
            .await?;
        destination
            .create_table_from_schema(&shape, &mapping.destination_schema, &shadow_table)
            .await?;
        let rows = snapshot::copy_table(
            source_config,
            destination_config,
            snapshot_id,
            mapping,
            &columns,
            Some(&shadow_table),
            options.snapshot_rows_per_partition,
            options.snapshot_parallel_workers,
        )
        .await?;

        let mut indexes = Vec::new();
        if options.replicate_indexes {
            indexes = schema::list_indexes(
                &source.client,
                &mapping.source_schema,
                &mapping.source_table,
            )
            .await?
            .into_iter()
            .filter(|i| !i.is_primary)
            .collect();
            for index in &indexes {
                destination
                    .create_index_renamed(
                        index,
                        &mapping.destination_schema,
                        &shadow_table,
                        &shadow_index_name(&index.name),
                    )
                    .await?;
            }
        }
        anyhow::Ok(PreparedShadow {
            shadow_table: shadow_table.clone(),
            indexes,
            rows,
        })
    }
    .await;

    match result {
        Ok(prepared) => Ok(prepared),
        Err(e) => {
            if let Err(drop_err) = destination
                .drop_table(&mapping.destination_schema, &shadow_table)
                .await
            {
                tracing::warn!("failed to drop shadow after error: {drop_err:#}");
            }
            catalog
                .set_table_error(name, &table_ref, &format!("{e:#}"))
                .await?;
            Err(e.context(format!("building shadow for {table_ref}")))
        },
    }
}

/// Steps 4-6: drop foreign keys referencing the live table, swap atomically,
/// rename the shadow indexes into the live names, and recreate the foreign
/// keys.
async fn swap_into_place(
    catalog: &Arc<CatalogStore>,
    name: &MirrorName,
    destination: &mut DestinationConnection,
    mapping: &TableMapping,
    prepared: PreparedShadow,
) -> anyhow::Result<()> {
    let table_ref = mapping.source_ref();
    let fks = schema::list_foreign_keys(
        destination.client(),
        &mapping.destination_schema,
        &mapping.destination_table,
    )
    .await?;
    for fk in &fks {
        catalog.capture_foreign_key(name, fk).await?;
        destination
            .drop_foreign_key(&fk.table_schema, &fk.table_name, &fk.constraint_name)
            .await?;
    }

    destination
        .swap_tables(
            &mapping.destination_schema,
            &mapping.destination_table,
            &prepared.shadow_table,
        )
        .await?;

    for index in &prepared.indexes {
        destination
            .rename_index(
                &mapping.destination_schema,
                &shadow_index_name(&index.name),
                &index.name,
            )
            .await?;
    }
    destination
        .rename_index(
            &mapping.destination_schema,
            &format!("{}_pkey", prepared.shadow_table),
            &format!("{}_pkey", mapping.destination_table),
        )
        .await?;

    for fk in &fks {
        destination
            .create_foreign_key(fk, &fk.table_schema, &fk.table_name, false)
            .await?;
        catalog
            .mark_foreign_key_recreated(name, &fk.table_ref(), &fk.constraint_name)
            .await?;
    }

    catalog
        .set_table_status(name, &table_ref, TableStatus::Synced)
        .await?;
    catalog
        .record_table_progress(name, &table_ref, prepared.rows as i64, prepared.rows as i64, 0)
        .await?;
    tracing::info!(mirror = %name, table = %table_ref, rows = prepared.rows, "table swapped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        shadow_index_name,
        shadow_name,
    };

    #[test]
    fn shadow_names_are_suffixed_and_bounded() {
        assert_eq!(shadow_name("accounts"), "accounts_resync");
        assert_eq!(shadow_index_name("accounts_bal_idx"), "accounts_bal_idx_resync");
        let long = "t".repeat(80);
        assert!(shadow_name(&long).len() <= 63);
        assert!(shadow_index_name(&long).len() <= 63);
    }
}

/// Truncate-and-refill for one table.
async fn refill_table(
    catalog: &Arc<CatalogStore>,
    name: &MirrorName,
    source: &SourceConnection,
    destination: &DestinationConnection,
    source_config: &tokio_postgres::Config,
    destination_config: &tokio_postgres::Config,
    snapshot_id: &str,
    mapping: &TableMapping,
    options: &SyncOptions,
) -> anyhow::Result<()> {
    let table_ref = mapping.source_ref();
    let fks = if options.replicate_foreign_keys {
        let fks = schema::list_foreign_keys(
            destination.client(),
            &mapping.destination_schema,
            &mapping.destination_table,
        )
        .await?;
        for fk in &fks {
            catalog.capture_foreign_key(name, fk).await?;
            destination
                .drop_foreign_key(&fk.table_schema, &fk.table_name, &fk.constraint_name)
                .await?;
        }
        fks
    } else {
        Vec::new()
    };

    destination
        .truncate_cascade(&mapping.destination_schema, &mapping.destination_table)
        .await?;
    let shape = schema::introspect_table(
        &source.client,
        &mapping.source_schema,
        &mapping.source_table,
    )
    .await?
    .with_context(|| format!("source table {table_ref} does not exist"))?;
    let shape = shape.without_columns(&mapping.excluded_columns);
    let columns: Vec<String> = shape.column_names().map(str::to_owned).collect();
    let rows = snapshot::copy_table(
        source_config,
        destination_config,
        snapshot_id,
        mapping,
        &columns,
        None,
        options.snapshot_rows_per_partition,
        options.snapshot_parallel_workers,
    )
    .await?;

    for fk in &fks {
        destination
            .create_foreign_key(fk, &fk.table_schema, &fk.table_name, false)
            .await?;
        catalog
            .mark_foreign_key_recreated(name, &fk.table_ref(), &fk.constraint_name)
            .await?;
    }
    catalog
        .set_table_status(name, &table_ref, TableStatus::Synced)
        .await?;
    catalog
        .record_table_progress(name, &table_ref, rows as i64, rows as i64, 0)
        .await?;
    Ok(())
}
