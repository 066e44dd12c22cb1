use anyhow::Context;
use common::{
    errors::{
        classify_pg_error,
        ErrorMetadata,
    },
    identifiers::{
        quote_ident,
        quote_qualified,
    },
    knobs::SLOT_DROP_TERMINATE_WAIT,
    retry::with_timeout,
    Lsn,
};
use tokio_postgres::Client;

use crate::connection::{
    simple_query_opt,
    ReplicationClient,
};

/// Result of creating a replication slot: the snapshot identifier is valid
/// while the creating transaction stays open, and is handed out exactly once
/// per slot creation.
#[derive(Clone, Debug)]
pub struct CreatedSlot {
    pub snapshot_id: String,
    /// The LSN at which streaming must start for the snapshot and the WAL
    /// tail to meet without gap or overlap.
    pub consistent_point: Lsn,
}

pub async fn slot_exists(client: &Client, name: &str) -> anyhow::Result<bool> {
    let row = with_timeout(client.query_opt(
        "SELECT 1 FROM pg_replication_slots WHERE slot_name = $1",
        &[&name],
    ))
    .await?;
    Ok(row.is_some())
}

/// Creates the slot inside a freshly opened REPEATABLE READ transaction on
/// the replication connection and exports the slot-creation snapshot. The
/// transaction is left open; the caller owns ending it (the snapshot session
/// keeps it alive for the duration of the table copies).
pub async fn create_slot_with_snapshot(
    repl: &ReplicationClient,
    slot: &str,
) -> anyhow::Result<CreatedSlot> {
    simple_query_opt(
        &repl.client,
        "BEGIN READ ONLY ISOLATION LEVEL REPEATABLE READ;",
    )
    .await
    .context("beginning snapshot transaction")?;
    let create = format!(
        "CREATE_REPLICATION_SLOT {} LOGICAL pgoutput USE_SNAPSHOT",
        quote_ident(slot),
    );
    let row = simple_query_opt(&repl.client, &create)
        .await
        .with_context(|| format!("creating replication slot {slot}"))?
        .context("CREATE_REPLICATION_SLOT returned no row")?;
    let consistent_point: Lsn = row
        .get("consistent_point")
        .context("missing consistent_point")?
        .parse()?;
    let snapshot_row = simple_query_opt(&repl.client, "SELECT pg_export_snapshot();")
        .await?
        .context("pg_export_snapshot returned no row")?;
    let snapshot_id = snapshot_row
        .get(0)
        .context("missing snapshot identifier")?
        .to_owned();
    tracing::info!(slot, %consistent_point, snapshot_id, "created replication slot");
    Ok(CreatedSlot {
        snapshot_id,
        consistent_point,
    })
}

/// Opens a REPEATABLE READ transaction and exports a fresh snapshot without
/// touching any slot, for shadow-table rebuilds. The transaction is left
/// open, as above.
pub async fn export_snapshot(client: &Client) -> anyhow::Result<String> {
    simple_query_opt(client, "BEGIN READ ONLY ISOLATION LEVEL REPEATABLE READ;")
        .await
        .context("beginning snapshot transaction")?;
    let row = simple_query_opt(client, "SELECT pg_export_snapshot();")
        .await?
        .context("pg_export_snapshot returned no row")?;
    Ok(row.get(0).context("missing snapshot identifier")?.to_owned())
}

/// Drops a slot. A backend holding the slot active blocks the drop, so any
/// active backend is terminated first (best effort), then we wait out the
/// server's cleanup before dropping.
pub async fn drop_slot(client: &Client, name: &str) -> anyhow::Result<()> {
    let active_pid = with_timeout(client.query_opt(
        "SELECT active_pid FROM pg_replication_slots WHERE slot_name = $1",
        &[&name],
    ))
    .await?;
    let Some(slot_row) = active_pid else {
        tracing::debug!(slot = name, "slot does not exist, nothing to drop");
        return Ok(());
    };
    if let Some(pid) = slot_row.try_get::<_, Option<i32>>(0)? {
        let terminated = with_timeout(
            client.query_opt("SELECT pg_terminate_backend($1)", &[&pid]),
        )
        .await;
        if let Err(e) = terminated {
            tracing::warn!(slot = name, pid, "failed to terminate slot holder: {e:#}");
        }
        tokio::time::sleep(*SLOT_DROP_TERMINATE_WAIT).await;
    }
    with_timeout(async {
        client
            .execute("SELECT pg_drop_replication_slot($1)", &[&name])
            .await
            .map_err(|e| classify_pg_error(e, "dropping replication slot"))
    })
    .await?;
    tracing::info!(slot = name, "dropped replication slot");
    Ok(())
}

pub async fn get_table_oid(client: &Client, schema: &str, table: &str) -> anyhow::Result<u32> {
    let row = with_timeout(client.query_opt(
        r#"
        SELECT c.oid FROM pg_class c
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE n.nspname = $1 AND c.relname = $2
        "#,
        &[&schema, &table],
    ))
    .await?
    .with_context(|| {
        ErrorMetadata::not_found(
            "TableNotFound",
            format!("table {schema}.{table} does not exist on the source"),
        )
    })?;
    Ok(row.try_get(0)?)
}

/// Planner estimate of a table's row count, used only to pick a partition
/// count. Falls back to an exact count when the table has never been
/// analyzed.
pub async fn approx_row_count(client: &Client, schema: &str, table: &str) -> anyhow::Result<u64> {
    let row = with_timeout(client.query_one(
        r#"
        SELECT c.reltuples::bigint FROM pg_class c
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE n.nspname = $1 AND c.relname = $2
        "#,
        &[&schema, &table],
    ))
    .await?;
    let estimate: i64 = row.try_get(0)?;
    if estimate >= 0 {
        return Ok(estimate as u64);
    }
    let count_sql = format!("SELECT count(*) FROM {}", quote_qualified(schema, table));
    let row = with_timeout(client.query_one(&count_sql, &[])).await?;
    Ok(row.try_get::<_, i64>(0)? as u64)
}

pub async fn server_version_num(client: &Client) -> anyhow::Result<i32> {
    let row = simple_query_opt(client, "SHOW server_version_num")
        .await?
        .context("SHOW server_version_num returned no row")?;
    row.get(0)
        .context("missing server_version_num")?
        .parse()
        .context("unparseable server_version_num")
}
