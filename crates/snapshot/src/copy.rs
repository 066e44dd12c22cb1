//! Partition copies: `COPY .. TO STDOUT` on the source piped straight into
//! `COPY .. FROM STDIN` on the destination. Both sides speak the same text
//! COPY format, so chunks pass through unparsed.

use anyhow::Context as _;
use common::{
    identifiers::quote_literal,
    mirror::TableMapping,
    retry::with_timeout,
};
use futures::{
    pin_mut,
    SinkExt,
    StreamExt,
};
use pg_destination::DestinationConnection;
use pg_source::simple_query_opt;

use crate::partition::{
    copy_out_query,
    PartitionSpec,
};

/// Copies one partition of one table under the given exported snapshot.
/// Opens its own source and destination connections; returns the row count
/// reported by the destination COPY.
pub async fn copy_partition(
    source_config: &tokio_postgres::Config,
    destination_config: &tokio_postgres::Config,
    snapshot_id: &str,
    mapping: &TableMapping,
    columns: &[String],
    dest_table_override: Option<&str>,
    partition: Option<PartitionSpec>,
) -> anyhow::Result<u64> {
    let source = pg_source::connect("snapshot_partition", source_config).await?;
    simple_query_opt(
        &source.client,
        "BEGIN READ ONLY ISOLATION LEVEL REPEATABLE READ;",
    )
    .await?;
    simple_query_opt(
        &source.client,
        &format!("SET TRANSACTION SNAPSHOT {};", quote_literal(snapshot_id)),
    )
    .await
    .context("importing snapshot")?;

    let destination = DestinationConnection::connect("snapshot_partition", destination_config)
        .await?;
    let dest_table = dest_table_override.unwrap_or(&mapping.destination_table);
    let sink = destination
        .copy_in_text(&mapping.destination_schema, dest_table, columns)
        .await?;
    pin_mut!(sink);

    let out_query = copy_out_query(mapping, columns, partition);
    let stream = source
        .client
        .copy_out(&out_query)
        .await
        .with_context(|| format!("starting COPY OUT for {}", mapping.source_ref()))?;
    pin_mut!(stream);

    loop {
        let chunk = with_timeout(async {
            anyhow::Ok(stream.next().await.transpose().context("reading COPY stream")?)
        })
        .await?;
        let Some(chunk) = chunk else { break };
        sink.send(chunk).await.context("writing COPY stream")?;
    }
    let rows = sink.finish().await.context("finishing COPY")?;

    simple_query_opt(&source.client, "COMMIT;").await?;
    tracing::debug!(
        table = %mapping.source_ref(),
        partition = ?partition,
        rows,
        "copied partition",
    );
    Ok(rows)
}

/// Copies a whole table: plans partitions from the row-count estimate and
/// runs them with bounded parallelism. A failed partition does not stop
/// partitions already in flight; the first error is surfaced after all
/// complete.
pub async fn copy_table(
    source_config: &tokio_postgres::Config,
    destination_config: &tokio_postgres::Config,
    snapshot_id: &str,
    mapping: &TableMapping,
    columns: &[String],
    dest_table_override: Option<&str>,
    rows_per_partition: u64,
    partitions_in_parallel: usize,
) -> anyhow::Result<u64> {
    let source = pg_source::connect("snapshot_plan", source_config).await?;
    let approx_rows = pg_source::approx_row_count(
        &source.client,
        &mapping.source_schema,
        &mapping.source_table,
    )
    .await?;
    drop(source);

    let total = if mapping.partition_key.is_some() {
        crate::partition::partition_count(approx_rows, rows_per_partition)
    } else {
        1
    };
    tracing::info!(
        table = %mapping.source_ref(),
        approx_rows,
        partitions = total,
        "copying table",
    );

    let copies = futures::stream::iter((0..total).map(|index| {
        let partition = PartitionSpec { index, total };
        async move {
            copy_partition(
                source_config,
                destination_config,
                snapshot_id,
                mapping,
                columns,
                dest_table_override,
                Some(partition),
            )
            .await
            .with_context(|| format!("partition {index}/{total} of {}", mapping.source_ref()))
        }
    }))
    .buffer_unordered(partitions_in_parallel.max(1));
    let results: Vec<anyhow::Result<u64>> = copies.collect().await;

    let mut rows = 0;
    let mut first_error = None;
    for result in results {
        match result {
            Ok(n) => rows += n,
            Err(e) => {
                tracing::error!(table = %mapping.source_ref(), "partition copy failed: {e:#}");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            },
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(rows),
    }
}
