use common::{
    errors::classify_pg_error,
    identifiers::{
        quote_ident,
        quote_qualified,
    },
    retry::with_timeout,
};
use itertools::Itertools as _;
use tokio_postgres::Client;

pub async fn publication_exists(client: &Client, name: &str) -> anyhow::Result<bool> {
    let row = with_timeout(
        client.query_opt("SELECT 1 FROM pg_publication WHERE pubname = $1", &[&name]),
    )
    .await?;
    Ok(row.is_some())
}

/// Creates the publication covering the mirrored tables. An existing
/// publication with the same name is reused.
pub async fn create_publication(
    client: &Client,
    name: &str,
    tables: &[(String, String)],
) -> anyhow::Result<()> {
    if publication_exists(client, name).await? {
        tracing::debug!(publication = name, "publication already exists, reusing");
        return Ok(());
    }
    let table_list = tables
        .iter()
        .map(|(schema, table)| quote_qualified(schema, table))
        .join(", ");
    let sql = format!("CREATE PUBLICATION {} FOR TABLE {}", quote_ident(name), table_list);
    with_timeout(async {
        client
            .batch_execute(&sql)
            .await
            .map_err(|e| classify_pg_error(e, "creating publication"))
    })
    .await?;
    tracing::info!(publication = name, tables = tables.len(), "created publication");
    Ok(())
}

pub async fn drop_publication(client: &Client, name: &str) -> anyhow::Result<()> {
    let sql = format!("DROP PUBLICATION IF EXISTS {}", quote_ident(name));
    with_timeout(async {
        client
            .batch_execute(&sql)
            .await
            .map_err(|e| classify_pg_error(e, "dropping publication"))
    })
    .await?;
    Ok(())
}
