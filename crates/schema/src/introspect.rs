use anyhow::Context;
use common::retry::with_timeout;
use tokio_postgres::Client;

use crate::types::{
    ColumnSchema,
    ForeignKeyDef,
    IndexDef,
    ReplicaIdentity,
    TableSchema,
};

const COLUMNS_SQL: &str = r#"
SELECT a.attname, format_type(a.atttypid, a.atttypmod), a.attnotnull,
       pg_get_expr(d.adbin, d.adrelid), a.attnum
FROM pg_attribute a
JOIN pg_class c ON c.oid = a.attrelid
JOIN pg_namespace n ON n.oid = c.relnamespace
LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
WHERE n.nspname = $1 AND c.relname = $2 AND a.attnum > 0 AND NOT a.attisdropped
ORDER BY a.attnum
"#;

const PRIMARY_KEY_SQL: &str = r#"
SELECT a.attname
FROM pg_index i
JOIN pg_class c ON c.oid = i.indrelid
JOIN pg_namespace n ON n.oid = c.relnamespace
JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = ANY(i.indkey)
WHERE n.nspname = $1 AND c.relname = $2 AND i.indisprimary
ORDER BY array_position(i.indkey::int2[], a.attnum)
"#;

const REPLICA_IDENTITY_SQL: &str = r#"
SELECT c.relreplident::text
FROM pg_class c
JOIN pg_namespace n ON n.oid = c.relnamespace
WHERE n.nspname = $1 AND c.relname = $2
"#;

const INDEXES_SQL: &str = r#"
SELECT ic.relname, pg_get_indexdef(i.indexrelid), i.indisunique, i.indisprimary, am.amname
FROM pg_index i
JOIN pg_class c ON c.oid = i.indrelid
JOIN pg_class ic ON ic.oid = i.indexrelid
JOIN pg_namespace n ON n.oid = c.relnamespace
JOIN pg_am am ON am.oid = ic.relam
WHERE n.nspname = $1 AND c.relname = $2
ORDER BY ic.relname
"#;

// Both directions matter: constraints declared on the table must not block
// its refill, and constraints pointing at the table must not block truncate
// or swap.
const FOREIGN_KEYS_SQL: &str = r#"
SELECT con.conname,
       nsp.nspname, rel.relname,
       fnsp.nspname, frel.relname,
       pg_get_constraintdef(con.oid),
       con.confdeltype::text, con.confupdtype::text,
       con.condeferrable, con.condeferred
FROM pg_constraint con
JOIN pg_class rel ON rel.oid = con.conrelid
JOIN pg_namespace nsp ON nsp.oid = rel.relnamespace
JOIN pg_class frel ON frel.oid = con.confrelid
JOIN pg_namespace fnsp ON fnsp.oid = frel.relnamespace
WHERE con.contype = 'f'
  AND ((nsp.nspname = $1 AND rel.relname = $2)
    OR (fnsp.nspname = $1 AND frel.relname = $2))
ORDER BY con.conname
"#;

const TABLE_EXISTS_SQL: &str = r#"
SELECT 1 FROM pg_class c
JOIN pg_namespace n ON n.oid = c.relnamespace
WHERE n.nspname = $1 AND c.relname = $2 AND c.relkind IN ('r', 'p')
"#;

pub async fn table_exists(client: &Client, schema: &str, table: &str) -> anyhow::Result<bool> {
    let row = with_timeout(client.query_opt(TABLE_EXISTS_SQL, &[&schema, &table])).await?;
    Ok(row.is_some())
}

pub async fn replica_identity(
    client: &Client,
    schema: &str,
    table: &str,
) -> anyhow::Result<ReplicaIdentity> {
    let row = with_timeout(client.query_opt(REPLICA_IDENTITY_SQL, &[&schema, &table]))
        .await?
        .with_context(|| format!("table {schema}.{table} does not exist"))?;
    let ident: String = row.try_get(0)?;
    ident
        .chars()
        .next()
        .and_then(ReplicaIdentity::from_char)
        .with_context(|| format!("unexpected replica identity {ident:?}"))
}

/// Reads the full shape of a table, or `None` when it does not exist.
pub async fn introspect_table(
    client: &Client,
    schema: &str,
    table: &str,
) -> anyhow::Result<Option<TableSchema>> {
    if !table_exists(client, schema, table).await? {
        return Ok(None);
    }
    let rows = with_timeout(client.query(COLUMNS_SQL, &[&schema, &table])).await?;
    let mut columns = Vec::with_capacity(rows.len());
    for row in rows {
        columns.push(ColumnSchema {
            name: row.try_get(0)?,
            data_type: row.try_get(1)?,
            nullable: !row.try_get::<_, bool>(2)?,
            default: row.try_get(3)?,
            ordinal: row.try_get(4)?,
        });
    }
    let pk_rows = with_timeout(client.query(PRIMARY_KEY_SQL, &[&schema, &table])).await?;
    let primary_key = pk_rows
        .iter()
        .map(|r| r.try_get(0))
        .collect::<Result<Vec<String>, _>>()?;
    let replica_identity = replica_identity(client, schema, table).await?;
    Ok(Some(TableSchema {
        schema: schema.to_owned(),
        name: table.to_owned(),
        columns,
        primary_key,
        replica_identity,
    }))
}

pub async fn list_indexes(
    client: &Client,
    schema: &str,
    table: &str,
) -> anyhow::Result<Vec<IndexDef>> {
    let rows = with_timeout(client.query(INDEXES_SQL, &[&schema, &table])).await?;
    let mut indexes = Vec::with_capacity(rows.len());
    for row in rows {
        indexes.push(IndexDef {
            schema: schema.to_owned(),
            table: table.to_owned(),
            name: row.try_get(0)?,
            definition: row.try_get(1)?,
            is_unique: row.try_get(2)?,
            is_primary: row.try_get(3)?,
            index_type: row.try_get(4)?,
        });
    }
    Ok(indexes)
}

/// Foreign keys declared on *or pointing at* the given table.
pub async fn list_foreign_keys(
    client: &Client,
    schema: &str,
    table: &str,
) -> anyhow::Result<Vec<ForeignKeyDef>> {
    let rows = with_timeout(client.query(FOREIGN_KEYS_SQL, &[&schema, &table])).await?;
    let mut fks = Vec::with_capacity(rows.len());
    for row in rows {
        fks.push(ForeignKeyDef {
            constraint_name: row.try_get(0)?,
            table_schema: row.try_get(1)?,
            table_name: row.try_get(2)?,
            referenced_schema: row.try_get(3)?,
            referenced_table: row.try_get(4)?,
            definition: row.try_get(5)?,
            on_delete: action_name(row.try_get::<_, String>(6)?.as_str()).to_owned(),
            on_update: action_name(row.try_get::<_, String>(7)?.as_str()).to_owned(),
            is_deferrable: row.try_get(8)?,
            initially_deferred: row.try_get(9)?,
        });
    }
    Ok(fks)
}

fn action_name(code: &str) -> &'static str {
    match code {
        "a" => "NO ACTION",
        "r" => "RESTRICT",
        "c" => "CASCADE",
        "n" => "SET NULL",
        "d" => "SET DEFAULT",
        _ => "NO ACTION",
    }
}
