//! Destination adapter: applies change records idempotently by primary key
//! and executes the DDL the engine needs on the receiving database (table
//! creation, truncation, index/FK management, atomic table swaps).

pub mod sql;

use std::future;
use std::task::{
    ready,
    Poll,
};

use anyhow::Context as _;
use bytes::Bytes;
use common::{
    errors::classify_pg_error,
    identifiers::{
        quote_ident,
        quote_qualified,
    },
    knobs::MAX_CACHED_STATEMENTS,
    retry::with_timeout,
};
use itertools::Itertools as _;
use lru::LruCache;
use parking_lot::Mutex;
use tokio_postgres::{
    types::ToSql,
    AsyncMessage,
    Client,
    CopyInSink,
    Statement,
};
use tokio_util::task::AbortOnDropHandle;

pub use crate::sql::{
    build_apply,
    create_table_sql,
    ApplyStatement,
    TableApplyInfo,
};

pub struct DestinationConnection {
    client: Client,
    statement_cache: Mutex<LruCache<String, Statement>>,
    _driver: AbortOnDropHandle<()>,
}

impl DestinationConnection {
    pub async fn connect(
        name: &'static str,
        config: &tokio_postgres::Config,
    ) -> anyhow::Result<Self> {
        let tls = common::tls::tls_connect()?;
        let (client, mut conn) = with_timeout(config.connect(tls))
            .await
            .map_err(|e| e.context(format!("connecting to destination for {name}")))?;
        let driver = AbortOnDropHandle::new(tokio::spawn(future::poll_fn(move |cx| loop {
            match ready!(conn.poll_message(cx)) {
                Some(Ok(AsyncMessage::Notice(notice))) => {
                    tracing::debug!("{}: {}", notice.severity(), notice.message());
                },
                Some(Ok(msg)) => {
                    tracing::warn!("unexpected message: {:?}", msg);
                },
                Some(Err(e)) => {
                    tracing::error!("destination connection error: {e}");
                    return Poll::Ready(());
                },
                None => return Poll::Ready(()),
            }
        })));
        Ok(DestinationConnection {
            client,
            statement_cache: Mutex::new(LruCache::new(*MAX_CACHED_STATEMENTS)),
            _driver: driver,
        })
    }

    /// The raw client, for schema introspection against the destination.
    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn prepare_cached(&self, sql: &str) -> anyhow::Result<Statement> {
        if let Some(prepared) = self.statement_cache.lock().get(sql) {
            return Ok(prepared.clone());
        }
        let prepared = with_timeout(async {
            self.client
                .prepare(sql)
                .await
                .map_err(|e| classify_pg_error(e, "preparing statement"))
        })
        .await?;
        self.statement_cache
            .lock()
            .put(sql.to_owned(), prepared.clone());
        Ok(prepared)
    }

    async fn execute_ddl(&self, sql: &str) -> anyhow::Result<()> {
        tracing::debug!(sql, "executing destination DDL");
        with_timeout(async {
            self.client
                .batch_execute(sql)
                .await
                .map_err(|e| classify_pg_error(e, "executing DDL"))
        })
        .await
    }

    pub async fn ensure_schema(&self, name: &str) -> anyhow::Result<()> {
        self.execute_ddl(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(name)))
            .await
    }

    pub async fn create_table_from_schema(
        &self,
        shape: &schema::TableSchema,
        dest_schema: &str,
        dest_table: &str,
    ) -> anyhow::Result<()> {
        self.ensure_schema(dest_schema).await?;
        self.execute_ddl(&sql::create_table_sql(shape, dest_schema, dest_table))
            .await
    }

    /// Applies one already-built statement outside any explicit transaction.
    pub async fn apply(&self, statement: &ApplyStatement) -> anyhow::Result<u64> {
        let prepared = self.prepare_cached(&statement.sql).await?;
        let params = param_refs(&statement.params);
        with_timeout(async {
            self.client
                .execute(&prepared, &params)
                .await
                .map_err(|e| classify_pg_error(e, "applying record"))
        })
        .await
    }

    /// Applies a batch of statements in one destination transaction. Either
    /// every statement commits or none do.
    pub async fn apply_batch(&mut self, statements: &[ApplyStatement]) -> anyhow::Result<u64> {
        let mut prepared = Vec::with_capacity(statements.len());
        for statement in statements {
            prepared.push(self.prepare_cached(&statement.sql).await?);
        }
        let txn = with_timeout(async {
            self.client
                .transaction()
                .await
                .map_err(|e| classify_pg_error(e, "beginning apply transaction"))
        })
        .await?;
        let mut affected = 0;
        for (statement, prepared) in statements.iter().zip(prepared.iter()) {
            let params = param_refs(&statement.params);
            affected += with_timeout(async {
                txn.execute(prepared, &params)
                    .await
                    .map_err(|e| classify_pg_error(e, "applying record"))
            })
            .await?;
        }
        with_timeout(async {
            txn.commit()
                .await
                .map_err(|e| classify_pg_error(e, "committing apply transaction"))
        })
        .await?;
        Ok(affected)
    }

    pub async fn add_column(
        &self,
        dest_schema: &str,
        dest_table: &str,
        column: &schema::ColumnSchema,
    ) -> anyhow::Result<()> {
        self.execute_ddl(&schema::add_column_sql(dest_schema, dest_table, column))
            .await
    }

    pub async fn truncate_cascade(&self, schema: &str, table: &str) -> anyhow::Result<()> {
        self.execute_ddl(&format!(
            "TRUNCATE TABLE {} CASCADE",
            quote_qualified(schema, table),
        ))
        .await
    }

    pub async fn create_index(
        &self,
        index: &schema::IndexDef,
        dest_schema: &str,
        dest_table: &str,
        concurrently: bool,
    ) -> anyhow::Result<()> {
        let sql = schema::index_create_sql(index, dest_schema, dest_table, None, concurrently);
        self.execute_ddl(&sql).await
    }

    /// Builds an index under a different name, for shadow tables whose
    /// indexes will be renamed into place after the swap.
    pub async fn create_index_renamed(
        &self,
        index: &schema::IndexDef,
        dest_schema: &str,
        dest_table: &str,
        new_name: &str,
    ) -> anyhow::Result<()> {
        let sql = schema::index_create_sql(index, dest_schema, dest_table, Some(new_name), false);
        self.execute_ddl(&sql).await
    }

    pub async fn drop_index(&self, schema: &str, name: &str) -> anyhow::Result<()> {
        self.execute_ddl(&format!(
            "DROP INDEX IF EXISTS {}",
            quote_qualified(schema, name),
        ))
        .await
    }

    pub async fn rename_index(&self, schema: &str, from: &str, to: &str) -> anyhow::Result<()> {
        self.execute_ddl(&format!(
            "ALTER INDEX IF EXISTS {} RENAME TO {}",
            quote_qualified(schema, from),
            quote_ident(to),
        ))
        .await
    }

    /// Restores a captured foreign key: `ADD CONSTRAINT .. NOT VALID`
    /// followed by `VALIDATE CONSTRAINT`, so the destination never holds a
    /// long validation lock.
    pub async fn create_foreign_key(
        &self,
        fk: &schema::ForeignKeyDef,
        dest_schema: &str,
        dest_table: &str,
        make_deferrable: bool,
    ) -> anyhow::Result<()> {
        let (add, validate) =
            schema::foreign_key_restore_sql(fk, dest_schema, dest_table, make_deferrable);
        self.execute_ddl(&add).await?;
        self.execute_ddl(&validate).await
    }

    pub async fn drop_foreign_key(
        &self,
        schema: &str,
        table: &str,
        constraint: &str,
    ) -> anyhow::Result<()> {
        self.execute_ddl(&format!(
            "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}",
            quote_qualified(schema, table),
            quote_ident(constraint),
        ))
        .await
    }

    pub async fn drop_table(&self, schema: &str, table: &str) -> anyhow::Result<()> {
        self.execute_ddl(&format!(
            "DROP TABLE IF EXISTS {} CASCADE",
            quote_qualified(schema, table),
        ))
        .await
    }

    /// Atomically swaps the shadow table into the live name. Runs as one
    /// transaction under ACCESS EXCLUSIVE locks: readers see the old table
    /// until commit and the new one after, never an absent table. Callers
    /// drop foreign keys referencing the live table beforehand and recreate
    /// them afterwards.
    pub async fn swap_tables(
        &mut self,
        schema: &str,
        live: &str,
        shadow: &str,
    ) -> anyhow::Result<()> {
        let retired = format!("{live}_old");
        let live_qualified = quote_qualified(schema, live);
        let shadow_qualified = quote_qualified(schema, shadow);
        let script = format!(
            "LOCK TABLE {live_qualified}, {shadow_qualified} IN ACCESS EXCLUSIVE MODE;\n\
             ALTER TABLE {live_qualified} RENAME TO {retired_ident};\n\
             ALTER TABLE {shadow_qualified} RENAME TO {live_ident};\n\
             DROP TABLE {retired_qualified};",
            retired_ident = quote_ident(&retired),
            live_ident = quote_ident(live),
            retired_qualified = quote_qualified(schema, &retired),
        );
        let txn = with_timeout(async {
            self.client
                .transaction()
                .await
                .map_err(|e| classify_pg_error(e, "beginning swap transaction"))
        })
        .await?;
        with_timeout(async {
            txn.batch_execute(&script)
                .await
                .map_err(|e| classify_pg_error(e, "swapping tables"))
        })
        .await?;
        with_timeout(async {
            txn.commit()
                .await
                .map_err(|e| classify_pg_error(e, "committing swap"))
        })
        .await?;
        tracing::info!(schema, live, shadow, "swapped shadow table into place");
        Ok(())
    }

    /// Opens a text-format COPY into the given table. Chunks fed to the sink
    /// are raw COPY text, which is exactly what a source-side
    /// `COPY .. TO STDOUT` emits.
    pub async fn copy_in_text(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
    ) -> anyhow::Result<CopyInSink<Bytes>> {
        let column_list = columns.iter().map(|c| quote_ident(c)).join(", ");
        let sql = format!(
            "COPY {} ({}) FROM STDIN",
            quote_qualified(schema, table),
            column_list,
        );
        with_timeout(async {
            self.client
                .copy_in(&sql)
                .await
                .map_err(|e| classify_pg_error(e, "starting COPY IN"))
        })
        .await
        .context("opening destination COPY")
    }
}

fn param_refs(params: &[Option<String>]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}
