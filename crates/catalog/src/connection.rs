//! Catalog connections.
//!
//! A small purpose-built pool: checked-in connections sit on a LIFO stack
//! and are pruned by checkout/check-in traffic itself, so there is no
//! background reaper task. Each connection carries a prepared-statement map
//! that is flushed wholesale when it reaches capacity, which keeps the
//! server-side statement count bounded without recency bookkeeping. A
//! connection that times out or drops its socket is discarded on the spot
//! and never returns to the stack.
//!
//! Every statement may reference the catalog schema as `@schema`; the pool
//! substitutes the escaped name before preparing.

use std::{
    collections::HashMap,
    sync::Arc,
};

use anyhow::Context as _;
use common::{
    errors::ErrorMetadataAnyhowExt,
    knobs::{
        CATALOG_INACTIVE_CONNECTION_LIFETIME,
        CATALOG_MAX_CONNECTIONS,
        MAX_CACHED_STATEMENTS,
    },
    retry::with_timeout,
};
use parking_lot::Mutex;
use tokio::{
    sync::{
        Semaphore,
        SemaphorePermit,
    },
    time::Instant,
};
use tokio_postgres::{
    types::ToSql,
    Row,
    Statement,
    Transaction,
};
use tokio_postgres_rustls::MakeRustlsConnect;

/// One live session plus its prepared statements.
struct CatalogConn {
    client: tokio_postgres::Client,
    statements: HashMap<String, Statement>,
}

struct ParkedConn {
    conn: CatalogConn,
    parked_at: Instant,
}

impl ParkedConn {
    fn expired(&self) -> bool {
        self.parked_at.elapsed() > *CATALOG_INACTIVE_CONNECTION_LIFETIME
    }
}

/// The catalog connection pool; always used behind an `Arc`.
pub struct CatalogPool {
    config: tokio_postgres::Config,
    tls: MakeRustlsConnect,
    /// Escaped schema substituted for `@schema` in statements.
    schema_escaped: String,
    /// Caps how many connections are out at once.
    limit: Semaphore,
    idle: Mutex<Vec<ParkedConn>>,
}

impl CatalogPool {
    pub fn new(config: tokio_postgres::Config, schema: &str) -> anyhow::Result<Arc<Self>> {
        anyhow::ensure!(
            !schema.starts_with("pg_") && !schema.contains('\0'),
            "invalid catalog schema name {schema:?}",
        );
        Ok(Arc::new(CatalogPool {
            config,
            tls: common::tls::tls_connect()?,
            schema_escaped: common::identifiers::quote_ident(schema),
            limit: Semaphore::new(*CATALOG_MAX_CONNECTIONS),
            idle: Mutex::new(Vec::new()),
        }))
    }

    pub async fn get_connection(&self) -> anyhow::Result<CatalogConnection<'_>> {
        let permit = self
            .limit
            .acquire()
            .await
            .context("catalog pool is shut down")?;
        let conn = match self.unpark() {
            Some(conn) => conn,
            None => self.dial().await?,
        };
        Ok(CatalogConnection {
            pool: self,
            _permit: permit,
            inner: Some(conn),
        })
    }

    /// Pops the most recently parked usable connection. Entries deeper in
    /// the stack are older, so once a popped entry has expired everything
    /// under it has too and the loop drains them.
    fn unpark(&self) -> Option<CatalogConn> {
        let mut idle = self.idle.lock();
        while let Some(parked) = idle.pop() {
            if parked.expired() || parked.conn.client.is_closed() {
                continue;
            }
            return Some(parked.conn);
        }
        None
    }

    fn park(&self, conn: CatalogConn) {
        if self.limit.is_closed() {
            return;
        }
        let mut idle = self.idle.lock();
        // Old connections settle at the bottom of the stack; evict them as
        // new ones come back instead of running a reaper task.
        while idle.first().is_some_and(ParkedConn::expired) {
            idle.remove(0);
        }
        idle.push(ParkedConn {
            conn,
            parked_at: Instant::now(),
        });
    }

    async fn dial(&self) -> anyhow::Result<CatalogConn> {
        let (client, connection) = with_timeout(self.config.connect(self.tls.clone())).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("catalog connection error: {e}");
            }
        });
        Ok(CatalogConn {
            client,
            statements: HashMap::new(),
        })
    }

    /// Closes the pool: parked connections drop and checked-out ones are not
    /// taken back.
    pub fn shutdown(&self) {
        self.limit.close();
        self.idle.lock().clear();
    }
}

/// A connection checked out of the pool, parked again on drop unless a
/// failure made the session unusable.
pub struct CatalogConnection<'a> {
    pool: &'a CatalogPool,
    _permit: SemaphorePermit<'a>,
    inner: Option<CatalogConn>,
}

impl CatalogConnection<'_> {
    fn client(&self) -> anyhow::Result<&tokio_postgres::Client> {
        self.inner
            .as_ref()
            .map(|conn| &conn.client)
            .context("catalog connection was discarded after an earlier failure")
    }

    /// Inspects a failed result and throws the connection away when the
    /// session cannot be trusted anymore: the socket is gone, or a timed-out
    /// call may still be executing server-side.
    fn check<T>(&mut self, result: anyhow::Result<T>) -> anyhow::Result<T> {
        if let Err(e) = &result {
            let timed_out = e.short_msg() == Some("PostgresTimeout");
            let closed = self
                .inner
                .as_ref()
                .is_some_and(|conn| conn.client.is_closed());
            if timed_out || closed {
                tracing::warn!("discarding catalog connection: {e:#}");
                self.inner = None;
            }
        }
        result
    }

    async fn statement(&mut self, query: &str) -> anyhow::Result<Statement> {
        let sql = query.replace("@schema", &self.pool.schema_escaped);
        if let Some(found) = self.inner.as_ref().and_then(|c| c.statements.get(&sql)) {
            return Ok(found.clone());
        }
        let prepared = {
            let client = self.client()?;
            with_timeout(client.prepare(&sql)).await
        };
        let prepared = self.check(prepared)?;
        let conn = self
            .inner
            .as_mut()
            .context("catalog connection was discarded after an earlier failure")?;
        cache_statement(&mut conn.statements, sql, &prepared);
        Ok(prepared)
    }

    pub async fn batch_execute(&mut self, query: &str) -> anyhow::Result<()> {
        let sql = query.replace("@schema", &self.pool.schema_escaped);
        let result = with_timeout(self.client()?.batch_execute(&sql)).await;
        self.check(result)
    }

    pub async fn query(
        &mut self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<Vec<Row>> {
        let statement = self.statement(query).await?;
        let result = with_timeout(self.client()?.query(&statement, params)).await;
        self.check(result)
    }

    pub async fn query_opt(
        &mut self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<Option<Row>> {
        let statement = self.statement(query).await?;
        let result = with_timeout(self.client()?.query_opt(&statement, params)).await;
        self.check(result)
    }

    pub async fn execute(
        &mut self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<u64> {
        let statement = self.statement(query).await?;
        let result = with_timeout(self.client()?.execute(&statement, params)).await;
        self.check(result)
    }

    pub async fn transaction(&mut self) -> anyhow::Result<CatalogTransaction<'_>> {
        let schema = self.pool.schema_escaped.as_str();
        let CatalogConn { client, statements } = self
            .inner
            .as_mut()
            .context("catalog connection was discarded after an earlier failure")?;
        let inner = with_timeout(client.transaction()).await?;
        Ok(CatalogTransaction {
            inner,
            statements,
            schema,
        })
    }
}

impl Drop for CatalogConnection<'_> {
    fn drop(&mut self) {
        let Some(conn) = self.inner.take() else {
            return;
        };
        if conn.client.is_closed() {
            return;
        }
        self.pool.park(conn);
    }
}

pub struct CatalogTransaction<'a> {
    inner: Transaction<'a>,
    statements: &'a mut HashMap<String, Statement>,
    schema: &'a str,
}

impl CatalogTransaction<'_> {
    async fn statement(&mut self, query: &str) -> anyhow::Result<Statement> {
        let sql = query.replace("@schema", self.schema);
        if let Some(found) = self.statements.get(&sql) {
            return Ok(found.clone());
        }
        let prepared = with_timeout(self.inner.client().prepare(&sql)).await?;
        cache_statement(self.statements, sql, &prepared);
        Ok(prepared)
    }

    pub async fn execute(
        &mut self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<u64> {
        let statement = self.statement(query).await?;
        with_timeout(self.inner.execute(&statement, params)).await
    }

    pub async fn commit(self) -> anyhow::Result<()> {
        with_timeout(self.inner.commit()).await
    }
}

/// Caches a prepared statement, flushing the whole map first when it is at
/// capacity. Dropping the old statements deallocates them server-side.
fn cache_statement(statements: &mut HashMap<String, Statement>, sql: String, prepared: &Statement) {
    if statements.len() >= MAX_CACHED_STATEMENTS.get() {
        statements.clear();
    }
    statements.insert(sql, prepared.clone());
}
