use std::{
    future,
    task::{
        ready,
        Poll,
    },
};

use common::{
    errors::classify_pg_error,
    retry::with_timeout,
};
use tokio_postgres::{
    config::ReplicationMode,
    AsyncMessage,
    Client,
    SimpleQueryMessage,
    SimpleQueryRow,
};
use tokio_util::task::AbortOnDropHandle;

/// A regular (query-protocol) connection to the source database. The
/// connection task is aborted when this handle drops, so a connection never
/// outlives the activity that opened it.
pub struct SourceConnection {
    pub client: Client,
    _driver: AbortOnDropHandle<()>,
}

/// A replication-mode connection. Accepts simple queries plus the
/// replication grammar (`CREATE_REPLICATION_SLOT`, `START_REPLICATION`).
pub struct ReplicationClient {
    pub client: Client,
    _driver: AbortOnDropHandle<()>,
}

async fn connect_inner(
    name: &'static str,
    config: &tokio_postgres::Config,
) -> anyhow::Result<(Client, AbortOnDropHandle<()>)> {
    let tls = common::tls::tls_connect()?;
    let (client, mut conn) = with_timeout(config.connect(tls))
        .await
        .map_err(|e| e.context(format!("connecting to source for {name}")))?;
    let driver = AbortOnDropHandle::new(tokio::spawn(future::poll_fn(move |cx| loop {
        match ready!(conn.poll_message(cx)) {
            Some(Ok(AsyncMessage::Notice(notice))) => {
                tracing::info!("{}: {}", notice.severity(), notice.message());
            },
            Some(Ok(msg)) => {
                tracing::warn!("unexpected message: {:?}", msg);
            },
            Some(Err(e)) => {
                tracing::error!("source connection error: {e}");
                return Poll::Ready(());
            },
            None => return Poll::Ready(()),
        }
    })));
    Ok((client, driver))
}

pub async fn connect(
    name: &'static str,
    config: &tokio_postgres::Config,
) -> anyhow::Result<SourceConnection> {
    let (client, driver) = connect_inner(name, config).await?;
    Ok(SourceConnection {
        client,
        _driver: driver,
    })
}

pub async fn connect_replication(
    name: &'static str,
    config: &tokio_postgres::Config,
) -> anyhow::Result<ReplicationClient> {
    let mut config = config.clone();
    config.replication_mode(ReplicationMode::Logical);
    let (client, driver) = connect_inner(name, &config).await?;
    Ok(ReplicationClient {
        client,
        _driver: driver,
    })
}

/// Runs a simple-protocol query and returns its first row, if any. The
/// replication grammar is only reachable through the simple protocol.
pub async fn simple_query_opt(
    client: &Client,
    query: &str,
) -> anyhow::Result<Option<SimpleQueryRow>> {
    let messages = with_timeout(async {
        client
            .simple_query(query)
            .await
            .map_err(|e| classify_pg_error(e, "simple query"))
    })
    .await?;
    for message in messages {
        if let SimpleQueryMessage::Row(row) = message {
            return Ok(Some(row));
        }
    }
    Ok(None)
}
