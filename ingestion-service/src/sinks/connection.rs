use std::{sync::Arc, time::Duration};

use sqlx::{postgres::PgConnectOptions, Connection, PgConnection};
use water_client::{db, domain::UsageIncrement, StoreError};

/// One open connection to the aggregate store.
#[async_trait::async_trait]
pub trait StoreConnection: Send + 'static {
    async fn accumulate_daily(&mut self, increment: &UsageIncrement) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;

    async fn close(self) -> Result<(), StoreError>
    where
        Self: Sized;
}

/// Opens fresh [`StoreConnection`]s.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: StoreConnection;

    async fn connect(&self) -> Result<Self::Conn, StoreError>;

    /// Upper bound for any single connect, write, rollback or close.
    fn operation_timeout(&self) -> Duration;
}

/// Run `fut`, failing with [`StoreError::Timeout`] if it exceeds `limit`.
pub(crate) async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: std::future::Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| StoreError::Timeout(limit))?
}

pub struct PgConnector {
    options: PgConnectOptions,
    op_timeout: Duration,
}

impl PgConnector {
    pub fn new(uri: &str, op_timeout: Duration) -> Result<Self, StoreError> {
        let options: PgConnectOptions = uri.parse()?;
        Ok(Self { options, op_timeout })
    }
}

#[async_trait::async_trait]
impl Connector for PgConnector {
    type Conn = PgStoreConnection;

    async fn connect(&self) -> Result<PgStoreConnection, StoreError> {
        let conn = PgConnection::connect_with(&self.options).await?;
        Ok(PgStoreConnection { conn })
    }

    fn operation_timeout(&self) -> Duration {
        self.op_timeout
    }
}

/// A dedicated (non-pooled) Postgres connection, running each upsert in autocommit.
pub struct PgStoreConnection {
    conn: PgConnection,
}

#[async_trait::async_trait]
impl StoreConnection for PgStoreConnection {
    async fn accumulate_daily(&mut self, increment: &UsageIncrement) -> Result<(), StoreError> {
        db::accumulate_daily(&mut self.conn, increment).await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        let conn = &mut self.conn;
        sqlx::Executor::execute(conn, "ROLLBACK").await?;
        Ok(())
    }

    async fn close(self) -> Result<(), StoreError> {
        self.conn.close().await?;
        Ok(())
    }
}

/// The connection owned by a single ingestion worker.
///
/// Opened on first use and reused for every later message. When an operation
/// fails or exceeds the connector's operation timeout, the connection is rolled
/// back, closed and dropped (both best-effort), so the next call opens a fresh
/// one; the original error is returned.
pub struct WorkerConnection<C: Connector> {
    worker: usize,
    connector: Arc<C>,
    conn: Option<C::Conn>,
}

impl<C: Connector> WorkerConnection<C> {
    pub fn new(worker: usize, connector: Arc<C>) -> Self {
        Self {
            worker,
            connector,
            conn: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    fn limit(&self) -> Duration {
        self.connector.operation_timeout()
    }

    pub async fn get(&mut self) -> Result<&mut C::Conn, StoreError> {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => {
                let conn = bounded(self.limit(), self.connector.connect()).await?;
                metrics::counter!("store_connections_opened_total").increment(1);
                tracing::info!(worker = self.worker, "opened store connection");
                conn
            }
        };
        Ok(self.conn.insert(conn))
    }

    pub async fn accumulate_daily(&mut self, increment: &UsageIncrement) -> Result<(), StoreError> {
        let limit = self.limit();
        let res = bounded(limit, self.get().await?.accumulate_daily(increment)).await;
        if let Err(e) = &res {
            tracing::warn!(worker = self.worker, error = %e, "store write failed, discarding connection");
            self.invalidate().await;
        }
        res
    }

    /// Roll back and close the current connection, if any. Failures here are
    /// logged and swallowed.
    pub async fn invalidate(&mut self) {
        let limit = self.limit();
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        if let Err(e) = bounded(limit, conn.rollback()).await {
            tracing::debug!(worker = self.worker, error = %e, "rollback on failed connection failed");
        }
        if let Err(e) = bounded(limit, conn.close()).await {
            tracing::debug!(worker = self.worker, error = %e, "close on failed connection failed");
        }
    }

    pub async fn close(mut self) {
        let limit = self.limit();
        if let Some(conn) = self.conn.take() {
            if let Err(e) = bounded(limit, conn.close()).await {
                tracing::debug!(worker = self.worker, error = %e, "error closing store connection");
            }
        }
    }
}
