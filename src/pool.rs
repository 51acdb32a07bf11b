//! PostgreSQL connection pool.
//!
//! The pool maintains a bounded set of reusable connections, each with its
//! own statement cache, and hands out sessions that seize one connection
//! for their whole lifetime.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Buf;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::connection::{PgConfig, PgConnection};
use crate::error::{Error, Result};
use crate::protocol::TransactionStatus;
use crate::session::{
    ExecuteFlags, NotifyMessage, PgSession, Query, ResultSink, SessionConnection,
};
use crate::types::PgValue;

// ============================================================================
// Configuration
// ============================================================================

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub config: PgConfig,
    /// Connections opened eagerly at startup.
    pub min_connections: u32,
    /// Upper bound on concurrently open connections.
    pub max_connections: u32,
}

impl PoolOptions {
    pub fn new(config: PgConfig) -> Self {
        Self {
            config,
            min_connections: 1,
            max_connections: 10,
        }
    }

    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }
}

// ============================================================================
// Pooled connection
// ============================================================================

/// A connection checked out of the pool. Returned on drop, unless it has
/// been closed in the meantime.
pub struct PooledConnection {
    conn: Option<PgConnection>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    fn conn_mut(&mut self) -> Result<&mut PgConnection> {
        self.conn.as_mut().ok_or(Error::ConnectionClosed)
    }

    pub fn is_healthy(&self) -> bool {
        self.conn.as_ref().map(|c| !c.is_closed()).unwrap_or(false)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !conn.is_closed() {
                self.pool.idle.lock().push(conn);
            } else {
                debug!("dropping closed connection instead of re-pooling");
            }
        }
    }
}

#[async_trait]
impl SessionConnection for PooledConnection {
    fn set_autocommit(&mut self, autocommit: bool) {
        if let Some(conn) = self.conn.as_mut() {
            conn.set_autocommit(autocommit);
        }
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.conn
            .as_ref()
            .map(PgConnection::transaction_status)
            .unwrap_or(TransactionStatus::Idle)
    }

    async fn execute(
        &mut self,
        query: &Query,
        params: &[PgValue],
        sink: &ResultSink,
        max_rows: i32,
        flags: ExecuteFlags,
    ) -> Result<()> {
        self.conn_mut()?
            .execute(query, params, sink, max_rows, flags)
            .await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.conn_mut()?.rollback().await
    }

    async fn notifications(&mut self, hint: i32) -> Result<Vec<NotifyMessage>> {
        self.conn_mut()?.notifications(hint).await
    }

    async fn copy_in_buffered(&mut self, sql: &str, input: &mut (dyn Buf + Send)) -> Result<u64> {
        self.conn_mut()?.copy_in_buffered(sql, input).await
    }

    async fn copy_begin(&mut self, sql: &str) -> Result<()> {
        self.conn_mut()?.copy_begin(sql).await
    }

    async fn copy_write(&mut self, data: &[u8]) -> Result<()> {
        self.conn_mut()?.copy_write(data).await
    }

    async fn copy_end(&mut self) -> Result<u64> {
        self.conn_mut()?.copy_end().await
    }

    async fn copy_fail(&mut self, reason: &str) -> Result<()> {
        self.conn_mut()?.copy_fail(reason).await
    }

    async fn close(&mut self) -> Result<()> {
        self.conn_mut()?.close().await
    }
}

// ============================================================================
// Pool
// ============================================================================

struct PoolInner {
    options: PoolOptions,
    idle: Mutex<Vec<PgConnection>>,
    semaphore: Arc<Semaphore>,
}

/// A PostgreSQL connection pool.
#[derive(Clone)]
pub struct PgPool {
    inner: Arc<PoolInner>,
}

impl PgPool {
    /// Create a pool and open the minimum number of connections.
    pub async fn connect(options: PoolOptions) -> Result<Self> {
        let inner = Arc::new(PoolInner {
            semaphore: Arc::new(Semaphore::new(options.max_connections as usize)),
            options,
            idle: Mutex::new(Vec::new()),
        });
        let pool = Self { inner };

        for _ in 0..pool.inner.options.min_connections {
            let conn = pool.create_connection().await?;
            pool.inner.idle.lock().push(conn);
        }

        Ok(pool)
    }

    /// Check a connection out of the pool, waiting when it is exhausted.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Error::ConnectionClosed)?;

        let reused = self.inner.idle.lock().pop();
        let conn = match reused {
            Some(c) if !c.is_closed() => c,
            _ => self.create_connection().await?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Seize a connection for exclusive use by a new session. The connection
    /// returns to the pool when the session terminates cleanly and is closed
    /// when it does not.
    pub async fn session(&self) -> Result<PgSession> {
        let conn = self.acquire().await?;
        Ok(PgSession::spawn(conn))
    }

    /// Close all idle connections. Checked-out connections close as they
    /// are returned.
    pub async fn close(&self) {
        let connections = std::mem::take(&mut *self.inner.idle.lock());
        for mut conn in connections {
            let _ = conn.close().await;
        }
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    async fn create_connection(&self) -> Result<PgConnection> {
        PgConnection::connect(self.inner.options.config.clone()).await
    }
}
