//! The session execution engine.
//!
//! A session seizes one physical connection for its whole lifetime. Work is
//! submitted from any task through the facade, queued, and consumed by a
//! single dedicated task that owns the connection and drives its
//! transactional state machine. Results flow back through per-submission
//! channels; notifications flow through the session's channel map.

mod copy;
mod hub;
mod runner;
mod sink;
mod work;

#[cfg(test)]
mod tests;

pub use copy::BINARY_PREAMBLE;
pub use hub::{NotifyMessage, NotifyStream};
pub use sink::{CommandStatus, CopyRows, QueryEvent, QueryStream, ResultSink};
pub use work::{CopySource, Query};

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::TransactionStatus;
use crate::sqlwriter;
use crate::types::PgValue;

use hub::NotificationHub;
use work::WorkItem;

/// Flags for the connection-level execute primitive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteFlags {
    /// Do not prepend an implicit BEGIN to this execution. Set by callers
    /// that own transaction framing themselves, as the session does through
    /// the autocommit setting.
    pub suppress_begin: bool,
}

impl ExecuteFlags {
    pub const NONE: ExecuteFlags = ExecuteFlags {
        suppress_begin: false,
    };
    pub const SUPPRESS_BEGIN: ExecuteFlags = ExecuteFlags {
        suppress_begin: true,
    };
}

/// The connection capability a session runs on.
///
/// Implemented by the wire connection and by pooled handles; the session
/// loop is written against this trait only. All methods are invoked
/// exclusively from the session's consumer task, which owns the value.
#[async_trait]
pub trait SessionConnection: Send {
    /// Toggle autocommit. While off, the execute path opens a transaction
    /// block ahead of the first statement run outside one.
    fn set_autocommit(&mut self, autocommit: bool);

    /// Transaction status observed at the last server sync point.
    fn transaction_status(&self) -> TransactionStatus;

    /// Run one query, emitting result events into `sink`. Server errors are
    /// returned as `Error::Server` after the connection has been resynced.
    async fn execute(
        &mut self,
        query: &Query,
        params: &[PgValue],
        sink: &ResultSink,
        max_rows: i32,
        flags: ExecuteFlags,
    ) -> Result<()>;

    /// Roll back the current transaction block.
    async fn rollback(&mut self) -> Result<()>;

    /// Collect pending notifications. A positive `hint` allows a short
    /// blocking wait for server-pushed data; otherwise only already-received
    /// frames are drained.
    async fn notifications(&mut self, hint: i32) -> Result<Vec<NotifyMessage>>;

    /// Run a COPY FROM STDIN over a fully buffered input. Must not leave a
    /// copy open on any exit path.
    async fn copy_in_buffered(&mut self, sql: &str, input: &mut (dyn Buf + Send)) -> Result<u64>;

    /// Open a COPY FROM STDIN for incremental writing.
    async fn copy_begin(&mut self, sql: &str) -> Result<()>;

    /// Write one chunk into the open copy.
    async fn copy_write(&mut self, data: &[u8]) -> Result<()>;

    /// Finish the open copy, returning the server-reported row count.
    async fn copy_end(&mut self) -> Result<u64>;

    /// Abort the open copy.
    async fn copy_fail(&mut self, reason: &str) -> Result<()>;

    /// Close the physical connection.
    async fn close(&mut self) -> Result<()>;
}

/// Terminal state of a session, delivered at most once.
#[derive(Debug, Clone)]
pub enum SessionTxnState {
    /// The session ended cleanly.
    Closed,
    /// The session ended because of a failure.
    Error(Error),
}

/// State shared between the facade and the consumer task.
pub(crate) struct SessionShared {
    accepting: AtomicBool,
    pub(crate) hub: NotificationHub,
    signal: watch::Sender<Option<SessionTxnState>>,
}

impl SessionShared {
    fn new(signal: watch::Sender<Option<SessionTxnState>>) -> Self {
        Self {
            accepting: AtomicBool::new(true),
            hub: NotificationHub::new(),
            signal,
        }
    }

    pub(crate) fn accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub(crate) fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    /// Fire the terminal signal. Later calls are ignored.
    pub(crate) fn finish(&self, state: SessionTxnState) {
        self.signal.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(state);
                true
            } else {
                false
            }
        });
    }
}

/// A session over one seized connection.
///
/// Work runs in submission order. Disposing a returned stream abandons its
/// results but has no effect on server-side execution.
pub struct PgSession {
    queue: mpsc::UnboundedSender<WorkItem>,
    shared: Arc<SessionShared>,
    terminal: watch::Receiver<Option<SessionTxnState>>,
}

impl PgSession {
    /// Seize `conn` and start the consumer task that owns it.
    pub fn spawn<C>(conn: C) -> Self
    where
        C: SessionConnection + 'static,
    {
        let (queue, rx) = mpsc::unbounded_channel();
        let (signal, terminal) = watch::channel(None);
        let shared = Arc::new(SessionShared::new(signal));

        tokio::spawn(drive(conn, Arc::clone(&shared), rx));

        Self {
            queue,
            shared,
            terminal,
        }
    }

    /// Whether the session still accepts submissions.
    pub fn is_accepting(&self) -> bool {
        self.shared.accepting()
    }

    /// Queue a query for execution, returning its result stream.
    pub fn submit(&self, query: impl Into<Query>, params: Vec<PgValue>) -> Result<QueryStream> {
        let query = query.into();
        self.ensure_accepting()?;
        let (sink, stream) = sink::channel();
        debug!(?query, "added work item");
        self.enqueue(WorkItem::Query {
            query,
            params,
            sink,
        })?;
        Ok(stream)
    }

    /// Queue a COPY FROM STDIN over a buffered payload. The binary preamble
    /// is prepended by the engine; `data` is the tuple stream only.
    pub fn copy_in(&self, sql: impl Into<String>, data: Bytes) -> Result<CopyRows> {
        self.copy(sql.into(), CopySource::Buffered(data))
    }

    /// Queue a COPY FROM STDIN fed from a stream of buffers. Every buffer is
    /// fully written and released before the next is requested.
    pub fn copy_in_stream(
        &self,
        sql: impl Into<String>,
        data: BoxStream<'static, io::Result<Bytes>>,
    ) -> Result<CopyRows> {
        self.copy(sql.into(), CopySource::Streaming(data))
    }

    fn copy(&self, sql: String, source: CopySource) -> Result<CopyRows> {
        debug!(sql = %sql, "starting copy submission");
        self.ensure_accepting()?;
        let (sink, rows) = sink::copy_channel();
        self.enqueue(WorkItem::Copy { sql, source, sink })?;
        Ok(rows)
    }

    /// Subscribe to notifications on `channel`, issuing the LISTEN through
    /// this session. A failed LISTEN tears the subscription down with the
    /// error.
    pub fn listen(&self, channel: &str) -> Result<NotifyStream> {
        // The mapping must be in place before the server can deliver
        // anything on the channel, so register first, then submit LISTEN.
        let stream = self.shared.hub.register(channel);

        let mut ack = match self.submit(sqlwriter::listen(channel), Vec::new()) {
            Ok(ack) => ack,
            Err(err) => {
                self.shared.hub.fail(channel, err.clone());
                return Err(err);
            }
        };

        let shared = Arc::clone(&self.shared);
        let name = channel.to_string();
        tokio::spawn(async move {
            while let Some(item) = ack.next().await {
                if let Err(err) = item {
                    warn!(channel = %name, error = %err, "listen failed");
                    shared.hub.fail(&name, err);
                    return;
                }
            }
            debug!(channel = %name, "subscribed");
        });

        Ok(stream)
    }

    /// Roll back whatever is open and end the session.
    pub fn rollback(&self) {
        self.shared.stop_accepting();
        let _ = self.queue.send(WorkItem::Rollback);
    }

    /// Stop accepting work and request graceful termination. Queued items
    /// still run; calling this again has no further effect.
    pub fn close(&self) {
        debug!("closing session");
        self.shared.stop_accepting();
        let _ = self.queue.send(WorkItem::Poison);
    }

    /// Wait for the session's terminal state. Fires at most once per
    /// session; every caller observes the same state.
    pub async fn terminated(&self) -> SessionTxnState {
        let mut rx = self.terminal.clone();
        loop {
            {
                let current = rx.borrow_and_update();
                if let Some(state) = current.as_ref() {
                    return state.clone();
                }
            }
            if rx.changed().await.is_err() {
                return SessionTxnState::Error(Error::SessionClosed);
            }
        }
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.shared.accepting() {
            Ok(())
        } else {
            Err(Error::SessionNotActive)
        }
    }

    fn enqueue(&self, item: WorkItem) -> Result<()> {
        self.queue.send(item).map_err(|_| Error::SessionNotActive)
    }
}

/// Outer runner: classifies how the loop ended and settles the terminal
/// signal. Connection-level failures close the physical connection; other
/// failures merely release it. Work still queued at exit is failed.
async fn drive<C>(
    mut conn: C,
    shared: Arc<SessionShared>,
    mut queue: mpsc::UnboundedReceiver<WorkItem>,
) where
    C: SessionConnection,
{
    let result = runner::run(&mut conn, &shared, &mut queue).await;

    queue.close();
    while let Ok(item) = queue.try_recv() {
        item.fail(Error::SessionClosed);
    }

    match result {
        Ok(state) => shared.finish(state),
        Err(err) => {
            shared.stop_accepting();
            if err.is_connection_error() {
                warn!(error = %err, "connection failed");
                if let Err(close_err) = conn.close().await {
                    debug!(error = %close_err, "error closing failed connection");
                }
                shared.finish(SessionTxnState::Error(Error::Unavailable(Box::new(err))));
            } else {
                warn!(error = %err, "session failed");
                shared.finish(SessionTxnState::Error(err));
            }
        }
    }
}
