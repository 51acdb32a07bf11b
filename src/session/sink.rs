//! Result events and the per-submission delivery channel.
//!
//! Every submission gets its own unbounded channel: the session loop emits
//! into the [`ResultSink`] half, the caller consumes the [`QueryStream`]
//! half from whatever task it likes. A sink delivers at most one terminal
//! signal, enforced by taking the sink by value on the terminal methods.

use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, ServerError};
use crate::statement::SharedColumns;
use crate::types::PgValue;

/// The completion tag of one executed statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStatus {
    /// Command word(s), e.g. `SELECT`, `INSERT`, `CREATE TABLE`.
    pub command: String,
    /// OID of the inserted row for single-row inserts, otherwise 0.
    pub oid: i32,
    /// Rows affected by the statement.
    pub update_count: u64,
    /// Rows inserted, for INSERT and COPY.
    pub insert_count: u64,
}

impl CommandStatus {
    /// Parse a CommandComplete tag such as `INSERT 0 5` or `SELECT 1`.
    pub fn from_tag(tag: &str) -> Self {
        let parts: Vec<&str> = tag.split_whitespace().collect();
        match parts.as_slice() {
            ["INSERT", oid, rows] => {
                let rows = rows.parse().unwrap_or(0);
                CommandStatus {
                    command: "INSERT".to_string(),
                    oid: oid.parse().unwrap_or(0),
                    update_count: rows,
                    insert_count: rows,
                }
            }
            [command @ .., last] if last.chars().all(|c| c.is_ascii_digit()) && !command.is_empty() => {
                let rows = last.parse().unwrap_or(0);
                CommandStatus {
                    command: command.join(" "),
                    oid: 0,
                    update_count: rows,
                    insert_count: if command == ["COPY"] { rows } else { 0 },
                }
            }
            _ => CommandStatus {
                command: tag.to_string(),
                oid: 0,
                update_count: 0,
                insert_count: 0,
            },
        }
    }

    /// A synthetic status for a completed COPY of `rows` rows.
    pub fn copied(rows: u64) -> Self {
        CommandStatus {
            command: "COPY".to_string(),
            oid: 0,
            update_count: rows,
            insert_count: rows,
        }
    }
}

/// One event produced while executing a work item.
#[derive(Debug, Clone)]
pub enum QueryEvent {
    /// Column descriptions, sent once before the first row.
    RowDescription(SharedColumns),
    /// One decoded row.
    Row(Vec<PgValue>),
    /// Statement completion tag.
    CommandStatus(CommandStatus),
    /// A server notice raised during execution.
    Notice(ServerError),
}

pub(crate) type SinkItem = Result<QueryEvent, Error>;

/// The emitting half of a submission channel.
///
/// All emissions happen on the session's consumer task; the terminal methods
/// consume the sink so a second terminal signal is unrepresentable.
pub struct ResultSink {
    tx: mpsc::UnboundedSender<SinkItem>,
}

impl ResultSink {
    /// Emit one result event. Quietly drops the event when the subscriber
    /// has gone away; server-side execution is not affected by a dropped
    /// stream.
    pub fn next(&self, event: QueryEvent) {
        if self.tx.send(Ok(event)).is_err() {
            debug!("subscriber gone, dropping result event");
        }
    }

    /// Terminate the stream successfully.
    pub fn complete(self) {
        // dropping the sender ends the stream
    }

    /// Terminate the stream with an error.
    pub fn error(self, err: Error) {
        if self.tx.send(Err(err)).is_err() {
            debug!("subscriber gone, dropping terminal error");
        }
    }
}

/// The consuming half of a submission channel. Yields result events and ends
/// after the terminal signal: a final `Err` item for failure, end-of-stream
/// for completion.
pub struct QueryStream {
    rx: mpsc::UnboundedReceiver<SinkItem>,
    done: bool,
}

impl Stream for QueryStream {
    type Item = SinkItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        let item = ready!(self.rx.poll_recv(cx));
        if matches!(item, Some(Err(_)) | None) {
            self.done = true;
        }
        Poll::Ready(item)
    }
}

/// Resolves a COPY submission to the server-reported row count.
pub struct CopyRows {
    rx: mpsc::UnboundedReceiver<SinkItem>,
}

impl Future for CopyRows {
    type Output = Result<u64, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            match ready!(self.rx.poll_recv(cx)) {
                Some(Ok(QueryEvent::CommandStatus(status))) => {
                    return Poll::Ready(Ok(status.update_count));
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Poll::Ready(Err(err)),
                None => return Poll::Ready(Err(Error::SessionClosed)),
            }
        }
    }
}

/// Create a sink/stream pair for one submission.
pub(crate) fn channel() -> (ResultSink, QueryStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ResultSink { tx }, QueryStream { rx, done: false })
}

/// Create a sink whose stream side resolves to a COPY row count.
pub(crate) fn copy_channel() -> (ResultSink, CopyRows) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ResultSink { tx }, CopyRows { rx })
}
