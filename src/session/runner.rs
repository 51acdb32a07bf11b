//! The session consumer loop.
//!
//! Runs on the task that owns the connection. Every connection operation in
//! the session's lifetime happens here; producers only touch the work queue.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::TransactionStatus;

use super::copy;
use super::sink::{CommandStatus, QueryEvent};
use super::work::WorkItem;
use super::{ExecuteFlags, SessionConnection, SessionShared, SessionTxnState};

/// Bounded wait per dequeue attempt. Notifications are polled at this
/// granularity while the queue is empty.
pub(crate) const LOOP_WAIT: Duration = Duration::from_millis(100);

/// Idle threshold. The loop never terminates on idle, it only reports it;
/// disposing idle sessions is the pool's job.
pub(crate) const MAX_IDLE: Duration = Duration::from_secs(5);

/// Consume the work queue until the session terminates.
///
/// Returns the terminal state for clean endings; a returned error means the
/// caller must decide whether the connection survives.
pub(crate) async fn run<C>(
    conn: &mut C,
    shared: &SessionShared,
    queue: &mut mpsc::UnboundedReceiver<WorkItem>,
) -> Result<SessionTxnState>
where
    C: SessionConnection,
{
    debug!("starting session");

    // The session owns transaction framing from here on.
    conn.set_autocommit(false);

    let mut idle_since = Instant::now();
    let mut idle_reported = false;

    loop {
        match timeout(LOOP_WAIT, queue.recv()).await {
            Ok(polled) => {
                // A closed queue means every facade handle is gone; treat it
                // as a close request.
                let item = polled.unwrap_or(WorkItem::Poison);

                poll_notifications(conn, shared, 1).await?;
                debug!(kind = item.kind(), "processing work item");

                match item {
                    WorkItem::Poison => {
                        debug!("session finished");
                        match conn.transaction_status() {
                            TransactionStatus::Idle => {}
                            TransactionStatus::Open | TransactionStatus::Failed => {
                                warn!("rolling back");
                                conn.rollback().await?;
                            }
                        }
                        return Ok(SessionTxnState::Closed);
                    }

                    WorkItem::Rollback => {
                        debug!("rollback requested, ending session");
                        conn.rollback().await?;
                        return Ok(SessionTxnState::Closed);
                    }

                    WorkItem::Copy { sql, source, sink } => {
                        info!(sql = %sql, "starting copy");
                        match copy::run(conn, &sql, source).await {
                            Ok(rows) => {
                                info!(rows, "copy completed");
                                sink.next(QueryEvent::CommandStatus(CommandStatus::copied(rows)));
                                sink.complete();
                                poll_notifications(conn, shared, -1).await?;
                            }
                            Err(err) => {
                                // A failed copy is fatal to the session.
                                warn!(error = %err, "copy error");
                                conn.rollback().await?;
                                shared.stop_accepting();
                                sink.error(err);
                            }
                        }
                    }

                    WorkItem::Query {
                        query,
                        params,
                        sink,
                    } => {
                        match conn
                            .execute(&query, &params, &sink, 0, ExecuteFlags::SUPPRESS_BEGIN)
                            .await
                        {
                            Ok(()) => sink.complete(),
                            Err(err) if err.is_connection_error() => {
                                sink.error(err.clone());
                                return Err(err);
                            }
                            // Server errors stay scoped to the item; the
                            // state check below decides the session's fate.
                            Err(err) => sink.error(err),
                        }
                        debug!("query completed");
                        poll_notifications(conn, shared, -1).await?;
                    }
                }

                idle_since = Instant::now();
                idle_reported = false;
            }
            Err(_) => {
                // Idle; keep server-pushed messages flowing.
                poll_notifications(conn, shared, 1).await?;

                if !idle_reported && idle_since.elapsed() >= MAX_IDLE {
                    trace!("session idle past threshold, waiting on the pool");
                    idle_reported = true;
                }
            }
        }

        match conn.transaction_status() {
            TransactionStatus::Idle => {}
            TransactionStatus::Failed => {
                trace!("transaction state now failed");
                shared.stop_accepting();
                let mut pending = 0usize;
                while let Ok(item) = queue.try_recv() {
                    item.fail(Error::SessionClosed);
                    pending += 1;
                }
                if pending > 0 {
                    warn!(pending, "work queue not empty after session failure");
                }
                return Ok(SessionTxnState::Error(Error::TransactionFailed));
            }
            TransactionStatus::Open => {
                if !shared.accepting() && queue.is_empty() {
                    info!("rolling back");
                    conn.rollback().await?;
                }
            }
        }
    }
}

/// Forward pending notifications to the hub. Skips the connection entirely
/// while nothing is listening. `hint` biases the connection's wait: positive
/// while the loop has time to spare, negative right after finishing work.
async fn poll_notifications<C>(conn: &mut C, shared: &SessionShared, hint: i32) -> Result<()>
where
    C: SessionConnection,
{
    if shared.hub.is_empty() {
        return Ok(());
    }
    for message in conn.notifications(hint).await? {
        shared.hub.dispatch(message);
    }
    Ok(())
}
