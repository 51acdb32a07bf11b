//! Session engine tests against a scripted connection.
//!
//! The scripted connection answers a small set of statements the way a real
//! server would, records every call, and lets tests inject failures. Tests
//! that need a live server are at the bottom behind the
//! `postgres-integration-tests` feature.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use futures::StreamExt;
use parking_lot::Mutex;

use crate::error::{Error, Result, ServerError};
use crate::protocol::{FieldDescription, Format, TransactionStatus};
use crate::statement::SharedColumns;
use crate::types::{Oid, PgValue};

use super::copy::BINARY_PREAMBLE;
use super::sink::{CommandStatus, QueryEvent, ResultSink};
use super::work::Query;
use super::{ExecuteFlags, NotifyMessage, PgSession, SessionConnection, SessionTxnState};

// ============================================================================
// Scripted connection
// ============================================================================

#[derive(Default)]
struct Recording {
    calls: Vec<String>,
    copy_bytes: Vec<u8>,
    rollbacks: usize,
}

impl Recording {
    fn saw(&self, call: &str) -> bool {
        self.calls.iter().any(|c| c == call)
    }
}

struct ScriptedConnection {
    state: TransactionStatus,
    autocommit: bool,
    copying: bool,
    copy_rows: u64,
    fail_copy_end: bool,
    pending_notifies: VecDeque<NotifyMessage>,
    recording: Arc<Mutex<Recording>>,
}

impl ScriptedConnection {
    fn new() -> (Self, Arc<Mutex<Recording>>) {
        let recording = Arc::new(Mutex::new(Recording::default()));
        (
            Self {
                state: TransactionStatus::Idle,
                autocommit: true,
                copying: false,
                copy_rows: 0,
                fail_copy_end: false,
                pending_notifies: VecDeque::new(),
                recording: Arc::clone(&recording),
            },
            recording,
        )
    }

    fn record(&self, call: impl Into<String>) {
        self.recording.lock().calls.push(call.into());
    }

    /// Open a block the way the autocommit-off framing would.
    fn frame_transaction(&mut self) {
        if !self.autocommit && self.state == TransactionStatus::Idle {
            self.state = TransactionStatus::Open;
        }
    }
}

fn server_error(code: &str, message: &str) -> Error {
    Error::Server(ServerError {
        severity: "ERROR".to_string(),
        code: code.to_string(),
        message: message.to_string(),
        detail: None,
        hint: None,
    })
}

fn int_column(name: &str) -> FieldDescription {
    FieldDescription {
        name: name.to_string(),
        table_oid: 0,
        column_attr: 0,
        type_oid: Oid::INT4,
        type_size: 4,
        type_modifier: -1,
        format: Format::Binary,
    }
}

#[async_trait]
impl SessionConnection for ScriptedConnection {
    fn set_autocommit(&mut self, autocommit: bool) {
        self.autocommit = autocommit;
        self.record(format!("set_autocommit:{}", autocommit));
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.state
    }

    async fn execute(
        &mut self,
        query: &Query,
        _params: &[PgValue],
        sink: &ResultSink,
        _max_rows: i32,
        flags: ExecuteFlags,
    ) -> Result<()> {
        let sql = query.joined();
        let suffix = if flags.suppress_begin { "[sb]" } else { "" };
        self.record(format!("execute{}:{}", suffix, sql));

        self.frame_transaction();

        if sql.contains("1/0") || sql.contains("forbidden") {
            self.state = TransactionStatus::Failed;
            return Err(server_error("22012", "division by zero"));
        }

        if sql.starts_with("SELECT") {
            let columns: SharedColumns = Arc::new(vec![int_column("n")]);
            sink.next(QueryEvent::RowDescription(Arc::clone(&columns)));
            sink.next(QueryEvent::Row(vec![PgValue::Int4(1)]));
            sink.next(QueryEvent::CommandStatus(CommandStatus::from_tag(
                "SELECT 1",
            )));
        } else if sql.starts_with("INSERT") {
            sink.next(QueryEvent::CommandStatus(CommandStatus::from_tag(
                "INSERT 0 1",
            )));
        } else if sql.starts_with("COMMIT") {
            self.state = TransactionStatus::Idle;
            sink.next(QueryEvent::CommandStatus(CommandStatus::from_tag("COMMIT")));
        } else {
            let command = sql.split_whitespace().next().unwrap_or("").to_string();
            sink.next(QueryEvent::CommandStatus(CommandStatus::from_tag(&command)));
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.record("rollback");
        self.recording.lock().rollbacks += 1;
        self.state = TransactionStatus::Idle;
        Ok(())
    }

    async fn notifications(&mut self, hint: i32) -> Result<Vec<NotifyMessage>> {
        self.record(format!("notifications:{}", hint));
        Ok(self.pending_notifies.drain(..).collect())
    }

    async fn copy_in_buffered(&mut self, sql: &str, input: &mut (dyn Buf + Send)) -> Result<u64> {
        self.record(format!("copy_in_buffered:{}", sql));
        self.frame_transaction();

        let mut bytes = Vec::new();
        while input.has_remaining() {
            let n = {
                let chunk = input.chunk();
                bytes.extend_from_slice(chunk);
                chunk.len()
            };
            input.advance(n);
        }
        self.recording.lock().copy_bytes = bytes;

        if self.fail_copy_end {
            self.state = TransactionStatus::Failed;
            return Err(server_error("22P04", "bad copy file format"));
        }
        Ok(self.copy_rows)
    }

    async fn copy_begin(&mut self, sql: &str) -> Result<()> {
        self.record(format!("copy_begin:{}", sql));
        self.frame_transaction();
        self.copying = true;
        Ok(())
    }

    async fn copy_write(&mut self, data: &[u8]) -> Result<()> {
        if !self.copying {
            return Err(Error::Protocol("no copy in progress".to_string()));
        }
        self.recording.lock().copy_bytes.extend_from_slice(data);
        Ok(())
    }

    async fn copy_end(&mut self) -> Result<u64> {
        self.record("copy_end");
        self.copying = false;
        if self.fail_copy_end {
            self.state = TransactionStatus::Failed;
            return Err(server_error("22P04", "bad copy file format"));
        }
        Ok(self.copy_rows)
    }

    async fn copy_fail(&mut self, reason: &str) -> Result<()> {
        self.record(format!("copy_fail:{}", reason));
        self.copying = false;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.record("close");
        Ok(())
    }
}

async fn collect(mut stream: super::QueryStream) -> Vec<Result<QueryEvent>> {
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event);
    }
    events
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn happy_path_query_event_order() {
    let (conn, _recording) = ScriptedConnection::new();
    let session = PgSession::spawn(conn);

    let events = collect(session.submit("SELECT 1", Vec::new()).unwrap()).await;

    assert_eq!(events.len(), 3);
    assert!(matches!(events[0], Ok(QueryEvent::RowDescription(_))));
    match &events[1] {
        Ok(QueryEvent::Row(row)) => assert_eq!(row, &vec![PgValue::Int4(1)]),
        other => panic!("expected row, got {:?}", other),
    }
    match &events[2] {
        Ok(QueryEvent::CommandStatus(status)) => {
            assert_eq!(status.command, "SELECT");
            assert_eq!(status.update_count, 1);
        }
        other => panic!("expected command status, got {:?}", other),
    }
}

#[tokio::test]
async fn poison_after_open_transaction_rolls_back() {
    let (conn, recording) = ScriptedConnection::new();
    let session = PgSession::spawn(conn);

    let insert = session
        .submit("INSERT INTO t VALUES (1)", Vec::new())
        .unwrap();
    session.close();

    assert!(matches!(
        session.terminated().await,
        SessionTxnState::Closed
    ));
    collect(insert).await;

    let recording = recording.lock();
    assert_eq!(recording.rollbacks, 1);
}

#[tokio::test]
async fn poison_while_idle_skips_rollback() {
    let (conn, recording) = ScriptedConnection::new();
    let session = PgSession::spawn(conn);

    // no work at all: the transaction was never opened
    session.close();

    assert!(matches!(
        session.terminated().await,
        SessionTxnState::Closed
    ));
    assert_eq!(recording.lock().rollbacks, 0);
}

#[tokio::test]
async fn failed_transaction_short_circuits_queue() {
    let (conn, _recording) = ScriptedConnection::new();
    let session = PgSession::spawn(conn);

    let failing = session.submit("SELECT 1/0", Vec::new()).unwrap();
    let queued = session.submit("SELECT 1", Vec::new()).unwrap();

    let failing_events = collect(failing).await;
    assert!(matches!(
        failing_events.last(),
        Some(Err(Error::Server(_)))
    ));

    let queued_events = collect(queued).await;
    assert!(matches!(
        queued_events.as_slice(),
        [Err(Error::SessionClosed)]
    ));

    assert!(matches!(
        session.terminated().await,
        SessionTxnState::Error(Error::TransactionFailed)
    ));
    assert!(!session.is_accepting());
}

#[tokio::test]
async fn buffered_copy_reports_row_count() {
    let (mut conn, recording) = ScriptedConnection::new();
    conn.copy_rows = 3;
    let session = PgSession::spawn(conn);

    let payload = Bytes::from_static(&[0, 1, 0, 2, 0, 3]);
    let rows = session
        .copy_in("COPY t FROM STDIN BINARY", payload)
        .unwrap()
        .await
        .unwrap();

    assert_eq!(rows, 3);
    let recording = recording.lock();
    assert!(recording.copy_bytes.starts_with(&BINARY_PREAMBLE));
    assert!(recording.copy_bytes.ends_with(&[0, 1, 0, 2, 0, 3]));
}

#[tokio::test]
async fn zero_tuple_copy_round_trips() {
    let (conn, recording) = ScriptedConnection::new();
    let session = PgSession::spawn(conn);

    // just the binary trailer: a tuple count of -1
    let rows = session
        .copy_in("COPY t FROM STDIN BINARY", Bytes::from_static(&[0xFF, 0xFF]))
        .unwrap()
        .await
        .unwrap();

    assert_eq!(rows, 0);
    assert_eq!(
        recording.lock().copy_bytes.len(),
        BINARY_PREAMBLE.len() + 2
    );
}

#[tokio::test]
async fn streaming_copy_writes_buffers_in_order() {
    let (mut conn, recording) = ScriptedConnection::new();
    conn.copy_rows = 2;
    let session = PgSession::spawn(conn);

    let source = futures::stream::iter([
        Ok(Bytes::from_static(b"first")),
        Ok(Bytes::from_static(b"second")),
    ])
    .boxed();

    let rows = session
        .copy_in_stream("COPY t FROM STDIN BINARY", source)
        .unwrap()
        .await
        .unwrap();

    assert_eq!(rows, 2);
    let recording = recording.lock();
    let mut expected = BINARY_PREAMBLE.to_vec();
    expected.extend_from_slice(b"firstsecond");
    assert_eq!(recording.copy_bytes, expected);
    assert!(recording.saw("copy_end"));
}

#[tokio::test]
async fn streaming_copy_error_kills_session() {
    let (conn, recording) = ScriptedConnection::new();
    let session = PgSession::spawn(conn);

    let source = futures::stream::iter([
        Ok(Bytes::from_static(b"one tuple")),
        Err(std::io::Error::other("upstream went away")),
    ])
    .boxed();

    let result = session
        .copy_in_stream("COPY t FROM STDIN BINARY", source)
        .unwrap()
        .await;
    assert!(matches!(result, Err(Error::CopySource(_))));

    // the copy was aborted, the transaction rolled back, and the session
    // no longer accepts work
    {
        let recording = recording.lock();
        assert!(recording.calls.iter().any(|c| c.starts_with("copy_fail")));
        assert_eq!(recording.rollbacks, 1);
    }
    assert!(!session.is_accepting());
    assert!(matches!(
        session.submit("SELECT 1", Vec::new()),
        Err(Error::SessionNotActive)
    ));
}

#[tokio::test]
async fn copy_server_failure_is_fatal_to_session() {
    let (mut conn, recording) = ScriptedConnection::new();
    conn.fail_copy_end = true;
    let session = PgSession::spawn(conn);

    let result = session
        .copy_in("COPY t FROM STDIN BINARY", Bytes::from_static(b"x"))
        .unwrap()
        .await;

    assert!(matches!(result, Err(Error::Server(_))));
    assert!(!session.is_accepting());
    assert_eq!(recording.lock().rollbacks, 1);
}

#[tokio::test]
async fn listen_delivers_notifications() {
    let (mut conn, _recording) = ScriptedConnection::new();
    conn.pending_notifies.push_back(NotifyMessage {
        channel: "c".to_string(),
        payload: "hello".to_string(),
        backend_pid: 7,
    });
    let session = PgSession::spawn(conn);

    let mut notifications = session.listen("c").unwrap();

    let message = notifications.next().await.unwrap().unwrap();
    assert_eq!(message.channel, "c");
    assert_eq!(message.payload, "hello");
}

#[tokio::test]
async fn listen_error_tears_down_subscriber() {
    let (conn, _recording) = ScriptedConnection::new();
    let session = PgSession::spawn(conn);

    let mut notifications = session.listen("forbidden").unwrap();

    assert!(matches!(
        notifications.next().await,
        Some(Err(Error::Server(_)))
    ));
    assert!(notifications.next().await.is_none());
}

#[tokio::test]
async fn submit_after_close_fails_synchronously() {
    let (conn, _recording) = ScriptedConnection::new();
    let session = PgSession::spawn(conn);

    session.close();

    assert!(matches!(
        session.submit("SELECT 1", Vec::new()),
        Err(Error::SessionNotActive)
    ));
    assert!(matches!(
        session.copy_in("COPY t FROM STDIN BINARY", Bytes::new()),
        Err(Error::SessionNotActive)
    ));
}

#[tokio::test]
async fn close_is_idempotent() {
    let (conn, recording) = ScriptedConnection::new();
    let session = PgSession::spawn(conn);

    session.close();
    session.close();

    assert!(matches!(
        session.terminated().await,
        SessionTxnState::Closed
    ));
    assert_eq!(recording.lock().rollbacks, 0);
}

#[tokio::test]
async fn terminal_state_is_shared_by_all_observers() {
    let (conn, _recording) = ScriptedConnection::new();
    let session = PgSession::spawn(conn);

    session.close();

    assert!(matches!(
        session.terminated().await,
        SessionTxnState::Closed
    ));
    // a second observation sees the same single-fire state
    assert!(matches!(
        session.terminated().await,
        SessionTxnState::Closed
    ));
}

#[tokio::test]
async fn rollback_item_ends_session() {
    let (conn, recording) = ScriptedConnection::new();
    let session = PgSession::spawn(conn);

    let insert = session
        .submit("INSERT INTO t VALUES (1)", Vec::new())
        .unwrap();
    session.rollback();

    assert!(matches!(
        session.terminated().await,
        SessionTxnState::Closed
    ));
    collect(insert).await;
    assert_eq!(recording.lock().rollbacks, 1);
    assert!(!session.is_accepting());
}

#[tokio::test]
async fn queries_execute_with_suppress_begin() {
    let (conn, recording) = ScriptedConnection::new();
    let session = PgSession::spawn(conn);

    collect(session.submit("SELECT 1", Vec::new()).unwrap()).await;
    session.close();
    session.terminated().await;

    let recording = recording.lock();
    assert!(recording.saw("set_autocommit:false"));
    assert!(recording.saw("execute[sb]:SELECT 1"));
}

#[tokio::test]
async fn work_runs_in_submission_order() {
    let (conn, recording) = ScriptedConnection::new();
    let session = PgSession::spawn(conn);

    let first = session.submit("INSERT INTO t VALUES (1)", Vec::new()).unwrap();
    let second = session.submit("SELECT 1", Vec::new()).unwrap();
    collect(first).await;
    collect(second).await;

    let recording = recording.lock();
    let executes: Vec<&String> = recording
        .calls
        .iter()
        .filter(|c| c.starts_with("execute"))
        .collect();
    assert_eq!(executes.len(), 2);
    assert!(executes[0].contains("INSERT"));
    assert!(executes[1].contains("SELECT"));
}

#[tokio::test]
async fn sink_sees_no_events_after_terminal_error() {
    let (conn, _recording) = ScriptedConnection::new();
    let session = PgSession::spawn(conn);

    let events = collect(session.submit("SELECT 1/0", Vec::new()).unwrap()).await;

    // the terminal error is the last item on the stream
    assert!(matches!(events.last(), Some(Err(Error::Server(_)))));
    assert_eq!(
        events
            .iter()
            .filter(|event| event.is_err())
            .count(),
        1
    );
}

// ============================================================================
// Integration tests (require a running PostgreSQL)
// ============================================================================

#[cfg(feature = "postgres-integration-tests")]
mod integration {
    use super::*;
    use crate::connection::{PgConfig, PgConnection};
    use crate::pool::{PgPool, PoolOptions};
    use crate::sqlwriter;

    fn config() -> PgConfig {
        PgConfig::new("postgres", "postgres").password("test")
    }

    #[tokio::test]
    async fn session_runs_query_against_server() {
        let conn = PgConnection::connect(config()).await.unwrap();
        let session = PgSession::spawn(conn);

        let events = collect(session.submit("SELECT 1", Vec::new()).unwrap()).await;
        assert!(events.iter().all(Result::is_ok));
        assert!(events
            .iter()
            .any(|e| matches!(e, Ok(QueryEvent::Row(row)) if row == &vec![PgValue::Int4(1)])));

        session.close();
        assert!(matches!(
            session.terminated().await,
            SessionTxnState::Closed | SessionTxnState::Error(_)
        ));
    }

    #[tokio::test]
    async fn binary_copy_preamble_round_trip() {
        let pool = PgPool::connect(PoolOptions::new(config())).await.unwrap();
        let session = pool.session().await.unwrap();

        collect(
            session
                .submit("CREATE TABLE IF NOT EXISTS copy_rt (n int)", Vec::new())
                .unwrap(),
        )
        .await;

        // preamble plus the zero-tuple trailer: rowCount must be 0
        let rows = session
            .copy_in(
                "COPY copy_rt FROM STDIN BINARY",
                Bytes::from_static(&[0xFF, 0xFF]),
            )
            .unwrap()
            .await
            .unwrap();
        assert_eq!(rows, 0);

        session.close();
    }

    #[tokio::test]
    async fn listen_and_notify_across_sessions() {
        let pool = PgPool::connect(PoolOptions::new(config()).max_connections(2))
            .await
            .unwrap();

        let listener = pool.session().await.unwrap();
        let mut notifications = listener.listen("pglane_test").unwrap();

        let notifier = pool.session().await.unwrap();
        collect(
            notifier
                .submit(sqlwriter::notify("pglane_test", Some("hello")), Vec::new())
                .unwrap(),
        )
        .await;
        collect(notifier.submit("COMMIT", Vec::new()).unwrap()).await;

        let message = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            notifications.next(),
        )
        .await
        .expect("notification within the poll interval")
        .unwrap()
        .unwrap();
        assert_eq!(message.payload, "hello");

        listener.close();
        notifier.close();
    }
}
