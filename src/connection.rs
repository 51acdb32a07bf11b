//! PostgreSQL connection implementation.
//!
//! The connection handles:
//! - TCP connection establishment, startup and authentication
//! - the execute primitive, streaming result events into a sink
//! - transaction framing under the autocommit setting
//! - the COPY FROM STDIN subprotocol
//! - buffering of asynchronous notifications for the session to poll

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{Error, Result, ServerError};
use crate::protocol::*;
use crate::scram::ScramClient;
use crate::session::{
    CommandStatus, ExecuteFlags, NotifyMessage, Query, QueryEvent, ResultSink, SessionConnection,
};
use crate::statement::{PreparedStatement, SharedColumns, StatementCache};
use crate::types::{Oid, PgValue};

/// How long `notifications` waits for server-pushed data when the caller
/// signals it has time to spare.
const NOTIFY_WAIT: Duration = Duration::from_millis(10);

// ============================================================================
// Configuration
// ============================================================================

/// PostgreSQL connection configuration.
#[derive(Debug, Clone)]
pub struct PgConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
    pub application_name: Option<String>,
    /// Prepared statements cached per connection.
    pub statement_cache_capacity: usize,
}

impl PgConfig {
    pub fn new(user: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: database.into(),
            user: user.into(),
            password: None,
            application_name: Some("pglane".to_string()),
            statement_cache_capacity: 100,
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    pub fn statement_cache_capacity(mut self, capacity: usize) -> Self {
        self.statement_cache_capacity = capacity;
        self
    }
}

// ============================================================================
// Connection
// ============================================================================

/// A PostgreSQL connection.
pub struct PgConnection {
    reader: BufReader<tokio::io::ReadHalf<TcpStream>>,
    writer: BufWriter<tokio::io::WriteHalf<TcpStream>>,
    config: PgConfig,
    statement_cache: StatementCache,
    transaction_status: TransactionStatus,
    /// While false, the execute path opens a transaction block ahead of the
    /// first statement run outside one.
    autocommit: bool,
    /// Whether a COPY FROM STDIN is currently open.
    copying: bool,
    backend_pid: i32,
    /// Server parameters (server_version, client_encoding, ...).
    parameters: HashMap<String, String>,
    /// Notifications received but not yet collected by the session.
    pending_notifications: Vec<NotifyMessage>,
    closed: bool,
    read_buffer: BytesMut,
}

impl PgConnection {
    /// Connect and authenticate.
    pub async fn connect(config: PgConfig) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let stream = TcpStream::connect(&addr).await?;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = tokio::io::split(stream);

        let mut conn = Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            statement_cache: StatementCache::new(config.statement_cache_capacity),
            config,
            transaction_status: TransactionStatus::Idle,
            autocommit: true,
            copying: false,
            backend_pid: 0,
            parameters: HashMap::new(),
            pending_notifications: Vec::new(),
            closed: false,
            read_buffer: BytesMut::with_capacity(32768),
        };

        conn.startup().await?;
        Ok(conn)
    }

    /// Startup handshake: authentication through ReadyForQuery.
    async fn startup(&mut self) -> Result<()> {
        let startup = StartupMessage {
            user: self.config.user.clone(),
            database: Some(self.config.database.clone()),
            options: self
                .config
                .application_name
                .as_ref()
                .map(|name| vec![("application_name".to_string(), name.clone())])
                .unwrap_or_default(),
        };
        self.send_message(&startup).await?;

        loop {
            match self.receive_message().await? {
                BackendMessage::AuthenticationOk => {}
                BackendMessage::AuthenticationCleartextPassword => {
                    let password = self.require_password()?.to_string();
                    self.send_message(&PasswordMessage { password }).await?;
                }
                BackendMessage::AuthenticationMD5Password { salt } => {
                    let password =
                        md5_password(&self.config.user, self.require_password()?, &salt);
                    self.send_message(&PasswordMessage { password }).await?;
                }
                BackendMessage::AuthenticationSASL { mechanisms } => {
                    if !mechanisms.iter().any(|m| m == "SCRAM-SHA-256") {
                        return Err(Error::Auth(format!(
                            "server offers no supported SASL mechanism: {:?}",
                            mechanisms
                        )));
                    }
                    self.authenticate_scram().await?;
                }
                BackendMessage::BackendKeyData { process_id, .. } => {
                    self.backend_pid = process_id;
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    return Ok(());
                }
                BackendMessage::ErrorResponse { fields } => {
                    return Err(Error::Server(ServerError::from_fields(&fields)));
                }
                _ => {}
            }
        }
    }

    async fn authenticate_scram(&mut self) -> Result<()> {
        let password = self.require_password()?;
        let mut scram = ScramClient::new(&self.config.user, password);

        let initial = SaslInitialResponseMessage {
            mechanism: "SCRAM-SHA-256".to_string(),
            data: scram.client_first_message(),
        };
        self.send_message(&initial).await?;

        loop {
            match self.receive_message().await? {
                BackendMessage::AuthenticationSASLContinue { data } => {
                    let data = scram
                        .process_server_first(&data)
                        .map_err(|e| Error::Auth(e.to_string()))?;
                    self.send_message(&SaslResponseMessage { data }).await?;
                }
                BackendMessage::AuthenticationSASLFinal { data } => {
                    scram
                        .verify_server_final(&data)
                        .map_err(|e| Error::Auth(e.to_string()))?;
                    return Ok(());
                }
                BackendMessage::ErrorResponse { fields } => {
                    return Err(Error::Server(ServerError::from_fields(&fields)));
                }
                _ => {}
            }
        }
    }

    fn require_password(&self) -> Result<&str> {
        self.config
            .password
            .as_deref()
            .ok_or_else(|| Error::Auth("password required".to_string()))
    }

    // ========================================================================
    // Execute
    // ========================================================================

    /// Toggle autocommit. Takes effect at the next execute.
    pub fn set_autocommit(&mut self, autocommit: bool) {
        self.autocommit = autocommit;
    }

    /// Run one query, streaming result events into `sink`.
    ///
    /// A BEGIN is pipelined ahead of the statement when no block is open:
    /// always while autocommit is off (the setting owns the framing), and
    /// otherwise unless `flags.suppress_begin` disables the primitive's own
    /// implicit begin.
    pub async fn execute(
        &mut self,
        query: &Query,
        params: &[PgValue],
        sink: &ResultSink,
        max_rows: i32,
        flags: ExecuteFlags,
    ) -> Result<()> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        if self.copying {
            return Err(Error::Protocol("copy in progress".to_string()));
        }

        let begin_pending = self.transaction_status == TransactionStatus::Idle
            && (!self.autocommit || !flags.suppress_begin);

        match query.as_single() {
            Some(sql) => {
                let sql = sql.to_string();
                self.exec_extended(&sql, params, sink, max_rows, begin_pending)
                    .await
            }
            None if params.is_empty() => {
                // Multi-statement batches go through the simple protocol.
                let joined = if begin_pending {
                    format!("BEGIN; {}", query.joined())
                } else {
                    query.joined()
                };
                self.exec_simple(&joined, sink, begin_pending).await
            }
            None => Err(Error::Protocol(
                "parameters are not supported in multi-statement batches".to_string(),
            )),
        }
    }

    /// Simple query protocol: one round trip, text row format.
    async fn exec_simple(
        &mut self,
        sql: &str,
        sink: &ResultSink,
        skip_first_tag: bool,
    ) -> Result<()> {
        self.send_message(&QueryMessage {
            query: sql.to_string(),
        })
        .await?;

        let mut columns: SharedColumns = Arc::new(Vec::new());
        let mut tag_skipped = !skip_first_tag;

        loop {
            match self.receive_message().await? {
                BackendMessage::RowDescription { fields } => {
                    columns = Arc::new(fields);
                    sink.next(QueryEvent::RowDescription(Arc::clone(&columns)));
                }
                BackendMessage::DataRow { values } => {
                    sink.next(QueryEvent::Row(decode_row(&values, &columns, false)?));
                }
                BackendMessage::CommandComplete { tag } => {
                    if !tag_skipped {
                        // the pipelined BEGIN's own tag
                        tag_skipped = true;
                    } else {
                        sink.next(QueryEvent::CommandStatus(CommandStatus::from_tag(&tag)));
                    }
                }
                BackendMessage::NoticeResponse { fields } => {
                    sink.next(QueryEvent::Notice(ServerError::from_fields(&fields)));
                }
                BackendMessage::EmptyQueryResponse => {}
                BackendMessage::CopyInResponse { .. } => {
                    self.copying = true;
                    self.copy_fail("COPY is not supported through execute")
                        .await?;
                    return Err(Error::Protocol(
                        "statement started a COPY; use the copy interface".to_string(),
                    ));
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    return Ok(());
                }
                BackendMessage::ErrorResponse { fields } => {
                    self.drain_until_ready().await?;
                    return Err(Error::Server(ServerError::from_fields(&fields)));
                }
                _ => {}
            }
        }
    }

    /// Extended protocol with statement caching, binary row format. The
    /// optional BEGIN, Parse/Describe for a cache miss, and Bind/Execute/
    /// Sync are pipelined to minimize round trips.
    async fn exec_extended(
        &mut self,
        sql: &str,
        params: &[PgValue],
        sink: &ResultSink,
        max_rows: i32,
        begin_pending: bool,
    ) -> Result<()> {
        let was_cached = self.statement_cache.contains(sql);

        if begin_pending {
            self.buffer_begin().await?;
        }

        let stmt = if was_cached {
            self.statement_cache
                .get_and_touch(sql)
                .expect("cache hit checked above")
        } else {
            let param_types: Vec<Oid> = params.iter().map(PgValue::type_oid).collect();
            let name = self.statement_cache.next_statement_name();

            self.buffer_message(&ParseMessage {
                name: name.clone(),
                query: sql.to_string(),
                param_types: param_types.clone(),
            })
            .await?;
            self.buffer_message(&DescribeMessage {
                kind: b'S',
                name: name.clone(),
            })
            .await?;
            self.buffer_message(&FlushMessage).await?;
            self.flush().await?;

            if begin_pending {
                // no Sync is in flight yet; an error here needs a resync
                self.consume_begin_response(false).await?;
            }
            self.consume_prepare_response(sql, name, param_types).await?
        };

        self.buffer_message(&BindMessage {
            portal: String::new(),
            statement: stmt.name.clone(),
            param_formats: vec![Format::Binary; params.len()],
            params: params.to_vec(),
            result_formats: vec![Format::Binary],
        })
        .await?;
        self.buffer_message(&ExecuteMessage {
            portal: String::new(),
            max_rows,
        })
        .await?;
        self.buffer_message(&SyncMessage).await?;
        self.flush().await?;

        if begin_pending && was_cached {
            // the trailing Sync is already on the wire
            self.consume_begin_response(true).await?;
        }

        if stmt.returns_rows() {
            sink.next(QueryEvent::RowDescription(Arc::clone(&stmt.columns)));
        }

        loop {
            match self.receive_message().await? {
                BackendMessage::BindComplete => {}
                BackendMessage::DataRow { values } => {
                    sink.next(QueryEvent::Row(decode_row(&values, &stmt.columns, true)?));
                }
                BackendMessage::CommandComplete { tag } => {
                    sink.next(QueryEvent::CommandStatus(CommandStatus::from_tag(&tag)));
                }
                BackendMessage::NoticeResponse { fields } => {
                    sink.next(QueryEvent::Notice(ServerError::from_fields(&fields)));
                }
                BackendMessage::EmptyQueryResponse => {}
                BackendMessage::CopyInResponse { .. } => {
                    self.copying = true;
                    self.copy_fail("COPY is not supported through execute")
                        .await?;
                    return Err(Error::Protocol(
                        "statement started a COPY; use the copy interface".to_string(),
                    ));
                }
                BackendMessage::PortalSuspended => {
                    self.drain_until_ready().await?;
                    return Err(Error::Protocol(
                        "portal suspended; partial fetches are not supported".to_string(),
                    ));
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    return Ok(());
                }
                BackendMessage::ErrorResponse { fields } => {
                    self.drain_until_ready().await?;
                    return Err(Error::Server(ServerError::from_fields(&fields)));
                }
                _ => {}
            }
        }
    }

    /// Buffer BEGIN as an extended-protocol exchange without flushing; it
    /// rides ahead of the next statement in the same packet.
    async fn buffer_begin(&mut self) -> Result<()> {
        self.buffer_message(&ParseMessage {
            name: String::new(),
            query: "BEGIN".to_string(),
            param_types: vec![],
        })
        .await?;
        self.buffer_message(&BindMessage {
            portal: String::new(),
            statement: String::new(),
            param_formats: vec![],
            params: vec![],
            result_formats: vec![],
        })
        .await?;
        self.buffer_message(&ExecuteMessage {
            portal: String::new(),
            max_rows: 0,
        })
        .await?;
        Ok(())
    }

    /// Consume the responses of a pipelined BEGIN. `synced` tells whether a
    /// Sync already follows on the wire, in which case an error only needs
    /// draining; otherwise the connection must be resynced explicitly.
    async fn consume_begin_response(&mut self, synced: bool) -> Result<()> {
        loop {
            match self.receive_message().await? {
                BackendMessage::ParseComplete | BackendMessage::BindComplete => {}
                BackendMessage::CommandComplete { .. } => return Ok(()),
                BackendMessage::ErrorResponse { fields } => {
                    if synced {
                        self.drain_until_ready().await?;
                    } else {
                        self.resync().await?;
                    }
                    return Err(Error::Server(ServerError::from_fields(&fields)));
                }
                _ => {}
            }
        }
    }

    /// Consume Parse/Describe responses and cache the statement.
    async fn consume_prepare_response(
        &mut self,
        sql: &str,
        name: String,
        param_types: Vec<Oid>,
    ) -> Result<Arc<PreparedStatement>> {
        let mut stmt = PreparedStatement::new(name, sql.to_string());
        stmt.set_param_types(param_types);

        loop {
            match self.receive_message().await? {
                BackendMessage::ParseComplete => {}
                BackendMessage::ParameterDescription { type_oids } => {
                    stmt.set_param_types(type_oids);
                }
                BackendMessage::RowDescription { fields } => {
                    stmt.set_columns(fields);
                    break;
                }
                BackendMessage::NoData => break,
                BackendMessage::ErrorResponse { fields } => {
                    self.resync().await?;
                    return Err(Error::Server(ServerError::from_fields(&fields)));
                }
                _ => {}
            }
        }

        let stmt = Arc::new(stmt);
        self.statement_cache
            .insert(sql.to_string(), Arc::clone(&stmt));
        Ok(stmt)
    }

    /// Roll back the current transaction block.
    pub async fn rollback(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }

        self.send_message(&QueryMessage {
            query: "ROLLBACK".to_string(),
        })
        .await?;

        loop {
            match self.receive_message().await? {
                BackendMessage::CommandComplete { .. } => {}
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    return Ok(());
                }
                BackendMessage::ErrorResponse { fields } => {
                    self.drain_until_ready().await?;
                    return Err(Error::Server(ServerError::from_fields(&fields)));
                }
                _ => {}
            }
        }
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    /// Collect pending notifications. A positive `hint` grants the server a
    /// short window to push more; otherwise only data already received is
    /// considered.
    pub async fn notifications(&mut self, hint: i32) -> Result<Vec<NotifyMessage>> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }

        let mut wait = if hint > 0 { NOTIFY_WAIT } else { Duration::ZERO };

        loop {
            // decode frames already buffered
            while let Some(frame) = self.try_decode_frame()? {
                match frame {
                    BackendMessage::NoticeResponse { fields } => {
                        debug!(notice = %ServerError::from_fields(&fields), "async notice");
                    }
                    // notifications and parameter status were already
                    // stashed by the decoder
                    other => {
                        return Err(Error::Protocol(format!(
                            "unexpected message between commands: {}",
                            message_name(&other)
                        )));
                    }
                }
            }

            let mut buf = [0u8; 4096];
            match timeout(wait, self.reader.read(&mut buf)).await {
                Err(_) => break, // nothing arrived in the window
                Ok(Ok(0)) => {
                    self.closed = true;
                    return Err(Error::ConnectionClosed);
                }
                Ok(Ok(n)) => {
                    self.read_buffer.extend_from_slice(&buf[..n]);
                    // drain whatever else is immediately available
                    wait = Duration::ZERO;
                }
                Ok(Err(e)) => return Err(e.into()),
            }
        }

        Ok(std::mem::take(&mut self.pending_notifications))
    }

    // ========================================================================
    // COPY subprotocol
    // ========================================================================

    /// Start a COPY FROM STDIN.
    pub async fn copy_begin(&mut self, sql: &str) -> Result<()> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        if self.copying {
            return Err(Error::Protocol("copy already in progress".to_string()));
        }

        self.send_message(&QueryMessage {
            query: sql.to_string(),
        })
        .await?;

        loop {
            match self.receive_message().await? {
                BackendMessage::CopyInResponse { .. } => {
                    self.copying = true;
                    return Ok(());
                }
                BackendMessage::CommandComplete { .. } => {}
                BackendMessage::NoticeResponse { fields } => {
                    debug!(notice = %ServerError::from_fields(&fields), "notice during copy start");
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    return Err(Error::Protocol(
                        "statement did not start a copy".to_string(),
                    ));
                }
                BackendMessage::ErrorResponse { fields } => {
                    self.drain_until_ready().await?;
                    return Err(Error::Server(ServerError::from_fields(&fields)));
                }
                _ => {}
            }
        }
    }

    /// Write one chunk of the copy byte stream.
    pub async fn copy_write(&mut self, data: &[u8]) -> Result<()> {
        if !self.copying {
            return Err(Error::Protocol("no copy in progress".to_string()));
        }
        self.buffer_message(&CopyDataMessage { data }).await
    }

    /// Finish the copy and return the server-reported row count.
    pub async fn copy_end(&mut self) -> Result<u64> {
        if !self.copying {
            return Err(Error::Protocol("no copy in progress".to_string()));
        }
        self.copying = false;

        self.buffer_message(&CopyDoneMessage).await?;
        self.flush().await?;

        let mut rows = 0;
        loop {
            match self.receive_message().await? {
                BackendMessage::CommandComplete { tag } => {
                    rows = CommandStatus::from_tag(&tag).update_count;
                }
                BackendMessage::NoticeResponse { fields } => {
                    debug!(notice = %ServerError::from_fields(&fields), "notice during copy");
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    return Ok(rows);
                }
                BackendMessage::ErrorResponse { fields } => {
                    self.drain_until_ready().await?;
                    return Err(Error::Server(ServerError::from_fields(&fields)));
                }
                _ => {}
            }
        }
    }

    /// Abort an in-progress copy. The server answers with an error, which is
    /// expected and swallowed; the caller already holds the original cause.
    pub async fn copy_fail(&mut self, reason: &str) -> Result<()> {
        if !self.copying {
            return Ok(());
        }
        self.copying = false;

        self.buffer_message(&CopyFailMessage {
            reason: reason.to_string(),
        })
        .await?;
        self.flush().await?;
        self.drain_until_ready().await
    }

    /// Run a whole COPY FROM STDIN over a buffered input. The copy is never
    /// left open: a failure aborts it before the error propagates.
    pub async fn copy_in_buffered(
        &mut self,
        sql: &str,
        input: &mut (dyn Buf + Send),
    ) -> Result<u64> {
        self.copy_begin(sql).await?;
        match self.write_buf_to_copy(input).await {
            Ok(()) => self.copy_end().await,
            Err(err) => {
                if let Err(fail_err) = self.copy_fail("buffered copy failed").await {
                    debug!(error = %fail_err, "failed to abort copy cleanly");
                }
                Err(err)
            }
        }
    }

    async fn write_buf_to_copy(&mut self, input: &mut (dyn Buf + Send)) -> Result<()> {
        while input.has_remaining() {
            let written = {
                let chunk = input.chunk();
                self.copy_write(chunk).await?;
                chunk.len()
            };
            input.advance(written);
        }
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Transaction status observed at the last server sync point.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Close the connection.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.send_message(&TerminateMessage).await?;
        self.closed = true;
        Ok(())
    }

    // ========================================================================
    // Wire plumbing
    // ========================================================================

    /// Send a frontend message and flush.
    async fn send_message<M: FrontendMessage>(&mut self, msg: &M) -> Result<()> {
        self.writer.write_all(&msg.encode()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Buffer a frontend message without flushing (pipelining).
    async fn buffer_message<M: FrontendMessage>(&mut self, msg: &M) -> Result<()> {
        self.writer.write_all(&msg.encode()).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await?;
        Ok(())
    }

    /// Receive the next backend message, transparently stashing asynchronous
    /// frames (notifications, parameter status) along the way.
    async fn receive_message(&mut self) -> Result<BackendMessage> {
        loop {
            if let Some(msg) = self.try_decode_frame()? {
                return Ok(msg);
            }

            let mut buf = [0u8; 4096];
            let n = self.reader.read(&mut buf).await?;
            if n == 0 {
                self.closed = true;
                return Err(Error::ConnectionClosed);
            }
            self.read_buffer.extend_from_slice(&buf[..n]);
        }
    }

    /// Decode one complete frame from the read buffer, if present.
    /// Notifications and parameter status updates are absorbed here and
    /// never surfaced to receive loops.
    fn try_decode_frame(&mut self) -> Result<Option<BackendMessage>> {
        loop {
            if self.read_buffer.len() < 5 {
                return Ok(None);
            }

            let length = i32::from_be_bytes([
                self.read_buffer[1],
                self.read_buffer[2],
                self.read_buffer[3],
                self.read_buffer[4],
            ]) as usize;
            let total = 1 + length;
            if self.read_buffer.len() < total {
                return Ok(None);
            }

            let frame = self.read_buffer.split_to(total);
            match BackendMessage::decode(&mut Bytes::from(frame))? {
                BackendMessage::NotificationResponse {
                    process_id,
                    channel,
                    payload,
                } => {
                    self.pending_notifications.push(NotifyMessage {
                        channel,
                        payload,
                        backend_pid: process_id,
                    });
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                other => return Ok(Some(other)),
            }
        }
    }

    /// Skip messages until ReadyForQuery (after an error response).
    async fn drain_until_ready(&mut self) -> Result<()> {
        loop {
            if let BackendMessage::ReadyForQuery { status } = self.receive_message().await? {
                self.transaction_status = status;
                return Ok(());
            }
        }
    }

    /// Send Sync and drain; used to resync after a mid-pipeline error.
    async fn resync(&mut self) -> Result<()> {
        self.buffer_message(&SyncMessage).await?;
        self.flush().await?;
        self.drain_until_ready().await
    }
}

#[async_trait]
impl SessionConnection for PgConnection {
    fn set_autocommit(&mut self, autocommit: bool) {
        PgConnection::set_autocommit(self, autocommit);
    }

    fn transaction_status(&self) -> TransactionStatus {
        PgConnection::transaction_status(self)
    }

    async fn execute(
        &mut self,
        query: &Query,
        params: &[PgValue],
        sink: &ResultSink,
        max_rows: i32,
        flags: ExecuteFlags,
    ) -> Result<()> {
        PgConnection::execute(self, query, params, sink, max_rows, flags).await
    }

    async fn rollback(&mut self) -> Result<()> {
        PgConnection::rollback(self).await
    }

    async fn notifications(&mut self, hint: i32) -> Result<Vec<NotifyMessage>> {
        PgConnection::notifications(self, hint).await
    }

    async fn copy_in_buffered(&mut self, sql: &str, input: &mut (dyn Buf + Send)) -> Result<u64> {
        PgConnection::copy_in_buffered(self, sql, input).await
    }

    async fn copy_begin(&mut self, sql: &str) -> Result<()> {
        PgConnection::copy_begin(self, sql).await
    }

    async fn copy_write(&mut self, data: &[u8]) -> Result<()> {
        PgConnection::copy_write(self, data).await
    }

    async fn copy_end(&mut self) -> Result<u64> {
        PgConnection::copy_end(self).await
    }

    async fn copy_fail(&mut self, reason: &str) -> Result<()> {
        PgConnection::copy_fail(self, reason).await
    }

    async fn close(&mut self) -> Result<()> {
        PgConnection::close(self).await
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn decode_row(
    values: &[Option<Bytes>],
    columns: &[FieldDescription],
    binary: bool,
) -> Result<Vec<PgValue>> {
    let mut row = Vec::with_capacity(values.len());
    for (i, value) in values.iter().enumerate() {
        let decoded = match value {
            None => PgValue::Null,
            Some(data) => {
                let oid = columns.get(i).map(|c| c.type_oid).unwrap_or(Oid::TEXT);
                if binary {
                    PgValue::decode_binary(oid, data)?
                } else {
                    PgValue::decode_text(oid, data)?
                }
            }
        };
        row.push(decoded);
    }
    Ok(row)
}

/// MD5(MD5(password + user) + salt), hex, with the "md5" prefix.
fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = format!("{:x}", md5::compute(format!("{}{}", password, user)));
    let mut outer_input = inner.into_bytes();
    outer_input.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(&outer_input))
}

fn message_name(msg: &BackendMessage) -> &'static str {
    match msg {
        BackendMessage::RowDescription { .. } => "RowDescription",
        BackendMessage::DataRow { .. } => "DataRow",
        BackendMessage::CommandComplete { .. } => "CommandComplete",
        BackendMessage::ReadyForQuery { .. } => "ReadyForQuery",
        BackendMessage::ErrorResponse { .. } => "ErrorResponse",
        BackendMessage::CopyInResponse { .. } => "CopyInResponse",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder() {
        let config = PgConfig::new("app", "appdb")
            .host("db.internal")
            .port(5433)
            .password("secret")
            .statement_cache_capacity(32);

        assert_eq!(config.host, "db.internal");
        assert_eq!(config.port, 5433);
        assert_eq!(config.user, "app");
        assert_eq!(config.database, "appdb");
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert_eq!(config.statement_cache_capacity, 32);
    }

    #[test]
    fn md5_password_format() {
        let hashed = md5_password("user", "pass", &[1, 2, 3, 4]);
        assert!(hashed.starts_with("md5"));
        assert_eq!(hashed.len(), 3 + 32);
    }

    #[test]
    fn row_decoding_handles_nulls_and_missing_columns() {
        let values = vec![Some(Bytes::from_static(&[0, 0, 0, 7])), None];
        let columns = vec![FieldDescription {
            name: "n".into(),
            table_oid: 0,
            column_attr: 0,
            type_oid: Oid::INT4,
            type_size: 4,
            type_modifier: -1,
            format: Format::Binary,
        }];

        let row = decode_row(&values, &columns, true).unwrap();
        assert_eq!(row[0], PgValue::Int4(7));
        assert_eq!(row[1], PgValue::Null);
    }
}
