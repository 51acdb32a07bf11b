//! PostgreSQL wire protocol message encoding and decoding.
//!
//! Implements the v3 protocol messages the client uses, including the
//! COPY subprotocol.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::types::Oid;

/// PostgreSQL protocol version 3.0.
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Wire format codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

/// Transaction status as reported by ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Not inside a transaction block.
    Idle,
    /// Inside a transaction block.
    Open,
    /// Inside a failed transaction block; queries are rejected until rollback.
    Failed,
}

impl From<u8> for TransactionStatus {
    fn from(b: u8) -> Self {
        match b {
            b'T' => TransactionStatus::Open,
            b'E' => TransactionStatus::Failed,
            _ => TransactionStatus::Idle,
        }
    }
}

// ============================================================================
// Frontend (client -> server) messages
// ============================================================================

/// Trait for encoding frontend messages.
pub trait FrontendMessage {
    fn encode(&self) -> BytesMut;
}

/// Frame a tagged message: tag byte, length (including itself), body.
fn frame(tag: u8, body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(body.len() + 5);
    buf.put_u8(tag);
    buf.put_i32(body.len() as i32 + 4);
    buf.put_slice(body);
    buf
}

/// Startup message sent at connection start (untagged).
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub user: String,
    pub database: Option<String>,
    pub options: Vec<(String, String)>,
}

impl FrontendMessage for StartupMessage {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_i32(0); // length placeholder
        buf.put_i32(PROTOCOL_VERSION);

        buf.put_slice(b"user\0");
        buf.put_slice(self.user.as_bytes());
        buf.put_u8(0);

        if let Some(db) = &self.database {
            buf.put_slice(b"database\0");
            buf.put_slice(db.as_bytes());
            buf.put_u8(0);
        }

        for (key, value) in &self.options {
            buf.put_slice(key.as_bytes());
            buf.put_u8(0);
            buf.put_slice(value.as_bytes());
            buf.put_u8(0);
        }

        buf.put_u8(0);

        let len = buf.len() as i32;
        buf[0..4].copy_from_slice(&len.to_be_bytes());
        buf
    }
}

/// Password message for cleartext or MD5 auth.
#[derive(Debug, Clone)]
pub struct PasswordMessage {
    pub password: String,
}

impl FrontendMessage for PasswordMessage {
    fn encode(&self) -> BytesMut {
        let mut body = Vec::with_capacity(self.password.len() + 1);
        body.extend_from_slice(self.password.as_bytes());
        body.push(0);
        frame(b'p', &body)
    }
}

/// Simple query message ('Q').
#[derive(Debug, Clone)]
pub struct QueryMessage {
    pub query: String,
}

impl FrontendMessage for QueryMessage {
    fn encode(&self) -> BytesMut {
        let mut body = Vec::with_capacity(self.query.len() + 1);
        body.extend_from_slice(self.query.as_bytes());
        body.push(0);
        frame(b'Q', &body)
    }
}

/// Parse message ('P'): create a prepared statement.
#[derive(Debug, Clone)]
pub struct ParseMessage {
    pub name: String,
    pub query: String,
    pub param_types: Vec<Oid>,
}

impl FrontendMessage for ParseMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_slice(self.name.as_bytes());
        body.put_u8(0);
        body.put_slice(self.query.as_bytes());
        body.put_u8(0);
        body.put_i16(self.param_types.len() as i16);
        for oid in &self.param_types {
            body.put_i32(oid.as_i32());
        }
        frame(b'P', &body)
    }
}

/// Bind message ('B'): bind parameters to a prepared statement.
#[derive(Debug, Clone)]
pub struct BindMessage {
    pub portal: String,
    pub statement: String,
    pub param_formats: Vec<Format>,
    pub params: Vec<crate::types::PgValue>,
    pub result_formats: Vec<Format>,
}

impl FrontendMessage for BindMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_slice(self.portal.as_bytes());
        body.put_u8(0);
        body.put_slice(self.statement.as_bytes());
        body.put_u8(0);

        body.put_i16(self.param_formats.len() as i16);
        for fmt in &self.param_formats {
            body.put_i16(*fmt as i16);
        }

        body.put_i16(self.params.len() as i16);
        for param in &self.params {
            if param.is_null() {
                body.put_i32(-1);
            } else {
                let encoded = param.encode_binary();
                body.put_i32(encoded.len() as i32);
                body.put_slice(&encoded);
            }
        }

        body.put_i16(self.result_formats.len() as i16);
        for fmt in &self.result_formats {
            body.put_i16(*fmt as i16);
        }

        frame(b'B', &body)
    }
}

/// Execute message ('E'): run a bound portal.
#[derive(Debug, Clone)]
pub struct ExecuteMessage {
    pub portal: String,
    /// 0 means no limit.
    pub max_rows: i32,
}

impl FrontendMessage for ExecuteMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_slice(self.portal.as_bytes());
        body.put_u8(0);
        body.put_i32(self.max_rows);
        frame(b'E', &body)
    }
}

/// Describe message ('D'): request a statement or portal description.
#[derive(Debug, Clone)]
pub struct DescribeMessage {
    /// 'S' for statement, 'P' for portal.
    pub kind: u8,
    pub name: String,
}

impl FrontendMessage for DescribeMessage {
    fn encode(&self) -> BytesMut {
        let mut body = Vec::with_capacity(self.name.len() + 2);
        body.push(self.kind);
        body.extend_from_slice(self.name.as_bytes());
        body.push(0);
        frame(b'D', &body)
    }
}

/// Sync message ('S'): end of an extended-protocol exchange.
#[derive(Debug, Clone, Copy)]
pub struct SyncMessage;

impl FrontendMessage for SyncMessage {
    fn encode(&self) -> BytesMut {
        frame(b'S', &[])
    }
}

/// Flush message ('H'): ask the server to flush its output buffer.
#[derive(Debug, Clone, Copy)]
pub struct FlushMessage;

impl FrontendMessage for FlushMessage {
    fn encode(&self) -> BytesMut {
        frame(b'H', &[])
    }
}

/// Terminate message ('X'): close the connection.
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode(&self) -> BytesMut {
        frame(b'X', &[])
    }
}

/// CopyData message ('d'): one chunk of a COPY byte stream.
#[derive(Debug, Clone)]
pub struct CopyDataMessage<'a> {
    pub data: &'a [u8],
}

impl FrontendMessage for CopyDataMessage<'_> {
    fn encode(&self) -> BytesMut {
        frame(b'd', self.data)
    }
}

/// CopyDone message ('c'): the COPY byte stream is complete.
#[derive(Debug, Clone, Copy)]
pub struct CopyDoneMessage;

impl FrontendMessage for CopyDoneMessage {
    fn encode(&self) -> BytesMut {
        frame(b'c', &[])
    }
}

/// CopyFail message ('f'): abort an in-progress COPY with a reason.
#[derive(Debug, Clone)]
pub struct CopyFailMessage {
    pub reason: String,
}

impl FrontendMessage for CopyFailMessage {
    fn encode(&self) -> BytesMut {
        let mut body = Vec::with_capacity(self.reason.len() + 1);
        body.extend_from_slice(self.reason.as_bytes());
        body.push(0);
        frame(b'f', &body)
    }
}

/// SASL initial response ('p'): first SCRAM message.
#[derive(Debug, Clone)]
pub struct SaslInitialResponseMessage {
    pub mechanism: String,
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslInitialResponseMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_slice(self.mechanism.as_bytes());
        body.put_u8(0);
        body.put_i32(self.data.len() as i32);
        body.put_slice(&self.data);
        frame(b'p', &body)
    }
}

/// SASL response ('p'): subsequent SCRAM messages.
#[derive(Debug, Clone)]
pub struct SaslResponseMessage {
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslResponseMessage {
    fn encode(&self) -> BytesMut {
        frame(b'p', &self.data)
    }
}

// ============================================================================
// Backend (server -> client) messages
// ============================================================================

/// One column in a RowDescription message.
#[derive(Debug, Clone)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

/// Backend message types.
#[derive(Debug, Clone)]
pub enum BackendMessage {
    // Authentication
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password { salt: [u8; 4] },
    AuthenticationSASL { mechanisms: Vec<String> },
    AuthenticationSASLContinue { data: Bytes },
    AuthenticationSASLFinal { data: Bytes },

    // Query responses
    RowDescription { fields: Vec<FieldDescription> },
    DataRow { values: Vec<Option<Bytes>> },
    CommandComplete { tag: String },
    EmptyQueryResponse,

    // Extended protocol
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,

    // COPY subprotocol
    CopyInResponse { format: i8, column_formats: Vec<i16> },

    // Status
    ReadyForQuery { status: TransactionStatus },
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },

    // Errors and notices
    ErrorResponse { fields: HashMap<u8, String> },
    NoticeResponse { fields: HashMap<u8, String> },

    // Asynchronous
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
    ParameterDescription { type_oids: Vec<Oid> },
}

impl BackendMessage {
    /// Decode one backend message. The buffer must start at the tag byte and
    /// contain the complete frame.
    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        if buf.remaining() < 5 {
            return Err(Error::Protocol("incomplete message header".to_string()));
        }

        let msg_type = buf.get_u8();
        let len = buf.get_i32() as usize;
        if len < 4 || buf.remaining() < len - 4 {
            return Err(Error::Protocol("incomplete message body".to_string()));
        }
        let body = buf.split_to(len - 4);

        match msg_type {
            b'R' => Self::decode_auth(body),
            b'T' => Self::decode_row_description(body),
            b'D' => Self::decode_data_row(body),
            b'C' => Self::decode_command_complete(body),
            b'Z' => Self::decode_ready_for_query(body),
            b'E' => Ok(BackendMessage::ErrorResponse {
                fields: read_error_fields(body)?,
            }),
            b'N' => Ok(BackendMessage::NoticeResponse {
                fields: read_error_fields(body)?,
            }),
            b'S' => Self::decode_parameter_status(body),
            b'K' => Self::decode_backend_key_data(body),
            b'G' => Self::decode_copy_in_response(body),
            b'1' => Ok(BackendMessage::ParseComplete),
            b'2' => Ok(BackendMessage::BindComplete),
            b'3' => Ok(BackendMessage::CloseComplete),
            b'I' => Ok(BackendMessage::EmptyQueryResponse),
            b'n' => Ok(BackendMessage::NoData),
            b's' => Ok(BackendMessage::PortalSuspended),
            b't' => Self::decode_parameter_description(body),
            b'A' => Self::decode_notification_response(body),
            _ => Err(Error::Protocol(format!(
                "unknown message type: {}",
                msg_type as char
            ))),
        }
    }

    fn decode_auth(mut body: Bytes) -> Result<Self> {
        let auth_type = body.get_i32();
        match auth_type {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                if body.remaining() < 4 {
                    return Err(Error::Protocol("truncated md5 salt".to_string()));
                }
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&body[..4]);
                Ok(BackendMessage::AuthenticationMD5Password { salt })
            }
            10 => {
                let mut mechanisms = Vec::new();
                while body.remaining() > 0 {
                    let mech = read_cstring(&mut body)?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                Ok(BackendMessage::AuthenticationSASL { mechanisms })
            }
            11 => Ok(BackendMessage::AuthenticationSASLContinue { data: body }),
            12 => Ok(BackendMessage::AuthenticationSASLFinal { data: body }),
            _ => Err(Error::Protocol(format!(
                "unknown authentication type: {}",
                auth_type
            ))),
        }
    }

    fn decode_row_description(mut body: Bytes) -> Result<Self> {
        let num_fields = body.get_i16() as usize;
        let mut fields = Vec::with_capacity(num_fields);

        for _ in 0..num_fields {
            let name = read_cstring(&mut body)?;
            let table_oid = body.get_i32();
            let column_attr = body.get_i16();
            let type_oid = Oid::from_i32(body.get_i32());
            let type_size = body.get_i16();
            let type_modifier = body.get_i32();
            let format = if body.get_i16() == 0 {
                Format::Text
            } else {
                Format::Binary
            };

            fields.push(FieldDescription {
                name,
                table_oid,
                column_attr,
                type_oid,
                type_size,
                type_modifier,
                format,
            });
        }

        Ok(BackendMessage::RowDescription { fields })
    }

    fn decode_data_row(mut body: Bytes) -> Result<Self> {
        let num_cols = body.get_i16() as usize;
        let mut values = Vec::with_capacity(num_cols);

        for _ in 0..num_cols {
            let len = body.get_i32();
            if len < 0 {
                values.push(None);
            } else {
                values.push(Some(body.split_to(len as usize)));
            }
        }

        Ok(BackendMessage::DataRow { values })
    }

    fn decode_command_complete(mut body: Bytes) -> Result<Self> {
        let tag = read_cstring(&mut body)?;
        Ok(BackendMessage::CommandComplete { tag })
    }

    fn decode_ready_for_query(mut body: Bytes) -> Result<Self> {
        let status = TransactionStatus::from(body.get_u8());
        Ok(BackendMessage::ReadyForQuery { status })
    }

    fn decode_parameter_status(mut body: Bytes) -> Result<Self> {
        let name = read_cstring(&mut body)?;
        let value = read_cstring(&mut body)?;
        Ok(BackendMessage::ParameterStatus { name, value })
    }

    fn decode_backend_key_data(mut body: Bytes) -> Result<Self> {
        let process_id = body.get_i32();
        let secret_key = body.get_i32();
        Ok(BackendMessage::BackendKeyData {
            process_id,
            secret_key,
        })
    }

    fn decode_copy_in_response(mut body: Bytes) -> Result<Self> {
        if body.remaining() < 3 {
            return Err(Error::Protocol("truncated CopyInResponse".to_string()));
        }
        let format = body.get_i8();
        let num_cols = body.get_i16() as usize;
        let mut column_formats = Vec::with_capacity(num_cols);
        for _ in 0..num_cols {
            column_formats.push(body.get_i16());
        }
        Ok(BackendMessage::CopyInResponse {
            format,
            column_formats,
        })
    }

    fn decode_parameter_description(mut body: Bytes) -> Result<Self> {
        let num_params = body.get_i16() as usize;
        let mut type_oids = Vec::with_capacity(num_params);
        for _ in 0..num_params {
            type_oids.push(Oid::from_i32(body.get_i32()));
        }
        Ok(BackendMessage::ParameterDescription { type_oids })
    }

    fn decode_notification_response(mut body: Bytes) -> Result<Self> {
        let process_id = body.get_i32();
        let channel = read_cstring(&mut body)?;
        let payload = read_cstring(&mut body)?;
        Ok(BackendMessage::NotificationResponse {
            process_id,
            channel,
            payload,
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Read a null-terminated string from the buffer.
fn read_cstring(buf: &mut Bytes) -> Result<String> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::Protocol("missing null terminator in string".to_string()))?;

    let s = std::str::from_utf8(&buf[..end])
        .map(str::to_owned)
        .unwrap_or_else(|_| String::from_utf8_lossy(&buf[..end]).into_owned());

    buf.advance(end + 1);
    Ok(s)
}

/// Read the tagged fields of an ErrorResponse / NoticeResponse.
fn read_error_fields(mut body: Bytes) -> Result<HashMap<u8, String>> {
    let mut fields = HashMap::new();
    while body.remaining() > 0 {
        let field_type = body.get_u8();
        if field_type == 0 {
            break;
        }
        fields.insert(field_type, read_cstring(&mut body)?);
    }
    Ok(fields)
}
