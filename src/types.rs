//! PostgreSQL type encoding and decoding.
//!
//! Binary-format codecs for the built-in types the client understands, with
//! a text-format fallback for the simple query protocol.

use crate::error::{Error, Result};

// ============================================================================
// Type OIDs
// ============================================================================

/// A PostgreSQL type object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid(pub i32);

impl Oid {
    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const TEXT: Oid = Oid(25);
    pub const OID_TYPE: Oid = Oid(26);
    pub const JSON: Oid = Oid(114);
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const VARCHAR: Oid = Oid(1043);
    pub const BPCHAR: Oid = Oid(1042);
    pub const DATE: Oid = Oid(1082);
    pub const TIME: Oid = Oid(1083);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const TIMETZ: Oid = Oid(1266);
    pub const NUMERIC: Oid = Oid(1700);
    pub const UUID: Oid = Oid(2950);
    pub const JSONB: Oid = Oid(3802);

    #[inline]
    pub fn from_i32(oid: i32) -> Self {
        Oid(oid)
    }

    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0
    }

    /// Whether values of this type decode as strings.
    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME
        )
    }
}

// ============================================================================
// Values
// ============================================================================

/// A PostgreSQL value with type information.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytea(Vec<u8>),
    Uuid([u8; 16]),
    /// Microseconds since 2000-01-01.
    Timestamp(i64),
    /// Days since 2000-01-01.
    Date(i32),
    /// Microseconds since midnight.
    Time(i64),
    Json(String),
    /// Raw bytes for types without a dedicated codec.
    Raw { oid: Oid, data: Vec<u8> },
}

impl PgValue {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
    }

    /// Encode this value to the binary wire format.
    pub fn encode_binary(&self) -> Vec<u8> {
        match self {
            PgValue::Null => Vec::new(),
            PgValue::Bool(v) => vec![u8::from(*v)],
            PgValue::Int2(v) => v.to_be_bytes().to_vec(),
            PgValue::Int4(v) => v.to_be_bytes().to_vec(),
            PgValue::Int8(v) => v.to_be_bytes().to_vec(),
            PgValue::Float4(v) => v.to_be_bytes().to_vec(),
            PgValue::Float8(v) => v.to_be_bytes().to_vec(),
            PgValue::Text(v) => v.as_bytes().to_vec(),
            PgValue::Bytea(v) => v.clone(),
            PgValue::Uuid(v) => v.to_vec(),
            PgValue::Timestamp(v) => v.to_be_bytes().to_vec(),
            PgValue::Date(v) => v.to_be_bytes().to_vec(),
            PgValue::Time(v) => v.to_be_bytes().to_vec(),
            PgValue::Json(v) => v.as_bytes().to_vec(),
            PgValue::Raw { data, .. } => data.clone(),
        }
    }

    /// The OID used when this value is sent as a parameter.
    pub fn type_oid(&self) -> Oid {
        match self {
            // NULL carries no type of its own; the server infers it.
            PgValue::Null => Oid::TEXT,
            PgValue::Bool(_) => Oid::BOOL,
            PgValue::Int2(_) => Oid::INT2,
            PgValue::Int4(_) => Oid::INT4,
            PgValue::Int8(_) => Oid::INT8,
            PgValue::Float4(_) => Oid::FLOAT4,
            PgValue::Float8(_) => Oid::FLOAT8,
            PgValue::Text(_) => Oid::TEXT,
            PgValue::Bytea(_) => Oid::BYTEA,
            PgValue::Uuid(_) => Oid::UUID,
            PgValue::Timestamp(_) => Oid::TIMESTAMP,
            PgValue::Date(_) => Oid::DATE,
            PgValue::Time(_) => Oid::TIME,
            PgValue::Json(_) => Oid::JSONB,
            PgValue::Raw { oid, .. } => *oid,
        }
    }

    /// Decode a value from the binary wire format.
    pub fn decode_binary(oid: Oid, data: &[u8]) -> Result<Self> {
        match oid {
            Oid::BOOL => match data {
                [b] => Ok(PgValue::Bool(*b != 0)),
                _ => Err(bad_len("bool", 1, data.len())),
            },
            Oid::INT2 => Ok(PgValue::Int2(i16::from_be_bytes(fixed("int2", data)?))),
            Oid::INT4 => Ok(PgValue::Int4(i32::from_be_bytes(fixed("int4", data)?))),
            Oid::INT8 => Ok(PgValue::Int8(i64::from_be_bytes(fixed("int8", data)?))),
            Oid::FLOAT4 => Ok(PgValue::Float4(f32::from_be_bytes(fixed("float4", data)?))),
            Oid::FLOAT8 => Ok(PgValue::Float8(f64::from_be_bytes(fixed("float8", data)?))),
            Oid::BYTEA => Ok(PgValue::Bytea(data.to_vec())),
            Oid::UUID => Ok(PgValue::Uuid(fixed("uuid", data)?)),
            Oid::TIMESTAMP | Oid::TIMESTAMPTZ => Ok(PgValue::Timestamp(i64::from_be_bytes(
                fixed("timestamp", data)?,
            ))),
            Oid::DATE => Ok(PgValue::Date(i32::from_be_bytes(fixed("date", data)?))),
            Oid::TIME | Oid::TIMETZ => {
                if data.len() < 8 {
                    return Err(bad_len("time", 8, data.len()));
                }
                Ok(PgValue::Time(i64::from_be_bytes(
                    data[..8].try_into().expect("length checked"),
                )))
            }
            Oid::JSON | Oid::JSONB => {
                // JSONB carries a one-byte version prefix.
                let body = if oid == Oid::JSONB && !data.is_empty() {
                    &data[1..]
                } else {
                    data
                };
                let s = std::str::from_utf8(body)
                    .map_err(|e| Error::Decode(format!("invalid utf-8 in json: {}", e)))?;
                Ok(PgValue::Json(s.to_owned()))
            }
            _ if oid.is_text_like() => {
                let s = std::str::from_utf8(data)
                    .map_err(|e| Error::Decode(format!("invalid utf-8 in text: {}", e)))?;
                Ok(PgValue::Text(s.to_owned()))
            }
            _ => Ok(PgValue::Raw {
                oid,
                data: data.to_vec(),
            }),
        }
    }

    /// Decode from text format (simple query protocol).
    pub fn decode_text(oid: Oid, data: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(data);

        match oid {
            Oid::BOOL => Ok(PgValue::Bool(matches!(&*text, "t" | "true" | "1"))),
            Oid::INT2 => parse_num(&text, PgValue::Int2, "int2"),
            Oid::INT4 => parse_num(&text, PgValue::Int4, "int4"),
            Oid::INT8 => parse_num(&text, PgValue::Int8, "int8"),
            Oid::FLOAT4 => parse_num(&text, PgValue::Float4, "float4"),
            Oid::FLOAT8 => parse_num(&text, PgValue::Float8, "float8"),
            // everything else is handed back as text
            _ => Ok(PgValue::Text(text.into_owned())),
        }
    }
}

fn fixed<const N: usize>(what: &str, data: &[u8]) -> Result<[u8; N]> {
    data.try_into().map_err(|_| bad_len(what, N, data.len()))
}

fn bad_len(what: &str, want: usize, got: usize) -> Error {
    Error::Decode(format!("{}: expected {} bytes, got {}", what, want, got))
}

fn parse_num<T: std::str::FromStr>(
    text: &str,
    wrap: impl FnOnce(T) -> PgValue,
    what: &str,
) -> Result<PgValue>
where
    T::Err: std::fmt::Display,
{
    text.parse::<T>()
        .map(wrap)
        .map_err(|e| Error::Decode(format!("invalid {}: {}", what, e)))
}
