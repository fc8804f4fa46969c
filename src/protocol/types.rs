//! RESP (Redis Serialization Protocol) Data Types
//!
//! The bridge speaks RESP2 to the backing store. Requests always go out as
//! arrays of bulk strings; replies can be any of the five RESP2 types.
//!
//! ## Protocol Format
//!
//! Each RESP type starts with a type prefix byte:
//! - `+` Simple String
//! - `-` Error
//! - `:` Integer
//! - `$` Bulk String
//! - `*` Array
//!
//! All types are terminated with CRLF (`\r\n`).
//!
//! ## Examples
//!
//! Request: `*2\r\n$3\r\nGET\r\n$4\r\nname\r\n`
//! Replies: `+OK\r\n`, `:1000\r\n`, `$5\r\nhello\r\n`, `$-1\r\n`

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// The CRLF terminator used in RESP protocol
pub const CRLF: &[u8] = b"\r\n";

/// RESP protocol type prefixes
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// A reply (or request) value in the RESP protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// Status reply such as `+OK`.
    SimpleString(String),

    /// Error reply. The first word is the error code (`ERR`, `WRONGTYPE`, `EXECABORT`...).
    Error(String),

    /// 64-bit signed integer.
    Integer(i64),

    /// Binary-safe string.
    BulkString(Bytes),

    /// Null bulk string or null array.
    Null,

    /// Arrays can contain any RESP type, including nested arrays.
    Array(Vec<RespValue>),
}

impl RespValue {
    pub fn simple_string(s: impl Into<String>) -> Self {
        RespValue::SimpleString(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    pub fn bulk_string(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(data.into())
    }

    /// Returns true for the `+OK` status reply.
    pub fn is_ok(&self) -> bool {
        matches!(self, RespValue::SimpleString(s) if s == "OK")
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::Null)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// Serializes the value into its wire format.
    pub fn serialize_into(&self, buf: &mut BytesMut) {
        match self {
            RespValue::SimpleString(s) => write_line(buf, prefix::SIMPLE_STRING, s.as_bytes()),
            RespValue::Error(s) => write_line(buf, prefix::ERROR, s.as_bytes()),
            RespValue::Integer(n) => write_line(buf, prefix::INTEGER, n.to_string().as_bytes()),
            RespValue::BulkString(data) => write_bulk(buf, data),
            RespValue::Null => write_line(buf, prefix::BULK_STRING, b"-1"),
            RespValue::Array(values) => {
                write_line(buf, prefix::ARRAY, values.len().to_string().as_bytes());
                for value in values {
                    value.serialize_into(buf);
                }
            }
        }
    }

    /// Converts a reply into the text handed to the success callback.
    ///
    /// Returns `None` for nil replies. Strings are passed through byte for byte,
    /// integers in decimal, arrays as a JSON array of the converted elements.
    pub fn to_payload(&self) -> Option<Vec<u8>> {
        match self {
            RespValue::Null => None,
            RespValue::SimpleString(s) | RespValue::Error(s) => Some(s.clone().into_bytes()),
            RespValue::Integer(n) => Some(n.to_string().into_bytes()),
            RespValue::BulkString(data) => Some(data.to_vec()),
            RespValue::Array(_) => Some(self.to_json().to_string().into_bytes()),
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            RespValue::Null => serde_json::Value::Null,
            RespValue::Integer(n) => serde_json::Value::from(*n),
            RespValue::SimpleString(s) | RespValue::Error(s) => serde_json::Value::from(s.as_str()),
            RespValue::BulkString(data) => {
                serde_json::Value::from(String::from_utf8_lossy(data).into_owned())
            }
            RespValue::Array(values) => {
                serde_json::Value::Array(values.iter().map(RespValue::to_json).collect())
            }
        }
    }
}

/// Encodes a command as a RESP array of bulk strings.
///
/// ```
/// use flashkv_bridge::protocol::encode_command;
/// use bytes::Bytes;
///
/// let frame = encode_command(&[Bytes::from("GET"), Bytes::from("name")]);
/// assert_eq!(&frame[..], b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n");
/// ```
pub fn encode_command(args: &[Bytes]) -> Bytes {
    let size = 16 + args.iter().map(|a| a.len() + 16).sum::<usize>();
    let mut buf = BytesMut::with_capacity(size);
    write_line(&mut buf, prefix::ARRAY, args.len().to_string().as_bytes());
    for arg in args {
        write_bulk(&mut buf, arg);
    }
    buf.freeze()
}

#[inline]
fn write_line(buf: &mut BytesMut, prefix: u8, content: &[u8]) {
    buf.put_u8(prefix);
    buf.extend_from_slice(content);
    buf.extend_from_slice(CRLF);
}

#[inline]
fn write_bulk(buf: &mut BytesMut, data: &[u8]) {
    write_line(buf, prefix::BULK_STRING, data.len().to_string().as_bytes());
    buf.extend_from_slice(data);
    buf.extend_from_slice(CRLF);
}

impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespValue::SimpleString(s) => write!(f, "{}", s),
            RespValue::Error(s) => write!(f, "(error) {}", s),
            RespValue::Integer(n) => write!(f, "(integer) {}", n),
            RespValue::BulkString(data) => match std::str::from_utf8(data) {
                Ok(s) => write!(f, "\"{}\"", s),
                Err(_) => write!(f, "(binary data, {} bytes)", data.len()),
            },
            RespValue::Null => write!(f, "(nil)"),
            RespValue::Array(values) if values.is_empty() => write!(f, "(empty array)"),
            RespValue::Array(values) => {
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {}", i + 1, v)?;
                }
                Ok(())
            }
        }
    }
}
