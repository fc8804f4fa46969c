//! Incremental RESP Reply Decoder
//!
//! Replies arrive on the socket in arbitrary chunks: a read may hold half a
//! reply, or several pipelined replies at once. The decoder looks at the
//! accumulated buffer and either:
//!
//! - returns `Ok(Some(value))` and removes exactly the bytes of that reply,
//! - returns `Ok(None)` and leaves the buffer untouched (need more data),
//! - returns `Err(ParseError)` when the stream is corrupt. The connection
//!   cannot be resynchronised after that and must be dropped.

use crate::protocol::types::{prefix, RespValue, CRLF};
use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Errors that can occur while decoding replies.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// Unknown type prefix byte
    #[error("unknown type prefix: {0:#04x}")]
    UnknownPrefix(u8),

    /// Invalid integer format
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Invalid UTF-8 in a simple string or error message
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    /// Bulk string length is negative (but not -1 for null)
    #[error("invalid bulk string length: {0}")]
    InvalidBulkLength(i64),

    /// Array length is negative (but not -1 for null)
    #[error("invalid array length: {0}")]
    InvalidArrayLength(i64),

    /// Protocol violation (missing CRLF, nesting too deep...)
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The reply exceeds maximum allowed size
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum size for a single bulk string (512 MB, same as Redis)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum array nesting depth
pub const MAX_NESTING_DEPTH: usize = 32;

/// Stateless reply decoder.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplyDecoder;

impl ReplyDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Decodes one complete reply from the front of `buf`, consuming its bytes.
    pub fn decode(&self, buf: &mut BytesMut) -> ParseResult<Option<RespValue>> {
        match parse_value(buf, 0)? {
            Some((value, consumed)) => {
                let _ = buf.split_to(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

/// Parses one value from `buf` without consuming, returning the value and its length.
pub fn parse_reply(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    parse_value(buf, 0)
}

fn parse_value(buf: &[u8], depth: usize) -> ParseResult<Option<(RespValue, usize)>> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };

    if depth > MAX_NESTING_DEPTH {
        return Err(ParseError::ProtocolError(format!(
            "maximum nesting depth exceeded: {}",
            MAX_NESTING_DEPTH
        )));
    }

    match first {
        prefix::SIMPLE_STRING => Ok(read_line(buf)?
            .map(|(line, used)| (RespValue::SimpleString(line.to_string()), used))),
        prefix::ERROR => {
            Ok(read_line(buf)?.map(|(line, used)| (RespValue::Error(line.to_string()), used)))
        }
        prefix::INTEGER => match read_line(buf)? {
            Some((line, used)) => Ok(Some((RespValue::Integer(parse_int(line)?), used))),
            None => Ok(None),
        },
        prefix::BULK_STRING => parse_bulk_string(buf),
        prefix::ARRAY => parse_array(buf, depth),
        other => Err(ParseError::UnknownPrefix(other)),
    }
}

/// Reads the line after the prefix byte. Returns the text and the bytes used
/// including prefix and CRLF.
fn read_line(buf: &[u8]) -> ParseResult<Option<(&str, usize)>> {
    match find_crlf(&buf[1..]) {
        Some(pos) => {
            let line = std::str::from_utf8(&buf[1..1 + pos])
                .map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;
            Ok(Some((line, 1 + pos + 2)))
        }
        None => Ok(None),
    }
}

fn parse_int(line: &str) -> ParseResult<i64> {
    line.parse()
        .map_err(|e: std::num::ParseIntError| ParseError::InvalidInteger(format!("{line:?}: {e}")))
}

/// `$<length>\r\n<data>\r\n`
fn parse_bulk_string(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    let Some((line, header)) = read_line(buf)? else {
        return Ok(None);
    };
    let length = parse_int(line)?;

    if length == -1 {
        return Ok(Some((RespValue::Null, header)));
    }
    if length < 0 {
        return Err(ParseError::InvalidBulkLength(length));
    }

    let length = length as usize;
    if length > MAX_BULK_SIZE {
        return Err(ParseError::MessageTooLarge {
            size: length,
            max: MAX_BULK_SIZE,
        });
    }

    let total = header + length + 2;
    if buf.len() < total {
        return Ok(None);
    }
    if &buf[header + length..total] != CRLF {
        return Err(ParseError::ProtocolError(
            "bulk string missing trailing CRLF".to_string(),
        ));
    }

    let data = Bytes::copy_from_slice(&buf[header..header + length]);
    Ok(Some((RespValue::BulkString(data), total)))
}

/// `*<count>\r\n<elements...>`
fn parse_array(buf: &[u8], depth: usize) -> ParseResult<Option<(RespValue, usize)>> {
    let Some((line, header)) = read_line(buf)? else {
        return Ok(None);
    };
    let count = parse_int(line)?;

    if count == -1 {
        return Ok(Some((RespValue::Null, header)));
    }
    if count < 0 {
        return Err(ParseError::InvalidArrayLength(count));
    }

    // Cap the preallocation: the count comes off the wire.
    let mut elements = Vec::with_capacity((count as usize).min(1024));
    let mut consumed = header;

    for _ in 0..count {
        match parse_value(&buf[consumed..], depth + 1)? {
            Some((value, used)) => {
                elements.push(value);
                consumed += used;
            }
            None => return Ok(None),
        }
    }

    Ok(Some((RespValue::Array(elements), consumed)))
}

#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> (Vec<RespValue>, BytesMut) {
        let decoder = ReplyDecoder::new();
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(value) = decoder.decode(&mut buf).unwrap() {
            out.push(value);
        }
        (out, buf)
    }

    #[test]
    fn test_decode_status_and_error() {
        let (values, rest) = decode_all(b"+OK\r\n-ERR unknown command 'FOO'\r\n");
        assert_eq!(
            values,
            vec![
                RespValue::simple_string("OK"),
                RespValue::error("ERR unknown command 'FOO'"),
            ]
        );
        assert!(rest.is_empty());
    }

    #[test]
    fn test_decode_integer_and_nulls() {
        let (values, _) = decode_all(b":1000\r\n:-42\r\n$-1\r\n*-1\r\n");
        assert_eq!(
            values,
            vec![
                RespValue::Integer(1000),
                RespValue::Integer(-42),
                RespValue::Null,
                RespValue::Null,
            ]
        );
    }

    #[test]
    fn test_partial_reply_leaves_buffer_untouched() {
        let decoder = ReplyDecoder::new();
        let mut buf = BytesMut::from(&b"$5\r\nhel"[..]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        assert_eq!(&buf[..], b"$5\r\nhel");

        buf.extend_from_slice(b"lo\r\n+PONG");
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(RespValue::bulk_string("hello"))
        );
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        assert_eq!(&buf[..], b"+PONG");
    }

    #[test]
    fn test_partial_nested_array() {
        let full = b"*2\r\n:1\r\n*2\r\n:2\r\n:3\r\n";
        for cut in 1..full.len() {
            assert!(parse_reply(&full[..cut]).unwrap().is_none(), "cut at {cut}");
        }
        let (value, used) = parse_reply(full).unwrap().unwrap();
        assert_eq!(used, full.len());
        assert_eq!(
            value,
            RespValue::Array(vec![
                RespValue::Integer(1),
                RespValue::Array(vec![RespValue::Integer(2), RespValue::Integer(3)]),
            ])
        );
    }

    #[test]
    fn test_binary_safe_bulk_string() {
        let (values, _) = decode_all(b"$5\r\nhel\x00o\r\n");
        assert_eq!(values, vec![RespValue::bulk_string(&b"hel\x00o"[..])]);
    }

    #[test]
    fn test_unknown_prefix_is_an_error() {
        let mut buf = BytesMut::from(&b"@oops\r\n"[..]);
        assert_eq!(
            ReplyDecoder::new().decode(&mut buf),
            Err(ParseError::UnknownPrefix(b'@'))
        );
    }

    #[test]
    fn test_invalid_lengths() {
        assert!(matches!(
            parse_reply(b"$-5\r\n"),
            Err(ParseError::InvalidBulkLength(-5))
        ));
        assert!(matches!(
            parse_reply(b"*-2\r\n"),
            Err(ParseError::InvalidArrayLength(-2))
        ));
        assert!(matches!(
            parse_reply(b":abc\r\n"),
            Err(ParseError::InvalidInteger(_))
        ));
        assert!(matches!(
            parse_reply(b"$3\r\nabcd\r\n"),
            Err(ParseError::ProtocolError(_))
        ));
    }

    #[test]
    fn test_nesting_limit() {
        let mut input = Vec::new();
        for _ in 0..=MAX_NESTING_DEPTH + 1 {
            input.extend_from_slice(b"*1\r\n");
        }
        input.extend_from_slice(b":1\r\n");
        assert!(matches!(
            parse_reply(&input),
            Err(ParseError::ProtocolError(_))
        ));
    }
}
