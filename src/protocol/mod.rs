//! RESP Protocol Implementation
//!
//! Client side of the Redis Serialization Protocol: commands are encoded as
//! arrays of bulk strings, replies are decoded incrementally from the
//! connection's read buffer.
//!
//! ## Modules
//!
//! - `types`: The `RespValue` enum, command encoding and callback payloads
//! - `parser`: Incremental reply decoder
//!
//! ## Example
//!
//! ```
//! use flashkv_bridge::protocol::{encode_command, ReplyDecoder, RespValue};
//! use bytes::{Bytes, BytesMut};
//!
//! let frame = encode_command(&[Bytes::from("PING")]);
//! assert_eq!(&frame[..], b"*1\r\n$4\r\nPING\r\n");
//!
//! let mut buf = BytesMut::from(&b"+PONG\r\n"[..]);
//! let reply = ReplyDecoder::new().decode(&mut buf).unwrap();
//! assert_eq!(reply, Some(RespValue::simple_string("PONG")));
//! ```

pub mod parser;
pub mod types;

pub use parser::{parse_reply, ParseError, ParseResult, ReplyDecoder};
pub use types::{encode_command, RespValue};
