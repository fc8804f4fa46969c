//! Connection Module
//!
//! Everything between a client and the backing store's socket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     handshake::connect                      │
//! │   TCP connect ──> AUTH ──> SELECT ──> CLIENT SETNAME        │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │ TcpStream
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Multiplexer task                       │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐      │
//! │  │ Write frame │───>│ Read bytes  │───>│ Decode RESP │      │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘      │
//! │                                               │             │
//! │                                               ▼             │
//! │                                      ┌─────────────────┐    │
//! │                                      │ Complete oldest │    │
//! │                                      │ pending slot    │    │
//! │                                      └─────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`Connection`] is the cloneable handle the rest of the crate uses;
//! [`RequestError`] and [`RequestErrorType`] describe per-command failures.

pub mod error;
pub mod handshake;
pub mod multiplexer;

pub use error::{ConnectError, RequestError, RequestErrorType};
pub use handshake::connect;
pub use multiplexer::{Connection, ConnectionStats};
