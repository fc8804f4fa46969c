//! # FlashKV Bridge - A C ABI for an Asynchronous Key-Value Client
//!
//! FlashKV Bridge is the native core behind host-language client wrappers
//! (C#, Go, Python...). The host creates a client, fires commands at it
//! without blocking, receives each outcome through a callback and finally
//! closes the client. All I/O runs on a tokio runtime owned by the core.
//!
//! ## Features
//!
//! - **Non-blocking commands**: `command` returns immediately; exactly one
//!   callback reports the outcome, tagged with the host's routing token
//! - **Pipelined connection**: one multiplexer task per client keeps many
//!   requests in flight on a single TCP stream
//! - **Self-healing**: lost connections are re-established with exponential
//!   backoff, the handle stays usable
//! - **Leak-free boundary**: every allocation crossing the boundary has one
//!   documented owner and one release function
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                             Host wrapper                                │
//! └──────┬───────────────────┬───────────────────────────▲──────────────────┘
//!        │ create_client     │ command(token, args)      │ on_success / on_failure
//!        │ close_client      │                           │ (token, message[, kind])
//! ┌──────▼───────────────────▼───────────────────────────┴──────────────────┐
//! │  ffi: registry (handle id -> Arc<Client>), envelopes, catch_unwind      │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                         client::Client                                  │
//! │  ┌──────────────────────────┐          ┌────────────────────────────┐   │
//! │  │ tokio runtime            │          │ Dispatcher                 │   │
//! │  │  command task ──timeout──┼─────────>│  mpsc<Completion>          │   │
//! │  │  command task ──timeout──┼─────────>│  delivery task ──callback  │   │
//! │  └────────────┬─────────────┘          └────────────────────────────┘   │
//! │               │ send(args)                                              │
//! │  ┌────────────▼─────────────────────────────────────────────────────┐   │
//! │  │ connection::Connection  ──>  Multiplexer task  <──>  TcpStream   │   │
//! │  │                              (RESP encode / incremental decode)  │   │
//! │  └──────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use flashkv_bridge::client::{Callbacks, Client};
//! use flashkv_bridge::config::ConnectionRequest;
//! use bytes::Bytes;
//!
//! unsafe extern "C" fn on_success(token: usize, message: *const std::ffi::c_char) { /* ... */ }
//! unsafe extern "C" fn on_failure(
//!     token: usize,
//!     message: *const std::ffi::c_char,
//!     kind: flashkv_bridge::RequestErrorType,
//! ) {
//!     flashkv_bridge::ffi::free_error_message(message as *mut _);
//! }
//!
//! let request = ConnectionRequest::decode(br#"{"addresses":[{"host":"127.0.0.1"}]}"#)?;
//! let client = Client::connect(request, Callbacks { success: on_success, failure: on_failure })?;
//!
//! client.execute(42, vec![Bytes::from("SET"), Bytes::from("name"), Bytes::from("Ariz")]);
//! client.close(); // returns once the callback for token 42 has fired
//! ```
//!
//! ## Module Overview
//!
//! - [`ffi`]: the exported `extern "C"` functions and the handle registry
//! - [`client`]: per-handle lifecycle and callback dispatch
//! - [`connection`]: connection setup, multiplexing and reconnection
//! - [`config`]: the JSON connection request
//! - [`protocol`]: RESP value model and codec
//! - [`logger`]: host-driven logging entry points
//!
//! ## Design Highlights
//!
//! ### Handles Are Ids
//!
//! The host never holds a Rust pointer. `conn_ptr` is an id into a process
//! wide registry, so closing twice or using a closed handle is detected and
//! reported instead of touching freed memory.
//!
//! ### One Callback, Exactly Once
//!
//! Outcomes are moved into a `Completion` and consumed on delivery. Timeouts,
//! disconnects and close all end in the same single callback.
//!
//! ### Close Drains
//!
//! `close_client` waits for every outstanding callback before releasing the
//! runtime. Because each command is bounded by the request timeout, the wait
//! is bounded too.

pub mod client;
pub mod config;
pub mod connection;
pub mod ffi;
pub mod logger;
pub mod protocol;

#[cfg(test)]
mod test_support;

// Re-export commonly used types for convenience
pub use client::{Callbacks, Client, ClientError};
pub use config::{ConfigError, ConnectionRequest};
pub use connection::{RequestError, RequestErrorType};
pub use ffi::ConnectionResponse;
pub use logger::Level;
pub use protocol::{ParseError, RespValue};

/// Version of FlashKV Bridge
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
