//! Connection Configuration
//!
//! Decoding and validation of the configuration buffer passed to
//! `create_client`. The buffer is borrowed for the duration of the call;
//! everything the client keeps afterwards is owned by [`ConnectionRequest`].

pub mod request;

pub use request::{
    AuthenticationInfo, ConfigError, ConnectionRequest, NodeAddress, RetryStrategy, TlsMode,
};
