//! Connection and request errors.
//!
//! Two surfaces: [`ConnectError`] for establishing a connection (reported in
//! the creation envelope), [`RequestError`] for a single command (reported
//! through the failure callback together with its [`RequestErrorType`]).

use crate::protocol::ParseError;
use std::io;
use thiserror::Error;

/// Coarse failure category handed to the failure callback.
///
/// The discriminants are part of the C ABI and must not change.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestErrorType {
    Unspecified = 0,
    /// A transaction was discarded by the server.
    ExecAbort = 1,
    Timeout = 2,
    /// The connection was lost or the client is closing.
    Disconnect = 3,
}

/// Why a single command failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    /// Error reply sent by the server.
    #[error("{0}")]
    Server(String),

    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    #[error("Received connection error `{0}`. Will attempt to reconnect")]
    Disconnected(String),

    #[error("Client is closing")]
    Closing,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The reply cannot be handed over the boundary.
    #[error("Invalid reply: {0}")]
    InvalidReply(String),
}

impl RequestError {
    pub fn kind(&self) -> RequestErrorType {
        match self {
            RequestError::Server(message) if message.starts_with("EXECABORT") => {
                RequestErrorType::ExecAbort
            }
            RequestError::Timeout(_) => RequestErrorType::Timeout,
            RequestError::Disconnected(_) | RequestError::Closing => RequestErrorType::Disconnect,
            RequestError::Server(_)
            | RequestError::InvalidRequest(_)
            | RequestError::InvalidReply(_) => RequestErrorType::Unspecified,
        }
    }
}

/// Failure to establish (or re-establish) a connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("no addresses to connect to")]
    NoAddresses,

    #[error("failed to connect to {address}: {source}")]
    Io {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out connecting to {address} after {timeout_ms} ms")]
    Timeout { address: String, timeout_ms: u64 },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("connection closed by server during handshake")]
    Closed,

    #[error("I/O error during handshake: {0}")]
    HandshakeIo(#[from] io::Error),

    #[error("protocol error during handshake: {0}")]
    Protocol(#[from] ParseError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(RequestErrorType::Unspecified as u32, 0);
        assert_eq!(RequestErrorType::ExecAbort as u32, 1);
        assert_eq!(RequestErrorType::Timeout as u32, 2);
        assert_eq!(RequestErrorType::Disconnect as u32, 3);
    }

    #[test]
    fn test_classification() {
        assert_eq!(
            RequestError::Server("ERR unknown command 'FOO'".into()).kind(),
            RequestErrorType::Unspecified
        );
        assert_eq!(
            RequestError::Server(
                "EXECABORT Transaction discarded because of previous errors.".into()
            )
            .kind(),
            RequestErrorType::ExecAbort
        );
        assert_eq!(RequestError::Timeout(250).kind(), RequestErrorType::Timeout);
        assert_eq!(
            RequestError::Disconnected("reset".into()).kind(),
            RequestErrorType::Disconnect
        );
        assert_eq!(RequestError::Closing.kind(), RequestErrorType::Disconnect);
        assert_eq!(
            RequestError::InvalidRequest("empty command".into()).kind(),
            RequestErrorType::Unspecified
        );
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            RequestError::Disconnected("connection reset by peer".into()).to_string(),
            "Received connection error `connection reset by peer`. Will attempt to reconnect"
        );
        assert_eq!(
            RequestError::Timeout(250).to_string(),
            "Request timed out after 250 ms"
        );
    }
}
