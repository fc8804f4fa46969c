//! Connection Request Decoding
//!
//! The host hands `create_client` an opaque byte buffer. It is a UTF-8 JSON
//! document describing where and how to connect:
//!
//! ```json
//! {
//!   "addresses": [{ "host": "127.0.0.1", "port": 6379 }],
//!   "request_timeout": 250,
//!   "connection_timeout": 2000,
//!   "database_id": 0,
//!   "client_name": "worker-1",
//!   "authentication_info": { "username": "default", "password": "secret" },
//!   "connection_retry_strategy": { "number_of_retries": 5, "factor": 10, "exponent_base": 2 },
//!   "worker_threads": 1
//! }
//! ```
//!
//! Timeouts are in milliseconds. Everything but `addresses` is optional.

use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default port of the backing store.
pub const DEFAULT_PORT: u16 = 6379;

/// Default per-command timeout in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 250;

/// Default timeout for establishing a connection, in milliseconds.
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 2000;

/// Upper bound on the per-client runtime size.
pub const MAX_WORKER_THREADS: usize = 64;

/// Errors produced while decoding or validating a connection request.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("connection request is empty")]
    Empty,

    #[error("malformed connection request: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("{0}")]
    Invalid(String),

    #[error("{0} is not supported")]
    Unsupported(&'static str),
}

/// One endpoint of the backing store.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeAddress {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthenticationInfo {
    #[serde(default)]
    pub username: Option<String>,
    pub password: String,
}

// Keep the password out of logs.
impl fmt::Debug for AuthenticationInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticationInfo")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum TlsMode {
    #[default]
    NoTls,
    SecureTls,
    InsecureTls,
}

/// Exponential backoff used between reconnect attempts.
///
/// The delay before attempt `n` (1-based) is `factor * exponent_base^n`
/// milliseconds, with `n` capped at `number_of_retries`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryStrategy {
    pub number_of_retries: u32,
    pub factor: u32,
    pub exponent_base: u32,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            number_of_retries: 5,
            factor: 10,
            exponent_base: 2,
        }
    }
}

impl RetryStrategy {
    /// Delay to wait after `failures` consecutive failed attempts.
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.min(self.number_of_retries);
        let multiplier = (self.exponent_base as u64).saturating_pow(exponent);
        Duration::from_millis((self.factor as u64).saturating_mul(multiplier))
    }
}

/// The decoded and validated connection request.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionRequest {
    pub addresses: Vec<NodeAddress>,

    #[serde(default = "default_request_timeout")]
    request_timeout: u64,

    #[serde(default = "default_connection_timeout")]
    connection_timeout: u64,

    #[serde(default)]
    pub database_id: u32,

    #[serde(default)]
    pub client_name: Option<String>,

    #[serde(default)]
    pub authentication_info: Option<AuthenticationInfo>,

    #[serde(default)]
    pub connection_retry_strategy: RetryStrategy,

    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    #[serde(default)]
    pub tls_mode: TlsMode,

    #[serde(default)]
    pub cluster_mode_enabled: bool,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_connection_timeout() -> u64 {
    DEFAULT_CONNECTION_TIMEOUT_MS
}

fn default_worker_threads() -> usize {
    1
}

impl ConnectionRequest {
    /// Decodes and validates a connection request. The buffer is only borrowed.
    pub fn decode(bytes: &[u8]) -> Result<Self, ConfigError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(ConfigError::Empty);
        }
        let request: ConnectionRequest = serde_json::from_slice(bytes)?;
        request.validate()?;
        Ok(request)
    }

    /// Builds a request for a single address with every other field defaulted.
    pub fn for_address(host: impl Into<String>, port: u16) -> Self {
        Self {
            addresses: vec![NodeAddress {
                host: host.into(),
                port,
            }],
            request_timeout: DEFAULT_REQUEST_TIMEOUT_MS,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT_MS,
            database_id: 0,
            client_name: None,
            authentication_info: None,
            connection_retry_strategy: RetryStrategy::default(),
            worker_threads: default_worker_threads(),
            tls_mode: TlsMode::NoTls,
            cluster_mode_enabled: false,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout.as_millis() as u64;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout.as_millis() as u64;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.addresses.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one address is required".to_string(),
            ));
        }
        for address in &self.addresses {
            if address.host.trim().is_empty() {
                return Err(ConfigError::Invalid("address host is empty".to_string()));
            }
            if address.port == 0 {
                return Err(ConfigError::Invalid(format!(
                    "invalid port 0 for host {}",
                    address.host
                )));
            }
        }
        if self.request_timeout == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout must be greater than zero".to_string(),
            ));
        }
        if self.connection_timeout == 0 {
            return Err(ConfigError::Invalid(
                "connection_timeout must be greater than zero".to_string(),
            ));
        }
        if !(1..=MAX_WORKER_THREADS).contains(&self.worker_threads) {
            return Err(ConfigError::Invalid(format!(
                "worker_threads must be between 1 and {}, got {}",
                MAX_WORKER_THREADS, self.worker_threads
            )));
        }
        if self.connection_retry_strategy.exponent_base == 0 {
            return Err(ConfigError::Invalid(
                "connection_retry_strategy.exponent_base must be at least 1".to_string(),
            ));
        }
        if self.tls_mode != TlsMode::NoTls {
            return Err(ConfigError::Unsupported("TLS"));
        }
        if self.cluster_mode_enabled {
            return Err(ConfigError::Unsupported("cluster mode"));
        }
        Ok(())
    }
}
