//! The Connection Core behind one client handle.
//!
//! ## Lifecycle
//!
//! ```text
//! 1. Client::connect
//!        │   build runtime, connect + handshake (blocking), spawn
//!        │   multiplexer and delivery tasks
//!        ▼
//! 2. Client::execute (any thread, any number of times)
//!        │   spawn: timeout(send) ──> Completion ──> callback
//!        ▼
//! 3. Client::close (once; later calls are no-ops)
//!        │   reject new commands, wait for in-flight callbacks,
//!        │   shut the runtime down
//!        ▼
//! 4. Dropped
//! ```

use crate::client::dispatch::{Callbacks, Dispatcher};
use crate::config::{ConfigError, ConnectionRequest};
use crate::connection::{self, ConnectError, Connection, RequestError};
use bytes::Bytes;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, error, info, trace, warn};

/// Extra time `close` waits for callbacks beyond the request timeout.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// How long the runtime gets to stop its remaining tasks.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a client could not be created. The `Display` text is what the host
/// reads from the creation envelope.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid configuration: connection request pointer is null")]
    NullRequest,

    #[error("Invalid configuration: connection request length {0} is too large")]
    RequestTooLarge(usize),

    #[error("Invalid callbacks: {0} callback is null")]
    MissingCallback(&'static str),

    #[error("Connection error: {0}")]
    Connect(#[from] ConnectError),

    #[error("Failed to start client runtime: {0}")]
    Runtime(#[source] io::Error),
}

/// Point-in-time counters of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientStats {
    pub commands_issued: u64,
    pub commands_succeeded: u64,
    pub commands_failed: u64,
    pub in_flight: usize,
    pub disconnects: u64,
    pub reconnects: u64,
}

/// A live connection plus the runtime executing its commands.
pub struct Client {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    connection: Connection,
    dispatcher: Dispatcher,
    request_timeout: Duration,
    closing: AtomicBool,
}

impl Client {
    /// Builds the runtime and establishes the connection.
    ///
    /// Blocks the calling thread until the connection is ready or has failed.
    /// Must not be called from inside an async context.
    pub fn connect(request: ConnectionRequest, callbacks: Callbacks) -> Result<Self, ClientError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(request.worker_threads)
            .thread_name("flashkv-bridge-worker")
            .enable_all()
            .build()
            .map_err(ClientError::Runtime)?;

        let request = Arc::new(request);
        let stream = runtime.block_on(connection::connect(&request))?;

        let handle = runtime.handle().clone();
        let connection = Connection::start(&handle, stream, Arc::clone(&request));
        let dispatcher = Dispatcher::start(&handle, callbacks);

        info!(
            addresses = ?request.addresses.iter().map(ToString::to_string).collect::<Vec<_>>(),
            worker_threads = request.worker_threads,
            request_timeout_ms = request.request_timeout().as_millis() as u64,
            "Client connected"
        );

        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            handle,
            connection,
            dispatcher,
            request_timeout: request.request_timeout(),
            closing: AtomicBool::new(false),
        })
    }

    /// Issues a command. Returns immediately; the outcome is reported through
    /// exactly one callback carrying `token`.
    pub fn execute(&self, token: usize, args: Vec<Bytes>) {
        self.dispatcher.begin();

        if self.closing.load(Ordering::SeqCst) {
            self.dispatcher.complete(token, Err(RequestError::Closing));
            return;
        }
        if args.is_empty() {
            self.dispatcher.complete(
                token,
                Err(RequestError::InvalidRequest("empty command".to_string())),
            );
            return;
        }

        trace!(token, args = args.len(), "Command issued");

        let connection = self.connection.clone();
        let dispatcher = self.dispatcher.clone();
        let timeout = self.request_timeout;

        self.handle.spawn(async move {
            let outcome = match tokio::time::timeout(timeout, connection.send(&args)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(RequestError::Timeout(timeout.as_millis() as u64)),
            };
            dispatcher.complete(token, outcome);
        });
    }

    /// Reports a command that was rejected before reaching the core.
    pub fn reject(&self, token: usize, error: RequestError) {
        self.dispatcher.begin();
        self.dispatcher.complete(token, Err(error));
    }

    /// Stops accepting commands, waits until every outstanding callback has
    /// fired, then releases the runtime and the connection.
    ///
    /// Called from one of the client's own threads (e.g. inside a callback),
    /// the teardown moves to a background thread instead of blocking.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            debug!("Client already closing");
            return;
        }

        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let dispatcher = self.dispatcher.clone();
        let drain_timeout = self.request_timeout + DRAIN_GRACE;

        let teardown = move || {
            let outstanding = dispatcher.in_flight().count();
            if outstanding > 0 {
                debug!(outstanding, "Waiting for outstanding commands");
            }
            if !dispatcher.in_flight().wait_idle(drain_timeout) {
                warn!(
                    remaining = dispatcher.in_flight().count(),
                    "Closing with undelivered callbacks"
                );
            }
            drop(dispatcher);
            if let Some(runtime) = runtime {
                runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
            }
            debug!("Client runtime stopped");
        };

        if Handle::try_current().is_ok() {
            warn!("close called from an async context, finishing teardown in the background");
            let spawned = std::thread::Builder::new()
                .name("flashkv-bridge-close".to_string())
                .spawn(teardown);
            if let Err(e) = spawned {
                error!(error = %e, "Failed to spawn teardown thread");
            }
        } else {
            teardown();
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ClientStats {
        let delivery = self.dispatcher.stats();
        let connection = self.connection.stats();
        ClientStats {
            commands_issued: delivery.issued.load(Ordering::Relaxed),
            commands_succeeded: delivery.succeeded.load(Ordering::Relaxed),
            commands_failed: delivery.failed.load(Ordering::Relaxed),
            in_flight: self.dispatcher.in_flight().count(),
            disconnects: connection.disconnects.load(Ordering::Relaxed),
            reconnects: connection.reconnects.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}
