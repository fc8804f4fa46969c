//! Callback Dispatch
//!
//! Command outcomes leave the core through two host-supplied function
//! pointers. Executing tasks never call them directly: they post a
//! [`Completion`] to the client's delivery channel and a single delivery task
//! drains it.
//!
//! ```text
//!  command task ──┐
//!  command task ──┼──> mpsc<Completion> ──> delivery task ──> on_success(token, msg)
//!  command task ──┘                                      └──> on_failure(token, msg, kind)
//! ```
//!
//! A `Completion` is consumed when delivered, so each command reaches exactly
//! one callback exactly once.
//!
//! ## Ownership at the boundary
//!
//! - `on_success`: the message belongs to the core and is freed as soon as the
//!   callback returns. The receiver copies what it needs.
//! - `on_failure`: the message is handed over with `CString::into_raw` and is
//!   never touched by the core again. The receiver frees it with
//!   `free_error_message`.

use crate::connection::{RequestError, RequestErrorType};
use crate::protocol::RespValue;
use std::ffi::{c_char, CString};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// Called when a command succeeds. `message` is null for nil replies.
pub type SuccessCallback = unsafe extern "C" fn(channel_address: usize, message: *const c_char);

/// Called when a command fails. The receiver owns `error_message`.
pub type FailureCallback = unsafe extern "C" fn(
    channel_address: usize,
    error_message: *const c_char,
    error_type: RequestErrorType,
);

/// The callback pair registered for one client.
#[derive(Debug, Clone, Copy)]
pub struct Callbacks {
    pub success: SuccessCallback,
    pub failure: FailureCallback,
}

/// Outcome of one command, addressed to the caller waiting on `token`.
#[derive(Debug)]
pub struct Completion {
    pub token: usize,
    pub outcome: Result<RespValue, RequestError>,
}

impl Completion {
    /// Invokes exactly one of the callbacks.
    pub fn deliver(self, callbacks: &Callbacks) -> bool {
        let value = match self.outcome {
            Ok(value) => value,
            Err(error) => {
                deliver_failure(callbacks, self.token, &error);
                return false;
            }
        };

        let Some(payload) = value.to_payload() else {
            // SAFETY: the host guarantees the callback stays valid until close.
            unsafe { (callbacks.success)(self.token, ptr::null()) };
            return true;
        };

        match CString::new(payload) {
            Ok(message) => {
                // SAFETY: `message` outlives the call and is freed right after it.
                unsafe { (callbacks.success)(self.token, message.as_ptr()) };
                true
            }
            Err(_) => {
                let error = RequestError::InvalidReply(
                    "reply contains an interior NUL byte".to_string(),
                );
                deliver_failure(callbacks, self.token, &error);
                false
            }
        }
    }
}

fn deliver_failure(callbacks: &Callbacks, token: usize, error: &RequestError) {
    let message = to_c_string(error.to_string()).into_raw();
    // SAFETY: ownership of `message` moves to the receiver.
    unsafe { (callbacks.failure)(token, message, error.kind()) };
}

/// Converts a message to a C string, replacing interior NUL bytes.
pub(crate) fn to_c_string(message: String) -> CString {
    match CString::new(message) {
        Ok(message) => message,
        Err(e) => {
            let cleaned: Vec<u8> = e
                .into_vec()
                .into_iter()
                .map(|b| if b == 0 { b'?' } else { b })
                .collect();
            CString::new(cleaned).unwrap_or_default()
        }
    }
}

/// Tracks commands that were issued but whose callback has not returned yet.
#[derive(Debug, Default)]
pub struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn lock(&self) -> MutexGuard<'_, usize> {
        self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self) {
        *self.lock() += 1;
    }

    fn finish(&self) {
        let mut count = self.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    pub fn count(&self) -> usize {
        *self.lock()
    }

    /// Blocks until nothing is in flight. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let count = self.lock();
        let (count, _) = self
            .idle
            .wait_timeout_while(count, timeout, |count| *count > 0)
            .unwrap_or_else(PoisonError::into_inner);
        *count == 0
    }
}

/// Delivery counters for one client.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    pub issued: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
}

/// Sending side of a client's delivery channel.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    completions: mpsc::UnboundedSender<Completion>,
    callbacks: Callbacks,
    in_flight: Arc<InFlight>,
    stats: Arc<DeliveryStats>,
}

impl Dispatcher {
    /// Spawns the delivery task on the client's runtime.
    pub fn start(runtime: &Handle, callbacks: Callbacks) -> Self {
        let (completions, receiver) = mpsc::unbounded_channel();
        let dispatcher = Self {
            completions,
            callbacks,
            in_flight: Arc::new(InFlight::default()),
            stats: Arc::new(DeliveryStats::default()),
        };
        runtime.spawn(delivery_loop(dispatcher.clone_receiving_side(), receiver));
        dispatcher
    }

    fn clone_receiving_side(&self) -> DeliverySide {
        DeliverySide {
            callbacks: self.callbacks,
            in_flight: Arc::clone(&self.in_flight),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Registers a new command. Every `begin` must be matched by one `complete`.
    pub fn begin(&self) {
        self.in_flight.begin();
        self.stats.issued.fetch_add(1, Ordering::Relaxed);
    }

    /// Posts the outcome of a command for delivery.
    pub fn complete(&self, token: usize, outcome: Result<RespValue, RequestError>) {
        if let Err(mpsc::error::SendError(completion)) =
            self.completions.send(Completion { token, outcome })
        {
            // The delivery task is gone (runtime shut down): deliver inline.
            warn!(token, "Delivery task stopped, invoking callback inline");
            self.clone_receiving_side().deliver(completion);
        }
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    pub fn stats(&self) -> &DeliveryStats {
        &self.stats
    }
}

/// What the delivery task needs; it holds no sender so the channel can close.
struct DeliverySide {
    callbacks: Callbacks,
    in_flight: Arc<InFlight>,
    stats: Arc<DeliveryStats>,
}

impl DeliverySide {
    fn deliver(&self, completion: Completion) {
        let token = completion.token;
        let counter = if completion.deliver(&self.callbacks) {
            &self.stats.succeeded
        } else {
            &self.stats.failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.in_flight.finish();
        trace!(token, "Callback delivered");
    }
}

async fn delivery_loop(side: DeliverySide, mut receiver: mpsc::UnboundedReceiver<Completion>) {
    while let Some(completion) = receiver.recv().await {
        side.deliver(completion);
    }
}
