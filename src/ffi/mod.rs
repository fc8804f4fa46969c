//! C ABI
//!
//! The entry points a host-language wrapper links against.
//!
//! ## Ownership Rules
//!
//! | Value                    | Allocated by | Freed by                              |
//! |--------------------------|--------------|---------------------------------------|
//! | configuration bytes      | host         | host (borrowed during the call only)  |
//! | command arguments        | host         | host (copied before `command` returns)|
//! | `ConnectionResponse`     | core         | host, via `free_connection_response`  |
//! | success message          | core         | core, right after the callback returns|
//! | failure message          | core         | host, via `free_error_message`        |
//! | client handle            | core         | host, via `close_client` (once)       |
//!
//! Callbacks run on a core-owned thread and must not block it: a host should
//! complete its own future/promise and return.
//!
//! No panic unwinds into the host. A panic during `create_client` becomes an
//! error envelope; anywhere else it is logged and swallowed.

pub mod registry;
pub mod response;

pub use response::ConnectionResponse;

use crate::client::{Callbacks, Client, ClientError, FailureCallback, SuccessCallback};
use crate::config::ConnectionRequest;
use crate::connection::RequestError;
use bytes::Bytes;
use std::any::Any;
use std::ffi::{c_char, c_void, CString};
use std::panic::{self, AssertUnwindSafe};
use std::slice;
use tracing::{debug, error, info, warn};

/// Creates a client and connects it.
///
/// Always returns a non-null envelope holding exactly one of a handle or an
/// error message. Blocks until the connection is ready or has failed. Neither
/// callback is invoked by this call.
///
/// # Safety
///
/// `connection_request_bytes` must point to `connection_request_len` readable
/// bytes (it may be null when the length is 0). The returned envelope must be
/// released exactly once with [`free_connection_response`].
#[no_mangle]
pub unsafe extern "C" fn create_client(
    connection_request_bytes: *const u8,
    connection_request_len: usize,
    success_callback: Option<SuccessCallback>,
    failure_callback: Option<FailureCallback>,
) -> *const ConnectionResponse {
    let response = panic::catch_unwind(AssertUnwindSafe(|| {
        match create(
            connection_request_bytes,
            connection_request_len,
            success_callback,
            failure_callback,
        ) {
            Ok(id) => ConnectionResponse::connected(id as usize as *const c_void),
            Err(e) => {
                error!(error = %e, "Client creation failed");
                ConnectionResponse::failed(e.to_string())
            }
        }
    }))
    .unwrap_or_else(|payload| {
        let message = format!("Client creation panicked: {}", panic_message(&*payload));
        error!("{}", message);
        ConnectionResponse::failed(message)
    });

    Box::into_raw(Box::new(response))
}

unsafe fn create(
    bytes: *const u8,
    len: usize,
    success: Option<SuccessCallback>,
    failure: Option<FailureCallback>,
) -> Result<u64, ClientError> {
    let success = success.ok_or(ClientError::MissingCallback("success"))?;
    let failure = failure.ok_or(ClientError::MissingCallback("failure"))?;

    let bytes = borrow_bytes(bytes, len).map_err(|e| match e {
        BufferError::Null => ClientError::NullRequest,
        BufferError::TooLarge(len) => ClientError::RequestTooLarge(len),
    })?;
    let request = ConnectionRequest::decode(bytes)?;
    let client = Client::connect(request, Callbacks { success, failure })?;

    let id = registry::insert(client);
    info!(client_id = id, live_clients = registry::len(), "Client created");
    Ok(id)
}

/// Issues one command. Returns immediately; the outcome arrives through
/// exactly one callback carrying `channel`.
///
/// A handle that is unknown or already closed is a contract violation: it is
/// logged and no callback fires.
///
/// # Safety
///
/// `args` and `args_len` must point to `arg_count` entries each, and every
/// `args[i]` to `args_len[i]` readable bytes. They are copied before the call
/// returns.
#[no_mangle]
pub unsafe extern "C" fn command(
    client_ptr: *const c_void,
    channel: usize,
    arg_count: usize,
    args: *const *const u8,
    args_len: *const usize,
) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let id = client_ptr as usize as u64;
        let Some(client) = registry::get(id) else {
            warn!(
                client_id = id,
                token = channel,
                "Command issued on an unknown or closed handle"
            );
            return;
        };

        match copy_args(arg_count, args, args_len) {
            Ok(args) => client.execute(channel, args),
            Err(e) => client.reject(channel, e),
        }
    }));

    if let Err(payload) = result {
        error!(
            token = channel,
            "Panic while issuing command: {}",
            panic_message(&*payload)
        );
    }
}

/// Closes a client: blocks until every outstanding command has delivered its
/// callback, then releases the connection and the runtime.
///
/// Null, unknown and already-closed handles are a no-op. After this call the
/// handle must not be used again.
///
/// # Safety
///
/// `client_ptr` must be a value returned in a [`ConnectionResponse`] (or null).
#[no_mangle]
pub unsafe extern "C" fn close_client(client_ptr: *const c_void) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        if client_ptr.is_null() {
            warn!("close_client called with a null handle");
            return;
        }
        let id = client_ptr as usize as u64;
        let Some(client) = registry::remove(id) else {
            warn!(client_id = id, "close_client called on an unknown or already closed handle");
            return;
        };

        debug!(client_id = id, stats = ?client.stats(), "Closing client");
        client.close();
        info!(client_id = id, live_clients = registry::len(), "Client closed");
    }));

    if let Err(payload) = result {
        error!("Panic while closing client: {}", panic_message(&*payload));
    }
}

/// Frees an envelope returned by [`create_client`], including its message.
///
/// # Safety
///
/// `connection_response_ptr` must come from [`create_client`] and must not be
/// used after this call. Freeing the same envelope twice is undefined
/// behavior. Null is a no-op.
#[no_mangle]
pub unsafe extern "C" fn free_connection_response(
    connection_response_ptr: *mut ConnectionResponse,
) {
    if connection_response_ptr.is_null() {
        return;
    }
    drop(Box::from_raw(connection_response_ptr));
}

/// Frees a message received by the failure callback.
///
/// # Safety
///
/// `error_message` must be a pointer passed to the failure callback, released
/// at most once. Null is a no-op.
#[no_mangle]
pub unsafe extern "C" fn free_error_message(error_message: *mut c_char) {
    if error_message.is_null() {
        return;
    }
    drop(CString::from_raw(error_message));
}

#[derive(Debug, PartialEq, Eq)]
enum BufferError {
    Null,
    /// No allocation can be longer than `isize::MAX` bytes.
    TooLarge(usize),
}

/// Borrows `len` bytes at `ptr`. A zero length yields an empty slice even
/// for a null pointer.
unsafe fn borrow_bytes<'a>(ptr: *const u8, len: usize) -> Result<&'a [u8], BufferError> {
    if len == 0 {
        return Ok(&[]);
    }
    if len > isize::MAX as usize {
        return Err(BufferError::TooLarge(len));
    }
    if ptr.is_null() {
        return Err(BufferError::Null);
    }
    Ok(slice::from_raw_parts(ptr, len))
}

unsafe fn copy_args(
    arg_count: usize,
    args: *const *const u8,
    args_len: *const usize,
) -> Result<Vec<Bytes>, RequestError> {
    if arg_count == 0 {
        return Ok(Vec::new());
    }
    if args.is_null() || args_len.is_null() {
        return Err(RequestError::InvalidRequest(
            "argument array is null".to_string(),
        ));
    }

    let pointers = slice::from_raw_parts(args, arg_count);
    let lengths = slice::from_raw_parts(args_len, arg_count);

    pointers
        .iter()
        .zip(lengths)
        .enumerate()
        .map(|(i, (&ptr, &len))| {
            borrow_bytes(ptr, len)
                .map(Bytes::copy_from_slice)
                .map_err(|e| {
                    RequestError::InvalidRequest(match e {
                        BufferError::Null => format!("argument {} is null", i),
                        BufferError::TooLarge(len) => {
                            format!("argument {} length {} is too large", i, len)
                        }
                    })
                })
        })
        .collect()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
