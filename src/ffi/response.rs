//! The creation envelope handed to the host by `create_client`.

use crate::client::dispatch::to_c_string;
use std::ffi::{c_char, c_void, CStr, CString};
use std::ptr;

/// Result of `create_client`: exactly one of the two fields is non-null.
///
/// Represented as a struct instead of an enum for ease of use in the host
/// language. Must be released with `free_connection_response`, whichever
/// field is set.
#[repr(C)]
#[derive(Debug)]
pub struct ConnectionResponse {
    pub conn_ptr: *const c_void,
    pub connection_error_message: *const c_char,
}

impl ConnectionResponse {
    /// Envelope for a successfully created client.
    pub(crate) fn connected(conn_ptr: *const c_void) -> Self {
        debug_assert!(!conn_ptr.is_null());
        Self {
            conn_ptr,
            connection_error_message: ptr::null(),
        }
    }

    /// Envelope for a failed creation attempt.
    pub(crate) fn failed(message: impl Into<String>) -> Self {
        Self {
            conn_ptr: ptr::null(),
            connection_error_message: to_c_string(message.into()).into_raw(),
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.conn_ptr.is_null()
    }

    /// Copies the error message out, if any.
    pub fn error_message(&self) -> Option<String> {
        if self.connection_error_message.is_null() {
            return None;
        }
        // SAFETY: set only by `failed`, from `CString::into_raw`, and valid until drop.
        let message = unsafe { CStr::from_ptr(self.connection_error_message) };
        Some(message.to_string_lossy().into_owned())
    }
}

impl Drop for ConnectionResponse {
    fn drop(&mut self) {
        if !self.connection_error_message.is_null() {
            // SAFETY: produced by `CString::into_raw` in `failed` and released only here.
            drop(unsafe { CString::from_raw(self.connection_error_message as *mut c_char) });
            self.connection_error_message = ptr::null();
        }
    }
}
