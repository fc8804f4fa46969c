//! Client Module
//!
//! The Connection Core and the callback dispatch protocol.
//!
//! - `session`: [`Client`], one per handle: runtime, connection, lifecycle
//! - `dispatch`: callback types and the completion delivery task
//!
//! ## Per-command state machine
//!
//! ```text
//! Issued ──> Pending ──> Executing ──┬──> Completed-Success  (on_success fired once)
//!                                    └──> Completed-Failure  (on_failure fired once)
//! ```
//!
//! There is no cancelled state: a command that does not complete within the
//! request timeout ends as a failure of kind `Timeout`.

pub mod dispatch;
pub mod session;

pub use dispatch::{Callbacks, Completion, FailureCallback, SuccessCallback};
pub use session::{Client, ClientError, ClientStats};
