use std::cell::RefCell;
use std::ffi::CString;
use std::panic::{self, AssertUnwindSafe};

use mb_graph::GraphError;
use mb_model::ModelError;

use crate::types::MbStatus;

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

/// Store an error message for later retrieval via `mb_last_error`.
pub fn set_last_error(msg: String) {
    // Interior NULs would truncate the message in C; drop them instead.
    let msg = msg.replace('\0', "");
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

/// Take the last error message, leaving `None` in its place.
pub fn take_last_error() -> Option<CString> {
    LAST_ERROR.with(|e| e.borrow_mut().take())
}

/// Status for `err`. Errors without a dedicated code map to `fallback`.
pub fn status_of(err: &ModelError, fallback: MbStatus) -> MbStatus {
    match err {
        ModelError::AlreadyInitialized(_) => MbStatus::ErrorAlreadyInitialized,
        ModelError::NotInitialized(_) => MbStatus::ErrorNotInitialized,
        ModelError::InvalidGraphParams(_) => MbStatus::ErrorInvalidArgument,
        ModelError::Graph(GraphError::BackendUnavailable(_)) => MbStatus::ErrorBackendUnavailable,
        _ => fallback,
    }
}

/// Record `err` as the last error and return its status.
pub(crate) fn fail(err: ModelError, fallback: MbStatus) -> MbStatus {
    let status = status_of(&err, fallback);
    tracing::debug!(?status, error = %err, "ffi call failed");
    set_last_error(err.to_string());
    status
}

/// Record `msg` as the last error and return `ErrorInvalidArgument`.
pub(crate) fn invalid_argument(msg: &str) -> MbStatus {
    set_last_error(msg.to_string());
    MbStatus::ErrorInvalidArgument
}

/// Execute a closure that returns an `MbStatus`, catching any panics
/// and converting them into `MbStatus::ErrorInternal`.
///
/// Handles are only written after a successful load, so a panic cannot leave
/// one half-initialized.
pub(crate) fn catch_panic<F: FnOnce() -> MbStatus>(f: F) -> MbStatus {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(status) => status,
        Err(_) => {
            set_last_error("internal panic".to_string());
            MbStatus::ErrorInternal
        }
    }
}
