//! Converts an escaped task panic into the taxonomy's `INTERNAL` error
//! ("Panic in probe / handler — recover, log with stack, convert
//! to error result"). `tokio::spawn` already catches the unwind at the task's
//! outermost frame and reports it through `JoinError`; this is the one place
//! that translation into `RouterError` happens, so call sites never match on
//! `JoinError` directly.

use tokio::task::JoinError;
use vtrouter_errors::{internal, RouterError};

pub fn join_result_to_router_result<T>(result: Result<T, JoinError>) -> Result<T, RouterError> {
    result.map_err(|e| {
        if e.is_panic() {
            internal!("task panicked: {e}")
        } else {
            internal!("task cancelled: {e}")
        }
    })
}
