//! Error taxonomy shared by every crate in the router workspace.
//!
//! [`RouterError`] is the one error type that crosses crate boundaries. Each
//! variant carries an [`ErrorKind`] so callers can classify failures
//! (retryable, fatal, caller-error) without string matching.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of a [`RouterError`], matching the failure-semantics
/// table: single unreachable tablet, stale shard map, malformed request,
/// expired deadline, or an unexpected internal fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// A single tablet RPC could not be completed; may succeed against
    /// another replica or on retry.
    TransientConn,
    /// The tablet reported that the shard map it was resolved against is
    /// obsolete (`FAILED_PRECONDITION` in the wire protocol).
    Resharding,
    /// The request itself is malformed: DML fanout, bad bind vars, schema
    /// mismatch. Never retried.
    InvalidArgument,
    /// The caller's deadline expired before the request completed.
    Deadline,
    /// A tablet is not currently reachable at all (no healthy candidate).
    Unavailable,
    /// Programmer error, protocol violation, or recovered panic.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::TransientConn => "TRANSIENT_CONN",
            ErrorKind::Resharding => "RESHARDING",
            ErrorKind::InvalidArgument => "INVALID_ARGUMENT",
            ErrorKind::Deadline => "DEADLINE",
            ErrorKind::Unavailable => "UNAVAILABLE",
            ErrorKind::Internal => "INTERNAL",
        };
        f.write_str(s)
    }
}

/// Outcome of a 1PC commit that failed partway through.
///
/// `committed` is the prefix of `(keyspace, shard, role)` tuples that were
/// durably committed before the first failure; `failed` is the one that
/// errored; `pending` is everything after it in commit order, which is never
/// attempted and must be treated as needing rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialCommit {
    pub committed: Vec<String>,
    pub failed: String,
    pub pending: Vec<String>,
}

/// The error type returned by every fallible operation in the router.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("{kind}: {message}")]
    Generic { kind: ErrorKind, message: String },

    #[error("partial commit: committed {committed:?}, failed on {failed}, pending {pending:?}",
        committed = partial.committed, failed = partial.failed, pending = partial.pending)]
    PartialCommit { partial: PartialCommit },

    #[error("scatter error on {keyspace}/{shard}/{role}: {source}")]
    ScatterShard {
        keyspace: String,
        shard: String,
        role: String,
        #[source]
        source: Box<RouterError>,
    },

    #[error("no healthy tablet serving {keyspace}/{shard}/{role}")]
    NoHealthyTablet {
        keyspace: String,
        shard: String,
        role: String,
    },

    #[error("keyspace id has no covering shard (keyspace {keyspace})")]
    UncoveredKeyspaceId { keyspace: String },
}

impl RouterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RouterError::Generic { kind, .. } => *kind,
            RouterError::PartialCommit { .. } => ErrorKind::Internal,
            RouterError::ScatterShard { source, .. } => source.kind(),
            RouterError::NoHealthyTablet { .. } => ErrorKind::Unavailable,
            RouterError::UncoveredKeyspaceId { .. } => ErrorKind::Internal,
        }
    }

    pub fn is_resharding(&self) -> bool {
        self.kind() == ErrorKind::Resharding
    }

    /// Wraps `self` with the `(keyspace, shard, role)` of the scatter call
    /// that produced it, per the "errors from scatter are wrapped once"
    /// propagation rule.
    pub fn wrap_shard(self, keyspace: impl Into<String>, shard: impl Into<String>, role: impl Into<String>) -> Self {
        RouterError::ScatterShard {
            keyspace: keyspace.into(),
            shard: shard.into(),
            role: role.into(),
            source: Box::new(self),
        }
    }
}

pub type RouterResult<T> = Result<T, RouterError>;

/// Converts any panic payload escaping a task's outermost frame into an
/// `INTERNAL` error, per the process-wide panic-to-error conversion policy.
pub fn panic_to_internal(payload: Box<dyn std::any::Any + Send>) -> RouterError {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    };
    internal!("recovered panic: {}", message)
}

#[macro_export]
macro_rules! internal {
    ($($args:tt)*) => {
        $crate::RouterError::Generic {
            kind: $crate::ErrorKind::Internal,
            message: format!($($args)*),
        }
    };
}

#[macro_export]
macro_rules! invalid_argument {
    ($($args:tt)*) => {
        $crate::RouterError::Generic {
            kind: $crate::ErrorKind::InvalidArgument,
            message: format!($($args)*),
        }
    };
}

#[macro_export]
macro_rules! resharding {
    ($($args:tt)*) => {
        $crate::RouterError::Generic {
            kind: $crate::ErrorKind::Resharding,
            message: format!($($args)*),
        }
    };
}

#[macro_export]
macro_rules! unavailable {
    ($($args:tt)*) => {
        $crate::RouterError::Generic {
            kind: $crate::ErrorKind::Unavailable,
            message: format!($($args)*),
        }
    };
}

#[macro_export]
macro_rules! transient_conn {
    ($($args:tt)*) => {
        $crate::RouterError::Generic {
            kind: $crate::ErrorKind::TransientConn,
            message: format!($($args)*),
        }
    };
}

#[macro_export]
macro_rules! deadline {
    ($($args:tt)*) => {
        $crate::RouterError::Generic {
            kind: $crate::ErrorKind::Deadline,
            message: format!($($args)*),
        }
    };
}
