//! Cooperative failure kinds delivered to a suspended coroutine.

use std::fmt;

/// A failure that reaches a coroutine while it waits inside an adapter.
///
/// `Cancelled` and `Timeout` are produced by the runtime (coroutine
/// cancellation, coroutine-scoped timeout). Everything else travels as
/// `Other` with a message; adapters map it to `EINTR` and log a warning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// The awaiting coroutine was cancelled.
    Cancelled,

    /// A coroutine-scoped timeout fired while the coroutine was suspended.
    Timeout,

    /// Any other cooperative failure (event construction refused, engine
    /// error surfaced through a callback, ...).
    Other(String),
}

impl Failure {
    pub fn other(msg: impl Into<String>) -> Self {
        Failure::Other(msg.into())
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Failure::Cancelled)
    }

    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Failure::Timeout)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Cancelled => write!(f, "operation cancelled"),
            Failure::Timeout => write!(f, "operation timed out"),
            Failure::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Failure {}
