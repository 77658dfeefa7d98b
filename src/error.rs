//! Error taxonomy for the runtime.
//!
//! Two classes of error flow through the crate:
//!
//! - **Programming errors** (`UnknownIdentifier`, `ProtocolViolation`):
//!   a dangling handle or a misuse of the dependency API. These are
//!   returned as `Err` so callers and tests can observe them, and the
//!   carrier loops escalate them to a process abort.
//! - **Recoverable conditions** (`AccessDenied`, `AlreadyRequested`,
//!   `CapacityExceeded`, `OutOfMemory`): returned to the caller and never
//!   silently swallowed.
//!
//! Expected lock-free interleavings (a registration losing the race
//! against a satisfy, a latch crossing zero) are handled internally and
//! never surface here.

use thiserror::Error;

use crate::registry::Guid;

/// Errors produced by runtime operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeError {
    /// A handle did not resolve to a live object.
    #[error("unknown identifier {0}")]
    UnknownIdentifier(Guid),

    /// The dependency API was misused; this is always fatal.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// Release without a matching acquire, or acquire after a free request.
    #[error("datablock access denied")]
    AccessDenied,

    /// A free was already requested for this datablock.
    #[error("free already requested")]
    AlreadyRequested,

    /// The datablock user tracker is full.
    #[error("datablock user capacity exceeded")]
    CapacityExceeded,

    /// The allocator could not satisfy a datablock allocation.
    #[error("out of memory")]
    OutOfMemory,
}

impl RuntimeError {
    /// Whether this error signals a broken invariant rather than a
    /// condition the caller can recover from.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RuntimeError::UnknownIdentifier(_) | RuntimeError::ProtocolViolation(_)
        )
    }
}

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RuntimeError>;
