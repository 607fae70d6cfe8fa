//! Status codes and errors surfaced to callers and listeners.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use thiserror::Error;

/// Coarse status code taxonomy this transport actually produces.
///
/// Higher layers are free to map these onto their own richer status
/// taxonomy; the transport core never needs more granularity than this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    /// No error.
    Ok,
    /// Peer is dead, peer shut us down, or the channel itself is unusable.
    /// Retriable at a higher layer.
    Unavailable,
    /// Unexpected internal error: a bug, or a call-id collision.
    Internal,
    /// Operation attempted before the transport reached `Ready`.
    FailedPrecondition,
    /// The peer's caller uid was unavailable when required.
    Unauthenticated,
    /// The operation was cancelled by its caller.
    Cancelled,
    /// Security-policy denial.
    PermissionDenied,
}

/// A status: a [`Code`] plus a human-readable message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{code:?}: {message}")]
pub struct Status {
    /// The coarse status code.
    pub code: Code,
    /// Free-form diagnostic text. Never parsed by the transport itself.
    pub message: String,
}

impl Status {
    /// Build a new status.
    #[inline]
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The canonical `Ok` status.
    #[inline]
    pub fn ok() -> Self {
        Self::new(Code::Ok, "")
    }

    /// Shorthand for `Code::Unavailable`.
    #[inline]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    /// Shorthand for `Code::Internal`.
    #[inline]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    /// Shorthand for `Code::FailedPrecondition`.
    #[inline]
    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(Code::FailedPrecondition, message)
    }

    /// Shorthand for `Code::Unauthenticated`.
    #[inline]
    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(Code::Unauthenticated, message)
    }

    /// Whether this status represents success.
    #[inline]
    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

/// Crate-level error type for operations that can fail for reasons beyond a
/// plain [`Status`] (malformed wire data, a dead channel).
#[derive(Debug, Error)]
pub enum Error {
    /// The peer channel rejected the transaction, or is known dead.
    #[error("channel transaction failed: {0}")]
    ChannelDead(String),
    /// A control or stream payload could not be decoded.
    #[error("malformed wire payload: {0}")]
    MalformedPayload(String),
    /// A status-shaped failure (see [`Status`]).
    #[error(transparent)]
    Status(#[from] Status),
}

impl Error {
    /// Map this error onto the [`Status`] that should be surfaced to a
    /// listener or a failed-send return value.
    pub fn to_status(&self) -> Status {
        match self {
            Self::ChannelDead(msg) => Status::unavailable(msg.clone()),
            Self::MalformedPayload(msg) => Status::unavailable(msg.clone()),
            Self::Status(status) => status.clone(),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = Status> = std::result::Result<T, E>;
