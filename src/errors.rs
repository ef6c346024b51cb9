//! Error taxonomy for the capture client
//!
//! Every fallible call in the crate returns `Result<T, CameraError>`. The
//! variants mirror the status codes the capture pipeline distinguishes:
//! precondition violations are `InvalidOperation`/`AlreadyActive`, device
//! failures are `Device`/`Busy`/`DeadObject`, bounded waits surface as
//! `TimedOut`, and the ZSL queue reports `NotEnoughData` when it holds no
//! usable frame.

use std::sync::PoisonError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Capture already in progress")]
    AlreadyActive,

    #[error("Timed out")]
    TimedOut,

    #[error("Not enough data")]
    NotEnoughData,

    #[error("Bad value: {0}")]
    BadValue(String),

    #[error("Device or resource busy")]
    Busy,

    #[error("Not initialized")]
    NoInit,

    #[error("Device is gone")]
    DeadObject,

    #[error("Device error: {0}")]
    Device(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CameraError {
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        CameraError::InvalidOperation(message.into())
    }

    pub fn bad_value(message: impl Into<String>) -> Self {
        CameraError::BadValue(message.into())
    }

    pub fn device(message: impl Into<String>) -> Self {
        CameraError::Device(message.into())
    }

    /// True for `TimedOut`, which callers in polling loops treat as "try again".
    pub fn is_timeout(&self) -> bool {
        matches!(self, CameraError::TimedOut)
    }
}

impl PartialEq for CameraError {
    fn eq(&self, other: &Self) -> bool {
        use CameraError::*;
        match (self, other) {
            (InvalidOperation(a), InvalidOperation(b)) => a == b,
            (BadValue(a), BadValue(b)) => a == b,
            (Device(a), Device(b)) => a == b,
            (Config(a), Config(b)) => a == b,
            (Io(a), Io(b)) => a.kind() == b.kind(),
            (AlreadyActive, AlreadyActive)
            | (TimedOut, TimedOut)
            | (NotEnoughData, NotEnoughData)
            | (Busy, Busy)
            | (NoInit, NoInit)
            | (DeadObject, DeadObject) => true,
            _ => false,
        }
    }
}

/// Recover the guard from a poisoned mutex.
///
/// A panic on one worker must not wedge every other thread sharing the lock,
/// so poisoned guards are taken over as-is.
pub(crate) fn recover<G>(err: PoisonError<G>) -> G {
    err.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            CameraError::invalid_operation("no preview").to_string(),
            "Invalid operation: no preview"
        );
        assert_eq!(CameraError::AlreadyActive.to_string(), "Capture already in progress");
        assert_eq!(CameraError::NotEnoughData.to_string(), "Not enough data");
    }

    #[test]
    fn test_error_equality() {
        assert_eq!(CameraError::TimedOut, CameraError::TimedOut);
        assert_ne!(CameraError::TimedOut, CameraError::Busy);
        assert_ne!(
            CameraError::device("a"),
            CameraError::device("b")
        );
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: CameraError = io.into();
        assert!(matches!(err, CameraError::Io(_)));
        assert!(!err.is_timeout());
        assert!(CameraError::TimedOut.is_timeout());
    }
}
