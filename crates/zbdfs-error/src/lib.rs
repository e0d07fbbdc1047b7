#![forbid(unsafe_code)]
//! Error types for zbdfs.
//!
//! Defines `ZbdError` and a `Result<T>` alias used throughout the workspace.
//! One variant per failure class; backend I/O errors are carried verbatim.

use thiserror::Error;

/// Unified error type for all zbdfs operations.
#[derive(Debug, Error)]
pub enum ZbdError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    /// Expected outcome of search routines (no migration target, no zone
    /// with the fewest resets). Callers match on it rather than log loudly.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("no space: {0}")]
    NoSpace(String),

    /// A programming invariant was violated (e.g. releasing a busy flag
    /// that was not held).
    #[error("corruption: {0}")]
    Corruption(String),
}

impl ZbdError {
    /// Whether this is the expected-miss `NotFound` outcome.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

// The deferred status latch replays the first background failure to every
// subsequent allocation, so the error must be clonable. `std::io::Error` is
// not `Clone`; rebuild it from the raw errno when present, otherwise from
// the kind and message.
impl Clone for ZbdError {
    fn clone(&self) -> Self {
        match self {
            Self::Io(err) => Self::Io(err.raw_os_error().map_or_else(
                || std::io::Error::new(err.kind(), err.to_string()),
                std::io::Error::from_raw_os_error,
            )),
            Self::InvalidArgument(msg) => Self::InvalidArgument(msg.clone()),
            Self::NotSupported(msg) => Self::NotSupported(msg.clone()),
            Self::NotFound(msg) => Self::NotFound(msg.clone()),
            Self::NoSpace(msg) => Self::NoSpace(msg.clone()),
            Self::Corruption(msg) => Self::Corruption(msg.clone()),
        }
    }
}

/// Result alias using `ZbdError`.
pub type Result<T> = std::result::Result<T, ZbdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_predicate() {
        assert!(ZbdError::NotFound("x".into()).is_not_found());
        assert!(!ZbdError::NoSpace("x".into()).is_not_found());
    }

    #[test]
    fn io_error_clone_keeps_errno() {
        let err = ZbdError::Io(std::io::Error::from_raw_os_error(28));
        let cloned = err.clone();
        match (err, cloned) {
            (ZbdError::Io(a), ZbdError::Io(b)) => {
                assert_eq!(a.raw_os_error(), b.raw_os_error());
            }
            other => panic!("expected Io variants, got {other:?}"),
        }
    }

    #[test]
    fn io_error_clone_keeps_kind_without_errno() {
        let err = ZbdError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "short read",
        ));
        match err.clone() {
            ZbdError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("expected Io, got {other:?}"),
        }
    }
}
