//! Error taxonomy
//!
//! Validation errors are raised at the cursor API boundary before any
//! mutation begins, so a failed call is a no-op. Internal tree and position
//! invariants are debug assertions, not errors.

use thiserror::Error;

/// Errors surfaced by the store and cursor APIs
#[derive(Debug, Error)]
pub enum StoreError {
    /// Operation on a cursor after disposal
    #[error("cursor has been disposed")]
    Disposed,

    /// Null/malformed names, mismatched-document comparisons, bad targets
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Structurally nonsensical request at the current position
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Document changed under a reader running without the monitor
    #[error("document changed during read (version {expected} -> {actual})")]
    ConcurrentModification { expected: u64, actual: u64 },

    /// Malformed input while loading a document
    #[error("parse error at byte {offset}: {message}")]
    Parse { offset: usize, message: String },
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub(crate) fn arg(msg: impl Into<String>) -> StoreError {
        StoreError::InvalidArgument(msg.into())
    }

    pub(crate) fn state(msg: impl Into<String>) -> StoreError {
        StoreError::InvalidState(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e = StoreError::ConcurrentModification {
            expected: 3,
            actual: 5,
        };
        assert_eq!(
            e.to_string(),
            "document changed during read (version 3 -> 5)"
        );
    }
}
