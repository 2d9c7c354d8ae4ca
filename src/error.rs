// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Error types.
//!
//! Sink-level errors are logged and retried; they never escape to end the
//! session. Only [`LedgerError::BufferExhausted`] is process-fatal.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    /// Disk or network momentarily unavailable. Retryable.
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// Remote store refused the credentials or the target is gone.
    /// Fatal to the current flush cycle, never to the process.
    #[error("Authorization error: {0}")]
    Authorization(String),

    /// An event (or a whole batch, when `sequence` is `None`) the remote
    /// store will never accept.
    #[error("Malformed data: {reason}")]
    MalformedData { sequence: Option<u64>, reason: String },

    /// The event buffer could not grow.
    #[error("Event buffer exhausted after {len} events")]
    BufferExhausted { len: usize },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    /// Stable label used in log fields and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::TransientIo(_) => "transient_io",
            LedgerError::Authorization(_) => "authorization",
            LedgerError::MalformedData { .. } => "malformed_data",
            LedgerError::BufferExhausted { .. } => "buffer_exhausted",
            LedgerError::Config(_) => "config",
            LedgerError::Io(_) => "io",
            LedgerError::Serialization(_) => "serialization",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::TransientIo(_) | LedgerError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(LedgerError::TransientIo("reset".into()).is_transient());
        assert!(LedgerError::Io(std::io::Error::other("disk")).is_transient());
        assert!(!LedgerError::Authorization("403".into()).is_transient());
        assert!(!LedgerError::MalformedData { sequence: Some(3), reason: "too long".into() }.is_transient());
        assert!(!LedgerError::BufferExhausted { len: 10 }.is_transient());
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(LedgerError::Authorization("x".into()).kind(), "authorization");
        assert_eq!(LedgerError::BufferExhausted { len: 0 }.kind(), "buffer_exhausted");
    }
}
