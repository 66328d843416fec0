//! Error types shared across the retrieval engine and the orchestration layer.
//!
//! The taxonomy distinguishes:
//! - Validation errors (malformed store mutations, bad splitter config) - rejected
//!   synchronously, never retried
//! - Transient I/O errors (store or channel unavailable) - surfaced, not retried here
//! - Model availability errors (embedder / generative model not ready) - fatal to the
//!   current operation only
//! - Cancellation - a cooperative interrupt, not a failure
//! - Partial index - an interrupted indexing run, detected lazily and documented as a
//!   known limitation rather than repaired

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AmaError {
    /// Malformed input rejected before any state changed
    #[error("validation error: {0}")]
    Validation(String),

    /// A store or channel was unavailable; the operation may succeed if retried
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// The embedder or generative model is not ready
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// The operation was cancelled cooperatively
    #[error("generation cancelled")]
    Cancelled,

    /// A previous indexing run for this document was interrupted mid-way; the
    /// collection holds {indexed} entries and is reused as-is
    #[error("partial index for {url}: collection holds {indexed} entries from an interrupted run")]
    PartialIndex { url: String, indexed: usize },
}

impl AmaError {
    /// Stable code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            AmaError::Validation(_) => "VALIDATION",
            AmaError::TransientIo(_) => "TRANSIENT_IO",
            AmaError::ModelUnavailable(_) => "MODEL_UNAVAILABLE",
            AmaError::Cancelled => "CANCELLED",
            AmaError::PartialIndex { .. } => "PARTIAL_INDEX",
        }
    }

    /// Whether the same operation may succeed if the caller retries it
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AmaError::TransientIo(_) | AmaError::ModelUnavailable(_)
        )
    }

    /// Cancellation is an interrupt, not a failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, AmaError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, AmaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_distinct() {
        let codes = [
            AmaError::Validation("x".to_string()).error_code(),
            AmaError::TransientIo("x".to_string()).error_code(),
            AmaError::ModelUnavailable("x".to_string()).error_code(),
            AmaError::Cancelled.error_code(),
            AmaError::PartialIndex {
                url: "u".to_string(),
                indexed: 1,
            }
            .error_code(),
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in codes.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn retryable_classification() {
        assert!(AmaError::TransientIo("store down".to_string()).is_retryable());
        assert!(AmaError::ModelUnavailable("downloading".to_string()).is_retryable());
        assert!(!AmaError::Validation("bad".to_string()).is_retryable());
        assert!(!AmaError::Cancelled.is_retryable());
        assert!(AmaError::Cancelled.is_cancellation());
    }
}
