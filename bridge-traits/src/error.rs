use thiserror::Error;

/// Errors reported by adapter and host bridge implementations.
///
/// The variant is the retry tag: the reconciliation driver never inspects the
/// message, only whether the failure is retryable.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bridge capability not available: {0}")]
    NotAvailable(String),

    #[error("Transient adapter failure: {0}")]
    Transient(String),

    #[error("Rate limited by remote (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Adapter call timed out after {0} ms")]
    Timeout(u64),

    #[error("Permanent adapter failure: {0}")]
    Permanent(String),

    #[error("Record not found on target: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::Transient(_) | BridgeError::RateLimited { .. } | BridgeError::Timeout(_)
        )
    }

    /// Minimum delay the remote asked for before the next attempt.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            BridgeError::RateLimited { retry_after_ms } => *retry_after_ms,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
