/// Provider-specific error with retry classification
///
/// Stores return this error type to tell the runtime whether the failed
/// operation may succeed if attempted again.
///
/// # Error Classification
///
/// **Retryable (is_retryable = true)**:
/// - Database busy/locked
/// - Connection timeouts
/// - Filesystem I/O failures
///
/// **Non-retryable (is_retryable = false)**:
/// - Corrupt rows or unreadable event records
/// - Event id conflicts (another writer appended first)
/// - Appends that would break history invariants
///
/// # Example Usage
///
/// ```rust
/// use durable_ingest::providers::ProviderError;
///
/// let busy = ProviderError::retryable("append", "database is locked");
/// assert!(busy.is_retryable());
///
/// let conflict = ProviderError::permanent("append", "event_id conflict");
/// assert!(!conflict.is_retryable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation}: {message}")]
pub struct ProviderError {
    /// Operation that failed (e.g., "append", "read")
    pub operation: String,
    /// Human-readable error message
    pub message: String,
    /// Whether this error should be retried
    pub retryable: bool,
}

impl ProviderError {
    /// Create a retryable (transient) error
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable (permanent) error
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Map an I/O error. Everything except malformed data is treated as transient.
    pub fn from_io(operation: &str, e: &std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::InvalidData => Self::permanent(operation, e.to_string()),
            _ => Self::retryable(operation, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_classification() {
        let retryable = ProviderError::retryable("read", "Database is busy");
        assert!(retryable.is_retryable());
        assert_eq!(retryable.operation, "read");

        let permanent = ProviderError::permanent("append", "event_id conflict");
        assert!(!permanent.is_retryable());

        let display = format!("{permanent}");
        assert!(display.contains("append"));
        assert!(display.contains("conflict"));

        let _err: Box<dyn std::error::Error> = Box::new(permanent);
    }

    #[test]
    fn test_provider_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(ProviderError::from_io("read", &io).is_retryable());

        let io = std::io::Error::new(std::io::ErrorKind::InvalidData, "garbage");
        assert!(!ProviderError::from_io("read", &io).is_retryable());
    }

    #[test]
    fn test_provider_error_equality() {
        let err1 = ProviderError::retryable("op", "msg");
        let err2 = ProviderError::retryable("op", "msg");
        let err3 = ProviderError::permanent("op", "msg");

        assert_eq!(err1, err2);
        assert_ne!(err1, err3);
    }
}
