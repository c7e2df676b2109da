use crate::ErrorDetails;

/// Failure reported by a history or instance store, classified for retry.
///
/// Retryable errors (busy files, interrupted I/O, injected faults) are retried
/// with backoff by the dispatchers and never reach orchestration code.
/// Permanent errors (corrupt records, unknown instances, conflicting terminal
/// states) fail fast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Store operation that failed, e.g. `append` or `dequeue_peek_lock`.
    pub operation: String,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

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

    /// Classify an I/O failure: missing or malformed data is permanent,
    /// everything else may succeed on a later attempt.
    pub fn from_io(operation: impl Into<String>, err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound | ErrorKind::InvalidData | ErrorKind::InvalidInput | ErrorKind::PermissionDenied => {
                Self::permanent(operation, err.to_string())
            }
            _ => Self::retryable(operation, err.to_string()),
        }
    }

    pub fn from_json(operation: impl Into<String>, err: serde_json::Error) -> Self {
        Self::permanent(operation, err.to_string())
    }

    pub fn to_error_details(&self) -> ErrorDetails {
        ErrorDetails::Infrastructure {
            operation: self.operation.clone(),
            message: self.message.clone(),
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.retryable { "retryable" } else { "permanent" };
        write!(f, "{} failed ({kind}): {}", self.operation, self.message)
    }
}

impl std::error::Error for ProviderError {}
