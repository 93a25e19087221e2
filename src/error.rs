use thiserror::Error;

/// Type alias for Result with TransferError
pub type Result<T> = std::result::Result<T, TransferError>;

/// Comprehensive error types for the Gmail-to-IMAP transfer system
#[derive(Error, Debug)]
pub enum TransferError {
    /// Gmail API returned an error
    #[error("Gmail API error: {0}")]
    ApiError(String),

    /// Authentication failed (Gmail OAuth2 or IMAP login)
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Rate limit exceeded - should retry after specified seconds
    #[error("Rate limit exceeded, retry after {retry_after} seconds")]
    RateLimitExceeded { retry_after: u64 },

    /// Rate limit error surfaced from a batch-level 429 rather than a single call
    #[error("Rate limit error: {0}")]
    RateLimitError(String),

    /// User cancelled operation
    #[error("Operation cancelled: {0}")]
    OperationCancelled(String),

    /// Network-related error (connection issues, timeouts, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Server returned 5xx error
    #[error("Server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    /// A Gmail message id referenced by a label listing no longer exists
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// Bad request (400)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Forbidden (403)
    #[error("Access forbidden: {0}")]
    Forbidden(String),

    /// Invalid message format or parsing error (raw RFC 5322 decode failure, bad date header)
    #[error("Invalid message format: {0}")]
    InvalidMessageFormat(String),

    /// IMAP protocol-level error (greeting, login, SELECT, APPEND, NAMESPACE, LIST)
    #[error("IMAP error: {0}")]
    ImapError(String),

    /// IMAP connection was dropped or degraded and must be recycled before the next attempt
    #[error("IMAP connection fault: {0}")]
    ImapConnectionFault(String),

    /// IO error (file operations, etc.)
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Progress store errors (corrupt or unreadable progress file)
    #[error("Progress store error: {0}")]
    ProgressStoreError(String),

    /// Folder mapping / mailbox creation errors
    #[error("Folder error: {0}")]
    FolderError(String),

    /// Generic catch-all error
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl TransferError {
    /// Check if the error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransferError::RateLimitExceeded { .. }
                | TransferError::RateLimitError(_)
                | TransferError::ServerError { .. }
                | TransferError::NetworkError(_)
                | TransferError::ImapConnectionFault(_)
        )
    }

    /// Check if the error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

impl From<google_gmail1::Error> for TransferError {
    fn from(error: google_gmail1::Error) -> Self {
        match error {
            // HTTP response with status code (non-success responses)
            google_gmail1::Error::Failure(ref response) => {
                let status = response.status();
                let status_code = status.as_u16();
                let message = format!(
                    "HTTP {}: {}",
                    status_code,
                    status.canonical_reason().unwrap_or("Unknown")
                );

                match status_code {
                    // Rate limiting - transient. The retry schedule itself is owned by
                    // the gmail_source retry policy (5s/10s/20s), not the Retry-After header.
                    429 => TransferError::RateLimitExceeded { retry_after: 5 },
                    // Not found
                    404 => TransferError::MessageNotFound("Resource not found".to_string()),
                    // Bad request
                    400 => TransferError::BadRequest(message),
                    // Forbidden
                    403 => TransferError::Forbidden(message),
                    // Server errors - transient
                    500..=599 => TransferError::ServerError {
                        status: status_code,
                        message,
                    },
                    // Other non-success status codes
                    _ => TransferError::ApiError(message),
                }
            }
            // BadRequest variant (request not understood by server)
            google_gmail1::Error::BadRequest(ref err) => {
                TransferError::BadRequest(format!("{}", err))
            }
            // Network/connection errors - transient
            google_gmail1::Error::HttpError(ref err) => {
                TransferError::NetworkError(format!("Connection error: {}", err))
            }
            // IO errors - transient
            google_gmail1::Error::Io(err) => TransferError::NetworkError(err.to_string()),
            // All other errors
            _ => TransferError::ApiError(error.to_string()),
        }
    }
}

impl From<async_imap::error::Error> for TransferError {
    fn from(error: async_imap::error::Error) -> Self {
        use async_imap::error::Error as ImapLibError;

        match error {
            ImapLibError::Io(io_err) => TransferError::ImapConnectionFault(io_err.to_string()),
            ImapLibError::ConnectionLost => {
                TransferError::ImapConnectionFault("connection lost".to_string())
            }
            other => TransferError::ImapError(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        let rate_limit = TransferError::RateLimitExceeded { retry_after: 5 };
        assert!(rate_limit.is_transient());
        assert!(!rate_limit.is_permanent());

        let server_error = TransferError::ServerError {
            status: 503,
            message: "Service unavailable".to_string(),
        };
        assert!(server_error.is_transient());

        let network_error = TransferError::NetworkError("Connection timeout".to_string());
        assert!(network_error.is_transient());

        let imap_fault = TransferError::ImapConnectionFault("socket reset".to_string());
        assert!(imap_fault.is_transient());
    }

    #[test]
    fn test_permanent_errors() {
        let bad_request = TransferError::BadRequest("Invalid query".to_string());
        assert!(bad_request.is_permanent());
        assert!(!bad_request.is_transient());

        let not_found = TransferError::MessageNotFound("msg123".to_string());
        assert!(not_found.is_permanent());

        let forbidden = TransferError::Forbidden("Access denied".to_string());
        assert!(forbidden.is_permanent());

        let imap_err = TransferError::ImapError("NO [CANNOT] invalid mailbox name".to_string());
        assert!(imap_err.is_permanent());
    }

    #[test]
    fn test_error_display() {
        let error = TransferError::RateLimitExceeded { retry_after: 10 };
        let display = format!("{}", error);
        assert!(display.contains("Rate limit exceeded"));
        assert!(display.contains("10 seconds"));

        let auth_error = TransferError::AuthError("Invalid token".to_string());
        let display = format!("{}", auth_error);
        assert!(display.contains("Authentication failed"));
    }

    #[test]
    fn test_message_not_found_is_a_permanent_per_message_error() {
        // A deleted Gmail message id is a permanent, per-message failure
        // that should not block the rest of the label's transfer.
        let err = TransferError::MessageNotFound("18c2f0a1b2c3d4e5".to_string());
        assert!(err.is_permanent());
    }
}
