// Error handling module
// Defines the client error taxonomy and retry classification

use thiserror::Error;

/// Errors that can occur while talking to Anaplan
#[derive(Error, Debug)]
pub enum ClientError {
    /// Credential rejected by the exchange or validation step
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Action id with an unknown classification prefix
    #[error("Unrecognized action id: {0}")]
    Classification(String),

    /// The server did not acknowledge the upload begin call
    #[error("Upload rejected for file {file_id}: {status} - {message}")]
    UploadRejected {
        file_id: String,
        status: u16,
        message: String,
    },

    /// A chunk failed mid-transfer; no completion call was issued
    #[error("Upload incomplete for file {file_id}: chunk {chunk_index} failed after {chunks_sent} chunks ({reason})")]
    UploadIncomplete {
        file_id: String,
        chunk_index: u64,
        chunks_sent: u64,
        reason: String,
    },

    /// A single poll request failed; says nothing about the job itself
    #[error("Polling failed for action {action_id}: {reason}")]
    Polling { action_id: String, reason: String },

    /// The action has never been run
    #[error("No tasks found for action {0}")]
    NoTasks(String),

    /// Caller-side wait loop gave up
    #[error("Timed out after {waited_secs}s waiting for action {action_id}")]
    PollTimeout { action_id: String, waited_secs: u64 },

    /// Non-success response from the Anaplan API
    #[error("Anaplan API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Network-level failure (connect, timeout, body)
    #[error("Transport error ({kind}): {message}")]
    Transport { kind: &'static str, message: String },

    /// Request validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Credential store read/write failure
    #[error("Credential store error: {0}")]
    Store(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ClientError {
    /// Whether a caller may retry the same call without new input.
    /// Authentication and input errors are never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport { .. } | ClientError::Polling { .. } => true,
            ClientError::Api { status, .. } => *status == 429 || (500..=599).contains(status),
            _ => false,
        }
    }

    /// Classify a reqwest failure into a transport error
    pub fn from_reqwest(e: &reqwest::Error) -> Self {
        ClientError::Transport {
            kind: transport_kind(e),
            message: e.to_string(),
        }
    }
}

/// Categorize a reqwest error for logging
pub fn transport_kind(e: &reqwest::Error) -> &'static str {
    if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connection_failed"
    } else if e.is_request() {
        "request_error"
    } else if e.is_body() {
        "body_error"
    } else if e.is_decode() {
        "decode_error"
    } else {
        "unknown"
    }
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ClientError::Authentication("FAILURE_BAD_CREDENTIAL".to_string());
        assert_eq!(err.to_string(), "Authentication failed: FAILURE_BAD_CREDENTIAL");

        let err = ClientError::Classification("999".to_string());
        assert_eq!(err.to_string(), "Unrecognized action id: 999");

        let err = ClientError::Api {
            status: 429,
            message: "Rate limit exceeded".to_string(),
        };
        assert_eq!(err.to_string(), "Anaplan API error: 429 - Rate limit exceeded");
    }

    #[test]
    fn test_upload_error_messages() {
        let err = ClientError::UploadRejected {
            file_id: "113000000001".to_string(),
            status: 404,
            message: "Not found".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Upload rejected for file 113000000001: 404 - Not found"
        );

        let err = ClientError::UploadIncomplete {
            file_id: "113000000001".to_string(),
            chunk_index: 2,
            chunks_sent: 2,
            reason: "connection reset".to_string(),
        };
        assert!(err.to_string().contains("chunk 2 failed after 2 chunks"));
    }

    #[test]
    fn test_internal_error_message() {
        let err = ClientError::Internal(anyhow::anyhow!("Something went wrong"));
        assert_eq!(err.to_string(), "Internal error: Something went wrong");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ClientError::Transport {
            kind: "timeout",
            message: "timed out".to_string()
        }
        .is_retryable());
        assert!(ClientError::Polling {
            action_id: "118000000000".to_string(),
            reason: "reset".to_string()
        }
        .is_retryable());
        assert!(ClientError::Api {
            status: 503,
            message: String::new()
        }
        .is_retryable());
        assert!(ClientError::Api {
            status: 429,
            message: String::new()
        }
        .is_retryable());
    }

    #[test]
    fn test_business_rejections_not_retryable() {
        assert!(!ClientError::Authentication("bad".to_string()).is_retryable());
        assert!(!ClientError::Classification("999".to_string()).is_retryable());
        assert!(!ClientError::Api {
            status: 400,
            message: String::new()
        }
        .is_retryable());
        assert!(!ClientError::UploadRejected {
            file_id: "1".to_string(),
            status: 400,
            message: String::new()
        }
        .is_retryable());
    }
}
