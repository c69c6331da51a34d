use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("Request rejected {status}: {body}")]
    Client { status: u16, body: String },

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Storage unavailable: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid action: {0}")]
    InvalidAction(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// How a failed attempt should be treated by the retry bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Worth another attempt on a later pass (no response, 5xx, 429).
    Retryable,
    /// Repeating the request cannot change the outcome (4xx).
    Terminal,
}

impl SyncError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status {
            429 => SyncError::RateLimited,
            400..=499 => SyncError::Client {
                status,
                body: truncated,
            },
            _ => SyncError::Server {
                status,
                body: truncated,
            },
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            SyncError::Client { .. } | SyncError::InvalidAction(_) => FailureKind::Terminal,
            // Storage/serialization never come back from the wire; if one
            // leaks into the drain it is treated like a transient failure.
            SyncError::Network(_)
            | SyncError::Server { .. }
            | SyncError::RateLimited
            | SyncError::Storage(_)
            | SyncError::Serialization(_) => FailureKind::Retryable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == FailureKind::Retryable
    }

    /// HTTP status carried by the error, if the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            SyncError::Server { status, .. } | SyncError::Client { status, .. } => Some(*status),
            SyncError::RateLimited => Some(429),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Network(e.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_classification() {
        assert!(matches!(SyncError::from_status(422, "bad"), SyncError::Client { status: 422, .. }));
        assert!(matches!(SyncError::from_status(400, ""), SyncError::Client { status: 400, .. }));
        assert!(matches!(SyncError::from_status(503, ""), SyncError::Server { status: 503, .. }));
        assert_eq!(SyncError::from_status(429, ""), SyncError::RateLimited);
    }

    #[test]
    fn test_kind() {
        assert_eq!(SyncError::Network("down".into()).kind(), FailureKind::Retryable);
        assert_eq!(SyncError::from_status(500, "").kind(), FailureKind::Retryable);
        assert_eq!(SyncError::RateLimited.kind(), FailureKind::Retryable);
        assert_eq!(SyncError::from_status(404, "").kind(), FailureKind::Terminal);
        assert!(!SyncError::from_status(422, "").is_retryable());
        assert_eq!(SyncError::InvalidAction("no id".into()).kind(), FailureKind::Terminal);
    }

    #[test]
    fn test_truncate_body() {
        let long = "x".repeat(1200);
        match SyncError::from_status(500, &long) {
            SyncError::Server { body, .. } => {
                assert!(body.starts_with(&"x".repeat(500)));
                assert!(body.contains("1200 total bytes"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        let long = "é".repeat(400);
        let err = SyncError::from_status(400, &long);
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_status() {
        assert_eq!(SyncError::from_status(503, "").status(), Some(503));
        assert_eq!(SyncError::Network("x".into()).status(), None);
    }
}
