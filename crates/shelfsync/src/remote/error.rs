//! Remote index error types.

use std::time::Duration;

use thiserror::Error;

/// Maximum length of a response body kept in an error message.
const MAX_ERROR_BODY_LENGTH: usize = 300;

/// Errors from the remote document index, classified by how the upload
/// engine reacts to them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The remote asked us to back off.
    #[error("Rate limited by remote index: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Network failure or a remote-side error worth trying again later.
    #[error("Transient remote error: {0}")]
    Transient(String),

    /// The remote rejected the request itself.
    #[error("Remote rejected request ({status}): {message}")]
    Permanent { status: u16, message: String },

    #[error("Remote resource not found: {0}")]
    NotFound(String),

    #[error("Failed to decode remote response: {0}")]
    Decode(String),

    /// The local file could not be read for upload.
    #[error("Failed to read '{path}' for upload: {message}")]
    LocalFile { path: String, message: String },
}

impl RemoteError {
    /// Classifies a non-success HTTP response.
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        let message = truncate_body(body);
        match status {
            429 => RemoteError::RateLimited {
                message,
                retry_after,
            },
            404 => RemoteError::NotFound(message),
            408 | 500..=599 => RemoteError::Transient(format!("HTTP {}: {}", status, message)),
            _ => RemoteError::Permanent { status, message },
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, RemoteError::RateLimited { .. })
    }

    /// Whether retrying the same file is pointless until it changes.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            RemoteError::Permanent { .. } | RemoteError::LocalFile { .. }
        )
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RemoteError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            RemoteError::from_status(status.as_u16(), &err.to_string(), None)
        } else {
            RemoteError::Transient(err.to_string())
        }
    }
}

fn truncate_body(body: &str) -> String {
    let body = body.trim();
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated)", &body[..end])
}

pub type Result<T> = std::result::Result<T, RemoteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(RemoteError::from_status(429, "slow down", None).is_rate_limit());
        assert!(matches!(
            RemoteError::from_status(404, "", None),
            RemoteError::NotFound(_)
        ));
        assert!(matches!(
            RemoteError::from_status(503, "unavailable", None),
            RemoteError::Transient(_)
        ));
        assert!(matches!(
            RemoteError::from_status(408, "timeout", None),
            RemoteError::Transient(_)
        ));
        assert!(RemoteError::from_status(400, "bad file", None).is_permanent());
        assert!(!RemoteError::from_status(500, "", None).is_permanent());
    }

    #[test]
    fn test_retry_after_is_kept() {
        let err = RemoteError::from_status(429, "", Some(Duration::from_secs(30)));
        assert_eq!(
            err,
            RemoteError::RateLimited {
                message: String::new(),
                retry_after: Some(Duration::from_secs(30)),
            }
        );
    }

    #[test]
    fn test_long_bodies_are_truncated() {
        let body = "é".repeat(400);
        let err = RemoteError::from_status(400, &body, None);
        let RemoteError::Permanent { message, .. } = err else {
            panic!("expected permanent error");
        };
        assert!(message.ends_with("... (truncated)"));
        assert!(message.len() < body.len());
    }
}
