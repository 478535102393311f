use thiserror::Error;
use time::OffsetDateTime;

/// Errors crossing the provider client boundary.
///
/// Four kinds matter to callers: authentication and not-found are terminal,
/// rate-limited carries the reset time so the caller may delay, and network
/// covers everything transient (including 5xx responses after retries).
#[derive(Debug, Error)]
pub enum GitClientError {
    #[error("authentication rejected by provider")]
    Authentication,

    #[error("repository or resource not found: {0}")]
    NotFound(String),

    #[error("rate limit exceeded, resets at {reset}")]
    RateLimited { reset: OffsetDateTime },

    #[error("network failure: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("invalid repository URL: {0}")]
    InvalidUrl(String),

    #[error("operation requires an API client: {0}")]
    ApiRequired(&'static str),

    #[error("operation cancelled")]
    Cancelled,
}

impl GitClientError {
    pub fn network(message: impl Into<String>) -> Self {
        GitClientError::Network {
            message: message.into(),
            source: None,
        }
    }

    pub fn network_caused_by(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        GitClientError::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether a retry (or the shell fallback) may succeed where this failed.
    ///
    /// Authentication and not-found must never be retried or masked by the
    /// fallback; a rate-limit error is handled by delaying, not retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GitClientError::Network { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_is_retryable() {
        assert!(GitClientError::network("connection reset").is_retryable());
    }

    #[test]
    fn test_terminal_errors_are_not_retryable() {
        assert!(!GitClientError::Authentication.is_retryable());
        assert!(!GitClientError::NotFound("org/repo".into()).is_retryable());
        assert!(
            !GitClientError::RateLimited {
                reset: OffsetDateTime::now_utc()
            }
            .is_retryable()
        );
        assert!(!GitClientError::Cancelled.is_retryable());
        assert!(!GitClientError::ApiRequired("file listing").is_retryable());
    }

    #[test]
    fn test_source_is_preserved() {
        let inner = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let err = GitClientError::network_caused_by("request failed", inner);
        assert!(std::error::Error::source(&err).is_some());
    }
}
