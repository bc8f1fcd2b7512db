//! Error types for LLM provider operations
//!
//! Errors are categorized so callers can pick a handling strategy without
//! inspecting message text: configuration problems fail fast, transport
//! problems are fatal for the step that raised them, and the local call budget
//! has its own retryable variant distinct from an upstream 429.

use reqwest::StatusCode;
use thiserror::Error;

/// Errors that can occur when interacting with LLM providers
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// Network-related errors (connection issues, DNS failures, broken streams)
    #[error("Network error: {message}")]
    Network {
        /// Error message
        message: String,
    },

    /// Authentication errors (invalid API key, unauthorized access)
    #[error("Authentication error: {message}")]
    Auth {
        /// Error message
        message: String,
    },

    /// Upstream rate limit (the vendor answered 429)
    #[error("Rate limit exceeded: {message}")]
    RateLimit {
        /// Error message
        message: String,
        /// Optional retry-after duration in seconds
        retry_after: Option<u64>,
    },

    /// Local per-minute call budget exhausted for a non-essential call
    #[error("Local call budget exhausted ({used}/{budget} calls in the last minute)")]
    RateLimitExceeded {
        /// Calls recorded in the current window
        used: usize,
        /// Calls allowed per window
        budget: usize,
        /// Seconds until the oldest call leaves the window
        retry_after: u64,
    },

    /// Invalid request errors (bad parameters, malformed input)
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Error message
        message: String,
    },

    /// Timeout errors (request took too long)
    #[error("Request timeout after {seconds} seconds")]
    Timeout {
        /// Timeout duration in seconds
        seconds: u64,
    },

    /// Provider-specific errors (errors reported by the LLM service)
    #[error("Provider error: {message}")]
    Provider {
        /// Error message from provider
        message: String,
        /// Optional error code from provider
        code: Option<String>,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message
        message: String,
    },

    /// Configuration errors (missing credential, invalid settings)
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
    },

    /// The caller cancelled the request
    #[error("Request cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Returns true if this error is potentially retryable
    ///
    /// Configuration and authentication problems are never retryable; the
    /// local budget error is, once the window has moved on.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Network { .. }
                | ProviderError::RateLimit { .. }
                | ProviderError::RateLimitExceeded { .. }
                | ProviderError::Timeout { .. }
        )
    }

    /// Returns true if this error indicates an authentication problem
    pub fn is_auth_error(&self) -> bool {
        matches!(self, ProviderError::Auth { .. })
    }

    /// Returns true for both the upstream and the local rate limit
    pub fn is_rate_limit(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimit { .. } | ProviderError::RateLimitExceeded { .. }
        )
    }

    /// Returns true for transport-level failures (network, timeout, non-2xx)
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ProviderError::Network { .. }
                | ProviderError::Timeout { .. }
                | ProviderError::Auth { .. }
                | ProviderError::RateLimit { .. }
                | ProviderError::InvalidRequest { .. }
                | ProviderError::Provider { .. }
                | ProviderError::Serialization { .. }
        )
    }

    /// Returns true if this error is a configuration problem
    pub fn is_config(&self) -> bool {
        matches!(self, ProviderError::Config { .. })
    }

    /// Returns true if the request was cancelled by the caller
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProviderError::Cancelled)
    }

    /// Returns the suggested retry delay in seconds, if any
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            ProviderError::RateLimit { retry_after, .. } => *retry_after,
            ProviderError::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            ProviderError::Network { .. } => Some(1),
            ProviderError::Timeout { .. } => Some(2),
            _ => None,
        }
    }

    /// Creates a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Creates an authentication error
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Creates an upstream rate limit error
    pub fn rate_limit(message: impl Into<String>, retry_after: Option<u64>) -> Self {
        Self::RateLimit {
            message: message.into(),
            retry_after,
        }
    }

    /// Creates a local budget error
    pub fn rate_limit_exceeded(used: usize, budget: usize, retry_after: u64) -> Self {
        Self::RateLimitExceeded {
            used,
            budget,
            retry_after,
        }
    }

    /// Creates an invalid request error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Creates a timeout error
    pub fn timeout(seconds: u64) -> Self {
        Self::Timeout { seconds }
    }

    /// Creates a provider error
    pub fn provider(message: impl Into<String>, code: Option<impl Into<String>>) -> Self {
        Self::Provider {
            message: message.into(),
            code: code.map(|c| c.into()),
        }
    }

    /// Creates a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Maps a non-2xx HTTP status and body to a typed error
    pub fn from_status(
        provider: &str,
        status: StatusCode,
        body: &str,
        retry_after: Option<u64>,
    ) -> Self {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Self::auth(format!("{} authentication failed ({}): {}", provider, status, body))
            }
            StatusCode::TOO_MANY_REQUESTS => Self::rate_limit(
                format!("{} rate limited the request: {}", provider, body),
                retry_after,
            ),
            status if status.is_client_error() => Self::invalid_request(format!(
                "{} rejected the request ({}): {}",
                provider, status, body
            )),
            status => Self::provider(
                format!("{} returned {}: {}", provider, status, body),
                Some(status.as_u16().to_string()),
            ),
        }
    }

    /// Maps a transport failure from the HTTP client
    pub fn from_transport(err: &reqwest::Error, timeout_seconds: u64) -> Self {
        if err.is_timeout() {
            Self::timeout(timeout_seconds)
        } else if err.is_connect() {
            Self::network(format!("Connection failed: {}", err))
        } else {
            Self::network(format!("Request failed: {}", err))
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

/// Result type for provider operations
pub type Result<T> = std::result::Result<T, ProviderError>;
