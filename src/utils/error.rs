//! Crate-level error type for configuration and persistence I/O
//!
//! Provider failures use [`ProviderError`](crate::providers::ProviderError) and
//! turn failures use [`AgentError`](crate::agent::AgentError); everything that
//! touches the local filesystem reports through [`StockpilotError`].
//! The binary wraps these with `anyhow` for context.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Global error type for stockpilot file and persistence operations
#[derive(Error, Debug)]
pub enum StockpilotError {
    /// IO errors with path context
    #[error("IO error on {}: {source}", sanitize_path(path))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Session persistence failures
    #[error("Session persistence failed for {session_id}: {message}")]
    SessionPersistence { session_id: String, message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

/// Replaces the home directory with `~`, and hides everything but the file
/// name outside of it
fn sanitize_path(path: &Path) -> String {
    if let Some(home) = dirs::home_dir() {
        if let Ok(stripped) = path.strip_prefix(&home) {
            return format!("~/{}", stripped.display());
        }
    }
    if path.is_relative() {
        return path.display().to_string();
    }
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|s| format!("<sanitized>/{}", s))
        .unwrap_or_else(|| "<path>".to_string())
}

impl StockpilotError {
    /// Create an IO error with path context (path will be sanitized in display)
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn session_persistence(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SessionPersistence {
            session_id: session_id.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Hint shown next to the error on the command line
    pub fn suggestion(&self) -> Option<String> {
        match self {
            StockpilotError::Config { .. } => {
                Some("Check ~/.stockpilot/config.json or the STOCKPILOT_* environment variables.".to_string())
            }
            StockpilotError::Io { source, .. } if source.kind() == std::io::ErrorKind::PermissionDenied => {
                Some("The file must be readable and writable by the current user.".to_string())
            }
            _ => None,
        }
    }
}

/// Result type alias using StockpilotError
pub type Result<T> = std::result::Result<T, StockpilotError>;

impl From<std::io::Error> for StockpilotError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::from("<unknown>"),
            source: err,
        }
    }
}

impl From<serde_json::Error> for StockpilotError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_has_hint() {
        let err = StockpilotError::config("STOCKPILOT_PROVIDER: Unknown provider 'ollama'");
        assert!(err.to_string().contains("ollama"));
        assert!(err.suggestion().unwrap().contains("STOCKPILOT_"));
    }

    #[test]
    fn test_io_error_keeps_relative_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = StockpilotError::io("config/test.json", io_err);
        assert!(err.to_string().contains("config/test.json"));
        assert!(err.suggestion().is_none());
    }

    #[test]
    fn test_io_error_hides_foreign_absolute_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = StockpilotError::io("/srv/secret/area/config.json", io_err);
        let text = err.to_string();
        assert!(!text.contains("/srv/secret"));
        assert!(text.contains("config.json"));
    }

    #[test]
    fn test_permission_denied_has_hint() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = StockpilotError::io("config.json", io_err);
        assert!(err.suggestion().is_some());
    }

    #[test]
    fn test_session_persistence_error() {
        let err = StockpilotError::session_persistence("cli", "disk full");
        assert!(err.to_string().contains("cli"));
        assert!(err.to_string().contains("disk full"));
        assert!(err.suggestion().is_none());
    }

    #[test]
    fn test_from_serde_json() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: StockpilotError = parse_err.into();
        assert!(matches!(err, StockpilotError::Serialization { .. }));
    }
}
