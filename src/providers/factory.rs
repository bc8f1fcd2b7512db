//! Provider factory for creating LLM provider instances
//!
//! This module provides a factory pattern for creating provider instances based on configuration.
//! Vendor configuration is pure data; building a provider never touches the network.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::providers::{
    AnthropicProvider, GeminiProvider, LlmProvider, OpenAiProvider, ProviderError,
};

/// Default HTTP timeout for vendor requests
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 60;

/// Supported vendors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
}

impl ProviderKind {
    /// All vendors, in fallback order
    pub const ALL: [ProviderKind; 3] = [ProviderKind::OpenAi, ProviderKind::Anthropic, ProviderKind::Gemini];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "gemini",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" | "claude" => Ok(ProviderKind::Anthropic),
            "gemini" | "google" => Ok(ProviderKind::Gemini),
            other => Err(ProviderError::config(format!(
                "Unknown provider '{}'. Valid providers: openai, anthropic, gemini",
                other
            ))),
        }
    }
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

/// Per-vendor settings; unset fields fall back to the adapter's defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VendorConfig {
    /// Explicit API key, wins over the vendor environment variable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    /// HTTP timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

impl Default for VendorConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            default_model: None,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
        }
    }
}

impl VendorConfig {
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<(), ProviderError> {
        if let Some(url) = &self.base_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ProviderError::config(format!(
                    "Base URL must start with http:// or https://, got '{}'",
                    url
                )));
            }
        }

        if self.default_model.as_deref().is_some_and(|m| m.trim().is_empty()) {
            return Err(ProviderError::config("Default model cannot be empty"));
        }

        if self.timeout_seconds == 0 {
            return Err(ProviderError::config("Timeout must be at least one second"));
        }

        Ok(())
    }
}

/// A vendor plus its settings
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub vendor: VendorConfig,
}

impl ProviderConfig {
    pub fn new(kind: ProviderKind, vendor: VendorConfig) -> Self {
        Self { kind, vendor }
    }

    pub fn openai() -> Self {
        Self::new(ProviderKind::OpenAi, VendorConfig::default())
    }

    pub fn anthropic() -> Self {
        Self::new(ProviderKind::Anthropic, VendorConfig::default())
    }

    pub fn gemini() -> Self {
        Self::new(ProviderKind::Gemini, VendorConfig::default())
    }
}

/// Factory for creating LLM providers
pub struct ProviderFactory;

impl ProviderFactory {
    /// Creates a provider from configuration
    ///
    /// Only validates settings; credentials are checked when the provider is used.
    pub fn create(config: &ProviderConfig) -> Result<Arc<dyn LlmProvider>, ProviderError> {
        config.vendor.validate()?;

        let provider: Arc<dyn LlmProvider> = match config.kind {
            ProviderKind::OpenAi => Arc::new(OpenAiProvider::new(&config.vendor)),
            ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(&config.vendor)),
            ProviderKind::Gemini => Arc::new(GeminiProvider::new(&config.vendor)),
        };

        debug!(provider = %config.kind, model = %provider.default_model(), "Created provider");
        Ok(provider)
    }

    /// Returns the first candidate whose credentials resolve
    pub fn first_available(candidates: &[ProviderConfig]) -> Option<Arc<dyn LlmProvider>> {
        candidates
            .iter()
            .filter_map(|config| Self::create(config).ok())
            .find(|provider| provider.is_available())
    }

    /// Returns the names of all supported providers
    pub fn available_providers() -> Vec<&'static str> {
        ProviderKind::ALL.iter().map(|k| k.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing() {
        assert_eq!("openai".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAi);
        assert_eq!(" Anthropic ".parse::<ProviderKind>().unwrap(), ProviderKind::Anthropic);
        assert_eq!("google".parse::<ProviderKind>().unwrap(), ProviderKind::Gemini);

        let err = "ollama".parse::<ProviderKind>().unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("ollama"));
    }

    #[test]
    fn test_kind_serialization() {
        assert_eq!(serde_json::to_string(&ProviderKind::OpenAi).unwrap(), "\"openai\"");
        let kind: ProviderKind = serde_json::from_str("\"gemini\"").unwrap();
        assert_eq!(kind, ProviderKind::Gemini);
    }

    #[test]
    fn test_vendor_config_defaults_from_json() {
        let config: VendorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, VendorConfig::default());
        assert_eq!(config.timeout_seconds, DEFAULT_TIMEOUT_SECONDS);
    }

    #[test]
    fn test_vendor_config_validation() {
        assert!(VendorConfig::default().validate().is_ok());
        assert!(VendorConfig::default().with_base_url("ftp://x").validate().is_err());
        assert!(VendorConfig::default().with_model("  ").validate().is_err());
        assert!(VendorConfig::default().with_timeout(0).validate().is_err());
    }

    #[test]
    fn test_factory_creates_each_kind() {
        for kind in ProviderKind::ALL {
            let provider = ProviderFactory::create(&ProviderConfig::new(kind, VendorConfig::default())).unwrap();
            assert_eq!(provider.name(), kind.as_str());
        }
    }

    #[test]
    fn test_factory_rejects_invalid_config() {
        let config = ProviderConfig::new(ProviderKind::OpenAi, VendorConfig::default().with_timeout(0));
        assert!(ProviderFactory::create(&config).is_err());
    }

    #[test]
    fn test_first_available_prefers_order() {
        let candidates = vec![
            ProviderConfig::new(
                ProviderKind::Gemini,
                VendorConfig::default().with_api_key("g-key"),
            ),
            ProviderConfig::new(
                ProviderKind::OpenAi,
                VendorConfig::default().with_api_key("o-key"),
            ),
        ];

        let provider = ProviderFactory::first_available(&candidates).unwrap();
        assert_eq!(provider.name(), "gemini");
    }

    #[test]
    fn test_available_providers() {
        assert_eq!(ProviderFactory::available_providers(), vec!["openai", "anthropic", "gemini"]);
    }
}
