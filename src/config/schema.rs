use serde::{Deserialize, Serialize};

use crate::agent::AgentConfig;
use crate::providers::{ProviderConfig, ProviderKind, VendorConfig};
use crate::ratelimit::RateLimitConfig;
use crate::utils::StockpilotError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Preferred vendor; without one, the first vendor with a credential wins
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderKind>,

    pub openai: VendorConfig,

    pub anthropic: VendorConfig,

    pub gemini: VendorConfig,

    pub rate_limit: RateLimitConfig,

    pub agent: AgentConfig,
}

/// What the configuration contains, without any secret
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigSummary {
    pub provider: Option<ProviderKind>,
    pub openai_key_configured: bool,
    pub anthropic_key_configured: bool,
    pub gemini_key_configured: bool,
    pub model: Option<String>,
    pub calls_per_minute: usize,
}

impl Config {
    pub fn vendor(&self, kind: ProviderKind) -> &VendorConfig {
        match kind {
            ProviderKind::OpenAi => &self.openai,
            ProviderKind::Anthropic => &self.anthropic,
            ProviderKind::Gemini => &self.gemini,
        }
    }

    pub fn vendor_mut(&mut self, kind: ProviderKind) -> &mut VendorConfig {
        match kind {
            ProviderKind::OpenAi => &mut self.openai,
            ProviderKind::Anthropic => &mut self.anthropic,
            ProviderKind::Gemini => &mut self.gemini,
        }
    }

    pub fn provider_config(&self, kind: ProviderKind) -> ProviderConfig {
        ProviderConfig::new(kind, self.vendor(kind).clone())
    }

    /// Vendors to try in order: the selected one alone, or all of them
    pub fn provider_candidates(&self) -> Vec<ProviderConfig> {
        match self.provider {
            Some(kind) => vec![self.provider_config(kind)],
            None => ProviderKind::ALL
                .iter()
                .map(|kind| self.provider_config(*kind))
                .collect(),
        }
    }

    pub fn validate(&self) -> Result<(), StockpilotError> {
        for kind in ProviderKind::ALL {
            self.vendor(kind)
                .validate()
                .map_err(|e| StockpilotError::config(format!("{}: {}", kind, e)))?;
        }
        self.rate_limit
            .validate()
            .map_err(|e| StockpilotError::config(format!("rate_limit: {}", e)))?;
        self.agent
            .validate()
            .map_err(|e| StockpilotError::config(format!("agent: {}", e)))?;
        Ok(())
    }

    /// Safe for logging
    pub fn get_safe_summary(&self) -> ConfigSummary {
        let configured = |vendor: &VendorConfig| vendor.api_key.as_deref().is_some_and(|k| !k.is_empty());
        ConfigSummary {
            provider: self.provider,
            openai_key_configured: configured(&self.openai),
            anthropic_key_configured: configured(&self.anthropic),
            gemini_key_configured: configured(&self.gemini),
            model: self.agent.model.clone(),
            calls_per_minute: self.rate_limit.calls_per_minute,
        }
    }
}
