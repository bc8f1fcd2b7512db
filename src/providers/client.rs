//! Credential resolution and the lazily-built HTTP client shared by adapters
//!
//! Adapters hold only pure configuration until their first request. The
//! `reqwest::Client` is built on first use, and credentials are resolved on
//! every call, so a key exported after process start is still honoured.

use std::time::Duration;

use reqwest::{Client, Response};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::providers::ProviderError;

/// Where a vendor's API key comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Key set explicitly in configuration, wins over the environment
    override_key: Option<String>,
    /// Environment variables checked in order
    env_vars: &'static [&'static str],
}

impl Credentials {
    pub fn new(override_key: Option<String>, env_vars: &'static [&'static str]) -> Self {
        Self {
            override_key: override_key.filter(|k| !k.trim().is_empty()),
            env_vars,
        }
    }

    /// Resolves the key: explicit override first, then the vendor env vars
    pub fn resolve(&self) -> Option<String> {
        if let Some(key) = &self.override_key {
            return Some(key.clone());
        }

        self.env_vars
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .find(|value| !value.trim().is_empty())
    }

    pub fn is_resolvable(&self) -> bool {
        self.resolve().is_some()
    }

    /// Resolves the key or fails with a configuration error naming the sources
    pub fn require(&self, provider: &str) -> Result<String, ProviderError> {
        self.resolve().ok_or_else(|| {
            ProviderError::config(format!(
                "No API key for {}: set it in the config file or export {}",
                provider,
                self.env_vars.join(" or ")
            ))
        })
    }

    pub fn env_vars(&self) -> &'static [&'static str] {
        self.env_vars
    }
}

/// HTTP client constructed on first use
#[derive(Debug)]
pub struct LazyHttpClient {
    timeout_seconds: u64,
    cell: OnceCell<Client>,
}

impl LazyHttpClient {
    pub fn new(timeout_seconds: u64) -> Self {
        Self {
            timeout_seconds,
            cell: OnceCell::new(),
        }
    }

    /// Returns the client, building it on the first call
    pub async fn get(&self) -> Result<&Client, ProviderError> {
        self.cell
            .get_or_try_init(|| async {
                debug!(timeout_secs = self.timeout_seconds, "Building HTTP client");
                Client::builder()
                    .timeout(Duration::from_secs(self.timeout_seconds))
                    .build()
                    .map_err(|e| ProviderError::config(format!("Failed to build HTTP client: {}", e)))
            })
            .await
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.initialized()
    }

    pub fn timeout_seconds(&self) -> u64 {
        self.timeout_seconds
    }
}

/// Passes 2xx responses through and maps everything else to a typed error
pub(crate) async fn check_status(provider: &str, response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();

    Err(ProviderError::from_status(provider, status, &body, retry_after))
}
