use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::config::schema::Config;
use crate::providers::ProviderKind;
use crate::utils::{Result, StockpilotError};

#[cfg(test)]
use std::sync::Mutex;

#[cfg(test)]
pub(crate) static CONFIG_TEST_ENV_LOCK: Mutex<()> = Mutex::new(());

pub const ENV_PROVIDER: &str = "STOCKPILOT_PROVIDER";
pub const ENV_MODEL: &str = "STOCKPILOT_MODEL";
pub const ENV_CALLS_PER_MINUTE: &str = "STOCKPILOT_CALLS_PER_MINUTE";

/// Loads defaults, then the config file, then environment, then CLI flags
pub fn load_config(
    cli_provider: Option<ProviderKind>,
    cli_model: Option<String>,
    cli_config_path: Option<PathBuf>,
) -> Result<Config> {
    tracing::debug!("Loading configuration");

    let mut config = Config::default();

    // Layer 1: config file (~/.stockpilot/config.json)
    let config_file = cli_config_path.or_else(get_default_config_path);

    if let Some(ref path) = config_file {
        if path.exists() {
            tracing::debug!(config_path = %path.display(), "Loading configuration from file");
            config = merge_config_from_file(config, path)?;
        } else {
            tracing::debug!(config_path = %path.display(), "Config file not found, using defaults");
        }
    }

    // Layer 2: environment
    config = merge_env_variables(config)?;

    // Layer 3: CLI flags
    if let Some(kind) = cli_provider {
        tracing::debug!(provider = %kind, "Applying CLI provider override");
        config.provider = Some(kind);
    }
    if let Some(model) = cli_model {
        tracing::debug!(model = %model, "Applying CLI model override");
        config.agent.model = Some(model);
    }

    config.validate()?;

    let summary = config.get_safe_summary();
    tracing::debug!(
        provider = ?summary.provider,
        openai_key_configured = summary.openai_key_configured,
        anthropic_key_configured = summary.anthropic_key_configured,
        gemini_key_configured = summary.gemini_key_configured,
        model = ?summary.model,
        calls_per_minute = summary.calls_per_minute,
        "Configuration loaded successfully"
    );

    Ok(config)
}

fn get_default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".stockpilot").join("config.json"))
}

fn merge_config_from_file(config: Config, path: &Path) -> Result<Config> {
    let metadata = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(config),
        Err(e) => return Err(StockpilotError::io(path, e)),
    };

    let mode = metadata.permissions().mode() & 0o777;
    if mode != 0o600 {
        tracing::error!(
            config_path = %path.display(),
            mode = %format!("{:o}", mode),
            "Config file permissions are not 0600, skipping it"
        );
        return Ok(config);
    }

    let content = fs::read_to_string(path).map_err(|e| StockpilotError::io(path, e))?;

    serde_json::from_str(&content).map_err(|e| {
        StockpilotError::config(format!(
            "Configuration file {} contains invalid JSON: {}",
            path.display(),
            e
        ))
    })
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn merge_env_variables(mut config: Config) -> Result<Config> {
    if let Some(provider) = env_value(ENV_PROVIDER) {
        let kind = provider
            .parse::<ProviderKind>()
            .map_err(|e| StockpilotError::config(format!("{}: {}", ENV_PROVIDER, e)))?;
        tracing::debug!(provider = %kind, "Applying environment provider override");
        config.provider = Some(kind);
    }

    if let Some(model) = env_value(ENV_MODEL) {
        config.agent.model = Some(model);
    }

    if let Some(raw) = env_value(ENV_CALLS_PER_MINUTE) {
        match raw.trim().parse::<usize>() {
            Ok(calls) if calls > 0 => config.rate_limit.calls_per_minute = calls,
            _ => tracing::warn!(value = %raw, "Ignoring invalid {}", ENV_CALLS_PER_MINUTE),
        }
    }

    Ok(config)
}

/// Writes pretty JSON readable by the owner only
pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StockpilotError::io(parent, e))?;
    }

    let json = serde_json::to_string_pretty(config)?;

    let mut file = fs::File::create(path).map_err(|e| StockpilotError::io(path, e))?;
    file.write_all(json.as_bytes())
        .map_err(|e| StockpilotError::io(path, e))?;

    let mut permissions = file.metadata()?.permissions();
    permissions.set_mode(0o600);
    fs::set_permissions(path, permissions).map_err(|e| StockpilotError::io(path, e))?;

    tracing::info!(config_path = %path.display(), "Configuration saved");
    Ok(())
}

pub fn get_config_path() -> Option<PathBuf> {
    get_default_config_path()
}
