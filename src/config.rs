// Configuration for switchboard
// JSON file in the user's config directory, overridable from the environment

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::info;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::gateway::{GatewayClient, RetryPolicy};
use crate::inbox::{DiscoveryOrder, InboxSettings, StatusTable};

pub const ENV_GATEWAY_URL: &str = "SWITCHBOARD_GATEWAY_URL";
pub const ENV_API_KEY: &str = "SWITCHBOARD_API_KEY";

const CONFIG_DIR_NAME: &str = "switchboard";
const CONFIG_FILE_NAME: &str = "config.json";

fn default_poll_interval() -> u64 {
    20
}
fn default_pairing_timeout() -> u64 {
    120
}
fn default_history_limit() -> usize {
    50
}
fn default_request_timeout() -> u64 {
    15
}
fn default_read_attempts() -> u32 {
    1
}
fn default_backoff_ms() -> u64 {
    500
}
fn default_online_tokens() -> Vec<String> {
    vec!["open".to_string(), "connected".to_string(), "online".to_string()]
}
fn default_pairing_tokens() -> Vec<String> {
    vec!["connecting".to_string(), "qrcode".to_string(), "pairing".to_string()]
}
fn default_discovery_order() -> String {
    "gateway".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    api_key: Option<String>, // base64 on disk
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_pairing_timeout")]
    pub pairing_timeout_secs: u64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_read_attempts")]
    pub max_read_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_online_tokens")]
    pub online_status_tokens: Vec<String>,
    #[serde(default = "default_pairing_tokens")]
    pub pairing_status_tokens: Vec<String>,
    #[serde(default = "default_discovery_order")]
    pub discovery_order: String,
    #[serde(default)]
    pub instance_priority: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            poll_interval_secs: default_poll_interval(),
            pairing_timeout_secs: default_pairing_timeout(),
            history_limit: default_history_limit(),
            request_timeout_secs: default_request_timeout(),
            max_read_attempts: default_read_attempts(),
            retry_backoff_ms: default_backoff_ms(),
            online_status_tokens: default_online_tokens(),
            pairing_status_tokens: default_pairing_tokens(),
            discovery_order: default_discovery_order(),
            instance_priority: Vec::new(),
        }
    }
}

impl GatewayConfig {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        let mut config = Self { base_url: base_url.to_string(), ..Self::default() };
        config.set_api_key(api_key);
        config
    }

    pub fn set_api_key(&mut self, api_key: &str) {
        self.api_key = Some(BASE64.encode(api_key));
    }

    pub fn api_key(&self) -> Option<String> {
        self.api_key
            .as_ref()
            .and_then(|encoded| BASE64.decode(encoded).ok())
            .and_then(|bytes| String::from_utf8(bytes).ok())
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// `load_config`).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_GATEWAY_URL).filter(|v| !v.trim().is_empty()) {
            self.base_url = url.trim().to_string();
        }
        if let Some(key) = lookup(ENV_API_KEY).filter(|v| !v.trim().is_empty()) {
            self.set_api_key(key.trim());
        }
    }

    pub fn discovery_order(&self) -> Result<DiscoveryOrder> {
        match self.discovery_order.trim().to_ascii_lowercase().as_str() {
            "gateway" | "" => Ok(DiscoveryOrder::Gateway),
            "name" => Ok(DiscoveryOrder::Name),
            "priority" => Ok(DiscoveryOrder::Priority(self.instance_priority.clone())),
            other => bail!("Unknown discovery order {:?} (expected gateway, name or priority)", other),
        }
    }

    pub fn inbox_settings(&self) -> Result<InboxSettings> {
        if self.poll_interval_secs == 0 {
            bail!("poll_interval_secs must be greater than zero");
        }
        if self.history_limit == 0 {
            bail!("history_limit must be greater than zero");
        }
        Ok(InboxSettings {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            pairing_timeout: Duration::from_secs(self.pairing_timeout_secs),
            history_limit: self.history_limit,
            status_table: StatusTable::new(&self.online_status_tokens, &self.pairing_status_tokens),
            discovery_order: self.discovery_order()?,
        })
    }

    pub fn build_client(&self) -> Result<GatewayClient> {
        if self.base_url.trim().is_empty() {
            bail!("No gateway URL configured (set {} or base_url in the config file)", ENV_GATEWAY_URL);
        }
        let api_key = self
            .api_key()
            .ok_or_else(|| anyhow!("No API key configured (set {} or api_key in the config file)", ENV_API_KEY))?;
        let client = GatewayClient::new(
            &self.base_url,
            &api_key,
            Duration::from_secs(self.request_timeout_secs.max(1)),
        )?
        .with_retry(RetryPolicy {
            max_attempts: self.max_read_attempts,
            base_backoff: Duration::from_millis(self.retry_backoff_ms),
        });
        Ok(client)
    }
}

static CONFIG_PATH_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

/// Use `path` instead of the default location for the rest of the process.
pub fn set_config_path_override(path: PathBuf) {
    let _ = CONFIG_PATH_OVERRIDE.set(path);
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join(CONFIG_DIR_NAME);

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

pub fn get_config_path() -> Result<PathBuf> {
    if let Some(path) = CONFIG_PATH_OVERRIDE.get() {
        return Ok(path.clone());
    }
    Ok(get_config_dir()?.join(CONFIG_FILE_NAME))
}

/// Read the config at `path`; a missing file yields the defaults.
pub fn read_config(path: &Path) -> Result<GatewayConfig> {
    if !path.exists() {
        return Ok(GatewayConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let config = serde_json::from_str(&contents).with_context(|| format!("Invalid config file {}", path.display()))?;
    info!("Loaded gateway config from {}", path.display());
    Ok(config)
}

pub fn write_config(path: &Path, config: &GatewayConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, config)?;
    info!("Gateway config saved to {}", path.display());
    Ok(())
}

/// Load the config file, then apply environment overrides.
pub fn load_config() -> Result<GatewayConfig> {
    let mut config = read_config(&get_config_path()?)?;
    config.apply_overrides(|name| std::env::var(name).ok());
    Ok(config)
}

pub fn save_config(config: &GatewayConfig) -> Result<()> {
    write_config(&get_config_path()?, config)
}
