//! Application configuration management.
//!
//! Configuration is stored at `~/.config/protocache/config.json`. Every field
//! has a default, so a missing file or a partial one is fine. The API URL and
//! token can be overridden from the environment.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::api::client::DEFAULT_REQUEST_TIMEOUT_SECS;
use crate::coordinator::{CoordinatorConfig, DEFAULT_PRELOAD_LIMIT};

/// Application name used for config directory paths
const APP_NAME: &str = "protocache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:3001/api";

pub const ENV_API_URL: &str = "PROTOCACHE_API_URL";
pub const ENV_TOKEN: &str = "PROTOCACHE_TOKEN";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub preload_limit: usize,
    /// Unbounded when absent
    pub detail_cache_capacity: Option<usize>,
    /// Also write logs to a daily file in this directory
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            preload_limit: DEFAULT_PRELOAD_LIMIT,
            detail_cache_capacity: None,
            log_dir: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Apply `PROTOCACHE_API_URL` if set and non-empty.
    pub fn apply_env(&mut self) {
        if let Some(url) = non_empty_var(ENV_API_URL) {
            self.api_base_url = url;
        }
    }

    /// Bearer token from `PROTOCACHE_TOKEN`; never written to the config file.
    pub fn token_from_env() -> Option<String> {
        non_empty_var(ENV_TOKEN)
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            preload_limit: self.preload_limit,
            detail_cache_capacity: self.detail_cache_capacity,
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
