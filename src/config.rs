use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::scheduler::DEFAULT_SAVE_INTERVAL_MS;

/// Upload secret baked in at build time, used when the config file has none.
const BUILD_UPLOAD_TOKEN: Option<&str> = option_env!("WEBCARD_UPLOAD_TOKEN");

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub service_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// When set, logs roll daily into this directory instead of stderr.
    #[serde(default)]
    pub log_directory: Option<String>,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_storage_root")]
    pub storage_root: String,
    #[serde(default = "default_stats_file")]
    pub stats_file: String,
    #[serde(default = "default_save_interval_ms")]
    pub save_interval_ms: u64,
    #[serde(default = "default_flush_check_ms")]
    pub flush_check_ms: u64,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    /// How long a response chunk may wait on a client that stopped reading.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default, skip_serializing)]
    pub upload_token: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:80".to_string()
}

fn default_storage_root() -> String {
    "./deployment/www".to_string()
}

fn default_stats_file() -> String {
    "/stats.bin".to_string()
}

fn default_save_interval_ms() -> u64 {
    DEFAULT_SAVE_INTERVAL_MS
}

fn default_flush_check_ms() -> u64 {
    1000
}

fn default_max_upload_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_send_timeout_ms() -> u64 {
    5_000
}

impl AppConfig {
    pub fn default_path() -> &'static str {
        "config/webcard.toml"
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let raw = fs::read_to_string(path_ref)
            .with_context(|| format!("failed to read configuration from {}", path_ref.display()))?;
        let mut config: Self = toml::from_str(&raw).with_context(|| {
            format!("failed to parse configuration from {}", path_ref.display())
        })?;
        if config.service_name.trim().is_empty() {
            config.service_name = "webcard".to_string();
        }
        if !config.stats_file.starts_with('/') {
            config.stats_file = format!("/{}", config.stats_file);
        }
        if config.save_interval_ms == 0 {
            anyhow::bail!("save_interval_ms must be greater than zero");
        }
        Ok(config)
    }

    /// Defaults for everything except the storage root.
    pub fn for_storage(storage_root: impl Into<String>) -> Self {
        Self {
            service_name: "webcard".to_string(),
            log_level: default_log_level(),
            log_directory: None,
            listen_addr: default_listen_addr(),
            storage_root: storage_root.into(),
            stats_file: default_stats_file(),
            save_interval_ms: default_save_interval_ms(),
            flush_check_ms: default_flush_check_ms(),
            max_upload_bytes: default_max_upload_bytes(),
            send_timeout_ms: default_send_timeout_ms(),
            upload_token: None,
        }
    }

    pub fn upload_secret(&self) -> Option<String> {
        self.upload_token
            .clone()
            .or_else(|| BUILD_UPLOAD_TOKEN.map(str::to_string))
            .filter(|token| !token.is_empty())
    }
}
