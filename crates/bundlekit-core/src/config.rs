use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

pub const DEFAULT_MANIFEST_URL: &str = "https://repo.bundlekit.dev/manifest/artifacts.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpdateConfig {
    pub manifest_url: String,
    pub data_root: Option<PathBuf>,
    pub cache_root: Option<PathBuf>,
    pub updates_enabled: bool,
    pub patches_enabled: bool,
    pub allow_downgrade: bool,
    pub manifest_max_age_secs: u64,
    pub lock_timeout_secs: Option<u64>,
    pub trusted_patch_keys: Vec<String>,
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub deadline_secs: u64,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            manifest_url: DEFAULT_MANIFEST_URL.to_string(),
            data_root: None,
            cache_root: None,
            updates_enabled: true,
            patches_enabled: true,
            allow_downgrade: false,
            manifest_max_age_secs: 900,
            lock_timeout_secs: None,
            trusted_patch_keys: Vec::new(),
            network: NetworkConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            deadline_secs: 600,
            connect_timeout_secs: 15,
            request_timeout_secs: 300,
            user_agent: concat!("bundlekit/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl UpdateConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input).context("failed to parse bundlekit config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(raw) => Self::from_toml_str(&raw)
                .with_context(|| format!("invalid config file: {}", path.display())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to read config: {}", path.display()))
            }
        }
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = non_empty(lookup("BUNDLEKIT_MANIFEST_URL")) {
            self.manifest_url = url;
        }
        if let Some(root) = non_empty(lookup("BUNDLEKIT_DATA_HOME")) {
            self.data_root = Some(PathBuf::from(root));
        }
        if let Some(root) = non_empty(lookup("BUNDLEKIT_CACHE_HOME")) {
            self.cache_root = Some(PathBuf::from(root));
        }
        if let Some(flag) = non_empty(lookup("BUNDLEKIT_UPDATES")) {
            self.updates_enabled = parse_flag(&flag)
                .ok_or_else(|| anyhow!("BUNDLEKIT_UPDATES must be 0 or 1, got '{flag}'"))?;
        }
        if let Some(secs) = non_empty(lookup("BUNDLEKIT_LOCK_TIMEOUT")) {
            let secs = secs
                .parse::<u64>()
                .with_context(|| format!("BUNDLEKIT_LOCK_TIMEOUT must be seconds, got '{secs}'"))?;
            self.lock_timeout_secs = Some(secs);
        }
        self.validate()
    }

    pub fn manifest_max_age(&self) -> Duration {
        Duration::from_secs(self.manifest_max_age_secs)
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_secs.map(Duration::from_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.manifest_url.trim().is_empty() {
            return Err(anyhow!("manifest_url must not be empty"));
        }
        if self.network.max_attempts == 0 {
            return Err(anyhow!("network.max_attempts must be at least 1"));
        }
        if self.network.initial_backoff_ms > self.network.max_backoff_ms {
            return Err(anyhow!(
                "network.initial_backoff_ms must not exceed network.max_backoff_ms"
            ));
        }
        for key in &self.trusted_patch_keys {
            if key.len() != 64 || !key.chars().all(|ch| ch.is_ascii_hexdigit()) {
                return Err(anyhow!(
                    "trusted_patch_keys entries must be 64 hex characters: '{key}'"
                ));
            }
        }
        Ok(())
    }
}

/// `$BUNDLEKIT_CONFIG`, else `$XDG_CONFIG_HOME/bundlekit/config.toml`, else
/// `$HOME/.config/bundlekit/config.toml`.
pub fn default_config_path<F>(lookup: F) -> Result<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = non_empty(lookup("BUNDLEKIT_CONFIG")) {
        return Ok(PathBuf::from(path));
    }
    if let Some(xdg) = non_empty(lookup("XDG_CONFIG_HOME")) {
        return Ok(PathBuf::from(xdg).join("bundlekit").join("config.toml"));
    }
    let home = non_empty(lookup("HOME"))
        .ok_or_else(|| anyhow!("HOME is not set; cannot resolve config path"))?;
    Ok(PathBuf::from(home)
        .join(".config")
        .join("bundlekit")
        .join("config.toml"))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
