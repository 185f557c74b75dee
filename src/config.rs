//! Configuration file handling for mediaforge.
//!
//! Loads configuration from `~/.config/mediaforge/config.toml` or a custom
//! path. API keys may also come from the environment (`MEDIAFORGE_GITEE_API_KEY`,
//! `MEDIAFORGE_GEMINI_API_KEY`, `MEDIAFORGE_GROK_API_KEY`), appended to the
//! configured key lists at startup.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::net::fetch::{NetworkConfig, DEFAULT_MAX_DOWNLOAD_BYTES};
use crate::net::retry::{RetryPolicy, DEFAULT_MAX_ATTEMPTS};
use crate::providers::ProviderId;

/// Configuration file structure for mediaforge.
/// Loaded from ~/.config/mediaforge/config.toml (or custom path via --config).
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub gitee: GiteeConfig,
    #[serde(default)]
    pub gemini: GeminiConfig,
    #[serde(default)]
    pub grok: GrokConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub webui: WebUiConfig,
}

#[derive(Debug, Deserialize, Default)]
pub struct GiteeConfig {
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub default_size: Option<String>,
    #[serde(default)]
    pub num_inference_steps: Option<u32>,
    #[serde(default)]
    pub negative_prompt: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct GeminiConfig {
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub image_size: Option<String>,
    #[serde(default)]
    pub aspect_ratio: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct GrokConfig {
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub image_model: Option<String>,
    #[serde(default)]
    pub video_model: Option<String>,
    #[serde(default)]
    pub default_size: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FallbackConfig {
    /// Provider tried first.
    #[serde(default = "default_primary")]
    pub primary: String,
    /// Fallback order after the primary, tried in sequence.
    #[serde(default = "default_fallback_order")]
    pub order: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            primary: default_primary(),
            order: default_fallback_order(),
            enabled: true,
        }
    }
}

impl FallbackConfig {
    /// Resolve the candidate order, primary first, dropping unknown names
    /// and duplicates.
    pub fn provider_order(&self) -> Vec<ProviderId> {
        let mut order = Vec::new();
        for name in std::iter::once(&self.primary).chain(self.order.iter()) {
            match name.parse::<ProviderId>() {
                Ok(id) if !order.contains(&id) => order.push(id),
                Ok(_) => {}
                Err(e) => log::warn!("ignoring fallback entry: {e}"),
            }
        }
        order
    }
}

#[derive(Debug, Deserialize)]
pub struct CacheConfig {
    /// Cache root directory. Defaults to the platform data dir.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Total byte ceiling, 0 = unlimited.
    #[serde(default = "default_cache_max_bytes")]
    pub max_bytes: u64,
    /// Item count ceiling, 0 = unlimited.
    #[serde(default = "default_cache_max_count")]
    pub max_count: usize,
    /// Seconds between background maintenance passes.
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_bytes: default_cache_max_bytes(),
            max_count: default_cache_max_count(),
            maintenance_interval_secs: default_maintenance_interval(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct NetworkSection {
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_download_bytes")]
    pub max_download_bytes: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Hosts exempt from outbound address validation.
    #[serde(default)]
    pub trusted_hosts: Vec<String>,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            proxy: None,
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            max_download_bytes: default_max_download_bytes(),
            max_attempts: default_max_attempts(),
            trusted_hosts: Vec::new(),
        }
    }
}

impl NetworkSection {
    pub fn fetch_config(&self) -> NetworkConfig {
        NetworkConfig {
            proxy: self.proxy.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            max_download_bytes: self.max_download_bytes,
            trusted_hosts: self.trusted_hosts.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_max_attempts(self.max_attempts)
    }
}

#[derive(Debug, Deserialize)]
pub struct WebUiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer token for the admin surface. Required (auto-generated when
    /// absent) for non-loopback binds.
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for WebUiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            token: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_primary() -> String {
    "gitee".to_string()
}

fn default_fallback_order() -> Vec<String> {
    vec!["gemini".to_string(), "grok".to_string()]
}

fn default_cache_max_bytes() -> u64 {
    500 * 1024 * 1024
}

fn default_cache_max_count() -> usize {
    100
}

fn default_maintenance_interval() -> u64 {
    3600
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    120
}

fn default_max_download_bytes() -> u64 {
    DEFAULT_MAX_DOWNLOAD_BYTES
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8520
}

impl Config {
    /// Load configuration from a file path.
    /// Returns default config if the file doesn't exist.
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(PathBuf::from).unwrap_or_else(default_path);

        if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::IoError {
                path: path.clone(),
                source: e,
            })?;
            let config: Config = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
                path: path.clone(),
                source: e,
            })?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Configured key list for a provider, with the matching environment
    /// variable appended when set.
    pub fn api_keys(&self, provider: ProviderId) -> Vec<String> {
        let (configured, env_var) = match provider {
            ProviderId::Gitee => (&self.gitee.api_keys, "MEDIAFORGE_GITEE_API_KEY"),
            ProviderId::Gemini => (&self.gemini.api_keys, "MEDIAFORGE_GEMINI_API_KEY"),
            ProviderId::Grok => (&self.grok.api_keys, "MEDIAFORGE_GROK_API_KEY"),
        };
        let mut keys = configured.clone();
        if let Ok(key) = std::env::var(env_var) {
            if !key.trim().is_empty() {
                keys.push(key);
            }
        }
        keys
    }

    /// Cache root, falling back to the platform data directory.
    pub fn cache_dir(&self) -> PathBuf {
        self.cache.dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("mediaforge")
        })
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError { path, source } => {
                write!(
                    f,
                    "Failed to read config file '{}': {}",
                    path.display(),
                    source
                )
            }
            ConfigError::ParseError { path, source } => {
                write!(
                    f,
                    "Failed to parse config file '{}': {}",
                    path.display(),
                    source
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::IoError { source, .. } => Some(source),
            ConfigError::ParseError { source, .. } => Some(source),
        }
    }
}

/// Get the default config file path.
pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".config")
        })
        .join("mediaforge")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.fallback.primary, "gitee");
        assert!(config.fallback.enabled);
        assert_eq!(config.cache.max_count, 100);
        assert_eq!(config.webui.host, "127.0.0.1");
        assert!(config.webui.token.is_none());
    }

    #[test]
    fn provider_order_drops_unknown_and_duplicate_entries() {
        let config: Config = toml::from_str(
            r#"
            [fallback]
            primary = "grok"
            order = ["grok", "typo", "gemini"]
            "#,
        )
        .unwrap();
        assert_eq!(
            config.fallback.provider_order(),
            vec![ProviderId::Grok, ProviderId::Gemini]
        );
    }

    #[test]
    fn full_document_parses() {
        let config: Config = toml::from_str(
            r#"
            [gitee]
            api_keys = ["k1", "k2"]
            model = "z-image-turbo"

            [grok]
            video_model = "grok-2-video"

            [cache]
            max_bytes = 1048576
            max_count = 10

            [network]
            proxy = "http://127.0.0.1:7890"
            max_attempts = 5
            trusted_hosts = ["ai.gitee.com"]

            [webui]
            host = "0.0.0.0"
            port = 9000
            token = "secret"
            "#,
        )
        .unwrap();
        assert_eq!(config.gitee.api_keys.len(), 2);
        assert_eq!(config.network.retry_policy().max_attempts, 5);
        assert_eq!(config.network.fetch_config().trusted_hosts.len(), 1);
        assert_eq!(config.webui.port, 9000);
    }
}
