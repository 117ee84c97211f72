//! Configuration management for Trackgate.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;

use crate::error::{Result, TrackgateError};
use crate::ratelimit::{PolicyConfig, RuleConfig};

/// Prefix for environment overrides, e.g. `TRACKGATE__SERVER__LISTEN_ADDR`.
const ENV_PREFIX: &str = "TRACKGATE";

/// Main configuration for the Trackgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Largest accepted request body in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_max_body_bytes() -> usize {
    5 * 1024 * 1024
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// When false, every request is admitted
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Policies by name
    #[serde(default = "default_policies")]
    pub policies: BTreeMap<String, PolicyConfig>,

    /// Dispatch rules, tried in order
    #[serde(default = "default_rules")]
    pub rules: Vec<RuleConfig>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            policies: default_policies(),
            rules: default_rules(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_policies() -> BTreeMap<String, PolicyConfig> {
    BTreeMap::from([
        ("upload".to_string(), PolicyConfig::new(0.1, 5)),
        ("download".to_string(), PolicyConfig::new(2.0, 30)),
        ("list".to_string(), PolicyConfig::new(5.0, 60)),
    ])
}

fn default_rules() -> Vec<RuleConfig> {
    vec![
        RuleConfig::new("POST", "/api/tracks", "upload"),
        RuleConfig::new("DELETE", "/api/tracks/{id}", "upload"),
        RuleConfig::new("GET", "/api/tracks/{id}/download", "download"),
        RuleConfig::new("GET", "/api/tracks", "list"),
        RuleConfig::new("GET", "/api/tracks/{id}", "list"),
    ]
}

impl TrackgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| TrackgateError::Config(e.to_string()))
    }

    /// Load configuration from an optional YAML file, then apply
    /// `TRACKGATE__*` environment overrides.
    ///
    /// The file is parsed with serde_yaml so policy names keep their case.
    /// Only scalar settings can be overridden from the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut loaded = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        let overrides: EnvOverrides = config::Config::builder()
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TrackgateError::Config(e.to_string()))?;

        overrides.apply(&mut loaded);
        Ok(loaded)
    }
}

/// Settings that `TRACKGATE__*` environment variables may override.
#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    #[serde(default)]
    server: ServerOverrides,
    #[serde(default)]
    rate_limiting: RateLimitingOverrides,
}

#[derive(Debug, Default, Deserialize)]
struct ServerOverrides {
    listen_addr: Option<SocketAddr>,
    max_body_bytes: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RateLimitingOverrides {
    enabled: Option<bool>,
}

impl EnvOverrides {
    fn apply(self, config: &mut TrackgateConfig) {
        if let Some(listen_addr) = self.server.listen_addr {
            config.server.listen_addr = listen_addr;
        }
        if let Some(max_body_bytes) = self.server.max_body_bytes {
            config.server.max_body_bytes = max_body_bytes;
        }
        if let Some(enabled) = self.rate_limiting.enabled {
            config.rate_limiting.enabled = enabled;
        }
    }
}
