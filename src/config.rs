//! Bridge configuration, layered toml + environment overrides.
//!
//! Loading follows the same shape as the bridge's sibling services: a
//! `Config::load` that reads `config.toml` (path overridable via
//! `VOICEBRIDGE_CONFIG`) and then lets `VOICEBRIDGE_*` environment
//! variables win over file values for the handful of secrets that should
//! never sit in a checked-in file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub kv: KvConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bind")]
    pub bind_addr: String,
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind(),
            max_concurrent_calls: default_max_concurrent_calls(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:9092".to_string()
}

fn default_max_concurrent_calls() -> usize {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct KvConfig {
    #[serde(default = "default_kv_url")]
    pub url: String,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            url: default_kv_url(),
            password: None,
        }
    }
}

fn default_kv_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default)]
    pub xai_api_key: Option<String>,
    #[serde(default)]
    pub gemini_api_key: Option<String>,
    #[serde(default)]
    pub ultravox_api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_secs: default_window_secs(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_window_secs() -> u64 {
    60
}

fn default_cooldown_secs() -> u64 {
    30
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = std::env::var("VOICEBRIDGE_CONFIG")
            .unwrap_or_else(|_| "config.toml".to_string());
        let mut config = Self::load_from_path(Path::new(&path)).unwrap_or_default();
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("VOICEBRIDGE_BIND_ADDR") {
            self.bridge.bind_addr = v;
        }
        if let Ok(v) = std::env::var("VOICEBRIDGE_KV_URL") {
            self.kv.url = v;
        }
        if let Ok(v) = std::env::var("VOICEBRIDGE_KV_PASSWORD") {
            self.kv.password = Some(v);
        }
        if let Ok(v) = std::env::var("VOICEBRIDGE_OPENAI_API_KEY") {
            self.providers.openai_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("VOICEBRIDGE_XAI_API_KEY") {
            self.providers.xai_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("VOICEBRIDGE_GEMINI_API_KEY") {
            self.providers.gemini_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("VOICEBRIDGE_ULTRAVOX_API_KEY") {
            self.providers.ultravox_api_key = Some(v);
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bridge: BridgeConfig::default(),
            kv: KvConfig::default(),
            providers: ProvidersConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Resolves a config-relative path the way `shellexpand`-using callers do
/// elsewhere in the ambient stack (tilde expansion for operator-supplied paths).
pub fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.bridge.bind_addr, "0.0.0.0:9092");
        assert_eq!(config.bridge.max_concurrent_calls, 500);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.window_secs, 60);
        assert_eq!(config.circuit_breaker.cooldown_secs, 30);
    }

    #[test]
    fn parses_minimal_toml() {
        let raw = r#"
            [bridge]
            bind_addr = "127.0.0.1:9999"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.bridge.bind_addr, "127.0.0.1:9999");
        assert_eq!(config.bridge.max_concurrent_calls, 500);
    }
}
