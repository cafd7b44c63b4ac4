//! Gateway configuration: TOML file + `GATEWAY_`-prefixed environment
//! overrides, following the same load/override/validate pipeline the
//! teacher's config module used.

use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;

use inference_engine::{CircuitBreakerConfig, DispatcherConfig, ProviderConfig, QuotaConfig, RoutingStrategy, SessionPoolConfig};
use serde::{Deserialize, Serialize};

pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    inference_engine::common::duration_serde::parse_duration(s).map_err(|e| anyhow::anyhow!(e))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
    #[serde(default)]
    pub multitenancy: MultitenancyConfig,
    #[serde(default)]
    pub session_pool: SessionPoolConfig,
    #[serde(default)]
    pub breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub dispatch: DispatcherConfig,
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(with = "inference_engine::common::duration_serde")]
    pub timeout: Duration,
    pub max_body_size: usize,
    #[serde(default)]
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024,
            cors: CorsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub max_age: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed_origins: vec!["*".to_string()],
            allowed_methods: vec!["GET".to_string(), "POST".to_string()],
            allowed_headers: vec!["*".to_string()],
            max_age: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub strategy: RoutingStrategy,
    #[serde(with = "inference_engine::common::duration_serde")]
    pub health_check_interval: Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            strategy: RoutingStrategy::Priority,
            health_check_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    pub enabled: bool,
    pub default_rps: f64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self { enabled: true, default_rps: 10.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultitenancyConfig {
    pub enabled: bool,
}

impl Default for MultitenancyConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    pub name: String,
    pub enabled: bool,
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Pretty, output: LogOutput::Stdout }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogOutput {
    Stdout,
    File { path: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            providers: HashMap::new(),
            routing: RoutingConfig::default(),
            quota: QuotaConfig::default(),
            rate_limiting: RateLimitingConfig::default(),
            multitenancy: MultitenancyConfig::default(),
            session_pool: SessionPoolConfig { capacity: 128, idle_ttl: Duration::from_secs(300) },
            breaker: CircuitBreakerConfig::default(),
            dispatch: DispatcherConfig::default(),
            plugins: Vec::new(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
            redis_url: None,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut config: Config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str(&contents)?
        } else {
            Config::default()
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(host) = env::var("GATEWAY_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = env::var("GATEWAY_PORT") {
            self.server.port = port.parse()?;
        }
        if let Ok(timeout) = env::var("GATEWAY_TIMEOUT") {
            self.server.timeout = parse_duration(&timeout)?;
        }
        if let Ok(redis_url) = env::var("GATEWAY_REDIS_URL") {
            self.redis_url = Some(redis_url);
        }
        if let Ok(level) = env::var("GATEWAY_LOG_LEVEL") {
            let valid = ["trace", "debug", "info", "warn", "error"];
            if !valid.contains(&level.as_str()) {
                return Err(anyhow::anyhow!("invalid GATEWAY_LOG_LEVEL: {level}"));
            }
            self.logging.level = level;
        }

        for (name, provider) in self.providers.iter_mut() {
            let env_prefix = name.to_uppercase();
            if let Ok(api_key) = env::var(format!("{env_prefix}_API_KEY")) {
                provider.secrets.insert("api_key".to_string(), api_key);
            }
            if let Ok(v) = env::var(format!("{env_prefix}_CB_FAILURE_THRESHOLD")) {
                provider.metadata.insert("cb_failure_threshold".to_string(), v);
            }
            if let Ok(v) = env::var(format!("{env_prefix}_CB_RECOVERY_TIMEOUT")) {
                provider.metadata.insert("cb_recovery_timeout".to_string(), v);
            }
            if let Ok(v) = env::var(format!("{env_prefix}_CB_REQUEST_TIMEOUT")) {
                provider.metadata.insert("cb_request_timeout".to_string(), v);
            }
        }

        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.validate_server()?;
        self.validate_providers()?;
        self.validate_logging()?;
        self.validate_plugins()?;
        Ok(())
    }

    fn validate_server(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("server.port must be nonzero"));
        }
        if self.server.max_body_size == 0 {
            return Err(anyhow::anyhow!("server.max_body_size must be nonzero"));
        }
        Ok(())
    }

    fn validate_providers(&self) -> anyhow::Result<()> {
        for (name, provider) in &self.providers {
            if provider.enabled && provider.api_key().is_none() {
                let kind = provider.metadata.get("kind").map(String::as_str).unwrap_or("custom");
                if kind != "custom" {
                    return Err(anyhow::anyhow!("provider '{name}' is enabled but has no api_key"));
                }
            }
        }
        Ok(())
    }

    fn validate_logging(&self) -> anyhow::Result<()> {
        let valid = ["trace", "debug", "info", "warn", "error"];
        if !valid.contains(&self.logging.level.as_str()) {
            return Err(anyhow::anyhow!("invalid logging.level: {}", self.logging.level));
        }
        Ok(())
    }

    fn validate_plugins(&self) -> anyhow::Result<()> {
        for plugin in &self.plugins {
            if plugin.name.trim().is_empty() {
                return Err(anyhow::anyhow!("plugin name must not be empty"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_port() {
        let mut config = Config::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_max_body_size() {
        let mut config = Config::default();
        config.server.max_body_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("30x").is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = Config::default();
        env::set_var("GATEWAY_HOST", "0.0.0.0");
        env::set_var("GATEWAY_PORT", "8080");
        env::set_var("GATEWAY_TIMEOUT", "60s");
        env::set_var("GATEWAY_LOG_LEVEL", "debug");

        config.apply_env_overrides().unwrap();

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.timeout.as_secs(), 60);
        assert_eq!(config.logging.level, "debug");

        env::remove_var("GATEWAY_HOST");
        env::remove_var("GATEWAY_PORT");
        env::remove_var("GATEWAY_TIMEOUT");
        env::remove_var("GATEWAY_LOG_LEVEL");
    }

    #[test]
    fn loads_missing_file_as_default() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config.server.port, 3000);
    }
}
