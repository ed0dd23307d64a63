//! Configuration management with layered sources and validation.
//!
//! Precedence, lowest first: embedded `config.toml`, optional local
//! `orchestrator.toml`, `ORCH__SECTION__KEY` environment variables, then the
//! explicit overrides in [`Settings::apply_env_overrides`].

use anyhow::{anyhow, Result};
use config::{Config, Environment};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_request_size_mb: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_request_size_mb: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Number of plan executions before giving up (initial run included)
    pub max_replan_iterations: u32,
    /// 0 = unbounded
    pub max_concurrent_tasks: usize,
    /// 0 = no timeout
    pub task_timeout_seconds: u64,
    #[serde(default)]
    pub state_file: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_replan_iterations: 3,
            max_concurrent_tasks: 0,
            task_timeout_seconds: 0,
            state_file: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn concurrency_limit(&self) -> Option<usize> {
        (self.max_concurrent_tasks > 0).then_some(self.max_concurrent_tasks)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        (self.task_timeout_seconds > 0).then(|| Duration::from_secs(self.task_timeout_seconds))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub store: String, // "memory" or "redis"
    #[serde(default)]
    pub redis_url: Option<String>,
    pub key: String,
    pub ttl_seconds: u64,
    /// TOML file with `[[agents]]` cards registered at startup
    #[serde(default)]
    pub seed_file: Option<PathBuf>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            store: "memory".to_string(),
            redis_url: None,
            key: "agent_registry".to_string(),
            ttl_seconds: 86_400,
            seed_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub timeout_seconds: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_seconds: 60,
            timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            timeout_seconds: 120,
            max_tokens: 2_048,
        }
    }
}

/// Main settings structure with all configuration sections
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub orchestrator: OrchestratorConfig,
    pub registry: RegistryConfig,
    pub health: HealthConfig,
    pub llm: LlmConfig,
}

impl Settings {
    /// Load settings from configuration files and environment variables
    pub fn load() -> Result<Self> {
        let config = Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config::File::with_name("orchestrator").required(false))
            .add_source(
                Environment::with_prefix("ORCH")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut settings: Settings = config.try_deserialize()?;
        Self::apply_env_overrides(&mut settings)?;
        settings.validate()?;

        Ok(settings)
    }

    /// Apply environment variable overrides for secrets and common knobs
    fn apply_env_overrides(settings: &mut Settings) -> Result<()> {
        if let Ok(port) = std::env::var("ORCH_SERVER_PORT") {
            settings.server.port = port.parse()?;
        }
        if let Ok(api_key) = std::env::var("ORCH_LLM_API_KEY") {
            settings.llm.api_key = Some(api_key);
        }
        if let Ok(redis_url) = std::env::var("ORCH_REDIS_URL") {
            settings.registry.redis_url = Some(redis_url);
        }
        if let Ok(state_file) = std::env::var("ORCH_STATE_FILE") {
            settings.orchestrator.state_file = Some(PathBuf::from(state_file));
        }
        Ok(())
    }

    /// Validate settings for consistency
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }
        if self.orchestrator.max_replan_iterations == 0 {
            return Err(anyhow!("orchestrator.max_replan_iterations must be > 0"));
        }
        match self.registry.store.as_str() {
            "memory" => {}
            "redis" => {
                if self.registry.redis_url.is_none() {
                    return Err(anyhow!(
                        "Redis registry store requires ORCH_REDIS_URL or registry.redis_url"
                    ));
                }
            }
            other => return Err(anyhow!("Unknown registry store: {}", other)),
        }
        if self.llm.model.trim().is_empty() {
            return Err(anyhow!("llm.model cannot be empty"));
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(anyhow!("Unknown log format: {}", self.logging.format));
        }
        if self.health.enabled && self.health.interval_seconds == 0 {
            return Err(anyhow!("health.interval_seconds must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.orchestrator.max_replan_iterations, 3);
        assert_eq!(settings.orchestrator.concurrency_limit(), None);
        assert_eq!(settings.orchestrator.task_timeout(), None);
    }

    #[test]
    fn test_embedded_config_parses() {
        let config = Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config.toml"),
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let settings: Settings = config.try_deserialize().unwrap();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.registry.key, "agent_registry");
    }

    #[test]
    fn test_validation_failures() {
        let mut settings = Settings::default();
        settings.orchestrator.max_replan_iterations = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.registry.store = "redis".to_string();
        assert!(settings.validate().is_err());
        settings.registry.redis_url = Some("redis://localhost".to_string());
        assert!(settings.validate().is_ok());

        let mut settings = Settings::default();
        settings.logging.format = "xml".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_optional_limits() {
        let config = OrchestratorConfig {
            max_concurrent_tasks: 4,
            task_timeout_seconds: 10,
            ..OrchestratorConfig::default()
        };
        assert_eq!(config.concurrency_limit(), Some(4));
        assert_eq!(config.task_timeout(), Some(Duration::from_secs(10)));
    }
}
