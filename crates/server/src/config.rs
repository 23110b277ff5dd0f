//! Server configuration
//!
//! Loaded from an optional TOML file named by `SUPERVISOR_CONFIG`, then
//! overridden by environment variables.

use std::path::Path;

use serde::{Deserialize, Serialize};
use supervisor::SupervisorConfig;
use thiserror::Error;

pub const CONFIG_PATH_ENV: &str = "SUPERVISOR_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid value for {name}: {value}")]
    InvalidEnv { name: String, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// 0 picks a free port
    #[serde(default)]
    pub port: u16,
    /// Base URL of the sub-agent execution service
    #[serde(default = "default_agent_service_url")]
    pub agent_service_url: String,
    /// Base URL of the thread service; threads are kept in memory when unset
    #[serde(default)]
    pub thread_service_url: Option<String>,
    /// Bearer token sent to the collaborator services
    #[serde(default)]
    pub service_token: Option<String>,
    /// Outbound messages buffered per WebSocket before sends start timing out
    #[serde(default = "default_ws_buffer")]
    pub ws_buffer: usize,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_agent_service_url() -> String {
    "http://127.0.0.1:8100".to_string()
}

fn default_ws_buffer() -> usize {
    64
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            agent_service_url: default_agent_service_url(),
            thread_service_url: None,
            service_token: None,
            ws_buffer: default_ws_buffer(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// File named by `SUPERVISOR_CONFIG` (or defaults), then process environment
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => {
                tracing::info!("[CONFIG] Loading configuration from {}", path);
                Self::from_file(path.trim())?
            }
            _ => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(host) = get("HOST") {
            self.host = host;
        }
        if let Some((name, port)) = get("BACKEND_PORT")
            .map(|v| ("BACKEND_PORT", v))
            .or_else(|| get("PORT").map(|v| ("PORT", v)))
        {
            self.port = port.parse().map_err(|_| ConfigError::InvalidEnv {
                name: name.to_string(),
                value: port.clone(),
            })?;
        }
        if let Some(url) = get("AGENT_SERVICE_URL") {
            self.agent_service_url = url;
        }
        if let Some(url) = get("THREAD_SERVICE_URL") {
            self.thread_service_url = Some(url);
        }
        if let Some(token) = get("SERVICE_TOKEN") {
            self.service_token = Some(token);
        }
        if let Some(value) = get("SUPERVISOR_STEP_TIMEOUT_MS") {
            self.supervisor.step_timeout_ms =
                value.parse().map_err(|_| ConfigError::InvalidEnv {
                    name: "SUPERVISOR_STEP_TIMEOUT_MS".to_string(),
                    value: value.clone(),
                })?;
        }
        if let Some(value) = get("SUPERVISOR_MAX_ATTEMPTS") {
            self.supervisor.max_attempts =
                value.parse().map_err(|_| ConfigError::InvalidEnv {
                    name: "SUPERVISOR_MAX_ATTEMPTS".to_string(),
                    value: value.clone(),
                })?;
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
