use std::time::Duration;

use octofhir_authflow::AuthFlowConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Flow configuration: realm, token keys, clients, providers
    #[serde(default)]
    pub authflow: AuthFlowConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        if self.server.sweep_interval.is_zero() {
            return Err("server.sweep_interval must be > 0".into());
        }
        self.authflow.validate().map_err(|e| e.to_string())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// How often expired auth sessions and consumed token keys are dropped.
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("config build error: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub mod loader {
    use super::{AppConfig, LoadError};
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    /// Default configuration file, looked up in the working directory.
    pub const DEFAULT_CONFIG_FILE: &str = "authflow.toml";

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, LoadError> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., AUTHFLOW__SERVER__PORT=9090
        builder = builder.add_source(
            Environment::with_prefix("AUTHFLOW")
                .try_parsing(true)
                .separator("__"),
        );
        let merged: AppConfig = builder.build()?.try_deserialize()?;
        merged.validate().map_err(LoadError::Invalid)?;
        Ok(merged)
    }
}
