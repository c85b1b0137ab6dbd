//! Configuration loading using Figment
//!
//! Configuration is layered:
//! 1. Built-in defaults (every field has one)
//! 2. `config/brewbot.toml` (or a file given on the command line)
//! 3. Environment variables prefixed with `BREWBOT_`, nested with `__`
//!
//! # Example
//! ```no_run
//! use brewbot::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! config.validate()?;
//! println!("backend: {}", config.backend.base_url);
//! # Ok::<(), brewbot::error::BrewError>(())
//! ```
//!
//! `BREWBOT_BACKEND__BASE_URL=http://10.0.0.5:5000/api/` overrides
//! `backend.base_url`.

use crate::error::{AppResult, BrewError};
use crate::session::SessionParams;
use crate::telemetry::OutputFormat;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/brewbot.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "BREWBOT_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Device backend connection
    pub backend: BackendConfig,
    /// Periodic state polling
    pub polling: PollingConfig,
    /// Orchestrator channel sizes and shutdown
    pub orchestrator: OrchestratorConfig,
    /// Default parameters for port initialization
    pub session: SessionParams,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "brewbot".to_string(),
            log_level: "info".to_string(),
            log_format: OutputFormat::Pretty,
        }
    }
}

/// Device backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Root URL of the backend API
    pub base_url: String,
    /// Upper bound for a single request, in milliseconds
    pub request_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000/api/".to_string(),
            request_timeout_ms: 2000,
        }
    }
}

impl BackendConfig {
    /// Request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Polling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Tick period shared by all pollers, in milliseconds
    pub interval_ms: u64,
    /// Poll the heat plate relay
    pub heat_plate: bool,
    /// Poll the motor relay
    pub motor: bool,
    /// Poll the temperature probe
    pub temperature: bool,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            heat_plate: true,
            motor: true,
            temperature: true,
        }
    }
}

impl PollingConfig {
    /// Tick period as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Capacity of the command mailbox
    pub command_capacity: usize,
    /// Capacity of the outcome event channel
    pub event_capacity: usize,
    /// How long shutdown waits for in-flight calls, in milliseconds
    pub shutdown_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            command_capacity: 64,
            event_capacity: 256,
            shutdown_timeout_ms: 5000,
        }
    }
}

impl OrchestratorConfig {
    /// Shutdown grace period as a [`Duration`].
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl AppConfig {
    /// Load from `config/brewbot.toml` and `BREWBOT_*` environment variables.
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path plus environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    /// The provider stack used by [`load_from`](Self::load_from).
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let level = self.application.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(BrewError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        if self.backend.base_url.trim().is_empty() {
            return Err(BrewError::Configuration(
                "backend.base_url must not be empty".to_string(),
            ));
        }
        if self.backend.request_timeout_ms == 0 {
            return Err(BrewError::Configuration(
                "backend.request_timeout_ms must be at least 1".to_string(),
            ));
        }

        if self.polling.interval_ms == 0 {
            return Err(BrewError::Configuration(
                "polling.interval_ms must be at least 1".to_string(),
            ));
        }

        if self.orchestrator.command_capacity == 0 || self.orchestrator.event_capacity == 0 {
            return Err(BrewError::Configuration(
                "orchestrator channel capacities must be at least 1".to_string(),
            ));
        }

        self.session
            .validate()
            .map_err(|e| BrewError::Configuration(format!("session: {}", e)))?;

        Ok(())
    }
}
