//! Layered settings.
//!
//! Loading order, later layers win:
//! 1. Compiled [`Settings::default()`]
//! 2. An optional JSON file
//! 3. `TETHER_`-prefixed environment variables, `__` separating nested keys
//!    (`TETHER_HUB__SHARD_COUNT=32`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized};
use serde::{Deserialize, Serialize};
use tether::HubConfig;
use tether_logging::LogSettings;
use tracing::debug;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "TETHER_";

/// Errors that can occur when loading settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// The requested settings file does not exist.
    #[error("settings file not found: {}", .0.display())]
    NotFound(PathBuf),
    /// A layer could not be parsed or merged.
    #[error("failed to load settings: {0}")]
    Figment(#[from] figment::Error),
    /// A value was out of range.
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;

/// Listener settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Host to bind.
    pub host: String,
    /// Port to bind (0 for auto-assign).
    pub port: u16,
    /// How long shutdown waits for connections to close.
    pub shutdown_grace_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3000,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl ServerSettings {
    /// Shutdown grace period.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Demo behaviour settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoSettings {
    /// Topic the clock publishes to and every connection subscribes to.
    pub clock_topic: String,
    /// Clock publish interval.
    pub clock_interval_ms: u64,
}

impl Default for DemoSettings {
    fn default() -> Self {
        Self {
            clock_topic: "server-time".into(),
            clock_interval_ms: 1_000,
        }
    }
}

impl DemoSettings {
    /// Clock publish interval.
    pub fn clock_interval(&self) -> Duration {
        Duration::from_millis(self.clock_interval_ms)
    }
}

/// Everything the server binary is configured with.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Listener.
    pub server: ServerSettings,
    /// Hub tunables.
    pub hub: HubConfig,
    /// Log output.
    pub logging: LogSettings,
    /// Demo behaviour.
    pub demo: DemoSettings,
}

impl Settings {
    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            return Err(SettingsError::InvalidValue("server.host is empty".into()));
        }
        if self.demo.clock_topic.is_empty() {
            return Err(SettingsError::InvalidValue("demo.clock_topic is empty".into()));
        }
        if self.demo.clock_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "demo.clock_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Load settings from defaults, an optional JSON file, and the environment.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let mut figment = Figment::from(Serialized::defaults(Settings::default()));
    if let Some(path) = path {
        if !path.exists() {
            return Err(SettingsError::NotFound(path.to_path_buf()));
        }
        debug!(?path, "loading settings from file");
        figment = figment.merge(Json::file(path));
    }
    let settings: Settings = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()?;
    settings.validate()?;
    Ok(settings)
}
