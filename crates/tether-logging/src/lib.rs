//! # tether-logging
//!
//! Structured logging setup with `tracing`.
//!
//! Library crates only emit `tracing` events; binaries call
//! [`init_subscriber`] once at startup. `RUST_LOG` takes precedence over the
//! configured level.

#![deny(unsafe_code)]

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Output format for log lines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable single-line output.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

/// Logging settings as they appear in configuration files.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Default filter directive, e.g. `"info"` or `"tether=debug,info"`.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Compact,
        }
    }
}

/// Build the filter: `RUST_LOG` if set and valid, otherwise `level`.
fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize the global tracing subscriber writing to stderr.
///
/// Call once at application startup. Later calls are no-ops.
pub fn init_subscriber(settings: &LogSettings) {
    let filter = build_filter(&settings.level);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    // try_init fails if a global subscriber is already set
    let _ = match settings.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings() {
        let settings = LogSettings::default();
        assert_eq!(settings.level, "info");
        assert_eq!(settings.format, LogFormat::Compact);
    }

    #[test]
    fn format_deserializes_lowercase() {
        let settings: LogSettings =
            serde_json::from_str(r#"{"level":"debug","format":"json"}"#).unwrap();
        assert_eq!(settings.level, "debug");
        assert_eq!(settings.format, LogFormat::Json);
    }

    #[test]
    fn invalid_level_falls_back() {
        // Must not panic on garbage directives.
        let _filter = build_filter("[[not a directive");
    }

    #[test]
    fn init_subscriber_does_not_panic() {
        init_subscriber(&LogSettings::default());
        init_subscriber(&LogSettings {
            level: "debug".into(),
            format: LogFormat::Json,
        });
    }
}
