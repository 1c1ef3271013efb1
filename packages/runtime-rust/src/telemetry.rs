//! Process-wide `tracing` subscriber setup.

use serde::Deserialize;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    /// Filter directive used when `RUST_LOG` is unset, e.g. `info` or
    /// `courier_runtime=debug,info`.
    pub log_level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
        }
    }
}

/// `RUST_LOG` when set, otherwise the configured level.
#[must_use]
pub fn env_filter(config: &TracingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing(config: &TracingConfig) -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::registry().with(env_filter(config));

    if config.json {
        subscriber
            .with(fmt::layer().json().with_target(true))
            .try_init()?;
    } else {
        subscriber.with(fmt::layer().with_target(true)).try_init()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_info_text() {
        let config = TracingConfig::default();
        assert_eq!(config.log_level, "info");
        assert!(!config.json);
    }

    #[test]
    fn config_parses_from_json() {
        let config: TracingConfig =
            serde_json::from_str(r#"{"log_level": "debug", "json": true}"#).unwrap();
        assert_eq!(config.log_level, "debug");
        assert!(config.json);
    }

    #[test]
    fn second_init_fails() {
        let config = TracingConfig::default();
        let _ = init_tracing(&config);
        assert!(init_tracing(&config).is_err());
    }
}
