use anyhow::Result;
use backoffice_telemetry::config::{duration_ms, TelemetryConfig};
use backoffice_telemetry::logging::LogSubscriberConfig;
use config::{Config as ConfigLoader, Environment, File};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub port: u16,
    #[serde(with = "duration_ms", alias = "shutdown_timeout_ms")]
    pub shutdown_timeout: Duration,
    pub logging: LogSubscriberConfig,
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// `config/default`, then `config/local`, then `BACKOFFICE_*` variables
    /// with `__` between nested keys (`BACKOFFICE_TELEMETRY__SAMPLE_RATE`).
    pub fn load() -> Result<Self> {
        let config = ConfigLoader::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("BACKOFFICE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 9090,
            shutdown_timeout: Duration::from_secs(30),
            logging: LogSubscriberConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}
