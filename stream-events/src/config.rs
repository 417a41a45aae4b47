use event_relay::config::{Config as RelayConfig, ValidationError};
use serde::Deserialize;
use std::fs::File;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default)]
    pub sentry_dsn: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct CommonConfig {
    pub metrics: Option<MetricsConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }

    /// Loads `path` if given, otherwise starts from defaults, then applies
    /// the environment and validates the result.
    pub fn load<F>(path: Option<&std::path::Path>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Config::default(),
        };
        config.apply_env(&lookup)?;
        config.relay.validate()?;

        Ok(config)
    }

    fn apply_env<F>(&mut self, lookup: &F) -> Result<(), ValidationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        if let Some(dsn) = lookup("SENTRY_DSN") {
            self.common.logging.get_or_insert_with(Default::default).sentry_dsn = Some(dsn);
        }

        match (lookup("STATSD_HOST"), lookup("STATSD_PORT")) {
            (None, None) => {}
            (host, port) => {
                let statsd_port = match port {
                    Some(port) => port.trim().parse().map_err(|_| ValidationError::InvalidEnv {
                        name: "STATSD_PORT",
                        value: port,
                    })?,
                    None => self.common.metrics.as_ref().map_or(8125, |m| m.statsd_port),
                };
                let statsd_host = host
                    .or_else(|| self.common.metrics.as_ref().map(|m| m.statsd_host.clone()))
                    .unwrap_or_else(|| "127.0.0.1".into());
                self.common.metrics = Some(MetricsConfig {
                    statsd_host,
                    statsd_port,
                });
            }
        }

        self.relay.apply_env(lookup)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    ValidationError(#[from] ValidationError),
}
