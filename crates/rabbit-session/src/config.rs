//! Session configuration.
//!
//! Sources, later ones overriding earlier ones:
//!
//! 1. Built-in defaults (every field has one).
//! 2. An optional file; TOML, YAML or JSON by extension.
//! 3. Environment variables prefixed `RABBIT_SESSION__`, with `__` between
//!    nested keys: `RABBIT_SESSION__RECONNECT__MAX_DELAY_MS=10000`.
//!    `RABBIT_SESSION__ENDPOINTS` takes a comma-separated list.

use crate::backoff::{BackoffPolicy, DEFAULT_INITIAL_DELAY, MAX_RECONNECT_DELAY};
use crate::endpoint::EndpointList;
use crate::error::ConfigurationError;
use crate::session::DEFAULT_SUBSCRIPTION_BUFFER;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Prefix of environment variables read by [`SessionConfig::load`].
pub const ENV_PREFIX: &str = "RABBIT_SESSION";

const DEFAULT_ENDPOINT: &str = "amqp://localhost";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Broker addresses in failover order.
    pub endpoints: Vec<String>,
    pub reconnect: ReconnectConfig,
    /// Messages buffered per subscription when no prefetch is set.
    pub subscription_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![DEFAULT_ENDPOINT.to_string()],
            reconnect: ReconnectConfig::default(),
            subscription_buffer: DEFAULT_SUBSCRIPTION_BUFFER,
        }
    }
}

impl SessionConfig {
    /// Load from an optional file and the environment.
    ///
    /// A given file must exist. Values that cannot be coerced to the right type
    /// fail the load rather than falling back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            debug!(path = %path.display(), "loading configuration file");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let loaded: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("endpoints")
                    .try_parsing(true),
            )
            .build()
            .and_then(config::Config::try_deserialize)
            .map_err(|err| ConfigurationError::Parsing {
                message: err.to_string(),
            })?;

        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.endpoint_list()?;
        self.reconnect.validate()?;

        if self.subscription_buffer == 0 {
            return Err(ConfigurationError::Invalid {
                message: "subscription_buffer must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn endpoint_list(&self) -> Result<EndpointList, ConfigurationError> {
        EndpointList::new(&self.endpoints)
    }
}

/// Reconnect schedule, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: DEFAULT_INITIAL_DELAY.as_millis() as u64,
            max_delay_ms: MAX_RECONNECT_DELAY.as_millis() as u64,
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl ReconnectConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.initial_delay_ms == 0 {
            return Err(ConfigurationError::Invalid {
                message: "reconnect.initial_delay_ms must be greater than zero".to_string(),
            });
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "reconnect.max_delay_ms ({}) is below reconnect.initial_delay_ms ({})",
                    self.max_delay_ms, self.initial_delay_ms
                ),
            });
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "reconnect.multiplier must be at least 1.0, got {}",
                    self.multiplier
                ),
            });
        }
        Ok(())
    }

    pub fn to_policy(&self) -> BackoffPolicy {
        let policy = BackoffPolicy::new(
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.multiplier,
        );
        if self.jitter {
            policy.with_jitter()
        } else {
            policy
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
