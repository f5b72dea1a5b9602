//! Ordered list of broker addresses used for failover.

use crate::error::ConfigurationError;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Non-empty, ordered list of broker addresses.
///
/// The connection manager rotates through the list on every failed attempt,
/// wrapping around at the end.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct EndpointList(Vec<String>);

impl EndpointList {
    /// Create an endpoint list, rejecting an empty list or blank entries.
    pub fn new<I, S>(endpoints: I) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let endpoints: Vec<String> = endpoints
            .into_iter()
            .map(|endpoint| endpoint.into().trim().to_string())
            .collect();

        if endpoints.is_empty() {
            return Err(ConfigurationError::Missing {
                key: "endpoints".to_string(),
            });
        }

        if let Some(position) = endpoints.iter().position(|endpoint| endpoint.is_empty()) {
            return Err(ConfigurationError::Invalid {
                message: format!("endpoint at position {} is blank", position),
            });
        }

        Ok(Self(endpoints))
    }

    /// Address to use for the given attempt number.
    pub fn select(&self, attempt: usize) -> &str {
        &self.0[attempt % self.0.len()]
    }

    /// First address in the list.
    pub fn primary(&self) -> &str {
        &self.0[0]
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; kept alongside [`EndpointList::len`].
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.0.iter().any(|endpoint| endpoint == address)
    }
}

impl fmt::Display for EndpointList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(","))
    }
}

/// Parses a comma separated list, e.g. `amqp://a,amqp://b`.
impl FromStr for EndpointList {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Self::new(Vec::<String>::new());
        }
        Self::new(s.split(','))
    }
}

impl TryFrom<Vec<String>> for EndpointList {
    type Error = ConfigurationError;

    fn try_from(value: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

#[cfg(test)]
#[path = "endpoint_tests.rs"]
mod tests;
