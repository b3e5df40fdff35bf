//! Socket URL resolution.
//!
//! The URL is resolved on every connect (including each reconnect attempt)
//! so an environment override set while the process runs is picked up by
//! the next attempt.

use crate::config::{Endpoints, Environment, TransportConfig};

use super::TransportError;

/// Environment variable that overrides the configured endpoint.
pub const ENDPOINT_ENV: &str = "VOICE_CALL_ENDPOINT";

/// Maps the selected [`Environment`] to a concrete socket URL.
#[derive(Debug, Clone)]
pub struct Endpoint {
    environment: Environment,
    endpoints: Endpoints,
}

impl Endpoint {
    pub fn new(environment: Environment, endpoints: Endpoints) -> Self {
        Self {
            environment,
            endpoints,
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(config.environment, config.endpoints.clone())
    }

    /// Resolve the URL, honouring [`ENDPOINT_ENV`].
    pub fn resolve(&self) -> Result<String, TransportError> {
        self.resolve_with(std::env::var(ENDPOINT_ENV).ok())
    }

    fn resolve_with(&self, env_override: Option<String>) -> Result<String, TransportError> {
        if let Some(url) = env_override.filter(|u| !u.trim().is_empty()) {
            return Ok(url.trim().to_string());
        }

        let url = match self.environment {
            Environment::Production => &self.endpoints.production,
            Environment::Local => &self.endpoints.local,
        };

        if url.trim().is_empty() {
            return Err(TransportError::Endpoint(format!(
                "no socket URL configured for {:?}",
                self.environment
            )));
        }
        Ok(url.trim().to_string())
    }
}
