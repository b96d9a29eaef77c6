//! Sofia transit configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffConfig;
use crate::error::TransitError;
use crate::tokens::DEFAULT_TOKEN_LIFESPAN_SECS;

/// Environment variable prefix for layered loading
pub const ENV_PREFIX: &str = "SOFIA_TRANSIT";

/// Configuration for polling sofiatraffic.bg
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SofiaTransitConfig {
    /// Comma-separated list of stop ids, e.g. "1287,2330"
    #[serde(default)]
    pub bus_stop_ids: String,

    /// Base URL of the provider
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Attempts per stop fetch
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Seconds before acquired tokens are considered stale
    #[serde(default = "default_token_lifespan_secs")]
    pub token_lifespan_secs: u64,

    /// Seconds between refresh cycles
    #[serde(default = "default_update_interval_secs")]
    pub update_interval_secs: u64,

    /// Consecutive empty cycles tolerated before stale data stops being served
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Browser User-Agent sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Accept-Language sent with every request
    #[serde(default = "default_accept_language")]
    pub accept_language: String,

    /// Retry delays
    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_base_url() -> String {
    "https://www.sofiatraffic.bg".to_string()
}

const fn default_timeout_secs() -> u64 {
    15
}

const fn default_max_attempts() -> u32 {
    4
}

const fn default_token_lifespan_secs() -> u64 {
    DEFAULT_TOKEN_LIFESPAN_SECS
}

const fn default_update_interval_secs() -> u64 {
    60
}

const fn default_failure_threshold() -> u32 {
    3
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (X11; Linux x86_64; rv:127.0) Gecko/20100101 Firefox/134.0".to_string()
}

fn default_accept_language() -> String {
    "bg-BG,bg;q=0.9,en;q=0.8".to_string()
}

impl Default for SofiaTransitConfig {
    fn default() -> Self {
        Self {
            bus_stop_ids: String::new(),
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            token_lifespan_secs: default_token_lifespan_secs(),
            update_interval_secs: default_update_interval_secs(),
            failure_threshold: default_failure_threshold(),
            user_agent: default_user_agent(),
            accept_language: default_accept_language(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl SofiaTransitConfig {
    /// Create a configuration suitable for testing against a mock server
    #[must_use]
    pub fn for_testing(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout_secs: 5,
            backoff: BackoffConfig::immediate(),
            ..Default::default()
        }
    }

    /// Load configuration from an optional TOML file and the environment
    ///
    /// Environment variables use the `SOFIA_TRANSIT_` prefix and `__` for
    /// nesting, e.g. `SOFIA_TRANSIT_BUS_STOP_IDS=1287,2330` or
    /// `SOFIA_TRANSIT_BACKOFF__MAX_DELAY_MS=4000`.
    ///
    /// # Errors
    ///
    /// Returns [`TransitError::Configuration`] if a source cannot be read or
    /// does not deserialize.
    pub fn load(file: Option<&Path>) -> Result<Self, TransitError> {
        let mut builder = config::Config::builder();
        builder = match file {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(config::File::with_name("sofia_transit").required(false)),
        };
        // Values stay strings so stop ids keep their leading zeros
        let builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__"),
        );

        builder
            .build()
            .and_then(|built| built.try_deserialize())
            .map_err(|e| TransitError::Configuration(e.to_string()))
    }

    /// Parsed and validated stop ids
    ///
    /// # Errors
    ///
    /// Returns [`TransitError::Validation`] for a non-numeric or empty entry.
    pub fn stop_ids(&self) -> Result<Vec<String>, TransitError> {
        parse_stop_ids(&self.bus_stop_ids)
    }

    /// Time between refresh cycles
    #[must_use]
    pub const fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), TransitError> {
        if self.base_url.is_empty() {
            return Err(TransitError::Configuration(
                "base_url must not be empty".to_string(),
            ));
        }

        if self.timeout_secs == 0 {
            return Err(TransitError::Configuration(
                "timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.max_attempts == 0 {
            return Err(TransitError::Configuration(
                "max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.update_interval_secs == 0 {
            return Err(TransitError::Configuration(
                "update_interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.failure_threshold == 0 {
            return Err(TransitError::Configuration(
                "failure_threshold must be greater than 0".to_string(),
            ));
        }

        self.stop_ids().map(|_| ())
    }
}

/// Split a comma-separated stop list, rejecting anything but digits
pub fn parse_stop_ids(raw: &str) -> Result<Vec<String>, TransitError> {
    let ids: Vec<String> = raw.split(',').map(|id| id.trim().to_string()).collect();

    if let Some(bad) = ids
        .iter()
        .find(|id| id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()))
    {
        return Err(TransitError::Validation(format!(
            "invalid bus stop id {bad:?} in {raw:?}"
        )));
    }

    Ok(ids)
}
