use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::producer::RefreshIntervals;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("workers must be greater than zero")]
    NoWorkers,
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
    #[error("rate limit must be a positive number of requests per second, got {0}")]
    InvalidRateLimit(f64),
    #[error("rate limit burst must be greater than zero")]
    ZeroBurst,
    #[error("max samples must be greater than zero")]
    NoSamples,
}

/// Tunables for a flood run.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FloodConfig {
    pub workers: usize,
    /// Requests per second across all workers. Unlimited when unset.
    pub rate_limit: Option<f64>,
    pub rate_limit_burst: u32,
    pub refresh_interval_secs: u64,
    pub empty_block_backoff_secs: u64,
    pub report_interval_secs: u64,
    /// Stop after this many generated queries.
    pub max_queries: Option<u64>,
    /// Cap on each sampled list of a chain snapshot.
    pub max_samples: usize,
    /// Fixed RNG seed for reproducible query streams.
    pub seed: Option<u64>,
}

impl Default for FloodConfig {
    fn default() -> Self {
        Self {
            workers: 250,
            rate_limit: None,
            rate_limit_burst: 10,
            refresh_interval_secs: 15,
            empty_block_backoff_secs: 5,
            report_interval_secs: 1,
            max_queries: None,
            max_samples: 256,
            seed: None,
        }
    }
}

impl FloodConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        for (name, value) in [
            ("refresh_interval_secs", self.refresh_interval_secs),
            ("empty_block_backoff_secs", self.empty_block_backoff_secs),
            ("report_interval_secs", self.report_interval_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroInterval(name));
            }
        }
        if let Some(rate) = self.rate_limit {
            if !(rate.is_finite() && rate > 0.0) {
                return Err(ConfigError::InvalidRateLimit(rate));
            }
        }
        if self.rate_limit_burst == 0 {
            return Err(ConfigError::ZeroBurst);
        }
        if self.max_samples == 0 {
            return Err(ConfigError::NoSamples);
        }
        Ok(())
    }

    pub fn refresh_intervals(&self) -> RefreshIntervals {
        RefreshIntervals {
            refresh: Duration::from_secs(self.refresh_interval_secs),
            empty_block_backoff: Duration::from_secs(self.empty_block_backoff_secs),
        }
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }
}
