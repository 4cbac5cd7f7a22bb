//! Filter system configuration with validation.

use super::criteria::MAX_TOPICS;
use crate::error::FilterError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Filter system configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSystemConfig {
    /// Reject subscriptions that need full log data
    pub light_mode: bool,
    /// Per-subscription delivery buffer; oldest entries are dropped on overflow
    pub delivery_buffer: usize,
    /// Maximum topic slots in a log filter
    pub max_topics_per_filter: usize,
    /// Maximum addresses in a log filter
    pub max_addresses_per_filter: usize,
    /// Polling filters not polled within this many seconds are removed
    pub filter_timeout_secs: u64,
    /// Interval of the expired-filter sweep
    pub filter_sweep_interval_secs: u64,
    /// Maximum concurrent polling filters
    pub max_filters: usize,
}

impl Default for FilterSystemConfig {
    fn default() -> Self {
        Self {
            light_mode: false,
            delivery_buffer: 64,
            max_topics_per_filter: MAX_TOPICS,
            max_addresses_per_filter: 1000,
            filter_timeout_secs: 300,
            filter_sweep_interval_secs: 60,
            max_filters: 10_000,
        }
    }
}

impl FilterSystemConfig {
    /// Configuration for a node without log data.
    pub fn light() -> Self {
        Self {
            light_mode: true,
            ..Self::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), FilterError> {
        if self.delivery_buffer == 0 {
            return Err(FilterError::InvalidConfig(
                "delivery_buffer cannot be 0".into(),
            ));
        }

        if self.max_topics_per_filter == 0 || self.max_topics_per_filter > MAX_TOPICS {
            return Err(FilterError::InvalidConfig(format!(
                "max_topics_per_filter must be in 1..={}, got {}",
                MAX_TOPICS, self.max_topics_per_filter
            )));
        }

        if self.max_addresses_per_filter == 0 {
            return Err(FilterError::InvalidConfig(
                "max_addresses_per_filter cannot be 0".into(),
            ));
        }

        if self.filter_timeout_secs == 0 {
            return Err(FilterError::InvalidConfig(
                "filter_timeout_secs cannot be 0".into(),
            ));
        }

        if self.filter_sweep_interval_secs == 0 {
            return Err(FilterError::InvalidConfig(
                "filter_sweep_interval_secs cannot be 0".into(),
            ));
        }

        if self.max_filters == 0 {
            return Err(FilterError::InvalidConfig("max_filters cannot be 0".into()));
        }

        Ok(())
    }

    pub fn filter_timeout(&self) -> Duration {
        Duration::from_secs(self.filter_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.filter_sweep_interval_secs)
    }
}
