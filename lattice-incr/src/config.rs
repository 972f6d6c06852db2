//! Engine Configuration
//!
//! The serializable part of the configuration. Callbacks (trace and fatal
//! hooks) and the clock are supplied through [`crate::EngineBuilder`].
//!
//! ```rust,ignore
//! let config = EngineConfig::from_json(r#"{
//!     "autoBatch": {"enabled": true, "delayMs": 0},
//!     "deepEqual": {"enabled": true},
//!     "rateLimit": {"maxUpdates": 10, "windowMs": 100, "backoffMs": 500}
//! }"#)?;
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::change::EqualityPolicy;

/// Recognized engine options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub auto_batch: AutoBatchConfig,
    pub deep_equal: DeepEqualConfig,
    pub rate_limit: Option<RateLimitConfig>,
}

/// Coalesce writes made outside an explicit batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutoBatchConfig {
    pub enabled: bool,
    /// Flush delay. Zero flushes on the next timer poll.
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeepEqualConfig {
    pub enabled: bool,
}

/// Update-rate backoff for static names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    /// Writes allowed per window before backoff starts.
    pub max_updates: u32,
    pub window_ms: u64,
    pub backoff_ms: u64,
}

impl EngineConfig {
    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub(crate) fn equality(&self) -> EqualityPolicy {
        if self.deep_equal.enabled {
            EqualityPolicy::Deep
        } else {
            EqualityPolicy::Reference
        }
    }

    /// Auto-batch delay, if auto-batching is on.
    pub(crate) fn auto_batch_delay(&self) -> Option<Duration> {
        self.auto_batch
            .enabled
            .then(|| Duration::from_millis(self.auto_batch.delay_ms))
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_camel_case_options() {
        let config = EngineConfig::from_json(
            r#"{
                "autoBatch": {"enabled": true, "delayMs": 5},
                "deepEqual": {"enabled": true},
                "rateLimit": {"maxUpdates": 3, "windowMs": 100, "backoffMs": 250}
            }"#,
        )
        .unwrap();

        assert_eq!(config.auto_batch_delay(), Some(Duration::from_millis(5)));
        assert_eq!(config.equality(), EqualityPolicy::Deep);
        let rate = config.rate_limit.unwrap();
        assert_eq!(rate.max_updates, 3);
        assert_eq!(rate.backoff(), Duration::from_millis(250));
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let config = EngineConfig::from_json("{}").unwrap();

        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.auto_batch_delay(), None);
        assert_eq!(config.equality(), EqualityPolicy::Reference);
    }

    #[test]
    fn rate_limit_requires_all_fields() {
        assert!(EngineConfig::from_json(r#"{"rateLimit": {"maxUpdates": 3}}"#).is_err());
    }
}
