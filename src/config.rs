//! Engine configuration.
//!
//! Configuration is a plain serde document. Durations are human readable
//! strings such as `"30m"`, `"5s"` or `"250ms"`. Every field has a default,
//! so an empty document plus a subscription is enough.
//!
//! # Example
//!
//! ```
//! use hemmer_arm_reconcile::EngineConfig;
//! use serde_json::json;
//!
//! let config = EngineConfig::from_json(json!({
//!     "subscription_id": "00000000-0000-0000-0000-000000000000",
//!     "timeouts": { "create": "1h" },
//!     "features": { "import_guard": false }
//! }))
//! .unwrap();
//!
//! assert_eq!(config.timeouts.create.as_secs(), 3600);
//! assert_eq!(config.timeouts.read.as_secs(), 300);
//! assert!(!config.features.import_guard);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;
use crate::lro::PollerOptions;

/// Environment variable consulted when no subscription is configured.
pub const SUBSCRIPTION_ENV: &str = "ARM_SUBSCRIPTION_ID";

/// Behavioural switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Features {
    /// Refuse to create a resource whose natural key already exists remotely.
    pub import_guard: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self { import_guard: true }
    }
}

/// Per-operation time budgets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Budget for a Create, including polling.
    #[serde(with = "humantime_serde")]
    pub create: Duration,
    /// Budget for a Read.
    #[serde(with = "humantime_serde")]
    pub read: Duration,
    /// Budget for an Update, including quiescence and polling.
    #[serde(with = "humantime_serde")]
    pub update: Duration,
    /// Budget for a Delete, including polling.
    #[serde(with = "humantime_serde")]
    pub delete: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            create: Duration::from_secs(30 * 60),
            read: Duration::from_secs(5 * 60),
            update: Duration::from_secs(30 * 60),
            delete: Duration::from_secs(30 * 60),
        }
    }
}

impl Timeouts {
    /// Use the same budget for every operation.
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            create: timeout,
            read: timeout,
            update: timeout,
            delete: timeout,
        }
    }
}

/// Configuration for an [`Engine`](crate::Engine).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Subscription new resources are created in.
    pub subscription_id: String,
    /// Behavioural switches.
    pub features: Features,
    /// Per-operation time budgets.
    pub timeouts: Timeouts,
    /// Long-running operation polling.
    pub polling: PollerOptions,
}

impl EngineConfig {
    /// Create a configuration with defaults for the given subscription.
    pub fn new(subscription_id: impl Into<String>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            ..Default::default()
        }
    }

    /// Millisecond polling and short budgets, for tests.
    pub fn for_testing(subscription_id: impl Into<String>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            features: Features::default(),
            timeouts: Timeouts::uniform(Duration::from_secs(5)),
            polling: PollerOptions::for_testing(),
        }
    }

    /// Decode a configuration document, fill the subscription from the
    /// environment if it is missing, and validate the result.
    pub fn from_json(value: Value) -> Result<Self, ConfigError> {
        let mut config: EngineConfig = serde_json::from_value(value)?;
        if config.subscription_id.is_empty() {
            if let Ok(subscription_id) = std::env::var(SUBSCRIPTION_ENV) {
                config.subscription_id = subscription_id;
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Set the import guard.
    pub fn with_import_guard(mut self, enabled: bool) -> Self {
        self.features.import_guard = enabled;
        self
    }

    /// Set the timeouts.
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set the polling options.
    pub fn with_polling(mut self, polling: PollerOptions) -> Self {
        self.polling = polling;
        self
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subscription_id.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "subscription_id must be set (or provided via {})",
                SUBSCRIPTION_ENV
            )));
        }

        let timeouts = [
            ("create", self.timeouts.create),
            ("read", self.timeouts.read),
            ("update", self.timeouts.update),
            ("delete", self.timeouts.delete),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, t)| t.is_zero()) {
            return Err(ConfigError::Invalid(format!(
                "{} timeout must be greater than zero",
                name
            )));
        }

        let backoff = &self.polling.backoff;
        if backoff.min_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "polling min interval must be greater than zero".to_string(),
            ));
        }
        if backoff.max_interval < backoff.min_interval {
            return Err(ConfigError::Invalid(
                "polling max interval must not be below the min interval".to_string(),
            ));
        }
        if !backoff.multiplier.is_finite() || backoff.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "polling multiplier must be at least 1.0, got {}",
                backoff.multiplier
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::assert_err;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::new("sub");
        assert!(config.features.import_guard);
        assert_eq!(config.timeouts.create, Duration::from_secs(1800));
        assert_eq!(config.timeouts.read, Duration::from_secs(300));
        assert_eq!(config.timeouts.update, Duration::from_secs(1800));
        assert_eq!(config.timeouts.delete, Duration::from_secs(1800));
        assert!(config.polling.honor_retry_after);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial_document() {
        let config = EngineConfig::from_json(json!({
            "subscription_id": "sub",
            "timeouts": { "delete": "1m" },
            "polling": { "backoff": { "min_interval": "250ms", "multiplier": 1.5 } }
        }))
        .unwrap();

        assert_eq!(config.timeouts.delete, Duration::from_secs(60));
        assert_eq!(config.timeouts.create, Duration::from_secs(1800));
        assert_eq!(config.polling.backoff.min_interval, Duration::from_millis(250));
        assert_eq!(config.polling.backoff.multiplier, 1.5);
    }

    #[test]
    fn test_from_json_rejects_wrong_types() {
        let result = EngineConfig::from_json(json!({
            "subscription_id": "sub",
            "timeouts": { "create": "soon" }
        }));
        assert!(matches!(result, Err(ConfigError::Decode(_))));
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let missing = EngineConfig::default();
        assert!(matches!(missing.validate(), Err(ConfigError::Invalid(_))));

        let mut zero_timeout = EngineConfig::new("sub");
        zero_timeout.timeouts.read = Duration::ZERO;
        let err = assert_err!(zero_timeout.validate());
        assert!(err.to_string().contains("read timeout"));

        let mut inverted = EngineConfig::new("sub");
        inverted.polling.backoff.max_interval = Duration::from_millis(1);
        assert!(inverted.validate().is_err());

        let mut shrinking = EngineConfig::new("sub");
        shrinking.polling.backoff.multiplier = 0.5;
        assert!(shrinking.validate().is_err());
    }

    #[test]
    fn test_serialize_round_trip() {
        let config = EngineConfig::for_testing("sub").with_import_guard(false);
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["timeouts"]["create"], "5s");
        assert_eq!(value["polling"]["backoff"]["min_interval"], "2ms");
        assert_eq!(value["features"]["import_guard"], false);

        let back = EngineConfig::from_json(value).unwrap();
        assert_eq!(back, config);
    }
}
