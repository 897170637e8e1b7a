//! Coordinator configuration
//!
//! Durations are written as (fractional) seconds wherever the configuration
//! is deserialized, matching the `scan_interval` option of config entries.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Config entry option holding the poll interval in seconds
pub const CONF_SCAN_INTERVAL: &str = "scan_interval";

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Name used in log messages
    pub name: String,

    /// Poll interval; `None` only refreshes on demand
    #[serde(default, with = "option_seconds")]
    pub update_interval: Option<Duration>,

    /// Upper bound on one fetch
    #[serde(default = "default_request_timeout", with = "seconds")]
    pub request_timeout: Duration,

    /// Debounce window for `request_refresh`; `None` disables debouncing
    #[serde(default, with = "option_seconds")]
    pub request_refresh_cooldown: Option<Duration>,

    /// Notify listeners even when a fetch returns unchanged data
    #[serde(default = "default_always_update")]
    pub always_update: bool,
}

fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

fn default_always_update() -> bool {
    true
}

impl CoordinatorConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            update_interval: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            request_refresh_cooldown: None,
            always_update: true,
        }
    }

    /// Build a config from config entry options
    ///
    /// A missing, non-numeric or non-positive `scan_interval` leaves the
    /// coordinator on demand only.
    pub fn from_options(
        name: impl Into<String>,
        options: &HashMap<String, serde_json::Value>,
    ) -> Self {
        let update_interval = options
            .get(CONF_SCAN_INTERVAL)
            .and_then(serde_json::Value::as_f64)
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64);

        Self {
            update_interval,
            ..Self::new(name)
        }
    }

    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = Some(interval);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_request_refresh_cooldown(mut self, cooldown: Duration) -> Self {
        self.request_refresh_cooldown = Some(cooldown);
        self
    }

    pub fn with_always_update(mut self, always_update: bool) -> Self {
        self.always_update = always_update;
        self
    }
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod option_seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::new("garden");
        assert_eq!(config.update_interval, None);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.request_refresh_cooldown, None);
        assert!(config.always_update);
    }

    #[test]
    fn test_from_options() {
        let options = HashMap::from([(CONF_SCAN_INTERVAL.to_string(), json!(90))]);
        let config = CoordinatorConfig::from_options("garden", &options);
        assert_eq!(config.update_interval, Some(Duration::from_secs(90)));

        let options = HashMap::from([(CONF_SCAN_INTERVAL.to_string(), json!(2.5))]);
        let config = CoordinatorConfig::from_options("garden", &options);
        assert_eq!(config.update_interval, Some(Duration::from_millis(2500)));

        for bad in [json!("often"), json!(0), json!(-5)] {
            let options = HashMap::from([(CONF_SCAN_INTERVAL.to_string(), bad)]);
            assert_eq!(
                CoordinatorConfig::from_options("garden", &options).update_interval,
                None
            );
        }
        assert_eq!(
            CoordinatorConfig::from_options("garden", &HashMap::new()).update_interval,
            None
        );
    }

    #[test]
    fn test_deserialize_seconds() {
        let config: CoordinatorConfig = serde_yaml::from_str(
            "name: roof\nupdate_interval: 60\nrequest_timeout: 0.5\nrequest_refresh_cooldown: 10\n",
        )
        .unwrap();

        assert_eq!(config.name, "roof");
        assert_eq!(config.update_interval, Some(Duration::from_secs(60)));
        assert_eq!(config.request_timeout, Duration::from_millis(500));
        assert_eq!(config.request_refresh_cooldown, Some(Duration::from_secs(10)));
        assert!(config.always_update);
    }

    #[test]
    fn test_deserialize_minimal_and_invalid() {
        let config: CoordinatorConfig = serde_yaml::from_str("name: roof\n").unwrap();
        assert_eq!(config, CoordinatorConfig::new("roof"));

        let negative = "name: roof\nrequest_timeout: -1\n";
        assert!(serde_yaml::from_str::<CoordinatorConfig>(negative).is_err());
    }

    #[test]
    fn test_serialize_as_seconds() {
        let config = CoordinatorConfig::new("roof").with_update_interval(Duration::from_secs(15));
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["update_interval"], json!(15.0));
        assert_eq!(value["request_timeout"], json!(30.0));
        assert!(value["request_refresh_cooldown"].is_null());
    }
}
