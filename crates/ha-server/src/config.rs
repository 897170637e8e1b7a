//! Hub configuration
//!
//! Parses `hub.yaml`, the list of weather stations this hub polls.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ha_config_entries::ConfigEntry;
use ha_update_coordinator::CONF_SCAN_INTERVAL;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::info;

use crate::weather::{
    CONF_AUTH_FAIL_AFTER, CONF_FAIL_EVERY, CONF_PUSH_INTERVAL, CONF_TIMEOUT, DOMAIN,
};

pub const DEFAULT_CONFIG_PATH: &str = "hub.yaml";

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors that can occur during configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a file
    #[error("failed to read file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML
    #[error("failed to parse YAML in {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub stations: Vec<StationConfig>,
}

/// One simulated weather station
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationConfig {
    pub name: String,

    /// Poll interval in seconds
    #[serde(default = "default_scan_interval")]
    pub scan_interval: f64,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: f64,

    /// Fail every n-th fetch with a connection error
    #[serde(default)]
    pub fail_every: Option<u32>,

    /// Reject credentials from the n-th fetch on
    #[serde(default)]
    pub auth_fail_after: Option<u32>,

    /// Push a reading every this many seconds, in addition to polling
    #[serde(default)]
    pub push_interval: Option<f64>,
}

fn default_scan_interval() -> f64 {
    30.0
}

fn default_timeout() -> f64 {
    10.0
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            stations: vec![StationConfig {
                push_interval: Some(7.0),
                ..StationConfig::new("Garden")
            }],
        }
    }
}

impl HubConfig {
    /// Load and validate a hub configuration file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: HubConfig =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseYaml {
                path: path.to_path_buf(),
                source: e,
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load `path`, or fall back to the built-in configuration if it is missing
    pub fn load_or_default(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            info!("No configuration at {}, using built-in stations", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let mut names = HashMap::new();
        for (index, station) in self.stations.iter().enumerate() {
            let key = |field: &str| format!("stations[{}].{}", index, field);

            if station.name.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: key("name"),
                    reason: "must not be empty".into(),
                });
            }
            if let Some(previous) = names.insert(station.name.as_str(), index) {
                return Err(ConfigError::InvalidValue {
                    key: key("name"),
                    reason: format!("duplicate of stations[{}]", previous),
                });
            }
            for (field, value) in [
                ("scan_interval", Some(station.scan_interval)),
                ("timeout", Some(station.timeout)),
                ("push_interval", station.push_interval),
            ] {
                if let Some(secs) = value {
                    if !(secs.is_finite() && secs > 0.0) {
                        return Err(ConfigError::InvalidValue {
                            key: key(field),
                            reason: format!("must be a positive number of seconds, got {}", secs),
                        });
                    }
                }
            }
            if station.fail_every == Some(0) {
                return Err(ConfigError::InvalidValue {
                    key: key("fail_every"),
                    reason: "must be at least 1".into(),
                });
            }
        }
        Ok(())
    }
}

impl StationConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scan_interval: default_scan_interval(),
            timeout: default_timeout(),
            fail_every: None,
            auth_fail_after: None,
            push_interval: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }

    /// The config entry representing this station
    pub fn to_config_entry(&self) -> ConfigEntry {
        let mut data = HashMap::from([(CONF_TIMEOUT.to_string(), json!(self.timeout))]);
        if let Some(n) = self.fail_every {
            data.insert(CONF_FAIL_EVERY.to_string(), json!(n));
        }
        if let Some(n) = self.auth_fail_after {
            data.insert(CONF_AUTH_FAIL_AFTER.to_string(), json!(n));
        }
        if let Some(secs) = self.push_interval {
            data.insert(CONF_PUSH_INTERVAL.to_string(), json!(secs));
        }

        ConfigEntry::new(DOMAIN, self.name.clone())
            .with_unique_id(ha_core::slugify(&self.name))
            .with_data(data)
            .with_options(HashMap::from([(
                CONF_SCAN_INTERVAL.to_string(),
                json!(self.scan_interval),
            )]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_stations() {
        let file = write_config(
            r#"
stations:
  - name: Garden
    scan_interval: 15
    fail_every: 4
  - name: Roof
    timeout: 2.5
    auth_fail_after: 10
    push_interval: 5
"#,
        );

        let config = HubConfig::load(file.path()).unwrap();
        assert_eq!(config.stations.len(), 2);

        let garden = &config.stations[0];
        assert_eq!(garden.scan_interval, 15.0);
        assert_eq!(garden.timeout, 10.0);
        assert_eq!(garden.fail_every, Some(4));

        let roof = &config.stations[1];
        assert_eq!(roof.scan_interval, 30.0);
        assert_eq!(roof.timeout(), Duration::from_millis(2500));
        assert_eq!(roof.push_interval, Some(5.0));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.yaml");

        assert!(matches!(
            HubConfig::load(&path),
            Err(ConfigError::ReadFile { .. })
        ));
        assert_eq!(HubConfig::load_or_default(&path).unwrap(), HubConfig::default());
    }

    #[test]
    fn test_invalid_yaml() {
        let file = write_config("stations: [name: {");
        assert!(matches!(
            HubConfig::load(file.path()),
            Err(ConfigError::ParseYaml { .. })
        ));
    }

    #[test]
    fn test_validation() {
        let cases = [
            ("stations:\n  - name: ''\n", "stations[0].name"),
            ("stations:\n  - name: A\n  - name: A\n", "stations[1].name"),
            ("stations:\n  - name: A\n    scan_interval: 0\n", "stations[0].scan_interval"),
            ("stations:\n  - name: A\n    timeout: -1\n", "stations[0].timeout"),
            ("stations:\n  - name: A\n    fail_every: 0\n", "stations[0].fail_every"),
        ];

        for (content, expected_key) in cases {
            let file = write_config(content);
            match HubConfig::load(file.path()) {
                Err(ConfigError::InvalidValue { key, .. }) => assert_eq!(key, expected_key),
                other => panic!("expected invalid {expected_key}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_station_to_config_entry() {
        let mut station = StationConfig::new("Back Yard");
        station.scan_interval = 45.0;
        station.fail_every = Some(3);

        let entry = station.to_config_entry();
        assert_eq!(entry.domain, DOMAIN);
        assert_eq!(entry.title, "Back Yard");
        assert_eq!(entry.unique_id.as_deref(), Some("back_yard"));
        assert_eq!(entry.option::<f64>(CONF_SCAN_INTERVAL), Some(45.0));
        assert_eq!(entry.data_value::<u32>(CONF_FAIL_EVERY), Some(3));
        assert_eq!(entry.data_value::<u32>(CONF_AUTH_FAIL_AFTER), None);
    }
}
