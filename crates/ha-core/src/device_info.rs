//! Device metadata carried by entities

use serde::{Deserialize, Serialize};

/// Describes the physical or logical device an entity belongs to
///
/// Entities hold one of these by value; it is never looked up from a
/// registry by the coordinator layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// `(integration domain, vendor id)` pairs that identify the device
    #[serde(default)]
    pub identifiers: Vec<(String, String)>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sw_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration_url: Option<String>,
}

impl DeviceInfo {
    pub fn new(domain: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            identifiers: vec![(domain.into(), id.into())],
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_sw_version(mut self, sw_version: impl Into<String>) -> Self {
        self.sw_version = Some(sw_version.into());
        self
    }

    pub fn with_configuration_url(mut self, url: impl Into<String>) -> Self {
        self.configuration_url = Some(url.into());
        self
    }

    /// Whether `(domain, id)` is one of this device's identifiers
    pub fn has_identifier(&self, domain: &str, id: &str) -> bool {
        self.identifiers
            .iter()
            .any(|(d, i)| d == domain && i == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_identifiers() {
        let info = DeviceInfo::new("weather_station", "ws-01")
            .with_name("Garden")
            .with_manufacturer("Acme")
            .with_model("WS-3000");

        assert!(info.has_identifier("weather_station", "ws-01"));
        assert!(!info.has_identifier("weather_station", "ws-02"));
        assert_eq!(info.name.as_deref(), Some("Garden"));
        assert_eq!(info.sw_version, None);
    }

    #[test]
    fn test_serializes_without_empty_fields() {
        let info = DeviceInfo::new("weather_station", "ws-01").with_name("Garden");
        let json = serde_json::to_value(&info).unwrap();

        assert_eq!(json["name"], "Garden");
        assert!(json.get("model").is_none());
        assert_eq!(json["identifiers"][0][1], "ws-01");
    }
}
