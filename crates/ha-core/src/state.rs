//! Observable state of a single entity

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EntityId, MAX_STATE_LENGTH, STATE_UNAVAILABLE, STATE_UNKNOWN};

/// Extra key/value data attached to a state
pub type Attributes = HashMap<String, serde_json::Value>;

/// The state of an entity at a point in time
///
/// The value is always a string ("21.5", "on", "unavailable"); everything
/// else an entity wants to expose goes into `attributes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub entity_id: EntityId,

    pub state: String,

    #[serde(default)]
    pub attributes: Attributes,

    /// Last time `state` took a different value
    pub last_changed: DateTime<Utc>,

    /// Last time the state or its attributes were written
    pub last_updated: DateTime<Utc>,
}

impl State {
    pub fn new(entity_id: EntityId, state: impl Into<String>, attributes: Attributes) -> Self {
        let now = Utc::now();
        Self {
            entity_id,
            state: clamp(state.into()),
            attributes,
            last_changed: now,
            last_updated: now,
        }
    }

    /// Derive the next state, keeping `last_changed` when the value is unchanged
    pub fn with_update(&self, state: impl Into<String>, attributes: Attributes) -> Self {
        let now = Utc::now();
        let state = clamp(state.into());
        let last_changed = if state == self.state {
            self.last_changed
        } else {
            now
        };

        Self {
            entity_id: self.entity_id.clone(),
            state,
            attributes,
            last_changed,
            last_updated: now,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        self.state == STATE_UNAVAILABLE
    }

    pub fn is_unknown(&self) -> bool {
        self.state == STATE_UNKNOWN
    }

    /// Read and deserialize one attribute
    pub fn attribute<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.attributes
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

fn clamp(state: String) -> String {
    if state.len() > MAX_STATE_LENGTH {
        STATE_UNKNOWN.to_string()
    } else {
        state
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        // timestamps are bookkeeping, not identity
        self.entity_id == other.entity_id
            && self.state == other.state
            && self.attributes == other.attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temperature() -> EntityId {
        EntityId::new("sensor", "temperature").unwrap()
    }

    #[test]
    fn test_update_keeps_last_changed_for_same_value() {
        let first = State::new(temperature(), "20", Attributes::new());
        std::thread::sleep(std::time::Duration::from_millis(5));

        let same = first.with_update("20", Attributes::new());
        assert_eq!(same.last_changed, first.last_changed);
        assert!(same.last_updated > first.last_updated);

        let changed = same.with_update("21", Attributes::new());
        assert!(changed.last_changed > first.last_changed);
    }

    #[test]
    fn test_oversized_state_becomes_unknown() {
        let state = State::new(temperature(), "x".repeat(MAX_STATE_LENGTH + 1), Attributes::new());
        assert!(state.is_unknown());
    }

    #[test]
    fn test_attribute_lookup() {
        let attrs = Attributes::from([("unit_of_measurement".to_string(), json!("°C"))]);
        let state = State::new(temperature(), STATE_UNAVAILABLE, attrs);

        assert!(state.is_unavailable());
        assert_eq!(
            state.attribute::<String>("unit_of_measurement").as_deref(),
            Some("°C")
        );
        assert_eq!(state.attribute::<u32>("unit_of_measurement"), None);
        assert_eq!(state.attribute::<String>("missing"), None);
    }

    #[test]
    fn test_equality_ignores_timestamps() {
        let a = State::new(temperature(), "20", Attributes::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = State::new(temperature(), "20", Attributes::new());
        assert_eq!(a, b);
    }
}
