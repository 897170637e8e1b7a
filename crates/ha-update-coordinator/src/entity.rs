//! Entities backed by a coordinator
//!
//! An entity is composed, not inherited: it holds a coordinator handle, a
//! description saying which field of the snapshot it renders, and the
//! device it belongs to. Once added to the host it rewrites its state in
//! the [`StateMachine`] after every coordinator cycle.

use std::sync::{Arc, Mutex, MutexGuard};

use ha_core::{
    Attributes, DeviceInfo, EntityId, EntityIdError, State, STATE_UNAVAILABLE, STATE_UNKNOWN,
};
use ha_state_machine::StateMachine;
use serde_json::json;
use tracing::{debug, warn};

use crate::coordinator::DataUpdateCoordinator;
use crate::listener::RemoveListener;

pub type ValueFn<T> = Arc<dyn Fn(&T) -> Option<String> + Send + Sync>;
pub type AttributesFn<T> = Arc<dyn Fn(&T) -> Attributes + Send + Sync>;

pub const DEFAULT_DOMAIN: &str = "sensor";

/// Which part of the snapshot an entity renders
pub struct EntityDescription<T> {
    /// Stable key, unique per device; also the listener context
    pub key: String,
    pub name: String,
    pub domain: String,
    pub unit_of_measurement: Option<String>,
    /// Extract the state value; `None` renders as unknown
    pub value_fn: ValueFn<T>,
    pub attributes_fn: Option<AttributesFn<T>>,
}

impl<T> EntityDescription<T> {
    pub fn new(
        key: impl Into<String>,
        name: impl Into<String>,
        value_fn: impl Fn(&T) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            domain: DEFAULT_DOMAIN.to_string(),
            unit_of_measurement: None,
            value_fn: Arc::new(value_fn),
            attributes_fn: None,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit_of_measurement = Some(unit.into());
        self
    }

    pub fn with_attributes(
        mut self,
        attributes_fn: impl Fn(&T) -> Attributes + Send + Sync + 'static,
    ) -> Self {
        self.attributes_fn = Some(Arc::new(attributes_fn));
        self
    }
}

impl<T> Clone for EntityDescription<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            name: self.name.clone(),
            domain: self.domain.clone(),
            unit_of_measurement: self.unit_of_measurement.clone(),
            value_fn: Arc::clone(&self.value_fn),
            attributes_fn: self.attributes_fn.clone(),
        }
    }
}

struct Registration {
    remove: RemoveListener,
    states: Arc<StateMachine>,
}

pub struct CoordinatorEntity<T> {
    coordinator: DataUpdateCoordinator<T>,
    description: EntityDescription<T>,
    device_info: Option<DeviceInfo>,
    entity_id: EntityId,
    name: String,
    unique_id: Option<String>,
    registration: Mutex<Option<Registration>>,
}

impl<T: Send + Sync + 'static> CoordinatorEntity<T> {
    /// Create an entity; its id is derived from the device and entity names
    pub fn new(
        coordinator: DataUpdateCoordinator<T>,
        description: EntityDescription<T>,
        device_info: Option<DeviceInfo>,
    ) -> Result<Self, EntityIdError> {
        let name = match device_info.as_ref().and_then(|info| info.name.as_deref()) {
            Some(device_name) => format!("{} {}", device_name, description.name),
            None => description.name.clone(),
        };
        let entity_id = EntityId::from_name(description.domain.clone(), &name)?;
        let unique_id = device_info
            .as_ref()
            .and_then(|info| info.identifiers.first())
            .map(|(_, id)| format!("{}_{}", id, description.key));

        Ok(Self {
            coordinator,
            description,
            device_info,
            entity_id,
            name,
            unique_id,
            registration: Mutex::new(None),
        })
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    /// Display name: device name followed by the entity name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unique_id(&self) -> Option<&str> {
        self.unique_id.as_deref()
    }

    pub fn description(&self) -> &EntityDescription<T> {
        &self.description
    }

    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.device_info.as_ref()
    }

    pub fn coordinator(&self) -> &DataUpdateCoordinator<T> {
        &self.coordinator
    }

    /// Available while the last cycle succeeded and there is data to show
    pub fn available(&self) -> bool {
        self.coordinator.last_update_success() && self.coordinator.read_latest().is_some()
    }

    pub fn native_state(&self) -> String {
        if !self.available() {
            return STATE_UNAVAILABLE.to_string();
        }
        self.coordinator
            .read_latest()
            .and_then(|data| (self.description.value_fn)(&data))
            .unwrap_or_else(|| STATE_UNKNOWN.to_string())
    }

    pub fn state_attributes(&self) -> Attributes {
        let mut attributes = Attributes::new();
        if let Some(attributes_fn) = &self.description.attributes_fn {
            if let Some(data) = self.coordinator.read_latest() {
                attributes.extend(attributes_fn(&data));
            }
        }

        attributes.insert("friendly_name".to_string(), json!(self.name));
        if let Some(unit) = &self.description.unit_of_measurement {
            attributes.insert("unit_of_measurement".to_string(), json!(unit));
        }
        if let Some(info) = &self.device_info {
            match serde_json::to_value(info) {
                Ok(device) => {
                    attributes.insert("device".to_string(), device);
                }
                Err(err) => {
                    warn!(entity_id = %self.entity_id, "Cannot serialize device info: {}", err)
                }
            }
        }
        attributes
    }

    pub fn is_added(&self) -> bool {
        self.registration().is_some()
    }

    /// Write the current state, subscribe to the coordinator
    ///
    /// Adding an entity that is already added does nothing.
    pub fn added_to_hass(self: &Arc<Self>, states: Arc<StateMachine>) {
        {
            let mut registration = self.registration();
            if registration.is_some() {
                debug!(entity_id = %self.entity_id, "Entity already added");
                return;
            }

            let weak = Arc::downgrade(self);
            let remove = self.coordinator.add_listener_with_context(
                move || {
                    if let Some(entity) = weak.upgrade() {
                        entity.write_state();
                    }
                },
                self.description.key.clone(),
            );
            *registration = Some(Registration { remove, states });
        }

        debug!(entity_id = %self.entity_id, "Entity added");
        self.write_state();
    }

    /// Unsubscribe and remove the state; safe to call repeatedly
    pub fn will_remove_from_hass(&self) {
        let Some(registration) = self.registration().take() else {
            return;
        };
        registration.remove.remove();
        registration.states.remove(&self.entity_id);
        debug!(entity_id = %self.entity_id, "Entity removed");
    }

    /// Ask the coordinator for fresh data
    pub async fn update(&self) {
        self.coordinator.request_refresh().await;
    }

    /// Push the current state into the state machine, if added
    pub fn write_state(&self) -> Option<State> {
        let states = self
            .registration()
            .as_ref()
            .map(|registration| Arc::clone(&registration.states))?;
        Some(states.set(
            self.entity_id.clone(),
            self.native_state(),
            self.state_attributes(),
        ))
    }

    fn registration(&self) -> MutexGuard<'_, Option<Registration>> {
        self.registration
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T> std::fmt::Debug for CoordinatorEntity<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorEntity")
            .field("entity_id", &self.entity_id)
            .field("unique_id", &self.unique_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::error::UpdateError;
    use crate::source::FnSource;

    #[derive(Debug, Clone)]
    struct Reading {
        temperature: Option<f64>,
    }

    fn coordinator(reading: Reading) -> DataUpdateCoordinator<Reading> {
        DataUpdateCoordinator::new(
            CoordinatorConfig::new("garden"),
            FnSource::new(move || {
                let reading = reading.clone();
                async move { Ok::<_, UpdateError>(reading) }
            }),
        )
    }

    fn temperature() -> EntityDescription<Reading> {
        EntityDescription::new("temperature", "Temperature", |r: &Reading| {
            r.temperature.map(|t| t.to_string())
        })
        .with_unit("°C")
    }

    #[test]
    fn test_entity_id_and_unique_id() {
        let device = DeviceInfo::new("weather_station", "ws-01").with_name("Garden Station");
        let entity = CoordinatorEntity::new(
            coordinator(Reading { temperature: None }),
            temperature(),
            Some(device),
        )
        .unwrap();

        assert_eq!(entity.entity_id().to_string(), "sensor.garden_station_temperature");
        assert_eq!(entity.name(), "Garden Station Temperature");
        assert_eq!(entity.unique_id(), Some("ws-01_temperature"));

        let bare =
            CoordinatorEntity::new(coordinator(Reading { temperature: None }), temperature(), None)
                .unwrap();
        assert_eq!(bare.entity_id().to_string(), "sensor.temperature");
        assert_eq!(bare.unique_id(), None);
    }

    #[test]
    fn test_unusable_name() {
        let description = EntityDescription::new("x", "???", |_: &Reading| None);
        assert!(matches!(
            CoordinatorEntity::new(coordinator(Reading { temperature: None }), description, None),
            Err(EntityIdError::UnusableName(_))
        ));
    }

    #[tokio::test]
    async fn test_native_state() {
        let entity = CoordinatorEntity::new(
            coordinator(Reading {
                temperature: Some(21.5),
            }),
            temperature(),
            None,
        )
        .unwrap();

        // no data yet
        assert!(!entity.available());
        assert_eq!(entity.native_state(), STATE_UNAVAILABLE);

        entity.coordinator().refresh_now().await.unwrap();
        assert!(entity.available());
        assert_eq!(entity.native_state(), "21.5");

        let missing = CoordinatorEntity::new(
            coordinator(Reading { temperature: None }),
            temperature(),
            None,
        )
        .unwrap();
        missing.coordinator().refresh_now().await.unwrap();
        assert_eq!(missing.native_state(), STATE_UNKNOWN);
    }

    #[tokio::test]
    async fn test_added_and_removed() {
        let states = Arc::new(StateMachine::new());
        let device = DeviceInfo::new("weather_station", "ws-01")
            .with_name("Garden")
            .with_manufacturer("Acme");
        let entity = Arc::new(
            CoordinatorEntity::new(
                coordinator(Reading {
                    temperature: Some(19.0),
                }),
                temperature(),
                Some(device),
            )
            .unwrap(),
        );

        entity.added_to_hass(Arc::clone(&states));
        entity.added_to_hass(Arc::clone(&states));
        assert_eq!(entity.coordinator().listener_count(), 1);
        assert!(states.is_state("sensor.garden_temperature", STATE_UNAVAILABLE));

        entity.update().await;
        let state = states.get("sensor.garden_temperature").unwrap();
        assert_eq!(state.state, "19");
        assert_eq!(
            state.attribute::<String>("unit_of_measurement").as_deref(),
            Some("°C")
        );
        assert_eq!(
            state.attribute::<String>("friendly_name").as_deref(),
            Some("Garden Temperature")
        );
        assert_eq!(state.attributes["device"]["manufacturer"], "Acme");
        assert!(entity.coordinator().contexts().contains("temperature"));

        entity.will_remove_from_hass();
        entity.will_remove_from_hass();
        assert!(!entity.is_added());
        assert_eq!(entity.coordinator().listener_count(), 0);
        assert!(states.get("sensor.garden_temperature").is_none());
        assert!(entity.write_state().is_none());
    }
}
