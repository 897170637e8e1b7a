//! Simulated weather station integration
//!
//! The station "API" returns loosely shaped JSON. [`parse_payload`] maps it
//! onto a typed [`WeatherSnapshot`], which is what the coordinator stores
//! and the sensors render.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use ha_config_entries::{ConfigEntry, ConfigEntryError, SetupHandler};
use ha_core::DeviceInfo;
use ha_state_machine::StateMachine;
use ha_update_coordinator::{
    CoordinatorConfig, CoordinatorEntity, DataSource, DataUpdateCoordinator, EntityDescription,
    PushSender, UpdateError,
};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DOMAIN: &str = "weather_station";

pub const CONF_TIMEOUT: &str = "timeout";
pub const CONF_FAIL_EVERY: &str = "fail_every";
pub const CONF_AUTH_FAIL_AFTER: &str = "auth_fail_after";
pub const CONF_PUSH_INTERVAL: &str = "push_interval";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeatherSnapshot {
    /// °C
    pub temperature: f64,
    /// Relative humidity, %
    pub humidity: u8,
    /// hPa
    pub pressure: f64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PayloadError {
    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("field '{field}' out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },
}

impl From<PayloadError> for UpdateError {
    fn from(err: PayloadError) -> Self {
        UpdateError::failed(format!("malformed payload: {}", err))
    }
}

/// Map a raw station payload onto a snapshot
pub fn parse_payload(raw: &Value) -> Result<WeatherSnapshot, PayloadError> {
    let number = |field: &'static str| {
        raw.get(field)
            .and_then(Value::as_f64)
            .ok_or(PayloadError::MissingField(field))
    };

    let temperature = number("temp_c")?;
    let humidity = number("rh")?;
    let pressure = number("baro_hpa")?;

    if !(0.0..=100.0).contains(&humidity) {
        return Err(PayloadError::OutOfRange {
            field: "rh",
            value: humidity,
        });
    }
    if pressure <= 0.0 {
        return Err(PayloadError::OutOfRange {
            field: "baro_hpa",
            value: pressure,
        });
    }

    Ok(WeatherSnapshot {
        temperature: round1(temperature),
        humidity: humidity.round() as u8,
        pressure: round1(pressure),
    })
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Vendor client of one simulated station
pub struct SimulatedStation {
    name: String,
    fail_every: Option<u32>,
    auth_fail_after: Option<u32>,
    requests: AtomicU32,
    ticks: AtomicU32,
}

impl SimulatedStation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fail_every: None,
            auth_fail_after: None,
            requests: AtomicU32::new(0),
            ticks: AtomicU32::new(0),
        }
    }

    pub fn from_entry(entry: &ConfigEntry) -> Self {
        Self {
            fail_every: entry.data_value(CONF_FAIL_EVERY),
            auth_fail_after: entry.data_value(CONF_AUTH_FAIL_AFTER),
            ..Self::new(entry.title.clone())
        }
    }

    /// One API request; every request consumes a reading
    fn request(&self) -> Result<Value, UpdateError> {
        let n = self.requests.fetch_add(1, Ordering::SeqCst) + 1;

        if self.auth_fail_after.is_some_and(|after| n >= after) {
            return Err(UpdateError::auth_failed(format!(
                "{} rejected the API key",
                self.name
            )));
        }
        if self.fail_every.is_some_and(|every| n % every == 0) {
            return Err(UpdateError::failed(format!(
                "connection refused by {}",
                self.name
            )));
        }
        Ok(self.next_reading())
    }

    /// Reading delivered by the station's own push channel
    pub fn push_reading(&self) -> Result<WeatherSnapshot, PayloadError> {
        parse_payload(&self.next_reading())
    }

    fn next_reading(&self) -> Value {
        let tick = self.ticks.fetch_add(1, Ordering::SeqCst);
        json!({
            "temp_c": 18.0 + f64::from(tick % 12) * 0.25,
            "rh": 40 + tick % 20,
            "baro_hpa": 1013.25 - f64::from(tick % 8) * 0.5,
            "firmware": "3.1.4",
        })
    }
}

#[async_trait]
impl DataSource<WeatherSnapshot> for SimulatedStation {
    async fn setup(&self) -> Result<(), UpdateError> {
        debug!("Connecting to station {}", self.name);
        Ok(())
    }

    async fn fetch(&self) -> Result<WeatherSnapshot, UpdateError> {
        let raw = self.request()?;
        Ok(parse_payload(&raw)?)
    }
}

/// The three sensors every station exposes
pub fn descriptions() -> Vec<EntityDescription<WeatherSnapshot>> {
    vec![
        EntityDescription::new("temperature", "Temperature", |s: &WeatherSnapshot| {
            Some(format!("{:.1}", s.temperature))
        })
        .with_unit("°C"),
        EntityDescription::new("humidity", "Humidity", |s: &WeatherSnapshot| {
            Some(s.humidity.to_string())
        })
        .with_unit("%"),
        EntityDescription::new("pressure", "Pressure", |s: &WeatherSnapshot| {
            Some(format!("{:.1}", s.pressure))
        })
        .with_unit("hPa"),
    ]
}

/// Setup handler for `weather_station` config entries
///
/// Builds the entry's coordinator, performs the first refresh, adds the
/// sensors to `states` and, when configured, starts the push thread.
pub fn setup_handler(states: Arc<StateMachine>) -> SetupHandler {
    Arc::new(move |entry: Arc<ConfigEntry>| {
        let states = Arc::clone(&states);
        async move {
            let station = Arc::new(SimulatedStation::from_entry(&entry));
            let mut config = CoordinatorConfig::from_options(entry.title.clone(), &entry.options);
            if let Some(secs) = entry.data_value::<f64>(CONF_TIMEOUT) {
                if let Ok(timeout) = Duration::try_from_secs_f64(secs) {
                    config = config.with_request_timeout(timeout);
                }
            }

            let source: Arc<dyn DataSource<WeatherSnapshot>> = station.clone();
            let coordinator = DataUpdateCoordinator::builder_from_arc(config, source)
                .with_config_entry(&entry)
                .build();
            coordinator.config_entry_first_refresh().await?;

            let device = DeviceInfo::new(
                DOMAIN,
                entry.unique_id.clone().unwrap_or_else(|| entry.entry_id.clone()),
            )
            .with_name(entry.title.clone())
            .with_manufacturer("Acme")
            .with_model("WS-3000");

            let mut sensors = Vec::new();
            for description in descriptions() {
                let sensor =
                    CoordinatorEntity::new(coordinator.clone(), description, Some(device.clone()))
                        .map_err(|e| ConfigEntryError::Error(e.to_string()))?;
                let sensor = Arc::new(sensor);
                sensor.added_to_hass(Arc::clone(&states));
                sensors.push(sensor);
            }
            entry.async_on_unload(move || {
                for sensor in &sensors {
                    sensor.will_remove_from_hass();
                }
            });

            if let Some(secs) = entry.data_value::<f64>(CONF_PUSH_INTERVAL) {
                let every = Duration::try_from_secs_f64(secs)
                    .map_err(|e| ConfigEntryError::Error(format!("invalid push interval: {}", e)))?;
                spawn_push_thread(station, coordinator.push_sender(), every).map_err(|e| {
                    ConfigEntryError::Error(format!("cannot start push thread: {}", e))
                })?;
            }

            info!(title = %entry.title, "Weather station ready");
            Ok::<(), ConfigEntryError>(())
        }
        .boxed()
    })
}

/// Deliver station pushes from a plain OS thread, like a vendor SDK would
///
/// The thread ends once the coordinator stops accepting pushes.
fn spawn_push_thread(
    station: Arc<SimulatedStation>,
    sender: PushSender<WeatherSnapshot>,
    every: Duration,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("push-{}", ha_core::slugify(&station.name)))
        .spawn(move || loop {
            std::thread::sleep(every);
            match station.push_reading() {
                Ok(snapshot) => {
                    if sender.send(snapshot).is_err() {
                        debug!("Push channel of {} closed", station.name);
                        break;
                    }
                }
                Err(err) => warn!("Dropping malformed push from {}: {}", station.name, err),
            }
        })
}
