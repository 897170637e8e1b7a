//! Home Assistant Rust Server
//!
//! Loads the weather stations from the hub config, sets each one up as a
//! config entry and runs until interrupted.

mod config;
mod state_log;
mod weather;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use ha_config_entries::{ConfigEntries, ConfigEntryState};
use ha_state_machine::StateMachine;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{HubConfig, DEFAULT_CONFIG_PATH};
use crate::state_log::StateLogger;

/// The central Home Assistant instance
pub struct HomeAssistant {
    /// State machine for entity states
    pub states: Arc<StateMachine>,
    pub config_entries: Arc<ConfigEntries>,
}

impl HomeAssistant {
    pub fn new() -> Self {
        let states = Arc::new(StateMachine::new());
        let config_entries = Arc::new(ConfigEntries::new());
        config_entries.register_handler(weather::DOMAIN, weather::setup_handler(states.clone()));

        Self {
            states,
            config_entries,
        }
    }

    /// Add one config entry per station and set them all up
    pub async fn start(&self, config: &HubConfig) -> Result<()> {
        for station in &config.stations {
            self.config_entries.add(station.to_config_entry())?;
        }

        for (entry_id, result) in self.config_entries.setup_all().await {
            match result {
                Ok(ConfigEntryState::Loaded) => info!("Config entry {} loaded", entry_id),
                Ok(state) => warn!("Config entry {} not loaded: {:?}", entry_id, state),
                Err(err) => warn!("Config entry {} failed: {}", entry_id, err),
            }
        }
        Ok(())
    }

    pub async fn stop(&self) {
        self.config_entries.shutdown().await;
    }
}

impl Default for HomeAssistant {
    fn default() -> Self {
        Self::new()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting Home Assistant (Rust)");

    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = HubConfig::load_or_default(&path)?;
    info!(
        "Loaded {} station(s) from {}",
        config.stations.len(),
        path.display()
    );

    let hass = HomeAssistant::new();
    let logger = StateLogger::start(&hass.states);
    hass.start(&config).await?;

    info!(
        "Home Assistant is running with {} entities",
        hass.states.entity_count()
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    hass.stop().await;
    logger.stop();

    Ok(())
}
