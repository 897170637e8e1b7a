//! Config Entries Manager
//!
//! Holds every config entry of the running host and dispatches setup to the
//! handler registered for the entry's domain.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::entry::{ConfigEntry, ConfigEntryState, SetupHandler};
use crate::error::{ConfigEntriesError, ConfigEntriesResult};

pub struct ConfigEntries {
    /// Primary index: entry_id -> ConfigEntry
    entries: DashMap<String, Arc<ConfigEntry>>,

    /// Index: domain -> set of entry_ids
    by_domain: DashMap<String, HashSet<String>>,

    /// Index: (domain, unique_id) -> entry_id
    by_unique_id: DashMap<(String, String), String>,

    /// Serializes setup and unload calls made through the manager
    setup_lock: Mutex<()>,

    setup_handlers: DashMap<String, SetupHandler>,
}

impl ConfigEntries {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            by_domain: DashMap::new(),
            by_unique_id: DashMap::new(),
            setup_lock: Mutex::new(()),
            setup_handlers: DashMap::new(),
        }
    }

    pub fn register_handler(&self, domain: impl Into<String>, handler: SetupHandler) {
        let domain = domain.into();
        debug!("Registered setup handler for domain: {}", domain);
        self.setup_handlers.insert(domain, handler);
    }

    /// Add a new entry, rejecting duplicate `(domain, unique_id)` pairs
    pub fn add(&self, entry: ConfigEntry) -> ConfigEntriesResult<Arc<ConfigEntry>> {
        if let Some(unique_id) = &entry.unique_id {
            if self.get_by_unique_id(&entry.domain, unique_id).is_some() {
                return Err(ConfigEntriesError::AlreadyExists {
                    domain: entry.domain.clone(),
                    unique_id: unique_id.clone(),
                });
            }
        }

        let entry = Arc::new(entry);
        self.entries
            .insert(entry.entry_id.clone(), Arc::clone(&entry));
        self.by_domain
            .entry(entry.domain.clone())
            .or_default()
            .insert(entry.entry_id.clone());
        if let Some(unique_id) = &entry.unique_id {
            self.by_unique_id.insert(
                (entry.domain.clone(), unique_id.clone()),
                entry.entry_id.clone(),
            );
        }

        info!(
            "Added config entry: {} ({}) [{}]",
            entry.title, entry.domain, entry.entry_id
        );
        Ok(entry)
    }

    /// Remove an entry that is not loaded
    pub fn remove(&self, entry_id: &str) -> ConfigEntriesResult<Arc<ConfigEntry>> {
        let entry = self.require(entry_id)?;
        let state = entry.state();
        if !matches!(
            state,
            ConfigEntryState::NotLoaded | ConfigEntryState::SetupError
        ) {
            return Err(ConfigEntriesError::CannotRemove(state));
        }

        if let Some(mut ids) = self.by_domain.get_mut(&entry.domain) {
            ids.remove(entry_id);
        }
        if let Some(unique_id) = &entry.unique_id {
            self.by_unique_id
                .remove(&(entry.domain.clone(), unique_id.clone()));
        }
        self.entries.remove(entry_id);

        info!(
            "Removed config entry: {} ({}) [{}]",
            entry.title, entry.domain, entry_id
        );
        Ok(entry)
    }

    pub fn get(&self, entry_id: &str) -> Option<Arc<ConfigEntry>> {
        self.entries.get(entry_id).map(|r| Arc::clone(r.value()))
    }

    pub fn get_by_unique_id(&self, domain: &str, unique_id: &str) -> Option<Arc<ConfigEntry>> {
        self.by_unique_id
            .get(&(domain.to_string(), unique_id.to_string()))
            .and_then(|entry_id| self.get(&entry_id))
    }

    pub fn entries_for_domain(&self, domain: &str) -> Vec<Arc<ConfigEntry>> {
        self.by_domain
            .get(domain)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn entry_ids(&self) -> Vec<String> {
        self.entries.iter().map(|r| r.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Set an entry up with its domain's handler
    ///
    /// Returns the resulting state; a failing setup is reported through the
    /// state (and the entry's reason), not as an error.
    pub async fn setup(&self, entry_id: &str) -> ConfigEntriesResult<ConfigEntryState> {
        let _lock = self.setup_lock.lock().await;

        let entry = self.require(entry_id)?;
        let handler = self
            .setup_handlers
            .get(&entry.domain)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| ConfigEntriesError::NoHandler(entry.domain.clone()))?;

        let state = entry.setup(handler).await?;
        if state != ConfigEntryState::Loaded {
            warn!(
                "Setup of {} ({}) ended in {:?}: {}",
                entry.title,
                entry_id,
                state,
                entry.reason().unwrap_or_default()
            );
        }
        Ok(state)
    }

    pub async fn unload(&self, entry_id: &str) -> ConfigEntriesResult<ConfigEntryState> {
        let _lock = self.setup_lock.lock().await;
        let entry = self.require(entry_id)?;
        Ok(entry.unload().await?)
    }

    /// Unload, then set up again
    pub async fn reload(&self, entry_id: &str) -> ConfigEntriesResult<ConfigEntryState> {
        self.unload(entry_id).await?;
        self.setup(entry_id).await
    }

    pub async fn setup_all(&self) -> Vec<(String, ConfigEntriesResult<ConfigEntryState>)> {
        let mut results = Vec::new();
        for entry_id in self.entry_ids() {
            let result = self.setup(&entry_id).await;
            results.push((entry_id, result));
        }
        results
    }

    /// Unload every entry, logging failures instead of stopping at the first
    pub async fn shutdown(&self) {
        for entry_id in self.entry_ids() {
            if let Err(err) = self.unload(&entry_id).await {
                warn!("Failed to unload config entry {}: {}", entry_id, err);
            }
        }
    }

    fn require(&self, entry_id: &str) -> ConfigEntriesResult<Arc<ConfigEntry>> {
        self.get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))
    }
}

impl Default for ConfigEntries {
    fn default() -> Self {
        Self::new()
    }
}
