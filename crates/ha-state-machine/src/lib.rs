//! Entity state storage with change notifications
//!
//! The [`StateMachine`] is the host surface entities push their state into.
//! It keeps the latest [`State`] of every entity, indexes entity ids by
//! domain, and broadcasts a [`StateChanged`] record on every write or removal.

use dashmap::DashMap;
use ha_core::{Attributes, EntityId, State};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, instrument, trace};

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// One write to (or removal from) the state machine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChanged {
    pub entity_id: EntityId,
    pub old_state: Option<State>,
    pub new_state: Option<State>,
}

impl StateChanged {
    /// Whether the state value itself changed (attribute-only writes return false)
    pub fn value_changed(&self) -> bool {
        match (&self.old_state, &self.new_state) {
            (Some(old), Some(new)) => old.state != new.state,
            _ => true,
        }
    }
}

pub struct StateMachine {
    /// Entity states keyed by entity id string
    states: DashMap<String, State>,
    /// Entity id strings grouped by domain
    domain_index: DashMap<String, Vec<String>>,
    changes: broadcast::Sender<StateChanged>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a state machine whose change channel buffers `capacity` records
    pub fn with_capacity(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity);
        Self {
            states: DashMap::new(),
            domain_index: DashMap::new(),
            changes,
        }
    }

    /// Receive every subsequent [`StateChanged`] record
    pub fn subscribe(&self) -> broadcast::Receiver<StateChanged> {
        self.changes.subscribe()
    }

    /// Write the state of an entity
    ///
    /// `last_changed` is preserved when the value did not change.
    #[instrument(skip(self, state, attributes), fields(entity_id = %entity_id))]
    pub fn set(
        &self,
        entity_id: EntityId,
        state: impl Into<String>,
        attributes: Attributes,
    ) -> State {
        let key = entity_id.to_string();
        let old_state = self.states.get(&key).map(|s| s.clone());

        let new_state = match &old_state {
            Some(existing) => existing.with_update(state, attributes),
            None => State::new(entity_id.clone(), state, attributes),
        };

        debug!(
            state = %new_state.state,
            changed = old_state.as_ref().map_or(true, |s| s.state != new_state.state),
            "Setting entity state"
        );

        self.states.insert(key.clone(), new_state.clone());

        if old_state.is_none() {
            self.domain_index
                .entry(entity_id.domain().to_string())
                .or_default()
                .push(key);
        }

        // no receivers is fine
        let _ = self.changes.send(StateChanged {
            entity_id,
            old_state,
            new_state: Some(new_state.clone()),
        });

        new_state
    }

    pub fn get(&self, entity_id: &str) -> Option<State> {
        self.states.get(entity_id).map(|s| s.clone())
    }

    pub fn get_state(&self, entity_id: &str) -> Option<String> {
        self.states.get(entity_id).map(|s| s.state.clone())
    }

    pub fn is_state(&self, entity_id: &str, state: &str) -> bool {
        self.get_state(entity_id).as_deref() == Some(state)
    }

    pub fn entity_ids(&self, domain: &str) -> Vec<String> {
        self.domain_index
            .get(domain)
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    pub fn all(&self) -> Vec<State> {
        self.states.iter().map(|r| r.value().clone()).collect()
    }

    /// Remove an entity's state, broadcasting a change with no new state
    #[instrument(skip(self), fields(entity_id = %entity_id))]
    pub fn remove(&self, entity_id: &EntityId) -> Option<State> {
        let key = entity_id.to_string();
        let old_state = self.states.remove(&key).map(|(_, s)| s);

        if let Some(state) = &old_state {
            trace!("Removing entity state");

            if let Some(mut ids) = self.domain_index.get_mut(entity_id.domain()) {
                ids.retain(|id| id != &key);
            }

            let _ = self.changes.send(StateChanged {
                entity_id: entity_id.clone(),
                old_state: Some(state.clone()),
                new_state: None,
            });
        }

        old_state
    }

    pub fn entity_count(&self) -> usize {
        self.states.len()
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedStateMachine = Arc<StateMachine>;
