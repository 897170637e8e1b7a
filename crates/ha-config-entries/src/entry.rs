//! Config entry types
//!
//! A [`ConfigEntry`] is one configured instance of an integration, e.g. one
//! weather station account. It owns the lifecycle around the integration's
//! setup handler: classifying setup failures, scheduling setup retries,
//! requesting reauthentication and running unload callbacks on teardown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::error::ConfigEntryError;
use crate::state_machine::{calculate_retry_delay, InvalidTransition};

/// Config entry lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntryState {
    #[default]
    NotLoaded,
    SetupInProgress,
    Loaded,
    /// Setup failed and will not be retried automatically
    SetupError,
    /// Setup failed transiently, a retry is scheduled
    SetupRetry,
    UnloadInProgress,
    /// Unload failed (not recoverable)
    FailedUnload,
}

impl ConfigEntryState {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ConfigEntryState::FailedUnload)
    }
}

/// Integration setup function, invoked with the entry being set up
pub type SetupHandler = Arc<
    dyn Fn(Arc<ConfigEntry>) -> BoxFuture<'static, Result<(), ConfigEntryError>> + Send + Sync,
>;

/// Teardown work registered by the integration during setup
pub type UnloadCallback = Box<dyn FnOnce() + Send + 'static>;

/// A pending request for the user to re-enter credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReauthRequest {
    pub reason: String,
    pub requested_at: DateTime<Utc>,
}

#[derive(Default)]
struct EntryRuntime {
    state: ConfigEntryState,
    reason: Option<String>,
    tries: u32,
    on_unload: Vec<UnloadCallback>,
    retry: Option<JoinHandle<()>>,
    reauth: Option<ReauthRequest>,
}

/// One configured integration instance
pub struct ConfigEntry {
    pub entry_id: String,

    /// Integration domain (e.g. "weather_station")
    pub domain: String,

    pub title: String,

    /// Connection data entered during configuration (host, credentials)
    pub data: HashMap<String, serde_json::Value>,

    /// User tunable options (scan interval, ...)
    pub options: HashMap<String, serde_json::Value>,

    pub unique_id: Option<String>,

    runtime: Mutex<EntryRuntime>,
}

impl ConfigEntry {
    pub fn new(domain: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            entry_id: Ulid::new().to_string(),
            domain: domain.into(),
            title: title.into(),
            data: HashMap::new(),
            options: HashMap::new(),
            unique_id: None,
            runtime: Mutex::new(EntryRuntime::default()),
        }
    }

    pub fn with_data(mut self, data: HashMap<String, serde_json::Value>) -> Self {
        self.data = data;
        self
    }

    pub fn with_options(mut self, options: HashMap<String, serde_json::Value>) -> Self {
        self.options = options;
        self
    }

    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }

    /// Read and deserialize one option
    pub fn option<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.options
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Read and deserialize one data value
    pub fn data_value<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn state(&self) -> ConfigEntryState {
        self.runtime().state
    }

    /// Explanation attached to the current failed state, if any
    pub fn reason(&self) -> Option<String> {
        self.runtime().reason.clone()
    }

    /// Number of consecutive not-ready setup attempts
    pub fn setup_tries(&self) -> u32 {
        self.runtime().tries
    }

    pub fn is_loaded(&self) -> bool {
        self.state() == ConfigEntryState::Loaded
    }

    /// Register teardown work to run when the entry unloads or its setup fails
    pub fn async_on_unload(&self, callback: impl FnOnce() + Send + 'static) {
        self.runtime().on_unload.push(Box::new(callback));
    }

    /// Ask the user to reauthenticate
    ///
    /// Returns `false` when a request is already pending.
    pub fn start_reauth(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let mut runtime = self.runtime();
        if runtime.reauth.is_some() {
            debug!(entry_id = %self.entry_id, "Reauth already pending");
            return false;
        }

        warn!(
            entry_id = %self.entry_id,
            domain = %self.domain,
            title = %self.title,
            reason = %reason,
            "Starting reauthentication"
        );
        runtime.reauth = Some(ReauthRequest {
            reason,
            requested_at: Utc::now(),
        });
        true
    }

    pub fn reauth_pending(&self) -> Option<ReauthRequest> {
        self.runtime().reauth.clone()
    }

    /// Mark the pending reauth request as handled
    pub fn clear_reauth(&self) -> Option<ReauthRequest> {
        self.runtime().reauth.take()
    }

    /// Run `handler` and record its classified outcome
    ///
    /// Setup failures never propagate: they are turned into entry states.
    /// The error is only returned for an invalid lifecycle transition.
    pub async fn setup(
        self: &Arc<Self>,
        handler: SetupHandler,
    ) -> Result<ConfigEntryState, InvalidTransition> {
        self.transition(ConfigEntryState::SetupInProgress, None)?;
        debug!(entry_id = %self.entry_id, domain = %self.domain, "Setting up config entry");

        let result = handler(Arc::clone(self)).await;

        match result {
            Ok(()) => {
                self.runtime().tries = 0;
                self.transition(ConfigEntryState::Loaded, None)?;
                info!(entry_id = %self.entry_id, title = %self.title, "Config entry loaded");
            }
            Err(ConfigEntryError::NotReady(message)) => {
                self.run_unload_callbacks();
                let reason = (!message.is_empty()).then(|| message.clone());
                self.transition(ConfigEntryState::SetupRetry, reason)?;

                let tries = {
                    let mut runtime = self.runtime();
                    let tries = runtime.tries;
                    runtime.tries += 1;
                    tries
                };
                let delay = calculate_retry_delay(tries);
                debug!(
                    entry_id = %self.entry_id,
                    title = %self.title,
                    ?delay,
                    "Config entry not ready yet: {}; retrying",
                    message
                );
                self.schedule_retry(handler, delay);
            }
            Err(ConfigEntryError::AuthFailed(message)) => {
                self.run_unload_callbacks();
                let reason = if message.is_empty() {
                    "could not authenticate".to_string()
                } else {
                    message
                };
                warn!(
                    entry_id = %self.entry_id,
                    title = %self.title,
                    "Config entry could not authenticate: {}",
                    reason
                );
                self.transition(ConfigEntryState::SetupError, Some(reason.clone()))?;
                self.start_reauth(reason);
            }
            Err(ConfigEntryError::Error(message)) => {
                self.run_unload_callbacks();
                warn!(
                    entry_id = %self.entry_id,
                    title = %self.title,
                    "Error setting up config entry: {}",
                    message
                );
                self.transition(ConfigEntryState::SetupError, Some(message))?;
            }
        }

        Ok(self.state())
    }

    /// Tear the entry down: cancel a pending retry and run unload callbacks
    pub async fn unload(&self) -> Result<ConfigEntryState, InvalidTransition> {
        if self.state() == ConfigEntryState::NotLoaded {
            return Ok(ConfigEntryState::NotLoaded);
        }

        self.transition(ConfigEntryState::UnloadInProgress, None)?;
        if let Some(retry) = self.runtime().retry.take() {
            retry.abort();
        }
        self.run_unload_callbacks();
        self.transition(ConfigEntryState::NotLoaded, None)?;
        info!(entry_id = %self.entry_id, title = %self.title, "Config entry unloaded");

        Ok(ConfigEntryState::NotLoaded)
    }

    fn schedule_retry(self: &Arc<Self>, handler: SetupHandler, delay: std::time::Duration) {
        let weak = Arc::downgrade(self);
        let retry = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(entry) = weak.upgrade() else {
                return;
            };
            if entry.state() != ConfigEntryState::SetupRetry {
                return;
            }
            entry.runtime().retry = None;
            if let Err(err) = Self::setup_again(entry, handler).await {
                warn!("Retrying config entry setup failed: {}", err);
            }
        });

        if let Some(previous) = self.runtime().retry.replace(retry) {
            previous.abort();
        }
    }

    fn setup_again(
        entry: Arc<Self>,
        handler: SetupHandler,
    ) -> BoxFuture<'static, Result<ConfigEntryState, InvalidTransition>> {
        Box::pin(async move { entry.setup(handler).await })
    }

    fn transition(
        &self,
        to: ConfigEntryState,
        reason: Option<String>,
    ) -> Result<(), InvalidTransition> {
        let mut runtime = self.runtime();
        runtime.state = runtime.state.try_transition(to)?;
        runtime.reason = reason;
        Ok(())
    }

    fn run_unload_callbacks(&self) {
        let callbacks = std::mem::take(&mut self.runtime().on_unload);
        for callback in callbacks {
            callback();
        }
    }

    fn runtime(&self) -> MutexGuard<'_, EntryRuntime> {
        // state stays consistent even if a holder panicked
        self.runtime.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for ConfigEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigEntry")
            .field("entry_id", &self.entry_id)
            .field("domain", &self.domain)
            .field("title", &self.title)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
