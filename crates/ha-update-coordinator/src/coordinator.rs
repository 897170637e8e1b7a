//! The polling update coordinator
//!
//! A [`DataUpdateCoordinator`] owns one vendor [`DataSource`] and keeps the
//! latest snapshot it returned. It guarantees:
//!
//! - at most one fetch is in flight; concurrent refreshes join it and all
//!   observe the same outcome
//! - a failed fetch keeps the previous data, flips `last_update_success` and
//!   still notifies listeners
//! - polling never stops because of a failure; only [`shutdown`] stops it
//!
//! Every fetch runs as its own tokio task bounded by the request timeout.
//! The next poll is scheduled `update_interval` after the fetch *started*,
//! or after the latest push when that is later. A fetch overtaken by a push
//! leaves the pushed data in place.
//!
//! [`shutdown`]: DataUpdateCoordinator::shutdown

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use ha_config_entries::{ConfigEntry, ConfigEntryError};
use indexmap::IndexSet;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::CoordinatorConfig;
use crate::debounce::{DebouncedFn, Debouncer};
use crate::error::UpdateError;
use crate::listener::{ListenerRegistry, RemoveListener};
use crate::push::{PushPump, PushSender};
use crate::source::DataSource;

/// Equality used to suppress notifications when `always_update` is off
pub type DataEq<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

type SharedRefresh = Shared<BoxFuture<'static, Result<(), UpdateError>>>;

/// What started a fetch cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshKind {
    Scheduled,
    Requested,
    /// `refresh_now`: the caller classifies failures itself
    Setup,
}

struct Snapshot<T> {
    data: Option<Arc<T>>,
    last_update_success: bool,
    last_exception: Option<UpdateError>,
    last_update_success_time: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    /// Number of `async_set_updated_data` calls, and when the last one happened
    pushes: u64,
    last_push: Option<Instant>,
}

#[derive(Default)]
struct TimerSlot {
    generation: u64,
    handle: Option<JoinHandle<()>>,
    deadline: Option<Instant>,
}

struct Inner<T> {
    config: CoordinatorConfig,
    source: Arc<dyn DataSource<T>>,
    data_eq: Option<DataEq<T>>,
    config_entry: Option<Weak<ConfigEntry>>,

    snapshot: Mutex<Snapshot<T>>,
    listeners: Arc<ListenerRegistry>,
    in_flight: Mutex<Option<SharedRefresh>>,
    timer: Mutex<TimerSlot>,
    debouncer: Option<Debouncer>,
    push: Mutex<Option<PushPump<T>>>,

    setup_done: AtomicBool,
    shutdown: AtomicBool,
}

/// Builder for coordinators that need more than a config and a source
pub struct CoordinatorBuilder<T> {
    config: CoordinatorConfig,
    source: Arc<dyn DataSource<T>>,
    data_eq: Option<DataEq<T>>,
    config_entry: Option<Arc<ConfigEntry>>,
}

impl<T: Send + Sync + 'static> CoordinatorBuilder<T> {
    /// Bind the coordinator to the config entry it serves
    ///
    /// Polling auth failures then request reauthentication on the entry,
    /// and unloading the entry (or failing its setup) shuts the coordinator
    /// down.
    pub fn with_config_entry(mut self, entry: &Arc<ConfigEntry>) -> Self {
        self.config_entry = Some(Arc::clone(entry));
        self
    }

    /// Equality used when `always_update` is disabled
    pub fn with_data_eq(mut self, eq: impl Fn(&T, &T) -> bool + Send + Sync + 'static) -> Self {
        self.data_eq = Some(Arc::new(eq));
        self
    }

    pub fn build(self) -> DataUpdateCoordinator<T> {
        let CoordinatorBuilder {
            config,
            source,
            data_eq,
            config_entry,
        } = self;

        let inner = Arc::new_cyclic(|weak: &Weak<Inner<T>>| {
            let debouncer = config.request_refresh_cooldown.map(|cooldown| {
                let weak = weak.clone();
                let function: DebouncedFn = Arc::new(move || {
                    let weak = weak.clone();
                    async move {
                        if let Some(inner) = weak.upgrade() {
                            // failures are recorded in the snapshot
                            let _ = inner.start_or_join(RefreshKind::Requested).await;
                        }
                    }
                    .boxed()
                });
                Debouncer::new(config.name.clone(), cooldown, true, function)
            });

            Inner {
                source,
                data_eq,
                config_entry: config_entry.as_ref().map(Arc::downgrade),
                snapshot: Mutex::new(Snapshot {
                    data: None,
                    last_update_success: true,
                    last_exception: None,
                    last_update_success_time: None,
                    consecutive_failures: 0,
                    pushes: 0,
                    last_push: None,
                }),
                listeners: Arc::new(ListenerRegistry::new()),
                in_flight: Mutex::new(None),
                timer: Mutex::new(TimerSlot::default()),
                debouncer,
                push: Mutex::new(None),
                setup_done: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                config,
            }
        });

        let coordinator = DataUpdateCoordinator { inner };
        if let Some(entry) = config_entry {
            let handle = coordinator.clone();
            entry.async_on_unload(move || handle.shutdown());
        }
        coordinator
    }
}

/// Shared handle to one coordinator
pub struct DataUpdateCoordinator<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for DataUpdateCoordinator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> DataUpdateCoordinator<T> {
    pub fn new(config: CoordinatorConfig, source: impl DataSource<T> + 'static) -> Self {
        Self::builder(config, source).build()
    }

    pub fn builder(
        config: CoordinatorConfig,
        source: impl DataSource<T> + 'static,
    ) -> CoordinatorBuilder<T> {
        Self::builder_from_arc(config, Arc::new(source))
    }

    /// Builder for a source that is already shared
    pub fn builder_from_arc(
        config: CoordinatorConfig,
        source: Arc<dyn DataSource<T>>,
    ) -> CoordinatorBuilder<T> {
        CoordinatorBuilder {
            config,
            source,
            data_eq: None,
            config_entry: None,
        }
    }

    /// Refresh and return the classified error of a failed fetch
    ///
    /// Used for the first refresh during integration setup. Internal state
    /// is updated exactly as for [`request_refresh`](Self::request_refresh).
    /// After shutdown this does nothing and returns `Ok(())`.
    pub async fn refresh_now(&self) -> Result<(), UpdateError> {
        if self.is_shutdown() {
            return Ok(());
        }
        self.inner.start_or_join(RefreshKind::Setup).await
    }

    /// First refresh of a config entry's coordinator
    ///
    /// Converts a failure into the setup classification: auth failures abort
    /// setup, everything else makes the entry retry later.
    pub async fn config_entry_first_refresh(&self) -> Result<(), ConfigEntryError> {
        self.refresh_now().await.map_err(ConfigEntryError::from)
    }

    /// Refresh, joining a fetch that is already running
    ///
    /// Never fails: the outcome lands in `last_update_success` and
    /// `last_exception`. Goes through the debouncer when a
    /// `request_refresh_cooldown` is configured.
    pub async fn request_refresh(&self) {
        if self.is_shutdown() {
            return;
        }
        match &self.inner.debouncer {
            Some(debouncer) => debouncer.call().await,
            None => {
                let _ = self.inner.start_or_join(RefreshKind::Requested).await;
            }
        }
    }

    /// Apply data pushed by the vendor instead of polling for it
    ///
    /// Marks the coordinator fresh, notifies listeners and moves the next
    /// poll to `update_interval` from now.
    pub fn async_set_updated_data(&self, data: T) {
        self.inner.set_updated_data(data);
    }

    /// Thread-safe handle that feeds [`async_set_updated_data`](Self::async_set_updated_data)
    ///
    /// Must be called from within a tokio runtime. All senders share one
    /// pump task owned by the coordinator.
    pub fn push_sender(&self) -> PushSender<T> {
        let mut push = self.inner.push();
        if let Some(pump) = push.as_ref() {
            return pump.sender();
        }

        let weak = Arc::downgrade(&self.inner);
        let pump = PushPump::spawn(move |data| match weak.upgrade() {
            Some(inner) => {
                inner.set_updated_data(data);
                true
            }
            None => false,
        });
        if self.is_shutdown() {
            pump.close();
        }
        let sender = pump.sender();
        *push = Some(pump);
        sender
    }

    pub fn add_listener(&self, callback: impl Fn() + Send + Sync + 'static) -> RemoveListener {
        self.inner.listeners.add(Arc::new(callback), None)
    }

    /// Register a listener together with the part of the data it needs
    pub fn add_listener_with_context(
        &self,
        callback: impl Fn() + Send + Sync + 'static,
        context: impl Into<String>,
    ) -> RemoveListener {
        self.inner
            .listeners
            .add(Arc::new(callback), Some(context.into()))
    }

    /// Contexts of all registered listeners
    pub fn contexts(&self) -> IndexSet<String> {
        self.inner.listeners.contexts()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Cancel the pending poll, drop listeners and stop accepting pushes
    ///
    /// Safe to call any number of times. A fetch still running finishes
    /// in the background and its result is discarded.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown()
    }

    /// Latest successfully fetched data, possibly stale
    pub fn read_latest(&self) -> Option<Arc<T>> {
        self.inner.snapshot().data.clone()
    }

    /// Whether the most recent cycle succeeded
    pub fn is_fresh(&self) -> bool {
        self.last_update_success()
    }

    pub fn last_update_success(&self) -> bool {
        self.inner.snapshot().last_update_success
    }

    pub fn last_exception(&self) -> Option<UpdateError> {
        self.inner.snapshot().last_exception.clone()
    }

    pub fn last_update_success_time(&self) -> Option<DateTime<Utc>> {
        self.inner.snapshot().last_update_success_time
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.snapshot().consecutive_failures
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn update_interval(&self) -> Option<Duration> {
        self.inner.config.update_interval
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Time until the pending poll fires, `None` when no poll is armed
    pub fn next_refresh_in(&self) -> Option<Duration> {
        let timer = self.inner.timer();
        timer.handle.as_ref()?;
        timer
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

impl<T: Send + Sync + 'static> Inner<T> {
    /// Start a fetch cycle, or hand out the one already running
    fn start_or_join(self: &Arc<Self>, kind: RefreshKind) -> SharedRefresh {
        let mut in_flight = self.in_flight();
        if let Some(running) = in_flight.as_ref() {
            debug!(coordinator = %self.config.name, ?kind, "Joining in-flight refresh");
            return running.clone();
        }

        let task = tokio::spawn(Arc::clone(self).run_cycle(kind));
        let refresh = async move {
            match task.await {
                Ok(result) => result,
                Err(err) => Err(UpdateError::Unexpected(format!("refresh task failed: {err}"))),
            }
        }
        .boxed()
        .shared();

        *in_flight = Some(refresh.clone());
        refresh
    }

    async fn run_cycle(self: Arc<Self>, kind: RefreshKind) -> Result<(), UpdateError> {
        let started = Instant::now();
        let pushes_before = self.snapshot().pushes;
        let result = self.fetch_with_timeout().await;

        if self.is_shutdown() {
            self.in_flight().take();
            debug!(coordinator = %self.config.name, "Discarding refresh finished after shutdown");
            return result.map(drop);
        }

        let (outcome, notify, last_push) = self.apply(result, kind, started, pushes_before);
        self.in_flight().take();

        if notify {
            self.listeners.notify(&self.config.name);
        }

        if let Some(interval) = self.config.update_interval {
            let mut deadline = match outcome.as_ref().err().and_then(UpdateError::retry_after) {
                Some(retry_after) => Instant::now() + retry_after,
                None => started + interval,
            };
            // a push never moves the next poll earlier than its own interval
            if let Some(pushed) = last_push {
                deadline = deadline.max(pushed + interval);
            }
            self.schedule_refresh_at(deadline);
        }

        outcome
    }

    /// Run the one-time setup if still pending, then fetch, all within the
    /// request timeout. A panicking source counts as a failed fetch.
    async fn fetch_with_timeout(&self) -> Result<T, UpdateError> {
        let timeout = self.config.request_timeout;
        let work = async {
            if !self.setup_done.load(Ordering::Acquire) {
                self.source.setup().await?;
                self.setup_done.store(true, Ordering::Release);
            }
            self.source.fetch().await
        };

        match tokio::time::timeout(timeout, AssertUnwindSafe(work).catch_unwind()).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(UpdateError::Unexpected("data source panicked".into())),
            Err(_) => Err(UpdateError::Timeout(timeout)),
        }
    }

    /// Record the outcome of a fetch
    ///
    /// Returns whether listeners are notified, plus the time of the last
    /// push. A fetch that started before the latest push is superseded: its
    /// outcome is returned but the pushed data stays in place.
    fn apply(
        &self,
        result: Result<T, UpdateError>,
        kind: RefreshKind,
        started: Instant,
        pushes_before: u64,
    ) -> (Result<(), UpdateError>, bool, Option<Instant>) {
        let name = &self.config.name;
        let mut snapshot = self.snapshot();
        let last_push = snapshot.last_push;
        let superseded = snapshot.pushes != pushes_before;

        let (outcome, notify) = match result {
            Ok(_) if superseded => {
                debug!(coordinator = %name, "Keeping {} data pushed during the fetch", name);
                (Ok(()), true)
            }
            Err(err) if superseded => {
                debug!(coordinator = %name, "Ignoring stale {} failure: {}", name, err);
                (Err(err), true)
            }
            Ok(data) => {
                let unchanged = !self.config.always_update
                    && snapshot.last_update_success
                    && match (&snapshot.data, &self.data_eq) {
                        (Some(previous), Some(eq)) => eq(previous, &data),
                        _ => false,
                    };

                if !snapshot.last_update_success {
                    info!(coordinator = %name, "Fetching {} data recovered", name);
                }
                snapshot.data = Some(Arc::new(data));
                snapshot.last_update_success = true;
                snapshot.last_exception = None;
                snapshot.last_update_success_time = Some(Utc::now());
                snapshot.consecutive_failures = 0;
                (Ok(()), !unchanged)
            }
            Err(err) => {
                if snapshot.last_update_success {
                    error!(coordinator = %name, "Error fetching {} data: {}", name, err);
                } else {
                    debug!(
                        coordinator = %name,
                        failures = snapshot.consecutive_failures + 1,
                        "Error fetching {} data: {}",
                        name,
                        err
                    );
                }
                snapshot.last_update_success = false;
                snapshot.last_exception = Some(err.clone());
                snapshot.consecutive_failures = snapshot.consecutive_failures.saturating_add(1);
                (Err(err), true)
            }
        };
        drop(snapshot);

        debug!(
            coordinator = %name,
            success = outcome.is_ok(),
            "Finished fetching {} data in {:?}",
            name,
            started.elapsed()
        );

        if let Err(UpdateError::AuthFailed(reason)) = &outcome {
            warn!(
                coordinator = %name,
                "Authentication failed while fetching {} data: {}",
                name,
                reason
            );
            if kind != RefreshKind::Setup {
                if let Some(entry) = self.config_entry.as_ref().and_then(Weak::upgrade) {
                    entry.start_reauth(reason.clone());
                }
            }
        }

        (outcome, notify, last_push)
    }

    fn set_updated_data(self: &Arc<Self>, data: T) {
        if self.is_shutdown() {
            return;
        }
        if let Some(debouncer) = &self.debouncer {
            debouncer.cancel();
        }

        {
            let mut snapshot = self.snapshot();
            snapshot.data = Some(Arc::new(data));
            snapshot.last_update_success = true;
            snapshot.last_exception = None;
            snapshot.last_update_success_time = Some(Utc::now());
            snapshot.consecutive_failures = 0;
            snapshot.pushes = snapshot.pushes.wrapping_add(1);
            snapshot.last_push = Some(Instant::now());
        }
        debug!(coordinator = %self.config.name, "Manually updated {} data", self.config.name);

        if let Some(interval) = self.config.update_interval {
            self.schedule_refresh_at(Instant::now() + interval);
        }
        self.listeners.notify(&self.config.name);
    }

    /// Replace the pending poll with one firing at `deadline`
    fn schedule_refresh_at(self: &Arc<Self>, deadline: Instant) {
        let mut timer = self.timer();
        if self.is_shutdown() {
            return;
        }
        if let Some(previous) = timer.handle.take() {
            previous.abort();
        }

        timer.generation = timer.generation.wrapping_add(1);
        let generation = timer.generation;
        let weak = Arc::downgrade(self);
        timer.handle = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_timer_fired(generation);
            }
        }));
        timer.deadline = Some(deadline);
    }

    fn on_timer_fired(self: &Arc<Self>, generation: u64) {
        {
            let mut timer = self.timer();
            if timer.generation != generation {
                return;
            }
            timer.handle = None;
            timer.deadline = None;
        }
        if self.is_shutdown() {
            return;
        }
        // the cycle runs in its own task; nobody needs to await it here
        drop(self.start_or_join(RefreshKind::Scheduled));
    }

    fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(coordinator = %self.config.name, "Shutting down coordinator");

        {
            let mut timer = self.timer();
            if let Some(handle) = timer.handle.take() {
                handle.abort();
            }
            timer.deadline = None;
        }
        self.listeners.clear();
        if let Some(debouncer) = &self.debouncer {
            debouncer.shutdown();
        }
        if let Some(pump) = self.push().as_ref() {
            pump.close();
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> MutexGuard<'_, Snapshot<T>> {
        self.snapshot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn in_flight(&self) -> MutexGuard<'_, Option<SharedRefresh>> {
        self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn timer(&self) -> MutexGuard<'_, TimerSlot> {
        self.timer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self) -> MutexGuard<'_, Option<PushPump<T>>> {
        self.push.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T> std::fmt::Debug for DataUpdateCoordinator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataUpdateCoordinator")
            .field("name", &self.inner.config.name)
            .field("update_interval", &self.inner.config.update_interval)
            .field("shutdown", &self.inner.shutdown.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
