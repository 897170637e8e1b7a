//! Debouncer for refresh requests
//!
//! Collapses a burst of calls into at most one execution at the start of a
//! cooldown window and one trailing execution at its end.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::debug;

/// The debounced async function
pub type DebouncedFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct DebounceState {
    timer: Option<JoinHandle<()>>,
    execute_at_end: bool,
    shutdown: bool,
}

struct DebouncerInner {
    name: String,
    cooldown: Duration,
    immediate: bool,
    function: DebouncedFn,
    state: Mutex<DebounceState>,
    execute_lock: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct Debouncer {
    inner: Arc<DebouncerInner>,
}

impl Debouncer {
    /// Create a debouncer
    ///
    /// With `immediate` the first call of a burst runs right away; without
    /// it every call is deferred to the end of the cooldown.
    pub fn new(
        name: impl Into<String>,
        cooldown: Duration,
        immediate: bool,
        function: DebouncedFn,
    ) -> Self {
        Self {
            inner: Arc::new(DebouncerInner {
                name: name.into(),
                cooldown,
                immediate,
                function,
                state: Mutex::new(DebounceState::default()),
                execute_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.inner.cooldown
    }

    /// Call the function, or queue it for the end of the running cooldown
    pub async fn call(&self) {
        {
            let mut state = self.inner.state();
            if state.shutdown {
                return;
            }
            if state.timer.is_some() {
                state.execute_at_end = true;
                return;
            }
            if !self.inner.immediate {
                state.execute_at_end = true;
                self.inner.schedule_timer(&mut state);
                return;
            }
        }

        let Ok(_guard) = self.inner.execute_lock.try_lock() else {
            let mut state = self.inner.state();
            state.execute_at_end = true;
            if state.timer.is_none() {
                self.inner.schedule_timer(&mut state);
            }
            return;
        };

        {
            let mut state = self.inner.state();
            if state.timer.is_some() || state.shutdown {
                return;
            }
            self.inner.schedule_timer(&mut state);
        }

        (self.inner.function)().await;
    }

    /// Drop the pending trailing call and stop the cooldown timer
    pub fn cancel(&self) {
        let mut state = self.inner.state();
        state.execute_at_end = false;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    /// Cancel and refuse every further call
    pub fn shutdown(&self) {
        self.inner.state().shutdown = true;
        self.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.state().shutdown
    }
}

impl DebouncerInner {
    /// The cooldown starts when an execution starts
    fn schedule_timer(self: &Arc<Self>, state: &mut DebounceState) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let cooldown = self.cooldown;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_timer_finish().await;
            }
        });
        if let Some(previous) = state.timer.replace(timer) {
            previous.abort();
        }
    }

    async fn on_timer_finish(self: Arc<Self>) {
        {
            let mut state = self.state();
            state.timer = None;
            if !std::mem::take(&mut state.execute_at_end) || state.shutdown {
                return;
            }
        }

        let Ok(_guard) = self.execute_lock.try_lock() else {
            debug!(debouncer = %self.name, "Still executing, dropping trailing call");
            return;
        };

        {
            let mut state = self.state();
            if state.timer.is_some() || state.shutdown {
                return;
            }
            self.schedule_timer(&mut state);
        }

        debug!(debouncer = %self.name, "Executing trailing call");
        (self.function)().await;
    }

    fn state(&self) -> MutexGuard<'_, DebounceState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    const COOLDOWN: Duration = Duration::from_secs(10);

    fn counting(immediate: bool) -> (Debouncer, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        let function: DebouncedFn = Arc::new(move || {
            let inner = Arc::clone(&inner);
            async move {
                inner.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        });
        (Debouncer::new("test", COOLDOWN, immediate, function), count)
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_burst_collapses_to_one_trailing_call() {
        let (debouncer, count) = counting(true);

        debouncer.call().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        debouncer.call().await;
        debouncer.call().await;
        debouncer.call().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        sleep(COOLDOWN + Duration::from_millis(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        // the trailing call started a new cooldown with nothing queued
        sleep(COOLDOWN * 3).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        // idle again: runs immediately
        debouncer.call().await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_calls_run_at_end_of_cooldown() {
        let (debouncer, count) = counting(false);

        debouncer.call().await;
        debouncer.call().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        sleep(COOLDOWN + Duration::from_millis(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_trailing_call() {
        let (debouncer, count) = counting(true);

        debouncer.call().await;
        debouncer.call().await;
        debouncer.cancel();

        sleep(COOLDOWN * 2).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_refuses_calls() {
        let (debouncer, count) = counting(true);

        debouncer.call().await;
        debouncer.call().await;
        debouncer.shutdown();
        debouncer.shutdown();
        assert!(debouncer.is_shutdown());

        debouncer.call().await;
        sleep(COOLDOWN * 2).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
