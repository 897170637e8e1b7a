//! Push hand-off from vendor threads
//!
//! Vendor SDKs that deliver data on their own threads get a [`PushSender`].
//! Sending never blocks; a pump task on the runtime drains the channel and
//! applies each item to the coordinator, so listeners are only notified
//! from the runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// The coordinator behind a [`PushSender`] has shut down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("coordinator is shut down")]
pub struct PushClosed;

/// Cloneable, thread-safe handle feeding pushed data into a coordinator
pub struct PushSender<T> {
    tx: mpsc::UnboundedSender<T>,
    closed: Arc<AtomicBool>,
}

impl<T> Clone for PushSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            closed: Arc::clone(&self.closed),
        }
    }
}

impl<T> PushSender<T> {
    /// Hand `data` to the coordinator; callable from any thread
    pub fn send(&self, data: T) -> Result<(), PushClosed> {
        if self.is_closed() {
            return Err(PushClosed);
        }
        self.tx.send(data).map_err(|_| PushClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }
}

impl<T> std::fmt::Debug for PushSender<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushSender")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Channel plus the task draining it
pub(crate) struct PushPump<T> {
    tx: mpsc::UnboundedSender<T>,
    closed: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl<T: Send + 'static> PushPump<T> {
    /// Spawn the pump; it stops once `apply` returns `false`
    pub(crate) fn spawn(apply: impl Fn(T) -> bool + Send + 'static) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                if !apply(data) {
                    break;
                }
            }
        });

        Self {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
            task,
        }
    }
}

impl<T> PushPump<T> {
    pub(crate) fn sender(&self) -> PushSender<T> {
        PushSender {
            tx: self.tx.clone(),
            closed: Arc::clone(&self.closed),
        }
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pump_applies_items_from_threads() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let pump = PushPump::spawn(move |n: u32| {
            sink.lock().unwrap().push(n);
            let _ = done_tx.send(());
            true
        });

        let sender = pump.sender();
        let worker = std::thread::spawn(move || {
            for n in 0..3 {
                sender.send(n).unwrap();
            }
        });
        worker.join().unwrap();

        for _ in 0..3 {
            tokio::time::timeout(Duration::from_secs(5), done_rx.recv())
                .await
                .unwrap();
        }
        assert_eq!(*received.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let pump = PushPump::spawn(|_: u32| true);
        let sender = pump.sender();
        let clone = sender.clone();

        assert_eq!(sender.send(1), Ok(()));
        pump.close();
        assert_eq!(sender.send(2), Err(PushClosed));
        assert!(clone.is_closed());
    }

    #[tokio::test]
    async fn test_pump_stops_when_apply_declines() {
        let pump = PushPump::spawn(|_: u32| false);
        let sender = pump.sender();
        sender.send(1).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !sender.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(sender.send(2), Err(PushClosed));
    }
}
