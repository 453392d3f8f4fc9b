//! Event delivery lane shared by every listener notification.
//!
//! Callbacks are queued as boxed futures in the order their triggering frames
//! were processed. The sequential queue drains them on one Tokio task so a slow
//! listener delays later callbacks but never the transport. The immediate queue
//! holds them until the producing task calls [`EventQueue::flush`], which it
//! does once its locks are released, and exists for deterministic tests.

use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{error, trace, warn};

use crate::error::{PusherError, Result};

/// A queued listener invocation
pub type Job = BoxFuture<'static, ()>;

/// How listener callbacks are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// One worker task, callbacks run strictly one after another
    #[default]
    Sequential,
    /// Callbacks run on the task that produced them, after it releases its locks
    Immediate,
}

#[derive(Clone)]
pub enum EventQueue {
    Sequential(mpsc::UnboundedSender<Job>),
    Immediate(Arc<Mutex<VecDeque<Job>>>),
}

impl fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequential(_) => f.write_str("EventQueue::Sequential"),
            Self::Immediate(_) => f.write_str("EventQueue::Immediate"),
        }
    }
}

impl EventQueue {
    pub fn new(mode: DeliveryMode) -> Result<Self> {
        match mode {
            DeliveryMode::Sequential => Self::sequential(),
            DeliveryMode::Immediate => Ok(Self::immediate()),
        }
    }

    /// Spawn the delivery worker on the current Tokio runtime
    pub fn sequential() -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| {
            PusherError::InvalidState(format!("event queue needs a Tokio runtime: {}", e))
        })?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        handle.spawn(async move {
            while let Some(job) = rx.recv().await {
                if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                    error!("Listener panicked during event delivery");
                }
            }
            trace!("Event queue closed");
        });

        Ok(Self::Sequential(tx))
    }

    pub fn immediate() -> Self {
        Self::Immediate(Arc::new(Mutex::new(VecDeque::new())))
    }

    /// Queue a callback. Never runs it on the calling task.
    pub fn dispatch(&self, job: Job) {
        match self {
            Self::Sequential(tx) => {
                if tx.send(job).is_err() {
                    warn!("Event queue worker has stopped, dropping notification");
                }
            }
            Self::Immediate(pending) => match pending.lock() {
                Ok(mut pending) => pending.push_back(job),
                Err(_) => error!("Immediate event queue poisoned, dropping notification"),
            },
        }
    }

    /// Run every pending immediate callback in order. Must not be called with
    /// a connection or channel lock held, since callbacks may re-enter the client.
    pub async fn flush(&self) {
        let Self::Immediate(pending) = self else {
            return;
        };

        loop {
            let job = match pending.lock() {
                Ok(mut pending) => pending.pop_front(),
                Err(_) => None,
            };
            let Some(job) = job else {
                break;
            };
            job.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[tokio::test]
    async fn sequential_queue_preserves_order() {
        let queue = EventQueue::sequential().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        for i in 0..5 {
            let seen = Arc::clone(&seen);
            let done_tx = done_tx.clone();
            queue.dispatch(Box::pin(async move {
                // Earlier jobs sleep longer; ordering must still hold.
                tokio::time::sleep(Duration::from_millis(10 - 2 * i)).await;
                seen.lock().unwrap().push(i);
                let _ = done_tx.send(());
            }));
        }

        for _ in 0..5 {
            tokio::time::timeout(Duration::from_secs(2), done_rx.recv())
                .await
                .unwrap();
        }
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn panicking_listener_does_not_stop_worker() {
        let queue = EventQueue::sequential().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        queue.dispatch(Box::pin(async {
            if true {
                panic!("listener bug");
            }
        }));
        queue.dispatch(Box::pin(async move {
            let _ = tx.send("delivered");
        }));

        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(got, Some("delivered"));
    }

    #[tokio::test]
    async fn immediate_queue_runs_on_flush() {
        let queue = EventQueue::immediate();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let seen = Arc::clone(&seen);
            queue.dispatch(Box::pin(async move {
                seen.lock().unwrap().push(i);
            }));
        }
        assert!(seen.lock().unwrap().is_empty());

        queue.flush().await;
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn job_queued_during_flush_runs_in_same_flush() {
        let queue = EventQueue::immediate();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let inner_queue = queue.clone();
        let inner_seen = Arc::clone(&seen);
        queue.dispatch(Box::pin(async move {
            inner_seen.lock().unwrap().push("outer");
            let seen = Arc::clone(&inner_seen);
            inner_queue.dispatch(Box::pin(async move {
                seen.lock().unwrap().push("inner");
            }));
        }));

        queue.flush().await;
        assert_eq!(*seen.lock().unwrap(), vec!["outer", "inner"]);
    }

    #[test]
    fn sequential_queue_requires_runtime() {
        assert!(matches!(
            EventQueue::sequential(),
            Err(PusherError::InvalidState(_))
        ));
    }
}
