//! Registry of in-flight operations (message handlers, receipt waits).
//!
//! Each entry is a keyed one-shot: whoever completes it decides success,
//! failure, or cancellation with a diagnostic reason. Graceful disconnect
//! waits for the registry to drain via [`InFlight::wait_idle`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, oneshot};

use stomp_protocol::error::StompError;

type Outcome = Result<(), StompError>;

/// Keyed one-shot operations sharing a label for diagnostics.
#[derive(Clone)]
pub struct InFlight {
    label: &'static str,
    inner: Arc<Mutex<HashMap<String, oneshot::Sender<Outcome>>>>,
    notify: Arc<Notify>,
}

impl InFlight {
    pub fn new(label: &'static str) -> InFlight {
        InFlight {
            label,
            inner: Arc::new(Mutex::new(HashMap::new())),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Register `key`; the returned receiver resolves when the operation
    /// completes or is cancelled. A key may be in flight only once.
    pub fn insert(&self, key: &str) -> Result<oneshot::Receiver<Outcome>, StompError> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().unwrap();
        if inner.contains_key(key) {
            return Err(StompError::AlreadyRunning(self.label));
        }
        inner.insert(key.to_owned(), tx);
        Ok(rx)
    }

    /// Complete `key` with `outcome`. Returns whether the key was in
    /// flight.
    pub fn complete(&self, key: &str, outcome: Outcome) -> bool {
        let waiter = self.inner.lock().unwrap().remove(key);
        match waiter {
            Some(tx) => {
                let _ = tx.send(outcome);
                self.notify.notify_waiters();
                true
            }
            None => false,
        }
    }

    /// Drop `key` without completing it (its receiver observes a closed
    /// channel). Returns whether the key was in flight.
    pub fn remove(&self, key: &str) -> bool {
        let removed = self.inner.lock().unwrap().remove(key).is_some();
        if removed {
            self.notify.notify_waiters();
        }
        removed
    }

    /// Cancel every in-flight operation with `reason`.
    pub fn cancel_all(&self, reason: &str) {
        let drained: Vec<_> = self.inner.lock().unwrap().drain().collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(StompError::Cancelled(reason.to_owned())));
        }
        self.notify.notify_waiters();
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Resolve once the registry is empty.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before the emptiness check so a completion
            // in between cannot be missed.
            notified.as_mut().enable();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for InFlight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlight")
            .field("label", &self.label)
            .field("len", &self.len())
            .finish()
    }
}
