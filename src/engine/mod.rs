//! The queue registry: on-demand queue creation, deletion, expiry sweeping
//! and consumption across several queues at once.
//!
//! The registry lock guards only the key → queue map and the creation feed.
//! It is never held while waiting for work: blocking calls resolve their
//! queues first and then wait on the queues' own buffers.

pub mod fan_in;
pub mod sweeper;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::model::Work;
use crate::queue::QueueManager;
use crate::telemetry::metrics;

/// Owns every registered queue. Create one per process (or per scope) and
/// hand out references; there is no global instance.
pub struct Engine {
    registry: Arc<Registry>,
    watcher: QueueWatcher,
    config: EngineConfig,
    /// Start offset for the next fan-in wait set.
    rotation: AtomicUsize,
    sweeper: CancellationToken,
}

pub(crate) struct Registry {
    queues: Mutex<HashMap<String, Arc<QueueManager>>>,
    created: mpsc::Sender<Arc<QueueManager>>,
    /// Wakes watchers parked in [`QueueWatcher::recv`].
    created_ready: Arc<Notify>,
    /// Runtime the engine was built on. Queue drain tasks are spawned here
    /// so producers on plain threads can create queues.
    runtime: Handle,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<QueueManager>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Close and remove every expired queue. Returns the evicted keys.
    pub(crate) fn sweep_expired(&self) -> Vec<String> {
        let mut expired = Vec::new();
        self.lock().retain(|key, queue| {
            if queue.has_expired() {
                queue.close();
                expired.push(key.clone());
                false
            } else {
                true
            }
        });
        for key in &expired {
            info!(queue = %key, "queue expired, removed");
            metrics::record_queue_event("expired");
        }
        expired
    }
}

/// Best-effort feed of newly created queues.
///
/// All clones share one buffer: each creation is seen by at most one
/// reader, and creations are dropped while the buffer is full. The buffer
/// lock is only held to take an item, so [`QueueWatcher::try_recv`] sees
/// buffered creations even while another clone waits in `recv`.
#[derive(Clone)]
pub struct QueueWatcher {
    receiver: Arc<Mutex<mpsc::Receiver<Arc<QueueManager>>>>,
    ready: Arc<Notify>,
}

impl QueueWatcher {
    /// Wait for the next created queue. Returns `None` when called after
    /// the engine is gone and the buffer is drained.
    pub async fn recv(&self) -> Option<Arc<QueueManager>> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            // Register before checking so a creation in between is not missed.
            notified.as_mut().enable();

            match self.take() {
                Ok(queue) => return Some(queue),
                Err(TryRecvError::Disconnected) => return None,
                Err(TryRecvError::Empty) => notified.await,
            }
        }
    }

    /// Take a buffered creation, if any, without waiting.
    pub fn try_recv(&self) -> Option<Arc<QueueManager>> {
        self.take().ok()
    }

    fn take(&self) -> std::result::Result<Arc<QueueManager>, TryRecvError> {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_recv()
    }
}

impl Engine {
    /// Create an engine with default settings.
    ///
    /// # Panics
    ///
    /// Outside a Tokio runtime. The engine binds to the current runtime:
    /// the expiry sweeper and every queue's drain task run there, so the
    /// engine itself can then be used from any thread.
    pub fn new() -> Self {
        Self::build(EngineConfig::default())
    }

    /// Create an engine with validated custom settings.
    pub fn with_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: EngineConfig) -> Self {
        let (created, receiver) = mpsc::channel(config.notification_capacity);
        let created_ready = Arc::new(Notify::new());
        let registry = Arc::new(Registry {
            queues: Mutex::new(HashMap::new()),
            created,
            created_ready: Arc::clone(&created_ready),
            runtime: Handle::current(),
        });
        let sweeper = CancellationToken::new();
        sweeper::spawn(Arc::clone(&registry), config.sweep_interval(), sweeper.clone());

        Self {
            registry,
            watcher: QueueWatcher {
                receiver: Arc::new(Mutex::new(receiver)),
                ready: created_ready,
            },
            config,
            rotation: AtomicUsize::new(0),
            sweeper,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Registry
    // -----------------------------------------------------------------------

    /// Return the queue for `key`, creating it if needed. Never blocks on
    /// the creation feed.
    pub fn get_or_create_queue(&self, key: &str) -> Arc<QueueManager> {
        let mut queues = self.registry.lock();
        if let Some(queue) = queues.get(key) {
            return Arc::clone(queue);
        }

        let queue = Arc::new(QueueManager::with_limits(
            key,
            self.config.queue_capacity,
            self.config.backlog_capacity,
            &self.registry.runtime,
        ));
        if self.config.default_expiration_ms > 0 {
            queue.set_expiration(self.config.default_expiration());
        }
        queues.insert(key.to_string(), Arc::clone(&queue));

        if self.registry.created.try_send(Arc::clone(&queue)).is_ok() {
            self.registry.created_ready.notify_waiters();
        } else {
            debug!(queue = %key, "creation feed full, notification dropped");
        }
        drop(queues);

        debug!(queue = %key, "queue created");
        metrics::record_queue_event("created");
        queue
    }

    pub fn get_queue(&self, key: &str) -> Option<Arc<QueueManager>> {
        self.registry.lock().get(key).cloned()
    }

    /// Close and unregister the queue for `key`.
    pub fn delete_queue(&self, key: &str) -> Result<()> {
        let mut queues = self.registry.lock();
        let queue = queues
            .remove(key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        queue.close();
        drop(queues);

        info!(queue = %key, "queue deleted");
        metrics::record_queue_event("deleted");
        Ok(())
    }

    /// Snapshot of the registered keys, in no particular order.
    pub fn list_queues(&self) -> Vec<String> {
        self.registry.lock().keys().cloned().collect()
    }

    /// The creation feed. See [`QueueWatcher`].
    pub fn watch_queues(&self) -> QueueWatcher {
        self.watcher.clone()
    }

    /// Run one expiry sweep now instead of waiting for the next tick.
    pub fn sweep_expired(&self) -> Vec<String> {
        self.registry.sweep_expired()
    }

    /// Stop the sweeper and close and unregister every queue.
    pub fn shutdown(&self) {
        self.sweeper.cancel();
        let drained: Vec<_> = self.registry.lock().drain().collect();
        for (_, queue) in &drained {
            queue.close();
        }
        info!(queues = drained.len(), "engine shut down");
    }

    // -----------------------------------------------------------------------
    // Consumption
    // -----------------------------------------------------------------------

    /// Wait for the next work on the queue `key`.
    pub async fn next_work(&self, cancel: &CancellationToken, key: &str) -> Result<Work> {
        let queue = self
            .get_queue(key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        queue.next_work(cancel).await
    }

    /// Wait for the next work on any of the queues named by `keys`.
    ///
    /// Keys are resolved once, up front; queues created afterwards are not
    /// watched. When several queues have work, which one is served is
    /// unspecified. Cancellation wins over available work. Returns the work
    /// and the key of the queue it came from.
    pub async fn next_work_from_queues<K: AsRef<str>>(
        &self,
        cancel: &CancellationToken,
        keys: &[K],
    ) -> Result<(Work, String)> {
        let mut sources: Vec<Arc<QueueManager>> = {
            let queues = self.registry.lock();
            keys.iter()
                .filter_map(|key| queues.get(key.as_ref()).cloned())
                .collect()
        };
        if sources.is_empty() {
            let wanted: Vec<&str> = keys.iter().map(AsRef::as_ref).collect();
            return Err(Error::NotFound(wanted.join(",")));
        }

        let start = self.rotation.fetch_add(1, Ordering::Relaxed) % sources.len();
        sources.rotate_left(start);
        fan_in::wait_any(cancel, sources).await
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}
