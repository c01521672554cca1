//! A single named queue.
//!
//! Each queue keeps three things behind one lock:
//!
//! - the sending half of a bounded delivery buffer that wakes consumers,
//! - an append-only audit log of every admitted work item, used for counts,
//! - expiration bookkeeping consulted by the engine's sweeper.
//!
//! Admission never waits. When the delivery buffer is full, items are parked
//! in a bounded backlog and forwarded in order by a drain task that lives
//! exactly as long as the queue is open.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{State, Work};
use crate::telemetry::metrics;

/// Delivery buffer slots for queues created by the engine.
pub const DEFAULT_CAPACITY: usize = 100;

/// Backlog limit for queues created without an explicit one.
pub const DEFAULT_BACKLOG_CAPACITY: usize = 10_000;

/// One named queue of work.
pub struct QueueManager {
    key: String,
    capacity: usize,
    created_at: DateTime<Utc>,
    shared: Arc<Shared>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Work>>,
    shutdown: CancellationToken,
}

/// State reachable from both the queue handle and its drain task.
struct Shared {
    state: Mutex<QueueState>,
    backlog_ready: Notify,
}

struct QueueState {
    /// `None` once closed.
    sender: Option<mpsc::Sender<Work>>,
    audit: Vec<Work>,
    backlog: VecDeque<Work>,
    /// Taken off the backlog by the drain task, not yet in the buffer.
    in_flight: usize,
    backlog_capacity: usize,
    expiration: Duration,
    last_reset: Instant,
    closed: bool,
}

impl QueueState {
    /// New admissions must queue behind the backlog to keep delivery order.
    fn overflowing(&self) -> bool {
        !self.backlog.is_empty() || self.in_flight > 0
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Point-in-time summary of a queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueInfo {
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub capacity: usize,
    pub expiration_ms: u64,
    pub time_to_expire_ms: i64,
    pub closed: bool,
    pub backlog: usize,
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
}

impl QueueManager {
    /// Create a queue with a delivery buffer of `capacity` slots.
    ///
    /// # Panics
    ///
    /// Outside a Tokio runtime: the backlog drain task is spawned on the
    /// current one. Use [`QueueManager::with_limits`] to name a runtime
    /// explicitly.
    pub fn new(key: impl Into<String>, capacity: usize) -> Self {
        Self::with_limits(key, capacity, DEFAULT_BACKLOG_CAPACITY, &Handle::current())
    }

    /// Create a queue with an explicit backlog limit whose drain task runs on
    /// `runtime`. Callable from any thread.
    pub fn with_limits(
        key: impl Into<String>,
        capacity: usize,
        backlog_capacity: usize,
        runtime: &Handle,
    ) -> Self {
        let key = key.into();
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                sender: Some(sender.clone()),
                audit: Vec::new(),
                backlog: VecDeque::new(),
                in_flight: 0,
                backlog_capacity: backlog_capacity.max(1),
                expiration: Duration::ZERO,
                last_reset: Instant::now(),
                closed: false,
            }),
            backlog_ready: Notify::new(),
        });
        let shutdown = CancellationToken::new();

        runtime.spawn(drain_backlog(
            key.clone(),
            Arc::clone(&shared),
            sender,
            shutdown.clone(),
        ));

        Self {
            key,
            capacity,
            created_at: Utc::now(),
            shared,
            receiver: tokio::sync::Mutex::new(receiver),
            shutdown,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.shared.lock()
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Admit a work item.
    ///
    /// The item is recorded in the audit log before it is offered to the
    /// delivery buffer, so success means "recorded and on its way", not
    /// "visible to a consumer yet".
    pub fn add_work(&self, work: Work) -> Result<()> {
        if work.is_empty() {
            return Err(Error::InvalidArgument("work cannot be empty".to_string()));
        }

        let mut state = self.lock();
        if state.closed {
            return Err(Error::Closed(self.key.clone()));
        }

        // Outside an overflow the backlog is empty, so parking always fits.
        if state.overflowing() && state.backlog.len() >= state.backlog_capacity {
            return Err(Error::BacklogFull {
                key: self.key.clone(),
                capacity: state.backlog_capacity,
            });
        }

        work.admit(&self.key);
        state.audit.push(work.clone());

        let work = if state.overflowing() {
            work
        } else {
            let offered = match state.sender.as_ref() {
                Some(sender) => sender.try_send(work),
                None => Err(TrySendError::Closed(work)),
            };
            match offered {
                Ok(()) => {
                    metrics::record_admitted("direct");
                    return Ok(());
                }
                Err(TrySendError::Full(work)) => work,
                Err(TrySendError::Closed(_)) => {
                    state.audit.pop();
                    return Err(Error::Closed(self.key.clone()));
                }
            }
        };

        state.backlog.push_back(work);
        debug!(queue = %self.key, backlog = state.backlog.len(), "delivery buffer full, work parked");
        drop(state);

        self.shared.backlog_ready.notify_one();
        metrics::record_admitted("backlog");
        Ok(())
    }

    /// Wait for the next work item.
    ///
    /// Fails with [`Error::Cancelled`] when `cancel` fires (checked first) and
    /// with [`Error::Closed`] once the queue is closed and its buffer drained.
    pub async fn next_work(&self, cancel: &CancellationToken) -> Result<Work> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            work = self.recv() => {
                let work = work.ok_or_else(|| Error::Closed(self.key.clone()))?;
                metrics::record_delivered("single");
                Ok(work)
            }
        }
    }

    /// Receive from the delivery buffer. `None` once closed and drained.
    pub(crate) async fn recv(&self) -> Option<Work> {
        let mut receiver = self.receiver.lock().await;
        receiver.recv().await
    }

    /// Close the queue. Idempotent.
    ///
    /// Further admissions fail, the drain task stops, parked backlog items
    /// are dropped from delivery (they stay in the audit log) and consumers
    /// are released once the buffer is empty.
    pub fn close(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.sender = None;
        let dropped = state.backlog.len();
        state.backlog.clear();
        self.shutdown.cancel();
        drop(state);

        debug!(queue = %self.key, dropped, "queue closed");
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Items parked behind a full delivery buffer.
    pub fn backlog_len(&self) -> usize {
        let state = self.lock();
        state.backlog.len() + state.in_flight
    }

    // -----------------------------------------------------------------------
    // Expiration
    // -----------------------------------------------------------------------

    /// Set the expiration window and restart it. Zero disables expiry.
    pub fn set_expiration(&self, expiration: Duration) {
        let mut state = self.lock();
        state.expiration = expiration;
        state.last_reset = Instant::now();
    }

    /// Restart the expiration window, keeping its length.
    pub fn reset_expiration(&self) {
        self.lock().last_reset = Instant::now();
    }

    pub fn expiration(&self) -> Duration {
        self.lock().expiration
    }

    /// Time left before the queue expires; negative once past due and zero
    /// when expiry is disabled.
    pub fn time_to_expire(&self) -> TimeDelta {
        let state = self.lock();
        if state.expiration.is_zero() {
            return TimeDelta::zero();
        }
        let expiration = TimeDelta::from_std(state.expiration).unwrap_or(TimeDelta::MAX);
        let elapsed = TimeDelta::from_std(state.last_reset.elapsed()).unwrap_or(TimeDelta::MAX);
        expiration - elapsed
    }

    pub fn has_expired(&self) -> bool {
        let state = self.lock();
        !state.expiration.is_zero() && state.last_reset.elapsed() >= state.expiration
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn count_all_works(&self) -> usize {
        self.lock().audit.len()
    }

    pub fn count_pending_works(&self) -> usize {
        self.count_by_state(State::Pending)
    }

    pub fn count_running_works(&self) -> usize {
        self.count_by_state(State::Running)
    }

    pub fn count_done_works(&self) -> usize {
        self.count_by_state(State::Done)
    }

    pub fn count_failed_works(&self) -> usize {
        self.count_by_state(State::Failed)
    }

    /// Every admitted work currently in `state`, in admission order.
    pub fn list_works_by_state(&self, state: State) -> Vec<Work> {
        self.lock()
            .audit
            .iter()
            .filter(|w| w.state() == state)
            .cloned()
            .collect()
    }

    fn count_by_state(&self, state: State) -> usize {
        self.lock().audit.iter().filter(|w| w.state() == state).count()
    }

    pub fn info(&self) -> QueueInfo {
        let (total, counts) = {
            let state = self.lock();
            let mut counts = [0usize; 4];
            for work in &state.audit {
                counts[work.state() as usize] += 1;
            }
            (state.audit.len(), counts)
        };
        let [pending, running, done, failed] = counts;
        QueueInfo {
            key: self.key.clone(),
            created_at: self.created_at,
            capacity: self.capacity,
            expiration_ms: u64::try_from(self.expiration().as_millis()).unwrap_or(u64::MAX),
            time_to_expire_ms: self.time_to_expire().num_milliseconds(),
            closed: self.is_closed(),
            backlog: self.backlog_len(),
            total,
            pending,
            running,
            done,
            failed,
        }
    }
}

impl Drop for QueueManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("key", &self.key)
            .field("capacity", &self.capacity)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Forward parked work into the delivery buffer, oldest first, until the
/// queue closes.
async fn drain_backlog(
    key: String,
    shared: Arc<Shared>,
    sender: mpsc::Sender<Work>,
    shutdown: CancellationToken,
) {
    loop {
        let next = {
            let mut state = shared.lock();
            let next = state.backlog.pop_front();
            if next.is_some() {
                state.in_flight += 1;
            }
            next
        };

        let work = match next {
            Some(work) => work,
            None => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = shared.backlog_ready.notified() => {}
                }
                continue;
            }
        };

        let delivered = tokio::select! {
            _ = shutdown.cancelled() => false,
            sent = sender.send(work) => sent.is_ok(),
        };
        shared.lock().in_flight -= 1;
        if !delivered {
            break;
        }
    }
    debug!(queue = %key, "backlog drain stopped");
}
