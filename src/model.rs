//! Core data model.
//!
//! A work item is one unit of work pushed into a queue. It carries an opaque
//! inbound payload, and once processed either an outbound payload or an
//! error message. `Work` is a shared handle: the queue's audit log and the
//! consumer holding the item observe the same record.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Work Id
// ---------------------------------------------------------------------------

/// Newtype for work item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkId(pub Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The id carried by an empty work item.
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Admitted, waiting for a consumer.
    #[default]
    Pending,
    /// A consumer is processing it.
    Running,
    /// Processed successfully. Terminal.
    Done,
    /// Processing failed. Terminal.
    Failed,
}

impl State {
    pub const ALL: [State; 4] = [State::Pending, State::Running, State::Done, State::Failed];

    /// Is `self → to` part of the usual lifecycle? Advisory: the `Work`
    /// transitions themselves accept any prior state.
    pub fn can_transition_to(self, to: State) -> bool {
        use State::*;
        matches!((self, to), (Pending, Running) | (Running, Done) | (Running, Failed))
    }

    /// [`State::can_transition_to`] as a `Result`, for callers that guard
    /// their own lifecycle.
    pub fn check_transition(self, to: State) -> Result<()> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(Error::InvalidTransition { from: self, to })
        }
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Done | State::Failed)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Pending => "pending",
            State::Running => "running",
            State::Done => "done",
            State::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for State {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(State::Pending),
            "running" => Ok(State::Running),
            "done" => Ok(State::Done),
            "failed" => Ok(State::Failed),
            other => Err(Error::InvalidArgument(format!("unknown work state: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Work Record
// ---------------------------------------------------------------------------

/// Plain, serialisable view of a work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRecord {
    /// Unique identifier. Nil marks an empty work item.
    pub id: WorkId,

    /// Key of the owning queue. Empty is filled in on admission.
    pub key: String,

    pub state: State,

    /// Message that arrived with the work. Opaque to the engine.
    pub inbound_payload: String,

    /// Response set by the processor on success.
    pub outbound_payload: Option<String>,

    /// Reason set on failure.
    pub error_message: Option<String>,

    /// Unset is filled in on admission.
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkRecord {
    /// A pending record with a fresh id and no timestamps.
    pub fn new(key: impl Into<String>, inbound_payload: impl Into<String>) -> Self {
        Self {
            id: WorkId::new(),
            key: key.into(),
            state: State::Pending,
            inbound_payload: inbound_payload.into(),
            outbound_payload: None,
            error_message: None,
            created_at: None,
            started_at: None,
            finished_at: None,
        }
    }

    fn empty() -> Self {
        Self {
            id: WorkId::nil(),
            ..Self::new("", "")
        }
    }
}

// ---------------------------------------------------------------------------
// Work
// ---------------------------------------------------------------------------

/// A unit of work. Cloning yields another handle to the same record.
#[derive(Debug, Clone)]
pub struct Work {
    inner: Arc<Mutex<WorkRecord>>,
}

impl Default for Work {
    /// The empty work item, rejected on admission.
    fn default() -> Self {
        Self::from_record(WorkRecord::empty())
    }
}

impl Work {
    /// Create a pending work item for the queue `key`, stamped now.
    pub fn new(key: impl Into<String>, inbound_payload: impl Into<String>) -> Self {
        let mut record = WorkRecord::new(key, inbound_payload);
        record.created_at = Some(Utc::now());
        Self::from_record(record)
    }

    /// Wrap a caller-built record. Unset defaults are applied on admission.
    pub fn from_record(record: WorkRecord) -> Self {
        Self {
            inner: Arc::new(Mutex::new(record)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WorkRecord> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether both handles refer to the same work item.
    pub fn same(&self, other: &Work) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().id.is_nil()
    }

    pub fn snapshot(&self) -> WorkRecord {
        self.lock().clone()
    }

    pub fn id(&self) -> WorkId {
        self.lock().id
    }

    pub fn key(&self) -> String {
        self.lock().key.clone()
    }

    pub fn state(&self) -> State {
        self.lock().state
    }

    pub fn inbound_payload(&self) -> String {
        self.lock().inbound_payload.clone()
    }

    pub fn outbound_payload(&self) -> Option<String> {
        self.lock().outbound_payload.clone()
    }

    pub fn error_message(&self) -> Option<String> {
        self.lock().error_message.clone()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.lock().created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.lock().started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.lock().finished_at
    }

    /// Overwrite the state without validation. Intended for replaying work
    /// from an external record; lifecycle code should use the transitions.
    pub fn set_state(&self, state: State) {
        self.lock().state = state;
    }

    pub fn set_outbound_payload(&self, payload: impl Into<String>) {
        self.lock().outbound_payload = Some(payload.into());
    }

    pub fn set_error_message(&self, message: impl Into<String>) {
        self.lock().error_message = Some(message.into());
    }

    /// Mark the work running and stamp `started_at`.
    ///
    /// Accepted from any state, so a failed item can be re-run in place.
    /// Callers that want the usual lifecycle enforced consult
    /// [`State::check_transition`] first.
    pub fn start(&self) {
        self.transition(State::Running, |record, now| {
            record.started_at = Some(now);
        });
    }

    /// Mark the work done and stamp `finished_at`.
    pub fn finish(&self) {
        self.transition(State::Done, |record, now| {
            record.finished_at = Some(now);
        });
    }

    /// Mark the work failed, keeping `reason`, and stamp `finished_at`.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.transition(State::Failed, move |record, now| {
            record.error_message = Some(reason);
            record.finished_at = Some(now);
        });
    }

    fn transition(&self, to: State, apply: impl FnOnce(&mut WorkRecord, DateTime<Utc>)) {
        let mut record = self.lock();
        let from = record.state;
        record.state = to;
        apply(&mut record, Utc::now());
        tracing::debug!(
            work.id = %record.id,
            queue = %record.key,
            %from,
            %to,
            "state_transition"
        );
    }

    /// Fill in the defaults an admitting queue is responsible for.
    pub(crate) fn admit(&self, queue_key: &str) {
        let mut record = self.lock();
        if record.created_at.is_none() {
            record.created_at = Some(Utc::now());
        }
        if record.key.is_empty() {
            record.key = queue_key.to_string();
        }
    }
}
