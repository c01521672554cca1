//! # queuehub
//!
//! In-process, in-memory work queues.
//!
//! An [`Engine`](engine::Engine) registers named queues on demand. Producers
//! push [`Work`](model::Work) into a [`QueueManager`](queue::QueueManager);
//! consumers pull from one queue or wait across several at once. Queues with
//! an expiration window are swept once they sit idle past it.

pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod queue;
pub mod telemetry;

pub use engine::{Engine, QueueWatcher};
pub use error::{Error, Result};
pub use model::{State, Work, WorkId, WorkRecord};
pub use queue::{QueueInfo, QueueManager};
pub use tokio_util::sync::CancellationToken;
