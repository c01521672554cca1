//! Error types for queuehub.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("queue not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("queue is closed: {0}")]
    Closed(String),

    #[error("wait cancelled")]
    Cancelled,

    #[error("backlog full for queue {key} ({capacity} items waiting)")]
    BacklogFull { key: String, capacity: usize },

    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: crate::model::State,
        to: crate::model::State,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for the "no item" outcomes of a blocking consume call.
    pub fn is_no_item(&self) -> bool {
        matches!(self, Error::Cancelled | Error::Closed(_) | Error::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
