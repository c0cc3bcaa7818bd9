//! The `error` module defines the error types shared across `taskrelay`.
//!
//! Setup-phase failures (`Connection`, `TopologyConflict`, `Config`) are meant
//! to abort startup. Publish failures are returned to the caller untouched.
//! Handler failures use the separate [`ProcessingError`] so the consumer loop
//! can turn them into an explicit reject instead of propagating them.

use std::time::Duration;

use thiserror::Error;

use crate::broker::message::DeliveryState;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("failed to connect to broker at {endpoint}: {reason}")]
    Connection { endpoint: String, reason: String },

    #[error("{entity} '{name}' conflicts with an existing declaration: {reason}")]
    TopologyConflict {
        entity: &'static str,
        name: String,
        reason: String,
    },

    #[error("{entity} '{name}' not found")]
    NotFound { entity: &'static str, name: String },

    #[error("publish was not confirmed within {0:?}")]
    PublishTimeout(Duration),

    #[error("broker rejected publish of message {message_id}")]
    PublishNacked { message_id: String },

    #[error("cannot {action} delivery {delivery_tag} in state {state:?}")]
    InvalidDeliveryState {
        delivery_tag: u64,
        state: DeliveryState,
        action: &'static str,
    },

    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    #[error("channel is closed")]
    ChannelClosed,

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Failure reported by a task handler between receipt and acknowledgment.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("processing failed: {0}")]
pub struct ProcessingError(pub String);

impl ProcessingError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

pub type Result<T> = std::result::Result<T, TaskError>;
