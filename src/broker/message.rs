//! Message definitions
//!
//! `TaskMessage` is what a producer hands to the broker: an opaque body plus
//! the metadata AMQP carries in basic properties. It is immutable once built;
//! the `with_*` methods consume and return a new value.
//!
//! `Delivery` is one broker hand-off of a `TaskMessage` to one consumer. It
//! owns the acknowledgment handle and enforces the per-delivery lifecycle:
//!
//! ```text
//! Received -> Processing -> Acknowledged
//!                       \-> Rejected
//! ```
//!
//! Both terminal states are final; any further `ack`/`reject` is refused
//! locally and never reaches the broker.

use std::fmt;

use async_trait::async_trait;
use uuid::Uuid;

use crate::utils::error::{Result, TaskError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskMessage {
    body: Vec<u8>,
    content_type: String,
    durable: bool,
    routing_key: Option<String>,
    message_id: String,
    timestamp: i64,
}

impl TaskMessage {
    /// Builds a transient `text/plain` message with a fresh id and timestamp.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            content_type: "text/plain".to_string(),
            durable: false,
            routing_key: None,
            message_id: Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Whether the broker should persist the message (delivery mode 2).
    pub fn durable(&self) -> bool {
        self.durable
    }

    pub fn routing_key(&self) -> Option<&str> {
        self.routing_key.as_deref()
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Seconds since the UNIX epoch, as the AMQP `timestamp` property expects.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Received,
    Processing,
    Acknowledged,
    Rejected,
}

impl DeliveryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryState::Acknowledged | DeliveryState::Rejected)
    }
}

/// Settles a delivery with the broker that produced it.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<()>;
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()>;
}

pub struct Delivery {
    message: TaskMessage,
    delivery_tag: u64,
    redelivered: bool,
    exchange: String,
    routing_key: String,
    state: DeliveryState,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        message: TaskMessage,
        delivery_tag: u64,
        redelivered: bool,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            message,
            delivery_tag,
            redelivered,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            state: DeliveryState::Received,
            acker,
        }
    }

    pub fn message(&self) -> &TaskMessage {
        &self.message
    }

    pub fn body(&self) -> &[u8] {
        self.message.body()
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn state(&self) -> DeliveryState {
        self.state
    }

    /// `Received -> Processing`.
    pub fn start_processing(&mut self) -> Result<()> {
        self.expect_state(DeliveryState::Received, "start processing")?;
        self.state = DeliveryState::Processing;
        Ok(())
    }

    /// `Processing -> Acknowledged`. Only legal once processing has started.
    pub async fn ack(&mut self) -> Result<()> {
        self.expect_state(DeliveryState::Processing, "acknowledge")?;
        self.acker.ack(self.delivery_tag).await?;
        self.state = DeliveryState::Acknowledged;
        Ok(())
    }

    /// `Processing -> Rejected`. With `requeue` the broker puts the message
    /// back at the head of its queue and marks the next delivery redelivered;
    /// without it the message is dropped or dead-lettered by the broker.
    pub async fn reject(&mut self, requeue: bool) -> Result<()> {
        self.expect_state(DeliveryState::Processing, "reject")?;
        self.acker.reject(self.delivery_tag, requeue).await?;
        self.state = DeliveryState::Rejected;
        Ok(())
    }

    fn expect_state(&self, expected: DeliveryState, action: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(TaskError::InvalidDeliveryState {
                delivery_tag: self.delivery_tag,
                state: self.state,
                action,
            })
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("state", &self.state)
            .field("message", &self.message)
            .finish()
    }
}
