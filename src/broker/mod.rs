//! Client-side broker contract.
//!
//! `BrokerChannel` is the seam between the task protocol (topology, publisher,
//! consumer) and whatever actually speaks to a broker. Two implementations
//! live here:
//! - `amqp::AmqpChannel`: a lapin channel on a real AMQP 0-9-1 connection.
//! - `memory::MemoryBroker`: an in-process loopback broker with the same
//!   declare/bind/route/ack semantics, used by tests and local runs.
//!
//! Every operation takes `&self`; implementations must tolerate concurrent
//! publish and consume on one channel.

pub mod amqp;
pub mod memory;
pub mod message;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::utils::error::Result;
use message::{Delivery, TaskMessage};

pub use memory::{BrokerEvent, JournalEntry, MemoryBroker};

/// The lazy, unbounded sequence of deliveries returned by `consume`.
/// It ends when the channel closes and cannot be restarted.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Routes to queues bound with a routing key equal to the message's.
    Direct,
    /// Routes to every bound queue.
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

/// Parameters of a `queue.declare`. An empty name asks the broker to
/// generate one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueSpec {
    /// A named, durable queue shared by competing consumers.
    pub fn shared(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// A server-named queue private to the declaring connection.
    pub fn exclusive() -> Self {
        Self {
            name: String::new(),
            durable: false,
            exclusive: true,
            auto_delete: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    pub fn durable(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: true,
        }
    }
}

/// A declared queue, carrying the name the broker resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHandle {
    pub name: String,
    pub spec: QueueSpec,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeHandle {
    pub name: String,
    pub kind: ExchangeKind,
}

/// Where a message is published. An empty exchange with the queue name as
/// routing key addresses that queue directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub exchange: String,
    pub routing_key: String,
}

impl Target {
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            exchange: String::new(),
            routing_key: name.into(),
        }
    }

    pub fn exchange(name: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: name.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// `basic.consume` parameters. Auto-ack is never used.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Empty means "let the channel pick one".
    pub consumer_tag: String,
    /// `basic.qos` prefetch; 0 leaves it unlimited.
    pub prefetch_count: u16,
}

/// What the broker said about a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerReceipt {
    /// The broker confirmed receipt (`basic.ack` under publisher confirms).
    Confirmed,
    /// The channel does not run publisher confirms; nothing was confirmed.
    Unconfirmed,
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueHandle>;

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<ExchangeHandle>;

    async fn bind(
        &self,
        queue: &QueueHandle,
        exchange: &ExchangeHandle,
        routing_key: &str,
    ) -> Result<()>;

    async fn publish(&self, target: &Target, message: &TaskMessage) -> Result<BrokerReceipt>;

    async fn consume(&self, queue: &QueueHandle, options: &ConsumeOptions)
    -> Result<DeliveryStream>;

    /// Closes the channel. Unacknowledged deliveries go back to the broker.
    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests;
