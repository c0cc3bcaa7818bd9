//! Topology declarator
//!
//! Makes sure the queue and/or exchange a process needs exist before it
//! publishes or consumes. Declarations are idempotent on the broker side; a
//! conflicting redeclaration surfaces as `TaskError::TopologyConflict` and is
//! never retried, since it means two processes disagree about configuration.
//!
//! Three named modes cover the two delivery patterns:
//! - `SharedQueue`: one durable queue, consumers compete for each message.
//! - `Fanout`: every consumer binds its own exclusive queue to a fanout
//!   exchange and gets a copy of every message.
//! - `Direct`: like `Fanout`, but a consumer only gets messages whose routing
//!   key equals the key it bound with.

use tracing::info;

use crate::broker::{
    ExchangeHandle, ExchangeKind, ExchangeSpec, QueueHandle, QueueSpec, Target,
};
use crate::config::TopologySettings;
use crate::session::Session;
use crate::utils::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyMode {
    SharedQueue,
    Fanout,
    Direct { routing_key: String },
}

/// What to declare for one side of one mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyDescriptor {
    pub queue: Option<QueueSpec>,
    pub exchange: Option<ExchangeSpec>,
    pub routing_key: String,
}

impl TopologyDescriptor {
    /// Producers declare what they publish into: the shared queue, or the
    /// exchange. They never declare the consumers' private queues.
    pub fn producer(mode: &TopologyMode, names: &TopologySettings) -> Self {
        match mode {
            TopologyMode::SharedQueue => Self {
                queue: Some(QueueSpec::shared(&names.queue)),
                exchange: None,
                routing_key: names.queue.clone(),
            },
            TopologyMode::Fanout => Self {
                queue: None,
                exchange: Some(ExchangeSpec::durable(
                    &names.fanout_exchange,
                    ExchangeKind::Fanout,
                )),
                routing_key: String::new(),
            },
            TopologyMode::Direct { routing_key } => Self {
                queue: None,
                exchange: Some(ExchangeSpec::durable(
                    &names.direct_exchange,
                    ExchangeKind::Direct,
                )),
                routing_key: routing_key.clone(),
            },
        }
    }

    /// Consumers declare the queue they read from and, for exchange modes,
    /// bind a fresh exclusive queue under their routing key.
    pub fn consumer(mode: &TopologyMode, names: &TopologySettings) -> Self {
        match mode {
            TopologyMode::SharedQueue => Self::producer(mode, names),
            TopologyMode::Fanout => Self {
                queue: Some(QueueSpec::exclusive()),
                ..Self::producer(mode, names)
            },
            TopologyMode::Direct { .. } => Self {
                queue: Some(QueueSpec::exclusive()),
                ..Self::producer(mode, names)
            },
        }
    }

    pub fn exchange_kind(&self) -> Option<ExchangeKind> {
        self.exchange.as_ref().map(|e| e.kind)
    }
}

/// The handles a declaration produced, plus where to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredTopology {
    pub queue: Option<QueueHandle>,
    pub exchange: Option<ExchangeHandle>,
    pub target: Target,
}

pub async fn declare_queue(session: &Session, spec: &QueueSpec) -> Result<QueueHandle> {
    session.channel().declare_queue(spec).await
}

pub async fn declare_exchange(session: &Session, spec: &ExchangeSpec) -> Result<ExchangeHandle> {
    session.channel().declare_exchange(spec).await
}

pub async fn bind(
    session: &Session,
    queue: &QueueHandle,
    exchange: &ExchangeHandle,
    routing_key: &str,
) -> Result<()> {
    session.channel().bind(queue, exchange, routing_key).await
}

/// Declares exchange, then queue, then the binding between them, so a
/// consumer's queue is bound before anything consumes from it.
pub async fn declare(session: &Session, descriptor: &TopologyDescriptor) -> Result<DeclaredTopology> {
    let exchange = match &descriptor.exchange {
        Some(spec) => Some(declare_exchange(session, spec).await?),
        None => None,
    };
    let queue = match &descriptor.queue {
        Some(spec) => Some(declare_queue(session, spec).await?),
        None => None,
    };

    if let (Some(queue), Some(exchange)) = (&queue, &exchange) {
        bind(session, queue, exchange, &descriptor.routing_key).await?;
    }

    let target = match (&exchange, &queue) {
        (Some(exchange), _) => Target::exchange(&exchange.name, &descriptor.routing_key),
        (None, Some(queue)) => Target::queue(&queue.name),
        (None, None) => Target::queue(&descriptor.routing_key),
    };

    info!(
        queue = queue.as_ref().map(|q| q.name.as_str()).unwrap_or("-"),
        exchange = exchange.as_ref().map(|e| e.name.as_str()).unwrap_or("-"),
        routing_key = %descriptor.routing_key,
        "Topology declared"
    );

    Ok(DeclaredTopology {
        queue,
        exchange,
        target,
    })
}

#[cfg(test)]
mod tests;
