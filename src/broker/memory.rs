//! Loopback broker
//!
//! An in-process broker implementing the subset of AMQP 0-9-1 behaviour the
//! task protocol relies on:
//! - queues (named or server-named, durable/exclusive/auto-delete flags) and
//!   direct/fanout exchanges, declared idempotently; a redeclaration with
//!   different flags is refused
//! - the default exchange (`""`) routes by queue name
//! - round-robin dispatch to the consumers of a queue, honouring prefetch
//! - unacknowledged deliveries are tracked per channel; `reject(requeue)`
//!   and channel close put them back at the head of their queue with the
//!   redelivered flag set
//!
//! Every `open_channel` call plays the part of one client connection, so two
//! channels on the same `MemoryBroker` behave like two worker processes.
//!
//! The broker also keeps a journal of publish/deliver/settle events with
//! timestamps, and can be stalled so publishes never complete.
//!
//! State sits behind a `std::sync::Mutex` and the lock is never held across
//! an `.await`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::message::{Acknowledger, Delivery, TaskMessage};
use super::{
    BrokerChannel, BrokerReceipt, ConsumeOptions, DeliveryStream, ExchangeHandle, ExchangeKind,
    ExchangeSpec, QueueHandle, QueueSpec, Target,
};
use crate::utils::error::{Result, TaskError};

type ChannelId = u64;

/// Something that happened inside the broker, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Published {
        exchange: String,
        routing_key: String,
        message_id: String,
        queues: Vec<String>,
    },
    Delivered {
        queue: String,
        consumer_tag: String,
        delivery_tag: u64,
        message_id: String,
        redelivered: bool,
    },
    Acked {
        queue: String,
        delivery_tag: u64,
    },
    Rejected {
        queue: String,
        delivery_tag: u64,
        requeue: bool,
    },
    /// An unacknowledged delivery returned to its queue because its channel closed.
    Recovered {
        queue: String,
        delivery_tag: u64,
    },
}

#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub at: Instant,
    pub event: BrokerEvent,
}

#[derive(Debug, Clone)]
struct Envelope {
    message: TaskMessage,
    exchange: String,
    routing_key: String,
    redelivered: bool,
}

#[derive(Debug)]
struct ConsumerSlot {
    tag: String,
    channel: ChannelId,
    sender: mpsc::UnboundedSender<Result<Delivery>>,
    prefetch: u16,
    in_flight: usize,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

#[derive(Debug)]
struct QueueState {
    spec: QueueSpec,
    owner: Option<ChannelId>,
    ready: VecDeque<Envelope>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
}

impl QueueState {
    /// Next consumer with room under its prefetch, round robin.
    fn next_consumer(&mut self) -> Option<usize> {
        let count = self.consumers.len();
        (0..count)
            .map(|offset| (self.cursor + offset) % count)
            .find(|&idx| self.consumers[idx].has_capacity())
    }
}

#[derive(Debug)]
struct ExchangeState {
    kind: ExchangeKind,
    durable: bool,
    /// (queue name, binding key)
    bindings: Vec<(String, String)>,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    consumer_tag: String,
    channel: ChannelId,
    envelope: Envelope,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, QueueState>,
    exchanges: HashMap<String, ExchangeState>,
    unacked: HashMap<u64, Unacked>,
    next_delivery_tag: u64,
    next_channel: ChannelId,
    stalled: bool,
    publish_attempts: usize,
    discarded: Vec<TaskMessage>,
    journal: Vec<JournalEntry>,
}

impl State {
    fn record(&mut self, event: BrokerEvent) {
        debug!(?event, "Broker event");
        self.journal.push(JournalEntry {
            at: Instant::now(),
            event,
        });
    }

    fn route(&self, target: &Target) -> Result<Vec<String>> {
        if target.exchange.is_empty() {
            // unroutable messages are dropped, as with a non-mandatory publish
            return Ok(self
                .queues
                .contains_key(&target.routing_key)
                .then(|| vec![target.routing_key.clone()])
                .unwrap_or_default());
        }

        let exchange = self
            .exchanges
            .get(&target.exchange)
            .ok_or_else(|| TaskError::NotFound {
                entity: "exchange",
                name: target.exchange.clone(),
            })?;

        let mut queues: Vec<String> = Vec::new();
        for (queue, key) in &exchange.bindings {
            let matches = match exchange.kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Direct => *key == target.routing_key,
            };
            if matches && !queues.contains(queue) {
                queues.push(queue.clone());
            }
        }
        Ok(queues)
    }

    /// Hands ready messages to consumers until the queue is empty or every
    /// consumer is at its prefetch limit.
    fn dispatch(&mut self, broker: &Weak<Mutex<State>>, queue_name: &str) {
        let State {
            queues,
            unacked,
            next_delivery_tag,
            journal,
            ..
        } = self;

        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };

        while !queue.ready.is_empty() {
            let Some(idx) = queue.next_consumer() else {
                return;
            };
            let Some(envelope) = queue.ready.pop_front() else {
                return;
            };

            *next_delivery_tag += 1;
            let delivery_tag = *next_delivery_tag;
            let consumer = &mut queue.consumers[idx];

            let delivery = Delivery::new(
                envelope.message.clone(),
                delivery_tag,
                envelope.redelivered,
                envelope.exchange.clone(),
                envelope.routing_key.clone(),
                Box::new(MemoryAcker {
                    state: broker.clone(),
                }),
            );

            if consumer.sender.unbounded_send(Ok(delivery)).is_err() {
                warn!(queue = queue_name, consumer_tag = %consumer.tag, "Consumer went away, dropping it");
                queue.consumers.remove(idx);
                queue.ready.push_front(envelope);
                if queue.consumers.is_empty() {
                    return;
                }
                queue.cursor %= queue.consumers.len();
                continue;
            }

            consumer.in_flight += 1;
            let consumer_tag = consumer.tag.clone();
            let channel = consumer.channel;
            queue.cursor = (idx + 1) % queue.consumers.len();

            journal.push(JournalEntry {
                at: Instant::now(),
                event: BrokerEvent::Delivered {
                    queue: queue_name.to_string(),
                    consumer_tag: consumer_tag.clone(),
                    delivery_tag,
                    message_id: envelope.message.message_id().to_string(),
                    redelivered: envelope.redelivered,
                },
            });
            unacked.insert(
                delivery_tag,
                Unacked {
                    queue: queue_name.to_string(),
                    consumer_tag,
                    channel,
                    envelope,
                },
            );
        }
    }

    fn settle(&mut self, broker: &Weak<Mutex<State>>, delivery_tag: u64, outcome: Settle) -> Result<()> {
        let pending = self
            .unacked
            .remove(&delivery_tag)
            .ok_or(TaskError::UnknownDeliveryTag(delivery_tag))?;

        let Unacked {
            queue: queue_name,
            consumer_tag,
            envelope,
            ..
        } = pending;

        if let Some(queue) = self.queues.get_mut(&queue_name) {
            if let Some(consumer) = queue.consumers.iter_mut().find(|c| c.tag == consumer_tag) {
                consumer.in_flight = consumer.in_flight.saturating_sub(1);
            }
        }

        let event = match outcome {
            Settle::Ack => BrokerEvent::Acked {
                queue: queue_name.clone(),
                delivery_tag,
            },
            Settle::Reject { requeue } => {
                if requeue {
                    if let Some(queue) = self.queues.get_mut(&queue_name) {
                        queue.ready.push_front(Envelope {
                            redelivered: true,
                            ..envelope
                        });
                    }
                } else {
                    self.discarded.push(envelope.message);
                }
                BrokerEvent::Rejected {
                    queue: queue_name.clone(),
                    delivery_tag,
                    requeue,
                }
            }
        };
        self.record(event);
        self.dispatch(broker, &queue_name);
        Ok(())
    }

    /// Drops everything a channel owned: consumers, exclusive queues, and
    /// unacked deliveries, which go back to the head of their queues.
    fn release_channel(&mut self, broker: &Weak<Mutex<State>>, channel: ChannelId) {
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, pending)| pending.channel == channel)
            .map(|(tag, _)| *tag)
            .collect();
        let mut returned: Vec<(u64, Unacked)> = tags
            .into_iter()
            .filter_map(|tag| self.unacked.remove(&tag).map(|pending| (tag, pending)))
            .collect();
        // newest first so push_front leaves the oldest at the head
        returned.sort_by(|a, b| b.0.cmp(&a.0));

        for (delivery_tag, pending) in returned {
            if let Some(queue) = self.queues.get_mut(&pending.queue) {
                queue.ready.push_front(Envelope {
                    redelivered: true,
                    ..pending.envelope
                });
            }
            self.record(BrokerEvent::Recovered {
                queue: pending.queue,
                delivery_tag,
            });
        }

        let mut removed = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| c.channel != channel);
            if queue.consumers.len() != before {
                queue.cursor = 0;
            }
            let orphaned_auto_delete =
                queue.spec.auto_delete && before > 0 && queue.consumers.is_empty();
            if queue.owner == Some(channel) || orphaned_auto_delete {
                removed.push(name.clone());
            }
        }
        for name in &removed {
            self.queues.remove(name);
            for exchange in self.exchanges.values_mut() {
                exchange.bindings.retain(|(queue, _)| queue != name);
            }
            debug!(queue = %name, "Deleted queue");
        }

        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.dispatch(broker, &name);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Settle {
    Ack,
    Reject { requeue: bool },
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The loopback broker. Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new channel, standing in for one client connection.
    pub fn open_channel(&self) -> Arc<MemoryChannel> {
        let id = {
            let mut state = lock(&self.state);
            state.next_channel += 1;
            state.next_channel
        };
        Arc::new(MemoryChannel {
            broker: self.clone(),
            id,
            closed: AtomicBool::new(false),
        })
    }

    /// While stalled, every publish hangs and never reaches a queue.
    pub fn set_stalled(&self, stalled: bool) {
        lock(&self.state).stalled = stalled;
    }

    /// Number of `basic.publish` calls received, stalled or not.
    pub fn publish_attempts(&self) -> usize {
        lock(&self.state).publish_attempts
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        lock(&self.state).journal.clone()
    }

    pub fn events(&self) -> Vec<BrokerEvent> {
        lock(&self.state)
            .journal
            .iter()
            .map(|entry| entry.event.clone())
            .collect()
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.state).queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn exchange_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.state).exchanges.keys().cloned().collect();
        names.sort();
        names
    }

    /// Messages waiting in `queue` that no consumer holds.
    pub fn ready_count(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Deliveries handed out from `queue` and not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        lock(&self.state)
            .unacked
            .values()
            .filter(|pending| pending.queue == queue)
            .count()
    }

    pub fn binding_count(&self, exchange: &str) -> usize {
        lock(&self.state)
            .exchanges
            .get(exchange)
            .map_or(0, |e| e.bindings.len())
    }

    /// Messages rejected without requeue.
    pub fn discarded(&self) -> Vec<TaskMessage> {
        lock(&self.state).discarded.clone()
    }
}

pub struct MemoryChannel {
    broker: MemoryBroker,
    id: ChannelId,
    closed: AtomicBool,
}

impl MemoryChannel {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TaskError::ChannelClosed)
        } else {
            Ok(())
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.broker.state)
    }

    fn weak(&self) -> Weak<Mutex<State>> {
        Arc::downgrade(&self.broker.state)
    }

    fn check_owner(&self, queue: &QueueState, name: &str) -> Result<()> {
        match queue.owner {
            Some(owner) if owner != self.id => Err(TaskError::TopologyConflict {
                entity: "queue",
                name: name.to_string(),
                reason: "exclusive queue belongs to another connection".to_string(),
            }),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueHandle> {
        self.ensure_open()?;
        let mut state = self.state();

        let name = if spec.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            spec.name.clone()
        };

        if let Some(existing) = state.queues.get(&name) {
            self.check_owner(existing, &name)?;
            if existing.spec.durable != spec.durable
                || existing.spec.exclusive != spec.exclusive
                || existing.spec.auto_delete != spec.auto_delete
            {
                return Err(TaskError::TopologyConflict {
                    entity: "queue",
                    name,
                    reason: format!(
                        "declared with durable={} exclusive={} auto_delete={}, requested durable={} exclusive={} auto_delete={}",
                        existing.spec.durable,
                        existing.spec.exclusive,
                        existing.spec.auto_delete,
                        spec.durable,
                        spec.exclusive,
                        spec.auto_delete
                    ),
                });
            }
        } else {
            state.queues.insert(
                name.clone(),
                QueueState {
                    spec: QueueSpec {
                        name: name.clone(),
                        ..spec.clone()
                    },
                    owner: spec.exclusive.then_some(self.id),
                    ready: VecDeque::new(),
                    consumers: Vec::new(),
                    cursor: 0,
                },
            );
            debug!(queue = %name, "Created queue");
        }

        Ok(QueueHandle {
            spec: QueueSpec {
                name: name.clone(),
                ..spec.clone()
            },
            name,
        })
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<ExchangeHandle> {
        self.ensure_open()?;
        if spec.name.is_empty() {
            return Err(TaskError::TopologyConflict {
                entity: "exchange",
                name: spec.name.clone(),
                reason: "the default exchange cannot be redeclared".to_string(),
            });
        }

        let mut state = self.state();
        match state.exchanges.get(&spec.name) {
            Some(existing) if existing.kind != spec.kind || existing.durable != spec.durable => {
                return Err(TaskError::TopologyConflict {
                    entity: "exchange",
                    name: spec.name.clone(),
                    reason: format!(
                        "declared as {} durable={}, requested {} durable={}",
                        existing.kind.as_str(),
                        existing.durable,
                        spec.kind.as_str(),
                        spec.durable
                    ),
                });
            }
            Some(_) => {}
            None => {
                state.exchanges.insert(
                    spec.name.clone(),
                    ExchangeState {
                        kind: spec.kind,
                        durable: spec.durable,
                        bindings: Vec::new(),
                    },
                );
                debug!(exchange = %spec.name, kind = spec.kind.as_str(), "Created exchange");
            }
        }

        Ok(ExchangeHandle {
            name: spec.name.clone(),
            kind: spec.kind,
        })
    }

    async fn bind(
        &self,
        queue: &QueueHandle,
        exchange: &ExchangeHandle,
        routing_key: &str,
    ) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state();

        let queue_state = state.queues.get(&queue.name).ok_or_else(|| TaskError::NotFound {
            entity: "queue",
            name: queue.name.clone(),
        })?;
        self.check_owner(queue_state, &queue.name)?;

        let exchange_state =
            state
                .exchanges
                .get_mut(&exchange.name)
                .ok_or_else(|| TaskError::NotFound {
                    entity: "exchange",
                    name: exchange.name.clone(),
                })?;

        let binding = (queue.name.clone(), routing_key.to_string());
        if !exchange_state.bindings.contains(&binding) {
            exchange_state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(&self, target: &Target, message: &TaskMessage) -> Result<BrokerReceipt> {
        self.ensure_open()?;
        let stalled = {
            let mut state = self.state();
            state.publish_attempts += 1;
            state.stalled
        };
        if stalled {
            warn!(exchange = %target.exchange, routing_key = %target.routing_key, "Broker stalled, publish will not complete");
            futures::future::pending::<()>().await;
        }

        let weak = self.weak();
        let mut state = self.state();
        let queues = state.route(target)?;

        for queue in &queues {
            if let Some(q) = state.queues.get_mut(queue) {
                q.ready.push_back(Envelope {
                    message: message.clone(),
                    exchange: target.exchange.clone(),
                    routing_key: target.routing_key.clone(),
                    redelivered: false,
                });
            }
        }
        state.record(BrokerEvent::Published {
            exchange: target.exchange.clone(),
            routing_key: target.routing_key.clone(),
            message_id: message.message_id().to_string(),
            queues: queues.clone(),
        });
        for queue in &queues {
            state.dispatch(&weak, queue);
        }

        Ok(BrokerReceipt::Confirmed)
    }

    async fn consume(
        &self,
        queue: &QueueHandle,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let weak = self.weak();
        let mut state = self.state();

        let queue_state = state
            .queues
            .get_mut(&queue.name)
            .ok_or_else(|| TaskError::NotFound {
                entity: "queue",
                name: queue.name.clone(),
            })?;
        self.check_owner(queue_state, &queue.name)?;

        let tag = if options.consumer_tag.is_empty() {
            format!("ctag-{}", Uuid::new_v4().simple())
        } else {
            options.consumer_tag.clone()
        };

        let (sender, receiver) = mpsc::unbounded();
        queue_state.consumers.push(ConsumerSlot {
            tag: tag.clone(),
            channel: self.id,
            sender,
            prefetch: options.prefetch_count,
            in_flight: 0,
        });
        info!(queue = %queue.name, consumer_tag = %tag, "Consumer registered");

        state.dispatch(&weak, &queue.name);
        Ok(receiver.boxed())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let weak = self.weak();
        self.state().release_channel(&weak, self.id);
        info!(channel = self.id, "Closed loopback channel");
        Ok(())
    }
}

struct MemoryAcker {
    state: Weak<Mutex<State>>,
}

impl MemoryAcker {
    fn settle(&self, delivery_tag: u64, outcome: Settle) -> Result<()> {
        let state = self.state.upgrade().ok_or(TaskError::ChannelClosed)?;
        let mut guard = lock(&state);
        guard.settle(&self.state, delivery_tag, outcome)
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.settle(delivery_tag, Settle::Ack)
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.settle(delivery_tag, Settle::Reject { requeue })
    }
}
