//! AMQP 0-9-1 channel backed by `lapin`.
//!
//! One `AmqpChannel` owns one connection and one channel on it. Publisher
//! confirms are switched on when the channel opens so `publish` can report
//! broker receipt. lapin channels are `Send + Sync` and multiplex publish and
//! consume safely, so no extra locking is needed here.

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties,
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    publisher_confirm::Confirmation,
    types::{FieldTable, ShortString},
    uri::{AMQPAuthority, AMQPUri, AMQPUserInfo},
};
use tracing::{debug, info};
use uuid::Uuid;

use super::message::{Acknowledger, Delivery, TaskMessage};
use super::{
    BrokerChannel, BrokerReceipt, ConsumeOptions, DeliveryStream, ExchangeHandle, ExchangeKind,
    ExchangeSpec, QueueHandle, QueueSpec, Target,
};
use crate::config::BrokerSettings;
use crate::utils::error::{Result, TaskError};

const PERSISTENT: u8 = 2;
const TRANSIENT: u8 = 1;
const REPLY_SUCCESS: u16 = 200;

pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
    endpoint: String,
}

impl AmqpChannel {
    /// Connects, opens a channel and enables publisher confirms. Any failure
    /// on the way is a `TaskError::Connection`; nothing is retried.
    pub async fn open(settings: &BrokerSettings) -> Result<Self> {
        let endpoint = settings.endpoint();
        let connection_error = |err: lapin::Error| TaskError::Connection {
            endpoint: endpoint.clone(),
            reason: err.to_string(),
        };

        let connection =
            Connection::connect_uri(amqp_uri(settings), ConnectionProperties::default())
                .await
                .map_err(connection_error)?;
        let channel = connection
            .create_channel()
            .await
            .map_err(connection_error)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(connection_error)?;

        info!(%endpoint, channel = channel.id(), "Connected to broker");

        Ok(Self {
            connection,
            channel,
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn amqp_uri(settings: &BrokerSettings) -> AMQPUri {
    AMQPUri {
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: settings.user.clone(),
                password: settings.password.clone(),
            },
            host: settings.host.clone(),
            port: settings.port,
        },
        vhost: settings.vhost.clone(),
        ..Default::default()
    }
}

fn lapin_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

/// Maps channel-level protocol errors onto the task error taxonomy.
pub(super) fn classify(err: lapin::Error, entity: &'static str, name: &str) -> TaskError {
    if let lapin::Error::ProtocolError(amqp_error) = &err {
        match amqp_error.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
            | AMQPErrorKind::Soft(AMQPSoftError::RESOURCELOCKED) => {
                return TaskError::TopologyConflict {
                    entity,
                    name: name.to_string(),
                    reason: amqp_error.to_string(),
                };
            }
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => {
                return TaskError::NotFound {
                    entity,
                    name: name.to_string(),
                };
            }
            _ => {}
        }
    }
    TaskError::Broker(err)
}

/// Basic properties for a published `TaskMessage`.
pub(super) fn properties_for(message: &TaskMessage) -> BasicProperties {
    let delivery_mode = if message.durable() {
        PERSISTENT
    } else {
        TRANSIENT
    };
    let timestamp = u64::try_from(message.timestamp()).unwrap_or_default();
    BasicProperties::default()
        .with_delivery_mode(delivery_mode)
        .with_content_type(ShortString::from(message.content_type()))
        .with_message_id(ShortString::from(message.message_id()))
        .with_timestamp(timestamp)
}

/// Rebuilds a `TaskMessage` from a received body and its basic properties.
pub(super) fn message_from(data: Vec<u8>, routing_key: &str, properties: &BasicProperties) -> TaskMessage {
    let mut message = TaskMessage::new(data)
        .with_durable(properties.delivery_mode() == &Some(PERSISTENT))
        .with_routing_key(routing_key);
    if let Some(content_type) = properties.content_type() {
        message = message.with_content_type(content_type.as_str());
    }
    if let Some(message_id) = properties.message_id() {
        message = message.with_message_id(message_id.as_str());
    }
    if let Some(timestamp) = properties.timestamp() {
        message = message.with_timestamp(i64::try_from(*timestamp).unwrap_or(i64::MAX));
    }
    message
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let lapin::message::Delivery {
        delivery_tag,
        exchange,
        routing_key,
        redelivered,
        properties,
        data,
        acker,
        ..
    } = delivery;

    Delivery::new(
        message_from(data, routing_key.as_str(), &properties),
        delivery_tag,
        redelivered,
        exchange.as_str(),
        routing_key.as_str(),
        Box::new(AmqpAcker(acker)),
    )
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self, _delivery_tag: u64) -> Result<()> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(&self, _delivery_tag: u64, requeue: bool) -> Result<()> {
        self.0.reject(BasicRejectOptions { requeue }).await?;
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueHandle> {
        let options = QueueDeclareOptions {
            durable: spec.durable,
            exclusive: spec.exclusive,
            auto_delete: spec.auto_delete,
            ..QueueDeclareOptions::default()
        };
        let queue = self
            .channel
            .queue_declare(&spec.name, options, FieldTable::default())
            .await
            .map_err(|err| classify(err, "queue", &spec.name))?;

        let name = queue.name().to_string();
        debug!(queue = %name, durable = spec.durable, exclusive = spec.exclusive, "Declared queue");
        Ok(QueueHandle {
            name,
            spec: spec.clone(),
        })
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<ExchangeHandle> {
        let options = ExchangeDeclareOptions {
            durable: spec.durable,
            ..ExchangeDeclareOptions::default()
        };
        self.channel
            .exchange_declare(
                &spec.name,
                lapin_kind(spec.kind),
                options,
                FieldTable::default(),
            )
            .await
            .map_err(|err| classify(err, "exchange", &spec.name))?;

        debug!(exchange = %spec.name, kind = spec.kind.as_str(), "Declared exchange");
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
        self.channel
            .queue_bind(
                &queue.name,
                &exchange.name,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| classify(err, "binding", &queue.name))?;

        debug!(queue = %queue.name, exchange = %exchange.name, routing_key, "Bound queue");
        Ok(())
    }

    async fn publish(&self, target: &Target, message: &TaskMessage) -> Result<BrokerReceipt> {
        let confirm = self
            .channel
            .basic_publish(
                &target.exchange,
                &target.routing_key,
                BasicPublishOptions::default(),
                message.body(),
                properties_for(message),
            )
            .await
            .map_err(|err| classify(err, "exchange", &target.exchange))?;

        match confirm.await? {
            Confirmation::Ack(_) => Ok(BrokerReceipt::Confirmed),
            Confirmation::NotRequested => Ok(BrokerReceipt::Unconfirmed),
            Confirmation::Nack(_) => Err(TaskError::PublishNacked {
                message_id: message.message_id().to_string(),
            }),
        }
    }

    async fn consume(
        &self,
        queue: &QueueHandle,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream> {
        if options.prefetch_count > 0 {
            self.channel
                .basic_qos(options.prefetch_count, BasicQosOptions::default())
                .await?;
        }

        let consumer_tag = if options.consumer_tag.is_empty() {
            format!("taskrelay-{}", Uuid::new_v4())
        } else {
            options.consumer_tag.clone()
        };

        let consumer = self
            .channel
            .basic_consume(
                &queue.name,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| classify(err, "queue", &queue.name))?;

        info!(queue = %queue.name, %consumer_tag, "Consumer registered");

        Ok(consumer
            .map(|item| item.map(into_delivery).map_err(TaskError::from))
            .boxed())
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            self.channel.close(REPLY_SUCCESS, "Bye").await?;
        }
        if self.connection.status().connected() {
            self.connection.close(REPLY_SUCCESS, "Bye").await?;
        }
        info!(endpoint = %self.endpoint, "Closed broker connection");
        Ok(())
    }
}
