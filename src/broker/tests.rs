use super::memory::BrokerEvent;
use super::message::{DeliveryState, TaskMessage};
use super::{
    BrokerChannel, ConsumeOptions, ExchangeKind, ExchangeSpec, MemoryBroker, QueueSpec, Target,
};
use crate::utils::error::TaskError;
use futures::StreamExt;

fn consume_opts(tag: &str, prefetch: u16) -> ConsumeOptions {
    ConsumeOptions {
        consumer_tag: tag.to_string(),
        prefetch_count: prefetch,
    }
}

#[tokio::test]
async fn test_declare_queue_is_idempotent() {
    let broker = MemoryBroker::new();
    let channel = broker.open_channel();

    let first = channel
        .declare_queue(&QueueSpec::shared("tasks_queue"))
        .await
        .unwrap();
    let second = channel
        .declare_queue(&QueueSpec::shared("tasks_queue"))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(broker.queue_names(), vec!["tasks_queue".to_string()]);
}

#[tokio::test]
async fn test_declare_queue_conflict() {
    let broker = MemoryBroker::new();
    let channel = broker.open_channel();
    channel
        .declare_queue(&QueueSpec::shared("tasks_queue"))
        .await
        .unwrap();

    let transient = QueueSpec {
        durable: false,
        ..QueueSpec::shared("tasks_queue")
    };
    let err = channel.declare_queue(&transient).await.unwrap_err();
    assert!(matches!(
        err,
        TaskError::TopologyConflict { entity: "queue", ref name, .. } if name == "tasks_queue"
    ));
}

#[tokio::test]
async fn test_server_named_queues_are_unique() {
    let broker = MemoryBroker::new();
    let channel = broker.open_channel();

    let a = channel.declare_queue(&QueueSpec::exclusive()).await.unwrap();
    let b = channel.declare_queue(&QueueSpec::exclusive()).await.unwrap();

    assert!(a.name.starts_with("amq.gen-"));
    assert_ne!(a.name, b.name);
}

#[tokio::test]
async fn test_exclusive_queue_is_private_to_its_channel() {
    let broker = MemoryBroker::new();
    let owner = broker.open_channel();
    let other = broker.open_channel();

    let queue = owner.declare_queue(&QueueSpec::exclusive()).await.unwrap();
    match other.consume(&queue, &ConsumeOptions::default()).await {
        Err(err) => assert!(matches!(err, TaskError::TopologyConflict { .. })),
        Ok(_) => panic!("consumed another channel's exclusive queue"),
    }
}

#[tokio::test]
async fn test_declare_exchange_idempotent_and_conflict() {
    let broker = MemoryBroker::new();
    let channel = broker.open_channel();
    let spec = ExchangeSpec::durable("shared_tasks", ExchangeKind::Fanout);

    channel.declare_exchange(&spec).await.unwrap();
    channel.declare_exchange(&spec).await.unwrap();
    assert_eq!(broker.exchange_names(), vec!["shared_tasks".to_string()]);

    let err = channel
        .declare_exchange(&ExchangeSpec::durable("shared_tasks", ExchangeKind::Direct))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TaskError::TopologyConflict {
            entity: "exchange",
            ..
        }
    ));
}

#[tokio::test]
async fn test_bind_requires_existing_entities() {
    let broker = MemoryBroker::new();
    let channel = broker.open_channel();
    let queue = channel.declare_queue(&QueueSpec::exclusive()).await.unwrap();
    let missing = super::ExchangeHandle {
        name: "nowhere".to_string(),
        kind: ExchangeKind::Direct,
    };

    let err = channel.bind(&queue, &missing, "key").await.unwrap_err();
    assert!(matches!(
        err,
        TaskError::NotFound {
            entity: "exchange",
            ..
        }
    ));
}

#[tokio::test]
async fn test_duplicate_binding_is_not_duplicated() {
    let broker = MemoryBroker::new();
    let channel = broker.open_channel();
    let exchange = channel
        .declare_exchange(&ExchangeSpec::durable("shared_tasks_direct", ExchangeKind::Direct))
        .await
        .unwrap();
    let queue = channel.declare_queue(&QueueSpec::exclusive()).await.unwrap();

    channel.bind(&queue, &exchange, "urgent").await.unwrap();
    channel.bind(&queue, &exchange, "urgent").await.unwrap();

    assert_eq!(broker.binding_count("shared_tasks_direct"), 1);
}

#[tokio::test]
async fn test_default_exchange_routes_by_queue_name() {
    let broker = MemoryBroker::new();
    let channel = broker.open_channel();
    let queue = channel
        .declare_queue(&QueueSpec::shared("tasks_queue"))
        .await
        .unwrap();

    channel
        .publish(&Target::queue("tasks_queue"), &TaskMessage::new("hello"))
        .await
        .unwrap();
    assert_eq!(broker.ready_count("tasks_queue"), 1);

    let mut stream = channel
        .consume(&queue, &consume_opts("c1", 0))
        .await
        .unwrap();
    let delivery = stream.next().await.unwrap().unwrap();
    assert_eq!(delivery.body(), b"hello");
    assert_eq!(delivery.exchange(), "");
    assert_eq!(delivery.routing_key(), "tasks_queue");
    assert!(!delivery.redelivered());
    assert_eq!(delivery.state(), DeliveryState::Received);
}

#[tokio::test]
async fn test_publish_to_unbound_queue_name_is_dropped() {
    let broker = MemoryBroker::new();
    let channel = broker.open_channel();

    channel
        .publish(&Target::queue("nobody_home"), &TaskMessage::new("lost"))
        .await
        .unwrap();

    assert!(matches!(
        broker.events().as_slice(),
        [BrokerEvent::Published { queues, .. }] if queues.is_empty()
    ));
}

#[tokio::test]
async fn test_publish_to_missing_exchange_fails() {
    let broker = MemoryBroker::new();
    let channel = broker.open_channel();

    let err = channel
        .publish(&Target::exchange("missing", ""), &TaskMessage::new("x"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TaskError::NotFound {
            entity: "exchange",
            ..
        }
    ));
}

#[tokio::test]
async fn test_shared_queue_consumers_compete() {
    let broker = MemoryBroker::new();
    let first = broker.open_channel();
    let second = broker.open_channel();
    let queue = first
        .declare_queue(&QueueSpec::shared("tasks_queue"))
        .await
        .unwrap();
    second
        .declare_queue(&QueueSpec::shared("tasks_queue"))
        .await
        .unwrap();

    let mut a = first.consume(&queue, &consume_opts("a", 0)).await.unwrap();
    let mut b = second.consume(&queue, &consume_opts("b", 0)).await.unwrap();

    for body in ["one", "two"] {
        first
            .publish(&Target::queue("tasks_queue"), &TaskMessage::new(body))
            .await
            .unwrap();
    }

    let got_a = a.next().await.unwrap().unwrap();
    let got_b = b.next().await.unwrap().unwrap();
    assert_eq!(got_a.body(), b"one");
    assert_eq!(got_b.body(), b"two");
}

#[tokio::test]
async fn test_ack_twice_is_refused() {
    let broker = MemoryBroker::new();
    let channel = broker.open_channel();
    let queue = channel
        .declare_queue(&QueueSpec::shared("tasks_queue"))
        .await
        .unwrap();
    let mut stream = channel
        .consume(&queue, &consume_opts("c1", 0))
        .await
        .unwrap();
    channel
        .publish(&Target::queue("tasks_queue"), &TaskMessage::new("once"))
        .await
        .unwrap();

    let mut delivery = stream.next().await.unwrap().unwrap();

    let early = delivery.ack().await.unwrap_err();
    assert!(matches!(
        early,
        TaskError::InvalidDeliveryState {
            state: DeliveryState::Received,
            ..
        }
    ));
    assert_eq!(broker.unacked_count("tasks_queue"), 1);

    delivery.start_processing().unwrap();
    delivery.ack().await.unwrap();
    assert_eq!(delivery.state(), DeliveryState::Acknowledged);

    let again = delivery.ack().await.unwrap_err();
    assert!(matches!(
        again,
        TaskError::InvalidDeliveryState {
            state: DeliveryState::Acknowledged,
            ..
        }
    ));
    let reject_after = delivery.reject(true).await.unwrap_err();
    assert!(matches!(reject_after, TaskError::InvalidDeliveryState { .. }));

    let acks = broker
        .events()
        .into_iter()
        .filter(|e| matches!(e, BrokerEvent::Acked { .. }))
        .count();
    assert_eq!(acks, 1);
    assert_eq!(broker.unacked_count("tasks_queue"), 0);
}

#[tokio::test]
async fn test_reject_with_requeue_redelivers() {
    let broker = MemoryBroker::new();
    let channel = broker.open_channel();
    let queue = channel
        .declare_queue(&QueueSpec::shared("tasks_queue"))
        .await
        .unwrap();
    let mut stream = channel
        .consume(&queue, &consume_opts("c1", 0))
        .await
        .unwrap();
    channel
        .publish(&Target::queue("tasks_queue"), &TaskMessage::new("retry me"))
        .await
        .unwrap();

    let mut first = stream.next().await.unwrap().unwrap();
    first.start_processing().unwrap();
    first.reject(true).await.unwrap();
    assert_eq!(first.state(), DeliveryState::Rejected);

    let mut second = stream.next().await.unwrap().unwrap();
    assert!(second.redelivered());
    assert_eq!(second.body(), b"retry me");
    assert_ne!(second.delivery_tag(), first.delivery_tag());

    second.start_processing().unwrap();
    second.reject(false).await.unwrap();
    assert_eq!(broker.discarded().len(), 1);
    assert_eq!(broker.ready_count("tasks_queue"), 0);
}

#[tokio::test]
async fn test_prefetch_limits_in_flight_deliveries() {
    let broker = MemoryBroker::new();
    let channel = broker.open_channel();
    let queue = channel
        .declare_queue(&QueueSpec::shared("tasks_queue"))
        .await
        .unwrap();
    let mut stream = channel
        .consume(&queue, &consume_opts("c1", 1))
        .await
        .unwrap();

    for body in ["a", "b"] {
        channel
            .publish(&Target::queue("tasks_queue"), &TaskMessage::new(body))
            .await
            .unwrap();
    }
    assert_eq!(broker.unacked_count("tasks_queue"), 1);
    assert_eq!(broker.ready_count("tasks_queue"), 1);

    let mut first = stream.next().await.unwrap().unwrap();
    first.start_processing().unwrap();
    first.ack().await.unwrap();

    let second = stream.next().await.unwrap().unwrap();
    assert_eq!(second.body(), b"b");
}

#[tokio::test]
async fn test_close_returns_unacked_to_queue() {
    let broker = MemoryBroker::new();
    let worker = broker.open_channel();
    let queue = worker
        .declare_queue(&QueueSpec::shared("tasks_queue"))
        .await
        .unwrap();
    let mut stream = worker
        .consume(&queue, &consume_opts("doomed", 0))
        .await
        .unwrap();
    worker
        .publish(&Target::queue("tasks_queue"), &TaskMessage::new("survive"))
        .await
        .unwrap();

    let mut delivery = stream.next().await.unwrap().unwrap();
    delivery.start_processing().unwrap();
    worker.close().await.unwrap();

    assert_eq!(broker.unacked_count("tasks_queue"), 0);
    assert_eq!(broker.ready_count("tasks_queue"), 1);
    assert!(stream.next().await.is_none());

    // a fresh worker picks it up, flagged as redelivered
    let replacement = broker.open_channel();
    let mut stream = replacement
        .consume(&queue, &consume_opts("fresh", 0))
        .await
        .unwrap();
    let again = stream.next().await.unwrap().unwrap();
    assert!(again.redelivered());
    assert_eq!(again.body(), b"survive");

    // settling the orphaned delivery after close is refused by the broker
    let err = delivery.ack().await.unwrap_err();
    assert!(matches!(err, TaskError::UnknownDeliveryTag(_)));
}

#[tokio::test]
async fn test_close_deletes_exclusive_queues_and_bindings() {
    let broker = MemoryBroker::new();
    let channel = broker.open_channel();
    let exchange = channel
        .declare_exchange(&ExchangeSpec::durable("shared_tasks", ExchangeKind::Fanout))
        .await
        .unwrap();
    let queue = channel.declare_queue(&QueueSpec::exclusive()).await.unwrap();
    channel.bind(&queue, &exchange, "").await.unwrap();

    channel.close().await.unwrap();
    channel.close().await.unwrap();

    assert!(broker.queue_names().is_empty());
    assert_eq!(broker.binding_count("shared_tasks"), 0);
    assert_eq!(broker.exchange_names(), vec!["shared_tasks".to_string()]);

    let err = channel
        .declare_queue(&QueueSpec::exclusive())
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::ChannelClosed));
}

#[test]
fn test_task_message_builders() {
    let msg = TaskMessage::new("payload")
        .with_durable(true)
        .with_content_type("application/octet-stream")
        .with_routing_key("urgent");

    assert_eq!(msg.body(), b"payload");
    assert!(msg.durable());
    assert_eq!(msg.content_type(), "application/octet-stream");
    assert_eq!(msg.routing_key(), Some("urgent"));
    assert!(!msg.message_id().is_empty());
    assert!(msg.timestamp() > 0);
    assert_ne!(
        TaskMessage::new("a").message_id(),
        TaskMessage::new("a").message_id()
    );
}

#[test]
fn test_message_timestamp_is_in_seconds() {
    let now = chrono::Utc::now().timestamp();
    let stamped = TaskMessage::new("t").timestamp();
    assert!((stamped - now).abs() <= 1, "{stamped} is not near {now}");
}

fn soft_error(code: lapin::protocol::AMQPSoftError) -> lapin::Error {
    use lapin::protocol::{AMQPError, AMQPErrorKind};
    lapin::Error::ProtocolError(AMQPError::new(
        AMQPErrorKind::Soft(code),
        "refused by broker".into(),
    ))
}

#[test]
fn test_broker_protocol_errors_are_classified() {
    use super::amqp::classify;
    use lapin::protocol::AMQPSoftError;

    for code in [AMQPSoftError::PRECONDITIONFAILED, AMQPSoftError::RESOURCELOCKED] {
        let err = classify(soft_error(code), "queue", "tasks_queue");
        assert!(matches!(
            err,
            TaskError::TopologyConflict { entity: "queue", ref name, .. } if name == "tasks_queue"
        ));
    }

    let err = classify(soft_error(AMQPSoftError::NOTFOUND), "exchange", "missing");
    assert!(matches!(
        err,
        TaskError::NotFound { entity: "exchange", ref name } if name == "missing"
    ));

    let err = classify(soft_error(AMQPSoftError::ACCESSREFUSED), "queue", "tasks_queue");
    assert!(matches!(err, TaskError::Broker(_)));
}

#[test]
fn test_amqp_properties_carry_message_metadata() {
    use super::amqp::{message_from, properties_for};

    let sent = TaskMessage::new("three.dots...")
        .with_durable(true)
        .with_content_type("text/plain")
        .with_timestamp(1_700_000_000);
    let properties = properties_for(&sent);
    assert_eq!(properties.delivery_mode(), &Some(2));
    assert_eq!(properties.timestamp(), &Some(1_700_000_000));

    let received = message_from(sent.body().to_vec(), "tasks_queue", &properties);
    assert_eq!(received.body(), sent.body());
    assert!(received.durable());
    assert_eq!(received.content_type(), "text/plain");
    assert_eq!(received.message_id(), sent.message_id());
    assert_eq!(received.timestamp(), 1_700_000_000);
    assert_eq!(received.routing_key(), Some("tasks_queue"));

    let transient = properties_for(&TaskMessage::new("x"));
    assert_eq!(transient.delivery_mode(), &Some(1));
    assert!(!message_from(b"x".to_vec(), "", &transient).durable());
}
