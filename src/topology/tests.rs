use super::{TopologyDescriptor, TopologyMode, declare};
use crate::broker::{ExchangeKind, MemoryBroker, QueueSpec, Target};
use crate::config::Settings;
use crate::session::Session;
use crate::utils::error::TaskError;

fn names() -> crate::config::TopologySettings {
    Settings::default().topology
}

#[test]
fn test_shared_queue_descriptor_addresses_queue_directly() {
    let producer = TopologyDescriptor::producer(&TopologyMode::SharedQueue, &names());
    let consumer = TopologyDescriptor::consumer(&TopologyMode::SharedQueue, &names());

    assert_eq!(producer, consumer);
    assert_eq!(producer.exchange_kind(), None);
    assert_eq!(producer.queue, Some(QueueSpec::shared("tasks_queue")));
    assert_eq!(producer.routing_key, "tasks_queue");
}

#[test]
fn test_fanout_descriptors() {
    let producer = TopologyDescriptor::producer(&TopologyMode::Fanout, &names());
    assert_eq!(producer.queue, None);
    assert_eq!(producer.exchange_kind(), Some(ExchangeKind::Fanout));
    assert_eq!(producer.exchange.as_ref().unwrap().name, "shared_tasks");

    let consumer = TopologyDescriptor::consumer(&TopologyMode::Fanout, &names());
    assert_eq!(consumer.queue, Some(QueueSpec::exclusive()));
    assert_eq!(consumer.exchange, producer.exchange);
}

#[test]
fn test_direct_descriptors_carry_routing_key() {
    let mode = TopologyMode::Direct {
        routing_key: "urgent".to_string(),
    };
    let consumer = TopologyDescriptor::consumer(&mode, &names());

    assert_eq!(consumer.exchange_kind(), Some(ExchangeKind::Direct));
    assert_eq!(
        consumer.exchange.as_ref().unwrap().name,
        "shared_tasks_direct"
    );
    assert_eq!(consumer.routing_key, "urgent");
    assert!(consumer.queue.as_ref().unwrap().exclusive);
}

#[tokio::test]
async fn test_declare_shared_queue_twice_is_noop() {
    let broker = MemoryBroker::new();
    let session = Session::from_channel(broker.open_channel());
    let descriptor = TopologyDescriptor::consumer(&TopologyMode::SharedQueue, &names());

    let first = declare(&session, &descriptor).await.unwrap();
    let second = declare(&session, &descriptor).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.target, Target::queue("tasks_queue"));
    assert_eq!(broker.queue_names(), vec!["tasks_queue".to_string()]);
    assert!(broker.exchange_names().is_empty());
}

#[tokio::test]
async fn test_declare_direct_consumer_binds_before_returning() {
    let broker = MemoryBroker::new();
    let session = Session::from_channel(broker.open_channel());
    let mode = TopologyMode::Direct {
        routing_key: "urgent".to_string(),
    };

    let declared = declare(&session, &TopologyDescriptor::consumer(&mode, &names()))
        .await
        .unwrap();

    assert!(declared.queue.unwrap().name.starts_with("amq.gen-"));
    assert_eq!(
        declared.target,
        Target::exchange("shared_tasks_direct", "urgent")
    );
    assert_eq!(broker.binding_count("shared_tasks_direct"), 1);
}

#[tokio::test]
async fn test_producer_and_consumer_sides_agree() {
    let broker = MemoryBroker::new();
    let producer = Session::from_channel(broker.open_channel());
    let consumer = Session::from_channel(broker.open_channel());

    let published = declare(
        &producer,
        &TopologyDescriptor::producer(&TopologyMode::Fanout, &names()),
    )
    .await
    .unwrap();
    declare(
        &consumer,
        &TopologyDescriptor::consumer(&TopologyMode::Fanout, &names()),
    )
    .await
    .unwrap();

    assert_eq!(published.target, Target::exchange("shared_tasks", ""));
    assert_eq!(broker.exchange_names(), vec!["shared_tasks".to_string()]);
    assert_eq!(broker.binding_count("shared_tasks"), 1);
}

#[tokio::test]
async fn test_conflicting_exchange_kind_is_fatal() {
    let broker = MemoryBroker::new();
    let session = Session::from_channel(broker.open_channel());

    let mut clashing = names();
    clashing.direct_exchange = clashing.fanout_exchange.clone();

    declare(
        &session,
        &TopologyDescriptor::producer(&TopologyMode::Fanout, &names()),
    )
    .await
    .unwrap();
    let err = declare(
        &session,
        &TopologyDescriptor::producer(
            &TopologyMode::Direct {
                routing_key: "k".to_string(),
            },
            &clashing,
        ),
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        TaskError::TopologyConflict { entity: "exchange", ref name, .. } if name == "shared_tasks"
    ));
}
