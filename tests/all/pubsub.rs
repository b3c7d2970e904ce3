use std::time::Duration;

use fake::{Fake, Faker};
use tokio::sync::mpsc;
use warren::amqp::convenience::BasicPropertiesExt;
use warren::amqp::types::AMQPValue;
use warren::amqp::ExchangeKind;
use warren::publishers::{MessageEnvelope, PublisherError};
use warren::{Error, ExchangeSpec, QueueSpec};

use crate::helpers::{connect, wait_until_connected, InMemoryBroker};

fn orders() -> ExchangeSpec {
    ExchangeSpec::new("orders", ExchangeKind::Topic).with_queue(QueueSpec::new("orders.sync", "sync"))
}

#[tokio::test(start_paused = true)]
async fn a_published_message_reaches_the_subscriber_exactly_once() {
    // Arrange
    let broker = InMemoryBroker::new();
    let manager = connect(&broker).await;
    let exchange = orders();
    manager.declare_exchange_with_queues(&exchange).await.unwrap();
    let (sink, mut messages) = mpsc::channel(8);
    let subscription = manager.subscribe(&exchange.queues[0], sink).await.unwrap();
    let body = serde_json::to_vec(&serde_json::json!({ "jobId": "abc" })).unwrap();

    // Act
    manager.publish(&exchange, "sync", body.clone()).await.unwrap();

    // Assert
    let received = tokio::time::timeout(Duration::from_secs(5), messages.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(br#"{"jobId":"abc"}"#.to_vec(), received);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(messages.try_recv().is_err());
    assert_eq!(1, broker.acks().len());
    assert_eq!("orders.sync", subscription.queue_name());
    assert!(!subscription.is_finished());
}

#[tokio::test(start_paused = true)]
async fn auto_ack_queues_are_not_acked_explicitly() {
    // Arrange
    let broker = InMemoryBroker::new();
    let manager = connect(&broker).await;
    let exchange = ExchangeSpec::new("inventory", ExchangeKind::Fanout)
        .with_queue(QueueSpec::new("inventory.audit", "").with_auto_ack(true));
    manager.declare_exchange_with_queues(&exchange).await.unwrap();
    let (sink, mut messages) = mpsc::channel(8);
    let _subscription = manager.subscribe(&exchange.queues[0], sink).await.unwrap();

    // Act
    manager.publish(&exchange, "", "{}").await.unwrap();

    // Assert
    assert_eq!(b"{}".to_vec(), messages.recv().await.unwrap());
    assert!(broker.acks().is_empty());
}

#[tokio::test(start_paused = true)]
async fn messages_waiting_in_the_queue_are_forwarded_on_subscribe() {
    let broker = InMemoryBroker::new();
    let manager = connect(&broker).await;
    let exchange = orders();
    manager.declare_exchange_with_queues(&exchange).await.unwrap();
    for i in 0..3 {
        manager
            .publish(&exchange, "sync", format!("{{\"jobId\":{i}}}"))
            .await
            .unwrap();
    }
    let (sink, mut messages) = mpsc::channel(8);

    let _subscription = manager.subscribe(&exchange.queues[0], sink).await.unwrap();

    for i in 0..3 {
        let expected = format!("{{\"jobId\":{i}}}").into_bytes();
        assert_eq!(expected, messages.recv().await.unwrap());
    }
    assert_eq!(0, broker.queue_depth("orders.sync"));
}

#[tokio::test(start_paused = true)]
async fn subscribing_to_a_missing_queue_fails() {
    let broker = InMemoryBroker::new();
    let manager = connect(&broker).await;
    let (sink, _messages) = mpsc::channel(8);

    let outcome = manager
        .subscribe(&QueueSpec::new(Faker.fake::<String>(), "sync"), sink)
        .await;

    assert!(matches!(outcome, Err(Error::Broker(_))));
}

#[tokio::test(start_paused = true)]
async fn a_consuming_channel_is_never_handed_to_another_caller() {
    // Arrange
    let broker = InMemoryBroker::new();
    let manager = connect(&broker).await;
    let exchange = orders();
    manager.declare_exchange_with_queues(&exchange).await.unwrap();
    let opened = broker.channels_opened();

    // Act
    let (sink, _messages) = mpsc::channel(8);
    let _subscription = manager.subscribe(&exchange.queues[0], sink).await.unwrap();
    let channel = manager.acquire().await.unwrap();

    // Assert
    assert_eq!(opened + 1, broker.channels_opened());
    assert!(channel.is_pooled());
}

#[tokio::test(start_paused = true)]
async fn dropping_the_sink_stops_the_subscription() {
    // Arrange
    let broker = InMemoryBroker::new();
    let manager = connect(&broker).await;
    let exchange = orders();
    manager.declare_exchange_with_queues(&exchange).await.unwrap();
    let (sink, messages) = mpsc::channel(8);
    let subscription = manager.subscribe(&exchange.queues[0], sink).await.unwrap();

    // Act
    drop(messages);
    manager.publish(&exchange, "sync", "{}").await.unwrap();

    // Assert
    tokio::time::timeout(Duration::from_secs(5), subscription.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(broker.acks().is_empty());
}

#[tokio::test(start_paused = true)]
async fn a_cancelled_subscription_stops_forwarding() {
    let broker = InMemoryBroker::new();
    let manager = connect(&broker).await;
    let exchange = orders();
    manager.declare_exchange_with_queues(&exchange).await.unwrap();
    let (sink, mut messages) = mpsc::channel(8);
    let mut subscription = manager.subscribe(&exchange.queues[0], sink).await.unwrap();

    subscription.cancel();
    tokio::time::timeout(Duration::from_secs(5), subscription.wait())
        .await
        .unwrap()
        .unwrap();
    manager.publish(&exchange, "sync", "{}").await.unwrap();

    assert!(messages.recv().await.is_none());
    assert_eq!(1, broker.queue_depth("orders.sync"));
}

#[tokio::test(start_paused = true)]
async fn subscriptions_end_with_their_connection_and_can_be_renewed() {
    // Arrange
    let broker = InMemoryBroker::new();
    let manager = connect(&broker).await;
    let exchange = orders();
    manager.declare_exchange_with_queues(&exchange).await.unwrap();
    let (sink, mut messages) = mpsc::channel(8);
    let subscription = manager
        .subscribe(&exchange.queues[0], sink.clone())
        .await
        .unwrap();

    // Act
    broker.force_close(320);
    tokio::time::timeout(Duration::from_secs(5), subscription.wait())
        .await
        .unwrap()
        .unwrap();
    wait_until_connected(&manager, 2).await;
    let _renewed = manager.subscribe(&exchange.queues[0], sink).await.unwrap();
    manager.publish(&exchange, "sync", "{}").await.unwrap();

    // Assert
    assert_eq!(b"{}".to_vec(), messages.recv().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_every_subscription() {
    let broker = InMemoryBroker::new();
    let manager = connect(&broker).await;
    let exchange = orders();
    manager.declare_exchange_with_queues(&exchange).await.unwrap();
    let (sink, _messages) = mpsc::channel(8);
    let subscription = manager.subscribe(&exchange.queues[0], sink).await.unwrap();

    manager.shutdown().await;

    tokio::time::timeout(Duration::from_secs(5), subscription.wait())
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_a_subscription_stuck_on_a_full_sink() {
    // Arrange
    let broker = InMemoryBroker::new();
    let manager = connect(&broker).await;
    let exchange = orders();
    manager.declare_exchange_with_queues(&exchange).await.unwrap();
    let (sink, _unread) = mpsc::channel(1);
    let subscription = manager.subscribe(&exchange.queues[0], sink).await.unwrap();
    manager.publish(&exchange, "sync", "{}").await.unwrap();
    manager.publish(&exchange, "sync", "{}").await.unwrap();
    // let the consumer fill the sink and block on the second message
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Act
    tokio::time::timeout(Duration::from_secs(5), manager.shutdown())
        .await
        .unwrap();

    // Assert
    tokio::time::timeout(Duration::from_secs(5), subscription.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(1, broker.acks().len());
}

#[tokio::test(start_paused = true)]
async fn cancelling_stops_a_subscription_stuck_on_a_full_sink() {
    // Arrange
    let broker = InMemoryBroker::new();
    let manager = connect(&broker).await;
    let exchange = orders();
    manager.declare_exchange_with_queues(&exchange).await.unwrap();
    let (sink, _unread) = mpsc::channel(1);
    let mut subscription = manager.subscribe(&exchange.queues[0], sink).await.unwrap();
    manager.publish(&exchange, "sync", "{}").await.unwrap();
    manager.publish(&exchange, "sync", "{}").await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Act
    subscription.cancel();

    // Assert
    tokio::time::timeout(Duration::from_secs(5), subscription.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(1, broker.acks().len());
}

#[tokio::test(start_paused = true)]
async fn publishing_declares_the_exchange() {
    let broker = InMemoryBroker::new();
    let manager = connect(&broker).await;
    let exchange = ExchangeSpec::new(Faker.fake::<String>(), ExchangeKind::Direct);

    manager.publish(&exchange, "sync", "{}").await.unwrap();

    assert!(manager.exists_exchange(&exchange).await);
}

#[tokio::test(start_paused = true)]
async fn messages_go_out_as_persistent_json() {
    // Arrange
    let broker = InMemoryBroker::new();
    let manager = connect(&broker).await;
    let envelope = MessageEnvelope::new("sync", "{}")
        .with_header("x-cloud", AMQPValue::LongString("aws".into()))
        .with_correlation_id("job-42".into());

    // Act
    manager.publish_envelope(&orders(), envelope).await.unwrap();

    // Assert
    let published = broker.published();
    let properties = &published[0].properties;
    assert_eq!("application/json", properties.content_type().as_ref().unwrap().as_str());
    assert_eq!(Some(2), *properties.delivery_mode());
    assert_eq!(Some(0), *properties.priority());
    assert!(properties.message_id().is_some());
    assert!(properties.timestamp().is_some());
    assert_eq!("aws", properties.get_header_str("x-cloud").unwrap());
    assert_eq!("job-42", properties.correlation_id().as_ref().unwrap().as_str());
    assert_eq!("orders", published[0].exchange);
    assert_eq!("sync", published[0].routing_key);
}

#[tokio::test(start_paused = true)]
async fn a_publish_failing_twice_succeeds_after_two_retry_delays() {
    // Arrange
    let broker = InMemoryBroker::new();
    let manager = connect(&broker).await;
    broker.fail_next_publishes(2);

    // Act
    let started = tokio::time::Instant::now();
    let outcome = manager.publish(&orders(), "sync", "{}").await;

    // Assert
    assert!(outcome.is_ok());
    assert_eq!(3, broker.publish_attempts());
    assert!(started.elapsed() >= Duration::from_secs(4));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn a_publish_failing_four_times_returns_the_last_error_after_three_retries() {
    // Arrange
    let broker = InMemoryBroker::new();
    let manager = connect(&broker).await;
    broker.fail_next_publishes(4);

    // Act
    let started = tokio::time::Instant::now();
    let outcome = manager.publish(&orders(), "sync", "{}").await;

    // Assert
    assert!(matches!(
        outcome,
        Err(PublisherError::GenericError { attempts: 4, .. })
    ));
    assert_eq!(4, broker.publish_attempts());
    assert!(started.elapsed() >= Duration::from_secs(6));
    assert!(started.elapsed() < Duration::from_secs(7));
    assert!(broker.published().is_empty());
}

#[tokio::test(start_paused = true)]
async fn a_failed_exchange_declaration_is_not_retried() {
    // Arrange
    let broker = InMemoryBroker::new();
    let manager = connect(&broker).await;
    manager
        .declare_exchange(&ExchangeSpec::new("orders", ExchangeKind::Fanout))
        .await
        .unwrap();

    // Act
    let outcome = manager.publish(&orders(), "sync", "{}").await;

    // Assert
    assert!(matches!(
        outcome,
        Err(PublisherError::ExchangeDeclaration { .. })
    ));
    assert_eq!(0, broker.publish_attempts());
}
