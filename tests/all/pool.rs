use std::time::Duration;

use warren::amqp::BrokerChannel;
use warren::ManagerSettings;

use crate::helpers::{connect, connect_with, wait_until_connected, InMemoryBroker};

fn pool_of(pool_size: usize) -> ManagerSettings {
    ManagerSettings {
        pool_size,
        ..ManagerSettings::default()
    }
}

#[tokio::test(start_paused = true)]
async fn released_channels_are_reused() {
    // Arrange
    let broker = InMemoryBroker::new();
    let manager = connect(&broker).await;

    // Act
    let channel = manager.acquire().await.unwrap();
    manager.release(channel).await;
    let channel = manager.acquire().await.unwrap();

    // Assert
    assert!(channel.is_pooled());
    assert_eq!(1, broker.channels_opened());
    assert_eq!(0, broker.channels_closed());
}

#[tokio::test(start_paused = true)]
async fn an_exhausted_pool_falls_back_to_a_detached_channel_after_the_wait_window() {
    // Arrange
    let broker = InMemoryBroker::new();
    let manager = connect_with(&broker, pool_of(2)).await;
    let first = manager.acquire().await.unwrap();
    let second = manager.acquire().await.unwrap();

    // Act
    let started = tokio::time::Instant::now();
    let third = manager.acquire().await.unwrap();

    // Assert
    assert!(first.is_pooled() && second.is_pooled());
    assert!(!third.is_pooled());
    assert!(started.elapsed() >= Duration::from_secs(1));
    let status = manager.pool_status().await.unwrap();
    assert_eq!(2, status.max_size);
    assert!(status.size <= 2);
}

#[tokio::test(start_paused = true)]
async fn detached_channels_are_closed_on_release() {
    // Arrange
    let broker = InMemoryBroker::new();
    let manager = connect_with(&broker, pool_of(1)).await;
    let pooled = manager.acquire().await.unwrap();
    let detached = manager.acquire().await.unwrap();

    // Act
    detached.release().await;
    pooled.release().await;

    // Assert
    assert_eq!(2, broker.channels_opened());
    assert_eq!(1, broker.channels_closed());
    assert_eq!(1, manager.pool_status().await.unwrap().size);
}

#[tokio::test(start_paused = true)]
async fn a_channel_released_by_another_caller_unblocks_a_waiting_acquire() {
    // Arrange
    let broker = InMemoryBroker::new();
    let manager = connect_with(&broker, pool_of(1)).await;
    let held = manager.acquire().await.unwrap();

    // Act
    let waiter = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.acquire().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    held.release().await;
    let channel = waiter.await.unwrap().unwrap();

    // Assert
    assert!(channel.is_pooled());
    assert_eq!(1, broker.channels_opened());
}

#[tokio::test(start_paused = true)]
async fn closed_channels_are_not_handed_out_again() {
    // Arrange
    let broker = InMemoryBroker::new();
    let manager = connect(&broker).await;
    let channel = manager.acquire().await.unwrap();
    channel.close().await.unwrap();

    // Act
    channel.release().await;
    let channel = manager.acquire().await.unwrap();

    // Assert
    assert!(channel.is_open());
    assert_eq!(2, broker.channels_opened());
}

#[tokio::test(start_paused = true)]
async fn channels_of_a_replaced_connection_are_closed_on_release() {
    // Arrange
    let broker = InMemoryBroker::new();
    let manager = connect(&broker).await;
    let stale = manager.acquire().await.unwrap();
    assert_eq!(1, stale.generation());

    // Act
    broker.force_close(320);
    wait_until_connected(&manager, 2).await;
    stale.release().await;
    let fresh = manager.acquire().await.unwrap();

    // Assert
    assert_eq!(2, fresh.generation());
    assert!(fresh.is_open());
    assert_eq!(2, broker.channels_opened());
}

#[tokio::test(start_paused = true)]
async fn dropping_a_channel_gives_it_back_to_the_pool() {
    // Arrange
    let broker = InMemoryBroker::new();
    let manager = connect(&broker).await;

    // Act
    drop(manager.acquire().await.unwrap());
    let channel = manager.acquire().await.unwrap();

    // Assert
    assert!(channel.is_pooled());
    assert_eq!(1, broker.channels_opened());
}
