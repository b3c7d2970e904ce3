use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info};
use warren::amqp::configuration::RabbitMqSettings;
use warren::amqp::ExchangeKind;
use warren::queue::JobQueue;
use warren::{ConnectionState, ManagerSettings};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    // First of all we build the configuration for our connection.
    // We are using the out-of-the-box parameters for the default RabbitMq Docker image.
    // `RabbitMqSettings::from_uri` works as well if all you have is an `amqp://` uri.
    let settings = RabbitMqSettings::default();

    // `JobQueue::connect` owns the one connection this process needs.
    // If RabbitMq cannot be reached within the connection budget (5 attempts, 3 seconds apart)
    // there is nothing useful we can do: the process exits.
    let queue = JobQueue::connect(&settings, ManagerSettings::default()).await;

    // Sync jobs go through a topic exchange. Every worker listens on the same queue, bound with
    // the `sync` routing key.
    queue
        .bind_exchange("inventory-jobs", "inventory-jobs.sync", "sync")
        .await?;

    // Messages are pushed into a plain tokio channel. Each one is acked as soon as it has been
    // handed over to the channel.
    let (sink, mut jobs) = mpsc::channel(16);
    let mut subscription = queue.listen("inventory-jobs.sync", "sync", sink.clone()).await?;

    // Subscriptions end with the connection they were started on.
    // Watch the connection state to subscribe again once the manager reconnected.
    let resubscriber = {
        let queue = queue.clone();
        let mut state = queue.manager().watch_state();
        tokio::spawn(async move {
            while state.changed().await.is_ok() {
                let status = *state.borrow_and_update();
                if status.state != ConnectionState::Connected || status.generation < 2 {
                    continue;
                }
                // dropping the `Subscription` handle does not stop it
                if let Err(e) = queue.listen("inventory-jobs.sync", "sync", sink.clone()).await {
                    error!(error = %e, "Failed to subscribe again");
                }
            }
        })
    };

    for provider in ["aws", "aliyun", "tencent"] {
        let job = format!(r#"{{"provider":"{provider}","kind":"vm"}}"#);
        queue
            .push("inventory-jobs", ExchangeKind::Topic, "sync", job.into_bytes())
            .await?;
    }

    for _ in 0..3 {
        match tokio::time::timeout(Duration::from_secs(5), jobs.recv()).await {
            Ok(Some(job)) => info!(job = %String::from_utf8_lossy(&job), "Received job"),
            _ => break,
        }
    }

    subscription.cancel();
    resubscriber.abort();
    // Shutting down stops the connection watcher and every subscription still running.
    queue.shutdown().await;
    Ok(())
}
