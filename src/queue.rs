//! A job queue on top of [`ConnectionManager`]: push jobs to exchanges, listen to queues.
use tokio::sync::mpsc;
use tracing::error;

use crate::amqp::configuration::RabbitMqSettings;
use crate::amqp::ConnectionFactory;
use crate::consumers::Subscription;
use crate::manager::settings::ManagerSettings;
use crate::pool::Error;
use crate::publishers::PublisherError;
use crate::topology::{ExchangeKind, ExchangeSpec, QueueSpec};
use crate::ConnectionManager;

/// Exit code used when the broker cannot be reached at startup.
const EXIT_NO_BROKER: i32 = 1;

/// A RabbitMq backed job queue.
#[derive(Clone)]
pub struct JobQueue {
    manager: ConnectionManager<ConnectionFactory>,
}

impl JobQueue {
    /// Connect to the broker described by `rabbit_mq`.
    ///
    /// A process cannot do anything useful without its job queue: if the broker cannot be
    /// reached within the connection budget, the process exits.
    pub async fn connect(rabbit_mq: &RabbitMqSettings, settings: ManagerSettings) -> Self {
        match Self::try_connect(rabbit_mq, settings).await {
            Ok(queue) => queue,
            Err(e) => {
                error!(error = ?e, fatal = e.is_fatal(), "Failed to connect the job queue");
                std::process::exit(EXIT_NO_BROKER);
            }
        }
    }

    /// Same as [`JobQueue::connect`], but hands the error back to the caller.
    pub async fn try_connect(
        rabbit_mq: &RabbitMqSettings,
        settings: ManagerSettings,
    ) -> Result<Self, Error> {
        let manager = ConnectionManager::from_config(rabbit_mq, settings).await?;
        Ok(Self { manager })
    }

    pub fn manager(&self) -> &ConnectionManager<ConnectionFactory> {
        &self.manager
    }

    /// Publish `data` to the exchange, declaring the exchange first if needed.
    pub async fn push(
        &self,
        exchange_name: &str,
        kind: ExchangeKind,
        routing_key: &str,
        data: Vec<u8>,
    ) -> Result<(), PublisherError> {
        let exchange = ExchangeSpec::new(exchange_name, kind);
        self.manager.publish(&exchange, routing_key, data).await
    }

    /// Forward the messages of `queue_name` to `sink`, acking each one once forwarded.
    pub async fn listen(
        &self,
        queue_name: &str,
        routing_key: &str,
        sink: mpsc::Sender<Vec<u8>>,
    ) -> Result<Subscription, Error> {
        let queue = QueueSpec::new(queue_name, routing_key);
        self.manager.subscribe(&queue, sink).await
    }

    /// Declare a topic exchange and a queue, and bind them with `routing_key`.
    pub async fn bind_exchange(
        &self,
        exchange_name: &str,
        queue_name: &str,
        routing_key: &str,
    ) -> Result<(), Error> {
        let exchange = ExchangeSpec::new(exchange_name, ExchangeKind::Topic)
            .with_queue(QueueSpec::new(queue_name, routing_key));
        self.manager.declare_exchange_with_queues(&exchange).await
    }

    pub async fn shutdown(&self) {
        self.manager.shutdown().await
    }
}
