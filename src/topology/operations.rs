use lapin::options::{ExchangeDeclareOptions, QueueDeclareOptions};
use tracing::error;

use crate::amqp::transport::{BrokerChannel, Dial, QueueState};
use crate::pool::Error;
use crate::topology::{ExchangeSpec, QueueSpec};
use crate::ConnectionManager;

fn durable_exchange(passive: bool) -> ExchangeDeclareOptions {
    ExchangeDeclareOptions {
        passive,
        durable: true,
        auto_delete: false,
        internal: false,
        nowait: false,
    }
}

fn durable_queue(passive: bool) -> QueueDeclareOptions {
    QueueDeclareOptions {
        passive,
        durable: true,
        exclusive: false,
        auto_delete: false,
        nowait: false,
    }
}

/// Topology operations.
///
/// Each of them borrows one channel, performs a single broker call and gives the channel back,
/// whatever the outcome.
impl<D: Dial> ConnectionManager<D> {
    /// Declare `exchange`. Declaring an exchange that already exists with the same settings
    /// is a no-op.
    #[tracing::instrument(skip_all, fields(exchange = %exchange.name))]
    pub async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), Error> {
        let channel = self.acquire().await?;
        let outcome = channel
            .exchange_declare(&exchange.name, exchange.kind.clone(), durable_exchange(false))
            .await;
        channel.release().await;

        outcome.map_err(|e| {
            error!(error = %e, "Failed to declare exchange");
            Error::Broker(e)
        })
    }

    /// Delete `exchange`, even if queues are still bound to it.
    #[tracing::instrument(skip_all, fields(exchange = %exchange.name))]
    pub async fn delete_exchange(&self, exchange: &ExchangeSpec) -> Result<(), Error> {
        let channel = self.acquire().await?;
        let outcome = channel.exchange_delete(&exchange.name).await;
        channel.release().await;
        Ok(outcome?)
    }

    /// Check whether `exchange` exists with a passive declare.
    ///
    /// Any failure, including failing to get a channel or being denied access, is reported as
    /// "does not exist".
    #[tracing::instrument(skip_all, fields(exchange = %exchange.name))]
    pub async fn exists_exchange(&self, exchange: &ExchangeSpec) -> bool {
        let Ok(channel) = self.acquire().await else {
            return false;
        };
        let outcome = channel
            .exchange_declare(&exchange.name, exchange.kind.clone(), durable_exchange(true))
            .await;
        channel.release().await;
        outcome.is_ok()
    }

    #[tracing::instrument(skip(self))]
    pub async fn declare_queue(&self, queue_name: &str) -> Result<QueueState, Error> {
        let channel = self.acquire().await?;
        let outcome = channel.queue_declare(queue_name, durable_queue(false)).await;
        channel.release().await;
        Ok(outcome?)
    }

    /// Delete the queue, whether or not it is empty or in use.
    /// Returns the number of messages dropped with it.
    #[tracing::instrument(skip(self))]
    pub async fn delete_queue(&self, queue_name: &str) -> Result<u32, Error> {
        let channel = self.acquire().await?;
        let outcome = channel.queue_delete(queue_name).await;
        channel.release().await;
        Ok(outcome?)
    }

    /// Check whether `queue` exists with a passive declare.
    ///
    /// Same caveat as [`ConnectionManager::exists_exchange`]: every error means `false`.
    #[tracing::instrument(skip_all, fields(queue = %queue.name))]
    pub async fn exists_queue(&self, queue: &QueueSpec) -> bool {
        let Ok(channel) = self.acquire().await else {
            return false;
        };
        let outcome = channel.queue_declare(&queue.name, durable_queue(true)).await;
        channel.release().await;
        outcome.is_ok()
    }

    #[tracing::instrument(skip(self))]
    pub async fn bind_queue(
        &self,
        exchange_name: &str,
        routing_key: &str,
        queue_name: &str,
    ) -> Result<(), Error> {
        let channel = self.acquire().await?;
        let outcome = channel
            .queue_bind(queue_name, exchange_name, routing_key)
            .await;
        channel.release().await;
        Ok(outcome?)
    }

    /// Declare `exchange`, then declare each of its queues and bind it with its routing key.
    ///
    /// Stops at the first failure. What was created before the failure is left in place.
    #[tracing::instrument(skip_all, fields(exchange = %exchange.name))]
    pub async fn declare_exchange_with_queues(&self, exchange: &ExchangeSpec) -> Result<(), Error> {
        self.declare_exchange(exchange).await?;
        for queue in &exchange.queues {
            self.declare_queue(&queue.name).await?;
            self.bind_queue(&exchange.name, &queue.routing_key, &queue.name)
                .await?;
        }
        Ok(())
    }
}
