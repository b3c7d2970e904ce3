use std::sync::Arc;

use futures_util::StreamExt;
use shutdown_handler::ShutdownHandler;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn, Instrument};

use crate::amqp::transport::{BrokerChannel, DeliveryStream, Dial};
use crate::pool::channel::close_quietly;
use crate::pool::Error;
use crate::topology::QueueSpec;
use crate::ConnectionManager;

/// A running consumer, forwarding the messages of one queue to a sink.
///
/// The consumer runs on its own task. Dropping the `Subscription` does not stop it: use
/// [`Subscription::cancel`], drop the receiving end of the sink or shut the manager down.
#[derive(Debug)]
pub struct Subscription {
    queue_name: String,
    cancel: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// `true` once the consumer stopped forwarding messages, for whatever reason.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop consuming. Messages that were not acked yet are redelivered by the broker.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }

    /// Wait for the consumer to stop.
    pub async fn wait(self) -> Result<(), JoinError> {
        self.handle.await
    }
}

impl<D: Dial> ConnectionManager<D> {
    /// Start consuming `queue` and push the body of every message into `sink`.
    ///
    /// Returns as soon as the broker registered the consumer. The channel is taken out of the
    /// pool for as long as the consumer runs.
    ///
    /// Unless the queue is auto-ack, each message is acked right after it reached `sink`.
    /// Failing to ack is logged and the message is not retried.
    ///
    /// The consumer stops when its channel or the connection closes: after a reconnect, call
    /// `subscribe` again (see [`ConnectionManager::watch_state`]).
    #[tracing::instrument(skip(self, sink), fields(queue_name = %queue.name))]
    pub async fn subscribe(
        &self,
        queue: &QueueSpec,
        sink: mpsc::Sender<Vec<u8>>,
    ) -> Result<Subscription, Error> {
        let channel = self.acquire().await?.detach();
        let deliveries = match channel.basic_consume(&queue.name, queue.auto_ack).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                error!(error = %e, "Failed to start consuming");
                close_quietly(channel).await;
                return Err(Error::Broker(e));
            }
        };

        let (cancel, cancelled) = oneshot::channel();
        let consumer = Consumer {
            channel,
            deliveries,
            sink,
            auto_ack: queue.auto_ack,
        };
        let handle = tokio::spawn(
            consumer
                .run_until_shutdown(Arc::clone(&self.link.shutdown), cancelled)
                .in_current_span(),
        );
        Ok(Subscription {
            queue_name: queue.name.clone(),
            cancel: Some(cancel),
            handle,
        })
    }
}

struct Consumer<C> {
    channel: C,
    deliveries: DeliveryStream,
    sink: mpsc::Sender<Vec<u8>>,
    auto_ack: bool,
}

impl<C: BrokerChannel> Consumer<C> {
    async fn run_until_shutdown(
        mut self,
        shutdown: Arc<ShutdownHandler>,
        cancelled: oneshot::Receiver<()>,
    ) {
        // a dropped `Subscription` never completes this, only a cancel does
        let stopped = async {
            tokio::select! {
                _ = shutdown.wait_for_signal() => info!("Consumer received shutdown event"),
                Ok(()) = cancelled => info!("Consumer cancelled"),
            }
        };
        tokio::pin!(stopped);

        loop {
            tokio::select! {
                // prefer stopping over forwarding more messages
                biased;

                _ = &mut stopped => break,

                delivery = self.deliveries.next() => match delivery {
                    None => {
                        info!("Delivery stream ended");
                        break;
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Consumer error");
                        break;
                    }
                    Some(Ok(delivery)) => {
                        let delivery_tag = delivery.delivery_tag;
                        // a full sink must not hold back a shutdown or a cancel
                        tokio::select! {
                            biased;

                            _ = &mut stopped => break,
                            sent = self.sink.send(delivery.data) => if sent.is_err() {
                                warn!("The message sink was dropped, stopping the consumer");
                                break;
                            }
                        }
                        if !self.auto_ack {
                            if let Err(e) = self.channel.basic_ack(delivery_tag).await {
                                error!(
                                    delivery_tag,
                                    error = %e,
                                    "Failed to ack received message"
                                );
                            }
                        }
                    }
                }
            }
        }

        close_quietly(self.channel).await;
        debug!("Consumer stopped");
    }
}
