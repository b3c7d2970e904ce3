//! The seam between the connection manager and the broker client.
//!
//! [`ConnectionManager`](crate::ConnectionManager) never talks to `lapin` directly: it dials
//! through [`Dial`], opens channels through [`BrokerConnection`] and drives topology and
//! messaging through [`BrokerChannel`].
//! The `lapin` implementations live at the bottom of this module.
use std::future::Future;

use amq_protocol_types::{DeliveryTag, ShortString};
use futures_util::stream::{BoxStream, StreamExt};
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
    ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, ChannelState, ConnectionState, ExchangeKind};
use tokio::sync::mpsc;

/// A stream of messages pushed by the broker to a consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, anyhow::Error>>;

/// Reply code and text sent along with the `close` method when we tear down channels
/// and connections ourselves.
const REPLY_SUCCESS: u16 = 200;

/// A factory for physical broker connections.
///
/// The connection manager calls `dial` for the first connection and again every time the
/// broker drops it. It never parses addresses or credentials itself.
///
/// Any `Fn() -> impl Future<Output = Result<C, anyhow::Error>>` is a `Dial`.
#[async_trait::async_trait]
pub trait Dial: Send + Sync + 'static {
    type Connection: BrokerConnection;

    async fn dial(&self) -> Result<Self::Connection, anyhow::Error>;
}

#[async_trait::async_trait]
impl<F, Fut, C> Dial for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<C, anyhow::Error>> + Send,
    C: BrokerConnection,
{
    type Connection = C;

    async fn dial(&self) -> Result<C, anyhow::Error> {
        (self)().await
    }
}

/// A physical connection to the broker.
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    /// Open a new logical channel on top of this connection.
    async fn create_channel(&self) -> Result<Self::Channel, anyhow::Error>;

    fn is_connected(&self) -> bool;

    /// Register `notifier` to be told when the broker (or the network) closes this connection.
    fn notify_close(&self, notifier: CloseNotifier);

    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// A logical channel multiplexed over a [`BrokerConnection`].
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    fn is_open(&self) -> bool;

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
    ) -> Result<(), anyhow::Error>;

    async fn exchange_delete(&self, exchange: &str) -> Result<(), anyhow::Error>;

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
    ) -> Result<QueueState, anyhow::Error>;

    /// Delete `queue`, returning the number of messages that were still in it.
    async fn queue_delete(&self, queue: &str) -> Result<u32, anyhow::Error>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), anyhow::Error>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), anyhow::Error>;

    async fn basic_consume(
        &self,
        queue: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, anyhow::Error>;

    async fn basic_ack(&self, delivery_tag: DeliveryTag) -> Result<(), anyhow::Error>;

    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// Why a connection went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// The AMQP reply code sent by the broker, e.g. `320` for `CONNECTION_FORCED`.
    ///
    /// `None` for failures that never reached the protocol layer (I/O errors, heartbeat
    /// timeouts, etc.).
    pub reply_code: Option<u16>,
    pub message: String,
}

impl CloseReason {
    pub fn new(reply_code: u16, message: impl Into<String>) -> Self {
        Self {
            reply_code: Some(reply_code),
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            reply_code: None,
            message: message.into(),
        }
    }
}

impl From<&lapin::Error> for CloseReason {
    fn from(error: &lapin::Error) -> Self {
        let reply_code = match error {
            lapin::Error::ProtocolError(amqp_error) => Some(amqp_error.get_id()),
            _ => None,
        };
        Self {
            reply_code,
            message: error.to_string(),
        }
    }
}

/// Handed to [`BrokerConnection::notify_close`].
///
/// Notifications are tagged with the generation of the connection they were registered for,
/// so a late notification from a connection that was already replaced is ignored.
#[derive(Clone, Debug)]
pub struct CloseNotifier {
    generation: u64,
    sender: mpsc::UnboundedSender<(u64, CloseReason)>,
}

impl CloseNotifier {
    pub(crate) fn new(generation: u64, sender: mpsc::UnboundedSender<(u64, CloseReason)>) -> Self {
        Self { generation, sender }
    }

    pub fn notify(&self, reason: CloseReason) {
        // The receiving end only goes away once the manager has shut down.
        let _ = self.sender.send((self.generation, reason));
    }
}

/// What the broker told us about a queue when declaring it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueState {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// A received AMQP message.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// The delivery tag of the message, used to acknowledge it on the channel it came from.
    pub delivery_tag: DeliveryTag,

    /// The exchange of the message. May be an empty string
    /// if the default exchange is used.
    pub exchange: ShortString,

    /// The routing key of the message. May be an empty string
    /// if no routing key is specified.
    pub routing_key: ShortString,

    pub redelivered: bool,

    /// Contains the properties and the headers of the
    /// message.
    pub properties: BasicProperties,

    /// The payload of the message in binary format.
    pub data: Vec<u8>,
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(value: lapin::message::Delivery) -> Self {
        Self {
            delivery_tag: value.delivery_tag,
            exchange: value.exchange,
            routing_key: value.routing_key,
            redelivered: value.redelivered,
            properties: value.properties,
            data: value.data,
        }
    }
}

#[async_trait::async_trait]
impl BrokerConnection for lapin::Connection {
    type Channel = lapin::Channel;

    async fn create_channel(&self) -> Result<lapin::Channel, anyhow::Error> {
        Ok(lapin::Connection::create_channel(self).await?)
    }

    fn is_connected(&self) -> bool {
        matches!(self.status().state(), ConnectionState::Connected)
    }

    fn notify_close(&self, notifier: CloseNotifier) {
        self.on_error(move |error| notifier.notify(CloseReason::from(&error)));
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        Ok(lapin::Connection::close(self, REPLY_SUCCESS, "connection manager shutdown").await?)
    }
}

#[async_trait::async_trait]
impl BrokerChannel for lapin::Channel {
    fn is_open(&self) -> bool {
        matches!(self.status().state(), ChannelState::Connected)
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
    ) -> Result<(), anyhow::Error> {
        lapin::Channel::exchange_declare(self, exchange, kind, options, FieldTable::default())
            .await?;
        Ok(())
    }

    async fn exchange_delete(&self, exchange: &str) -> Result<(), anyhow::Error> {
        lapin::Channel::exchange_delete(
            self,
            exchange,
            ExchangeDeleteOptions {
                if_unused: false,
                nowait: false,
            },
        )
        .await?;
        Ok(())
    }

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
    ) -> Result<QueueState, anyhow::Error> {
        let queue =
            lapin::Channel::queue_declare(self, queue, options, FieldTable::default()).await?;
        Ok(QueueState {
            name: queue.name().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn queue_delete(&self, queue: &str) -> Result<u32, anyhow::Error> {
        let purged = lapin::Channel::queue_delete(
            self,
            queue,
            QueueDeleteOptions {
                if_unused: false,
                if_empty: false,
                nowait: false,
            },
        )
        .await?;
        Ok(purged)
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), anyhow::Error> {
        lapin::Channel::queue_bind(
            self,
            queue,
            exchange,
            routing_key,
            QueueBindOptions { nowait: false },
            FieldTable::default(),
        )
        .await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, payload, properties))]
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), anyhow::Error> {
        let options = BasicPublishOptions {
            mandatory: false,
            // The immediate flag was dropped in RabbitMQ 3.0, setting it causes a not-supported error.
            immediate: false,
        };
        let confirm = lapin::Channel::basic_publish(
            self,
            exchange,
            routing_key,
            options,
            payload,
            properties,
        )
        .await?
        .await?;

        match confirm {
            Confirmation::Nack(_) => Err(anyhow::anyhow!(
                "The RabbitMq broker nacked the publishing of the message"
            )),
            Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
        }
    }

    async fn basic_consume(
        &self,
        queue: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, anyhow::Error> {
        let consumer = lapin::Channel::basic_consume(
            self,
            queue,
            "",
            BasicConsumeOptions {
                no_ack: auto_ack,
                ..BasicConsumeOptions::default()
            },
            FieldTable::default(),
        )
        .await?;
        Ok(consumer
            .map(|delivery| delivery.map(Delivery::from).map_err(anyhow::Error::from))
            .boxed())
    }

    async fn basic_ack(&self, delivery_tag: DeliveryTag) -> Result<(), anyhow::Error> {
        lapin::Channel::basic_ack(self, delivery_tag, BasicAckOptions { multiple: false }).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        Ok(lapin::Channel::close(self, REPLY_SUCCESS, "channel released").await?)
    }
}
