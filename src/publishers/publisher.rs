use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{error, warn};
use uuid::Uuid;

use crate::amqp::transport::{BrokerChannel, Dial};
use crate::pool::Error;
use crate::publishers::MessageEnvelope;
use crate::topology::ExchangeSpec;
use crate::ConnectionManager;

/// Content type of every published message.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Delivery mode: Non-persistent (1) or persistent (2).
const PERSISTENT: u8 = 2;

/// Error returned when trying to publish a message.
#[derive(thiserror::Error, Debug)]
pub enum PublisherError {
    #[error("Failed to declare exchange `{exchange}` before publishing")]
    ExchangeDeclaration {
        exchange: String,
        #[source]
        source: Error,
    },
    #[error("Failed to get a channel to publish on")]
    ChannelUnavailable(#[source] Error),
    #[error("Failed to publish the message to the RabbitMq broker after {attempts} attempts")]
    GenericError {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },
}

impl<D: Dial> ConnectionManager<D> {
    /// Publish `body` to `exchange` with `routing_key`.
    ///
    /// The exchange is declared first. Messages are persistent JSON with priority 0.
    ///
    /// # Fault tolerance
    ///
    /// A failed publish is retried `publish_retries` times, `publish_retry_delay` apart, each
    /// time on a freshly acquired channel. When every attempt fails the last error is returned.
    pub async fn publish(
        &self,
        exchange: &ExchangeSpec,
        routing_key: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<(), PublisherError> {
        self.publish_envelope(exchange, MessageEnvelope::new(routing_key, body))
            .await
    }

    /// Publish a message carrying custom headers or metadata.
    ///
    /// Same policy as [`ConnectionManager::publish`]: content type, delivery mode and priority
    /// set on the envelope are overwritten. A `message_id` and a `timestamp` are added when
    /// missing.
    #[tracing::instrument(
        name = "publish",
        skip_all,
        fields(exchange = %exchange.name, routing_key = %envelope.routing_key)
    )]
    pub async fn publish_envelope(
        &self,
        exchange: &ExchangeSpec,
        envelope: MessageEnvelope,
    ) -> Result<(), PublisherError> {
        self.declare_exchange(exchange)
            .await
            .map_err(|source| PublisherError::ExchangeDeclaration {
                exchange: exchange.name.clone(),
                source,
            })?;

        let MessageEnvelope {
            payload,
            routing_key,
            properties,
        } = inject_amqp_properties(envelope);
        let properties = properties
            .with_content_type(CONTENT_TYPE_JSON.into())
            .with_delivery_mode(PERSISTENT)
            .with_priority(0);

        let attempts = self.settings().publish_retries + 1;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let channel = self
                .acquire()
                .await
                .map_err(PublisherError::ChannelUnavailable)?;
            let outcome = channel
                .basic_publish(&exchange.name, &routing_key, &payload, properties.clone())
                .await;
            channel.release().await;

            match outcome {
                Ok(()) => return Ok(()),
                Err(source) if attempt >= attempts => {
                    error!(attempts, error = %source, "Failed to publish message, giving up");
                    return Err(PublisherError::GenericError { attempts, source });
                }
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "Failed to publish message, retrying");
                    tokio::time::sleep(self.settings().publish_retry_delay()).await;
                }
            }
        }
    }
}

/// Inject the current timestamp and a message_id, unless the envelope already carries them.
fn inject_amqp_properties(mut envelope: MessageEnvelope) -> MessageEnvelope {
    let current_timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|ct| ct.as_secs());

    let props = envelope.properties;
    let props = if let Some(ct) = current_timestamp {
        let ts = *props.timestamp();
        props.with_timestamp(ts.unwrap_or(ct))
    } else {
        warn!("System time is before 1970");
        props
    };

    let message_id = props.message_id().clone();
    envelope.properties =
        props.with_message_id(message_id.unwrap_or_else(|| Uuid::new_v4().to_string().into()));

    envelope
}
