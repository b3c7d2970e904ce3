use amq_protocol_types::{AMQPValue, FieldTable, ShortString, Timestamp};
use lapin::BasicProperties;

use crate::amqp::convenience::set_header;

/// A message to be published with
/// [`ConnectionManager::publish_envelope`](crate::ConnectionManager::publish_envelope).
///
/// Content type, delivery mode and priority are not configurable: every message goes out as
/// persistent JSON with priority 0.
#[derive(Debug, Clone, Default)]
pub struct MessageEnvelope {
    // The body of the message - as a sequence of bytes.
    pub payload: Vec<u8>,
    // The routing key used by the exchange to pick the queues that get a copy of the message.
    pub routing_key: String,
    // AMQP properties attached to the message.
    pub properties: BasicProperties,
}

impl MessageEnvelope {
    pub fn new(routing_key: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            routing_key: routing_key.into(),
            properties: BasicProperties::default(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: AMQPValue) -> Self {
        self.properties = set_header(self.properties, name, value);
        self
    }

    fn props(mut self, f: impl FnOnce(BasicProperties) -> BasicProperties) -> Self {
        self.properties = f(self.properties);
        self
    }

    #[must_use]
    pub fn with_headers(self, value: FieldTable) -> Self {
        self.props(|p| p.with_headers(value))
    }

    #[must_use]
    pub fn with_correlation_id(self, value: ShortString) -> Self {
        self.props(|p| p.with_correlation_id(value))
    }

    #[must_use]
    pub fn with_reply_to(self, value: ShortString) -> Self {
        self.props(|p| p.with_reply_to(value))
    }

    #[must_use]
    pub fn with_expiration(self, value: ShortString) -> Self {
        self.props(|p| p.with_expiration(value))
    }

    #[must_use]
    pub fn with_message_id(self, value: ShortString) -> Self {
        self.props(|p| p.with_message_id(value))
    }

    #[must_use]
    pub fn with_timestamp(self, value: Timestamp) -> Self {
        self.props(|p| p.with_timestamp(value))
    }

    #[must_use]
    pub fn with_kind(self, value: ShortString) -> Self {
        self.props(|p| p.with_kind(value))
    }

    #[must_use]
    pub fn with_app_id(self, value: ShortString) -> Self {
        self.props(|p| p.with_app_id(value))
    }
}
