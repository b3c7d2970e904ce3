//! Facilities to publish messages to a RabbitMq exchange.
//! Check out [`ConnectionManager::publish`](crate::ConnectionManager::publish) as a starting point.
mod message_envelope;
mod publisher;

pub use message_envelope::MessageEnvelope;
pub use publisher::{PublisherError, CONTENT_TYPE_JSON};
