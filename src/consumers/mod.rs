//! Facilities to consume messages from a RabbitMq queue. Check out
//! [`ConnectionManager::subscribe`](crate::ConnectionManager::subscribe) as a starting point.
mod subscription;

pub use subscription::Subscription;
