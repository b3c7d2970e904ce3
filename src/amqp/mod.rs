//! Helpers for connecting to a rabbitmq broker

pub mod configuration;
pub mod convenience;
mod factory;
pub mod transport;

pub use factory::ConnectionFactory;
pub use transport::{
    BrokerChannel, BrokerConnection, CloseNotifier, CloseReason, Delivery, DeliveryStream, Dial,
    QueueState,
};

pub use lapin::{options, types, BasicProperties, Channel, Connection, ExchangeKind};
