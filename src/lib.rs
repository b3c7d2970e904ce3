//! `warren` keeps a single RabbitMq connection alive for a whole process and multiplexes
//! publishers and consumers over a bounded pool of channels on top of it, built on
//! [`lapin`] and [`deadpool`].
//!
//! [`ConnectionManager`] is the best starting point to learn more about what `warren`
//! provides:
//! - recovery from broker-initiated disconnects, see [`ReconnectPolicy`];
//! - idempotent topology helpers, see [`topology`];
//! - publishing with bounded retries and consuming into a channel, see [`publishers`] and
//!   [`consumers`].
//!
//! [`queue::JobQueue`] wraps all of that in a small job queue API.
//!
//! ## Examples
//!
//! Check the `demos` directory to see the library in action.

pub mod amqp;
pub mod consumers;
pub mod manager;
pub mod pool;
pub mod publishers;
pub mod queue;
pub mod topology;

pub use manager::settings::{ManagerSettings, ReconnectPolicy};
pub use manager::{ConnectionManager, ConnectionManagerBuilder, ConnectionState, ConnectionStatus};
pub use pool::Error;
pub use topology::{ExchangeSpec, QueueSpec};
