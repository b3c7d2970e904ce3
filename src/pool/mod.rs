//! Channel pooling over the single shared connection, using [`deadpool`].
//!
//! This module provides two key guarantees:
//! - At most `pool_size` pooled channels exist per connection; when the pool is at capacity
//!   and nothing is released within the wait window, a detached channel is opened instead.
//! - Channels opened on a connection that has since been replaced are never handed out again.
//!
//! ```rust,no_run
//! use warren::amqp::configuration::RabbitMqSettings;
//! use warren::amqp::ConnectionFactory;
//! use warren::ConnectionManager;
//!
//! async fn example() -> anyhow::Result<()> {
//!     let factory = ConnectionFactory::new_from_config(&RabbitMqSettings::default())?;
//!     let manager = ConnectionManager::builder(factory)
//!         .pool_size(16)
//!         .connect()
//!         .await?;
//!
//!     let channel = manager.acquire().await?;
//!     // ... use the channel ...
//!     channel.release().await;
//!     Ok(())
//! }
//! ```

pub(crate) mod channel;
mod error;

pub use channel::{ChannelManager, ChannelOf, ChannelPool, LinkedChannel, PooledChannel};
pub use error::Error;
