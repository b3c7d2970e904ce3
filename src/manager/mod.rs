//! The [`ConnectionManager`]: one shared broker connection, a pool of channels on top of it,
//! and automatic recovery when the broker drops the connection.
pub mod settings;
pub(crate) mod supervisor;

use std::sync::Arc;

use tokio::sync::watch;

use crate::amqp::transport::Dial;
use crate::amqp::ConnectionFactory;
use crate::pool::{Error, PooledChannel};
use settings::ManagerSettings;
use supervisor::Link;
pub use supervisor::{ConnectionState, ConnectionStatus, PoolStatus};

/// A long-lived handle over the single broker connection of a process.
///
/// `ConnectionManager` is cheap to clone: clones share the connection, the channel pool and
/// the background watcher. Build one at startup, inject it wherever messages are published or
/// consumed, and call [`ConnectionManager::shutdown`] on the way out.
///
/// # Fault tolerance
///
/// When the broker closes the connection with a reply code accepted by the
/// [`ReconnectPolicy`](settings::ReconnectPolicy), the channel pool is discarded and the
/// manager dials again until it succeeds. Operations issued in the meantime wait for the new
/// connection, within the budget configured in [`ManagerSettings`].
///
/// Subscriptions do not survive a reconnect: use [`ConnectionManager::watch_state`] to notice
/// the new connection and subscribe again.
pub struct ConnectionManager<D: Dial> {
    pub(crate) link: Arc<Link<D>>,
}

impl<D: Dial> Clone for ConnectionManager<D> {
    fn clone(&self) -> Self {
        Self {
            link: Arc::clone(&self.link),
        }
    }
}

impl<D: Dial> ConnectionManager<D> {
    /// Start building a [`ConnectionManager`] on top of `dial`.
    pub fn builder(dial: D) -> ConnectionManagerBuilder<D> {
        ConnectionManagerBuilder {
            dial,
            settings: ManagerSettings::default(),
        }
    }

    /// Connect with the default [`ManagerSettings`].
    ///
    /// If the broker cannot be reached within the connection budget the returned error is
    /// [`Error::InitialConnection`]: check [`Error::is_fatal`] and stop the process.
    pub async fn connect(dial: D) -> Result<Self, Error> {
        Self::builder(dial).connect().await
    }

    /// Borrow a channel. See [`PooledChannel`] for how to give it back.
    pub async fn acquire(&self) -> Result<PooledChannel<D>, Error> {
        self.link.acquire().await
    }

    /// Give a channel back. Same as [`PooledChannel::release`].
    pub async fn release(&self, channel: PooledChannel<D>) {
        channel.release().await
    }

    pub async fn state(&self) -> ConnectionStatus {
        self.link.status().await
    }

    /// Get notified of every state transition of the underlying connection.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionStatus> {
        self.link.watch_status()
    }

    /// `None` while there is no live connection.
    pub async fn pool_status(&self) -> Option<PoolStatus> {
        self.link.pool_status().await
    }

    /// Dial again after the broker closed the connection for a reason that did not trigger an
    /// automatic reconnect. Does nothing while connected.
    pub async fn reconnect(&self) {
        if self.link.status().await.state == ConnectionState::Connected {
            return;
        }
        self.link.reconnect().await
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.link.settings
    }

    /// Stop the background watcher and every subscription, then close the connection.
    ///
    /// Every operation issued afterwards fails with [`Error::Shutdown`].
    pub async fn shutdown(&self) {
        self.link.shutdown().await
    }
}

impl ConnectionManager<ConnectionFactory> {
    /// Connect to the broker described by `settings` with a [`ConnectionFactory`].
    pub async fn from_config(
        rabbit_mq: &crate::amqp::configuration::RabbitMqSettings,
        settings: ManagerSettings,
    ) -> Result<Self, Error> {
        let factory = ConnectionFactory::new_from_config(rabbit_mq)?;
        Self::builder(factory).settings(settings).connect().await
    }
}

/// A builder for [`ConnectionManager`].
///
/// Use [`ConnectionManager::builder`] as entrypoint.
pub struct ConnectionManagerBuilder<D: Dial> {
    dial: D,
    settings: ManagerSettings,
}

impl<D: Dial> ConnectionManagerBuilder<D> {
    #[must_use]
    pub fn settings(mut self, settings: ManagerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Maximum number of pooled channels. Defaults to 100.
    #[must_use]
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.settings.pool_size = pool_size;
        self
    }

    /// Establish the connection and start watching it.
    #[tracing::instrument(name = "connection_manager_connect", skip_all)]
    pub async fn connect(self) -> Result<ConnectionManager<D>, Error> {
        let link = Link::establish(self.dial, self.settings).await?;
        Ok(ConnectionManager { link })
    }
}
