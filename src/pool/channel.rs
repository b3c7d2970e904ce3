//! Implements [`Manager`] for the channels of the shared connection.
use std::ops::Deref;
use std::sync::Weak;

use deadpool::managed::{self, Manager, Object};
use deadpool::Runtime;

use crate::amqp::transport::{BrokerChannel, BrokerConnection, Dial};
use crate::manager::supervisor::Link;
use crate::pool::Error;

/// The channel type produced by the connections of a [`Dial`].
pub type ChannelOf<D> = <<D as Dial>::Connection as BrokerConnection>::Channel;

/// `ChannelPool` pools the channels opened on the connection of one generation.
///
/// A new pool is built every time the supervisor installs a connection; the previous one is
/// closed, so channels opened on a dead connection can never be handed out again.
pub type ChannelPool<D> = deadpool::managed::Pool<ChannelManager<D>>;

/// A channel tagged with the generation of the connection it was opened on.
pub struct LinkedChannel<C> {
    pub(crate) raw: C,
    pub(crate) generation: u64,
}

/// `ChannelManager` implements [`Manager`] to open and recycle channels for a [`ChannelPool`].
pub struct ChannelManager<D: Dial> {
    link: Weak<Link<D>>,
    generation: u64,
}

impl<D: Dial> ChannelManager<D> {
    pub(crate) fn new(link: Weak<Link<D>>, generation: u64) -> Self {
        Self { link, generation }
    }
}

pub(crate) fn build_pool<D: Dial>(
    link: Weak<Link<D>>,
    generation: u64,
    max_size: usize,
) -> Result<ChannelPool<D>, Error> {
    ChannelPool::builder(ChannelManager::new(link, generation))
        .max_size(max_size)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| Error::Pool(e.to_string()))
}

#[async_trait::async_trait]
impl<D: Dial> Manager for ChannelManager<D> {
    type Type = LinkedChannel<ChannelOf<D>>;
    type Error = Error;

    async fn create(&self) -> Result<Self::Type, Error> {
        let link = self.link.upgrade().ok_or(Error::Shutdown)?;
        link.open_channel().await
    }

    async fn recycle(&self, obj: &mut Self::Type) -> managed::RecycleResult<Error> {
        if obj.generation != self.generation {
            return Err(managed::RecycleError::Message(format!(
                "Channel belongs to connection generation {}, the pool serves generation {}",
                obj.generation, self.generation
            )));
        }
        if !obj.raw.is_open() {
            return Err(managed::RecycleError::Message(
                "Channel is not in an healthy state".to_owned(),
            ));
        }
        Ok(())
    }
}

/// A channel borrowed from a [`ConnectionManager`](crate::ConnectionManager).
///
/// Call [`PooledChannel::release`] once done with it. Dropping it also hands a pooled channel
/// back to its pool, where it is health-checked before being reused.
pub struct PooledChannel<D: Dial> {
    slot: Slot<D>,
    link: Weak<Link<D>>,
}

enum Slot<D: Dial> {
    Pooled(Object<ChannelManager<D>>),
    /// Opened straight from the connection because the pool was at capacity.
    Detached(LinkedChannel<ChannelOf<D>>),
}

impl<D: Dial> PooledChannel<D> {
    pub(crate) fn pooled(object: Object<ChannelManager<D>>, link: Weak<Link<D>>) -> Self {
        Self {
            slot: Slot::Pooled(object),
            link,
        }
    }

    pub(crate) fn detached(channel: LinkedChannel<ChannelOf<D>>, link: Weak<Link<D>>) -> Self {
        Self {
            slot: Slot::Detached(channel),
            link,
        }
    }

    fn linked(&self) -> &LinkedChannel<ChannelOf<D>> {
        match &self.slot {
            Slot::Pooled(object) => &**object,
            Slot::Detached(channel) => channel,
        }
    }

    /// `false` if the channel was opened outside of the pool bound.
    pub fn is_pooled(&self) -> bool {
        matches!(self.slot, Slot::Pooled(_))
    }

    /// The generation of the connection this channel was opened on.
    pub fn generation(&self) -> u64 {
        self.linked().generation
    }

    /// Give the channel back.
    ///
    /// A pooled channel goes back to its pool if it is still open and its connection is the
    /// current one. Every other channel is closed. Releasing never fails: close errors are
    /// logged, and a pool that was replaced in the meantime simply drops the channel.
    pub async fn release(self) {
        let current = match self.link.upgrade() {
            Some(link) => link.is_current(self.generation()).await,
            None => false,
        };
        let healthy = current && self.is_open();

        match self.slot {
            Slot::Pooled(object) if healthy => drop(object),
            Slot::Pooled(object) => close_quietly(Object::take(object).raw).await,
            Slot::Detached(channel) => close_quietly(channel.raw).await,
        }
    }

    /// Take the channel out of the pool for good, e.g. to keep consuming on it.
    pub(crate) fn detach(self) -> ChannelOf<D> {
        match self.slot {
            Slot::Pooled(object) => Object::take(object).raw,
            Slot::Detached(channel) => channel.raw,
        }
    }
}

impl<D: Dial> Deref for PooledChannel<D> {
    type Target = ChannelOf<D>;

    fn deref(&self) -> &ChannelOf<D> {
        &self.linked().raw
    }
}

pub(crate) async fn close_quietly<C: BrokerChannel>(channel: C) {
    if !channel.is_open() {
        return;
    }
    if let Err(e) = channel.close().await {
        tracing::debug!(error = %e, "Failed to close a released channel");
    }
}
