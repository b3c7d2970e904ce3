//! Owns the one physical connection: dials it, watches it and replaces it when the broker
//! drops it.
use std::sync::{Arc, Weak};

use deadpool::managed::{PoolError, Timeouts};
use shutdown_handler::ShutdownHandler;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::amqp::transport::{BrokerConnection, CloseNotifier, CloseReason, Dial};
use crate::manager::settings::ManagerSettings;
use crate::pool::channel::{build_pool, ChannelOf, ChannelPool, LinkedChannel, PooledChannel};
use crate::pool::Error;

/// How many times `acquire` goes back to the pool after finding it closed by a reconnect.
const MAX_POOL_REFRESHES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// A snapshot of the supervisor state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Bumped every time a new connection is installed. `0` until the first connection.
    pub generation: u64,
}

/// Occupancy of the current channel pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub max_size: usize,
    /// Pooled channels currently alive, idle or checked out.
    pub size: usize,
}

/// Everything guarded by the supervisor lock.
///
/// The connection, the `disconnected` flag and the pool are always inspected and replaced
/// together.
struct LinkState<D: Dial> {
    connection: Option<Arc<D::Connection>>,
    disconnected: bool,
    generation: u64,
    pool: Option<ChannelPool<D>>,
    shut_down: bool,
}

/// A usable connection, copied out of the lock.
struct Snapshot<D: Dial> {
    connection: Arc<D::Connection>,
    generation: u64,
    pool: Option<ChannelPool<D>>,
}

pub(crate) struct Link<D: Dial> {
    dial: D,
    pub(crate) settings: ManagerSettings,
    state: RwLock<LinkState<D>>,
    close_sender: mpsc::UnboundedSender<(u64, CloseReason)>,
    status: watch::Sender<ConnectionStatus>,
    pub(crate) shutdown: Arc<ShutdownHandler>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    /// Held by the one reconnect loop allowed to run at a time.
    reconnecting: Mutex<()>,
}

impl<D: Dial> Link<D> {
    /// Dial the first connection and start watching it.
    ///
    /// Failing to ever connect is fatal and reported as [`Error::InitialConnection`].
    pub(crate) async fn establish(dial: D, settings: ManagerSettings) -> Result<Arc<Self>, Error> {
        let (close_sender, close_receiver) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ConnectionStatus {
            state: ConnectionState::Disconnected,
            generation: 0,
        });
        let link = Arc::new(Self {
            dial,
            settings,
            state: RwLock::new(LinkState {
                connection: None,
                disconnected: true,
                generation: 0,
                pool: None,
                shut_down: false,
            }),
            close_sender,
            status,
            shutdown: Arc::new(ShutdownHandler::new()),
            watcher: Mutex::new(None),
            reconnecting: Mutex::new(()),
        });

        match link.dial_with_retries().await {
            Ok(connection) => link.install(connection).await,
            Err(source) => {
                error!(error = %source, "Could not connect to RabbitMq, giving up");
                return Err(Error::InitialConnection {
                    attempts: link.settings.connect_attempts.max(1),
                    source,
                });
            }
        }

        let watcher = Self::spawn_watcher(Arc::downgrade(&link), close_receiver);
        *link.watcher.lock().await = Some(watcher);
        Ok(link)
    }

    /// Up to `connect_attempts` dials, `connect_delay` apart.
    async fn dial_with_retries(&self) -> Result<D::Connection, anyhow::Error> {
        let attempts = self.settings.connect_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.dial.dial().await {
                Ok(connection) => return Ok(connection),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "Failed to connect to RabbitMq, retrying");
                    tokio::time::sleep(self.settings.connect_delay()).await;
                }
            }
        }
    }

    /// Make `connection` the current one, with a brand new channel pool.
    async fn install(self: &Arc<Self>, connection: D::Connection) {
        let mut state = self.state.write().await;
        if state.shut_down {
            drop(state);
            if let Err(e) = connection.close().await {
                debug!(error = %e, "Failed to close a connection dialed during shutdown");
            }
            return;
        }

        let generation = state.generation + 1;
        let notifier = CloseNotifier::new(generation, self.close_sender.clone());
        connection.notify_close(notifier.clone());
        // a failure between the dial and the registration above is never reported by the client
        let alive = connection.is_connected();
        let pool = match build_pool(Arc::downgrade(self), generation, self.settings.pool_size) {
            Ok(pool) => Some(pool),
            Err(e) => {
                error!(error = %e, "Failed to build the channel pool, channels will not be reused");
                None
            }
        };
        if let Some(stale) = std::mem::replace(&mut state.pool, pool) {
            stale.close();
        }
        let previous = state.connection.replace(Arc::new(connection));
        state.disconnected = false;
        state.generation = generation;
        drop(state);

        if let Some(previous) = previous {
            warn!(generation, "Closing a connection that was still installed");
            if let Err(e) = previous.close().await {
                debug!(error = %e, "Failed to close the replaced connection");
            }
        }

        info!(generation, "Connected to RabbitMq");
        self.status.send_replace(ConnectionStatus {
            state: ConnectionState::Connected,
            generation,
        });
        if !alive {
            notifier.notify(CloseReason::transport(
                "The connection was lost before it could be watched",
            ));
        }
    }

    fn spawn_watcher(
        link: Weak<Self>,
        mut close_receiver: mpsc::UnboundedReceiver<(u64, CloseReason)>,
    ) -> JoinHandle<()> {
        let shutdown = match link.upgrade() {
            Some(link) => Arc::clone(&link.shutdown),
            None => return tokio::spawn(async {}),
        };
        tokio::spawn(async move {
            let signal = shutdown.wait_for_signal();
            tokio::pin!(signal);
            loop {
                tokio::select! {
                    biased;

                    _ = &mut signal => break,

                    notification = close_receiver.recv() => {
                        let Some((generation, reason)) = notification else { break };
                        let Some(link) = link.upgrade() else { break };
                        link.handle_close(generation, reason).await;
                    }
                }
            }
            debug!("RabbitMq connection watcher stopped");
        })
    }

    async fn handle_close(self: &Arc<Self>, generation: u64, reason: CloseReason) {
        {
            let mut state = self.state.write().await;
            if state.shut_down || state.disconnected || state.generation != generation {
                debug!(generation, "Ignoring a close notification for a stale connection");
                return;
            }
            error!(
                generation,
                reply_code = ?reason.reply_code,
                reason = %reason.message,
                "RabbitMq connection closed"
            );
            state.disconnected = true;
            state.connection = None;
            if let Some(pool) = state.pool.take() {
                pool.close();
            }
        }
        self.status.send_replace(ConnectionStatus {
            state: ConnectionState::Disconnected,
            generation,
        });

        if self.settings.reconnect.should_reconnect(reason.reply_code) {
            self.reconnect().await;
        } else {
            warn!(
                reply_code = ?reason.reply_code,
                "Close reason does not warrant a reconnect, staying disconnected"
            );
        }
    }

    /// Dial until a connection sticks or the manager shuts down.
    ///
    /// An exhausted round is logged and followed by another one: a long-running process must
    /// survive a broker outage.
    ///
    /// Only one loop runs at a time. A caller that had to wait for another loop returns as soon
    /// as that loop installed a connection.
    pub(crate) async fn reconnect(self: &Arc<Self>) {
        let signal = self.shutdown.wait_for_signal();
        tokio::pin!(signal);
        let _reconnecting = tokio::select! {
            biased;
            _ = &mut signal => return,
            guard = self.reconnecting.lock() => guard,
        };
        if self.status().await.state == ConnectionState::Connected {
            debug!("Already reconnected by another caller");
            return;
        }
        let mut round: u64 = 0;
        loop {
            round += 1;
            let dialed = tokio::select! {
                biased;
                _ = &mut signal => return,
                dialed = self.dial_with_retries() => dialed,
            };
            match dialed {
                Ok(connection) => {
                    info!(round, "Reconnected to RabbitMq");
                    self.install(connection).await;
                    return;
                }
                Err(e) => {
                    error!(round, error = %e, "Reconnection round failed, retrying");
                    tokio::select! {
                        biased;
                        _ = &mut signal => return,
                        _ = tokio::time::sleep(self.settings.connect_delay()) => {}
                    }
                }
            }
        }
    }

    /// Wait for a usable connection, checking `disconnect_wait_attempts` more times,
    /// `disconnect_wait` apart, while the manager is disconnected.
    async fn wait_for_connection(&self) -> Result<Snapshot<D>, Error> {
        let attempts = self.settings.disconnect_wait_attempts;
        let mut waited = 0;
        loop {
            {
                let state = self.state.read().await;
                if state.shut_down {
                    return Err(Error::Shutdown);
                }
                if let (Some(connection), false) = (&state.connection, state.disconnected) {
                    return Ok(Snapshot {
                        connection: Arc::clone(connection),
                        generation: state.generation,
                        pool: state.pool.clone(),
                    });
                }
            }
            if waited >= attempts {
                error!(attempts, "RabbitMq is still disconnected, giving up");
                return Err(Error::Disconnected { attempts });
            }
            waited += 1;
            warn!(
                attempt = waited,
                attempts, "RabbitMq is disconnected, waiting for the connection to come back"
            );
            tokio::select! {
                biased;
                _ = self.shutdown.wait_for_signal() => return Err(Error::Shutdown),
                _ = tokio::time::sleep(self.settings.disconnect_wait()) => {}
            }
        }
    }

    /// Open a channel on the current connection.
    pub(crate) async fn open_channel(&self) -> Result<LinkedChannel<ChannelOf<D>>, Error> {
        let snapshot = self.wait_for_connection().await?;
        let raw = snapshot.connection.create_channel().await?;
        Ok(LinkedChannel {
            raw,
            generation: snapshot.generation,
        })
    }

    /// Borrow a channel: from the pool when it can serve one within the pool wait window,
    /// straight from the connection otherwise.
    pub(crate) async fn acquire(self: &Arc<Self>) -> Result<PooledChannel<D>, Error> {
        let timeouts = Timeouts {
            wait: Some(self.settings.pool_wait()),
            create: None,
            recycle: None,
        };
        let mut refreshes = 0;
        let snapshot = loop {
            let snapshot = self.wait_for_connection().await?;
            let pool = match snapshot.pool.clone() {
                Some(pool) => pool,
                None => break snapshot,
            };
            match pool.timeout_get(&timeouts).await {
                Ok(object) => return Ok(PooledChannel::pooled(object, Arc::downgrade(self))),
                Err(PoolError::Timeout(_)) => {
                    debug!("Channel pool exhausted, opening a detached channel");
                    break snapshot;
                }
                Err(PoolError::Closed) if refreshes < MAX_POOL_REFRESHES => {
                    debug!("Channel pool was replaced by a reconnect, trying the new one");
                    refreshes += 1;
                }
                Err(PoolError::Closed) => break snapshot,
                Err(e) => return Err(e.into()),
            }
        };

        let raw = snapshot.connection.create_channel().await?;
        Ok(PooledChannel::detached(
            LinkedChannel {
                raw,
                generation: snapshot.generation,
            },
            Arc::downgrade(self),
        ))
    }

    /// `true` if `generation` is the live connection.
    pub(crate) async fn is_current(&self, generation: u64) -> bool {
        let state = self.state.read().await;
        !state.shut_down && !state.disconnected && state.generation == generation
    }

    pub(crate) async fn status(&self) -> ConnectionStatus {
        let state = self.state.read().await;
        ConnectionStatus {
            state: if state.disconnected {
                ConnectionState::Disconnected
            } else {
                ConnectionState::Connected
            },
            generation: state.generation,
        }
    }

    pub(crate) fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub(crate) async fn pool_status(&self) -> Option<PoolStatus> {
        let state = self.state.read().await;
        state.pool.as_ref().map(|pool| {
            let status = pool.status();
            PoolStatus {
                max_size: status.max_size,
                size: status.size,
            }
        })
    }

    /// Stop the watcher and every subscription, then close the pool and the connection.
    pub(crate) async fn shutdown(&self) {
        self.shutdown.shutdown();
        let (connection, generation) = {
            let mut state = self.state.write().await;
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state.disconnected = true;
            if let Some(pool) = state.pool.take() {
                pool.close();
            }
            (state.connection.take(), state.generation)
        };
        self.status.send_replace(ConnectionStatus {
            state: ConnectionState::Disconnected,
            generation,
        });

        if let Some(watcher) = self.watcher.lock().await.take() {
            if let Err(e) = watcher.await {
                warn!(error = %e, "RabbitMq connection watcher panicked");
            }
        }
        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                debug!(error = %e, "Failed to close the RabbitMq connection");
            }
        }
        info!("RabbitMq connection manager shut down");
    }
}

impl<D: Dial> Drop for Link<D> {
    fn drop(&mut self) {
        // Stops the subscriptions that outlived every manager handle.
        self.shutdown.shutdown();
    }
}
