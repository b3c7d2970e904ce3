/// Errors returned by the connection manager, its channel pool and the topology operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The very first connection to the broker could not be established.
    ///
    /// Nothing works without a broker: callers are expected to terminate the process.
    #[error("Failed to establish the initial connection to the RabbitMq broker after {attempts} attempts")]
    InitialConnection {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },
    #[error("The RabbitMq broker is disconnected, gave up waiting after {attempts} attempts")]
    Disconnected { attempts: u32 },
    #[error("The connection manager has been shut down")]
    Shutdown,
    #[error("Channel pool error: {0}")]
    Pool(String),
    #[error(transparent)]
    Broker(#[from] anyhow::Error),
}

impl Error {
    /// `true` for failures the process cannot recover from.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InitialConnection { .. })
    }
}

impl From<lapin::Error> for Error {
    fn from(err: lapin::Error) -> Self {
        Self::Broker(err.into())
    }
}

impl From<deadpool::managed::PoolError<Error>> for Error {
    fn from(err: deadpool::managed::PoolError<Error>) -> Self {
        match err {
            deadpool::managed::PoolError::Backend(e) => e,
            deadpool::managed::PoolError::Closed => Self::Pool("the channel pool is closed".into()),
            err => Self::Pool(err.to_string()),
        }
    }
}
