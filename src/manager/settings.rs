//! Knobs controlling pooling, retries and reconnection.
use serde::Deserialize;
use std::time::Duration;

/// Reply codes that make the manager reconnect by default:
/// `320` (CONNECTION_FORCED), `501` (FRAME_ERROR) and `504` (CHANNEL_ERROR).
pub const DEFAULT_RECONNECT_REPLY_CODES: [u16; 3] = [320, 501, 504];

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
/// Tuning for a [`ConnectionManager`](crate::ConnectionManager).
///
/// Every field has a default, so a partial configuration file is enough.
pub struct ManagerSettings {
    /// Upper bound on the number of pooled channels.
    pub pool_size: usize,
    /// How long `acquire` waits for a pooled channel to be released when the pool is at
    /// capacity, before opening a detached channel instead.
    pub pool_wait_millis: u64,
    /// Dial attempts per connection round.
    pub connect_attempts: u32,
    pub connect_delay_seconds: u64,
    /// How many times channel creation re-checks a disconnected manager before giving up.
    pub disconnect_wait_attempts: u32,
    pub disconnect_wait_seconds: u64,
    /// Retries after the first failed publish attempt.
    pub publish_retries: u32,
    pub publish_retry_delay_seconds: u64,
    pub reconnect: ReconnectPolicy,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            pool_size: 100,
            pool_wait_millis: 1000,
            connect_attempts: 5,
            connect_delay_seconds: 3,
            disconnect_wait_attempts: 10,
            disconnect_wait_seconds: 3,
            publish_retries: 3,
            publish_retry_delay_seconds: 2,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ManagerSettings {
    pub fn pool_wait(&self) -> Duration {
        Duration::from_millis(self.pool_wait_millis)
    }

    pub fn connect_delay(&self) -> Duration {
        Duration::from_secs(self.connect_delay_seconds)
    }

    pub fn disconnect_wait(&self) -> Duration {
        Duration::from_secs(self.disconnect_wait_seconds)
    }

    pub fn publish_retry_delay(&self) -> Duration {
        Duration::from_secs(self.publish_retry_delay_seconds)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
/// Decides which connection closures are worth reconnecting after.
pub struct ReconnectPolicy {
    /// AMQP reply codes that trigger a reconnect.
    pub reply_codes: Vec<u16>,
    /// Reconnect after failures that carry no reply code (I/O errors, missed heartbeats).
    pub on_transport_error: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            reply_codes: DEFAULT_RECONNECT_REPLY_CODES.to_vec(),
            on_transport_error: true,
        }
    }
}

impl ReconnectPolicy {
    pub fn should_reconnect(&self, reply_code: Option<u16>) -> bool {
        match reply_code {
            Some(code) => self.reply_codes.contains(&code),
            None => self.on_transport_error,
        }
    }
}
