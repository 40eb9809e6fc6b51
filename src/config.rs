//! Configuration types for the connection manager

use crate::error::{LiteError, Result};
use liteconn_core::{Header, TimeoutSetting, CONVERSATION_PREFIX_SIZE, MAX_TIMEOUT};
use std::time::Duration;

/// Largest payload a UDP datagram over IPv4 can carry
pub const MAX_UDP_PAYLOAD: usize = 65507;

/// Connection manager configuration builder
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Number of connection slots
    pub num_connections: usize,
    /// Bound of each connection's delivered-message queue
    pub packet_queue_capacity: usize,
    /// Largest datagram sent or accepted, header included
    pub max_datagram_size: usize,
    /// Period of the maintenance loop
    pub update_interval: Duration,
    /// Queue inbound handshakes from the start
    pub listening: bool,
    /// Bound of the connection request queue
    pub max_pending_connections: usize,
    /// Timing shared by every connection of the manager
    pub timeouts: TimeoutSetting,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            num_connections: 16,
            packet_queue_capacity: 256,
            max_datagram_size: 1400,
            update_interval: Duration::from_millis(10),
            listening: false,
            max_pending_connections: 64,
            timeouts: TimeoutSetting::default(),
        }
    }
}

impl ManagerConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of connection slots
    pub fn num_connections(mut self, n: usize) -> Self {
        self.num_connections = n;
        self
    }

    /// Set the per-connection delivered-queue bound
    pub fn packet_queue_capacity(mut self, capacity: usize) -> Self {
        self.packet_queue_capacity = capacity;
        self
    }

    /// Set the maximum datagram size
    pub fn max_datagram_size(mut self, size: usize) -> Self {
        self.max_datagram_size = size;
        self
    }

    /// Set the maintenance tick period
    pub fn update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    /// Start in listening mode
    pub fn listening(mut self, enabled: bool) -> Self {
        self.listening = enabled;
        self
    }

    /// Set the connection request queue bound
    pub fn max_pending_connections(mut self, n: usize) -> Self {
        self.max_pending_connections = n;
        self
    }

    /// Replace all timeouts at once
    pub fn timeouts(mut self, timeouts: TimeoutSetting) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set connection timeout
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connection_timeout = timeout;
        self
    }

    /// Set handshake retry and heartbeat interval
    pub fn connection_retry_interval(mut self, interval: Duration) -> Self {
        self.timeouts.connection_retry_interval = interval;
        self
    }

    /// Set reliable retransmission interval
    pub fn imp_retry_interval(mut self, interval: Duration) -> Self {
        self.timeouts.imp_retry_interval = interval;
        self
    }

    /// Set how long acknowledged reliability ids are remembered
    pub fn reply_keep_duration(mut self, duration: Duration) -> Self {
        self.timeouts.reply_keep_duration = duration;
        self
    }

    /// Largest application payload that fits in one datagram
    pub fn max_payload_size(&self) -> usize {
        self.max_datagram_size.saturating_sub(Header::SIZE)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.num_connections == 0 {
            return Err(LiteError::config("Connection slot count must be greater than 0"));
        }

        if self.packet_queue_capacity == 0 {
            return Err(LiteError::config("Packet queue capacity must be greater than 0"));
        }

        if self.max_pending_connections == 0 {
            return Err(LiteError::config(
                "Pending connection queue bound must be greater than 0",
            ));
        }

        // A conversation reply needs room for the header and the nested id.
        if self.max_datagram_size <= Header::SIZE + CONVERSATION_PREFIX_SIZE
            || self.max_datagram_size > MAX_UDP_PAYLOAD
        {
            return Err(LiteError::config(format!(
                "Max datagram size must be between {} and {}",
                Header::SIZE + CONVERSATION_PREFIX_SIZE + 1,
                MAX_UDP_PAYLOAD
            )));
        }

        if self.update_interval.is_zero() || self.update_interval > MAX_TIMEOUT {
            return Err(LiteError::config(format!(
                "Update interval must be between 0 and {} seconds",
                MAX_TIMEOUT.as_secs()
            )));
        }

        self.timeouts.validate()?;
        Ok(())
    }
}

/// Preset configurations for common use cases
impl ManagerConfig {
    /// Listening endpoint with room for many peers
    pub fn server() -> Self {
        Self::default().listening(true).num_connections(64)
    }

    /// Outbound-only endpoint with a handful of slots
    pub fn client() -> Self {
        Self::default().listening(false).num_connections(4)
    }

    /// Short timeouts and a fast tick, for tests over an in-memory network
    pub fn testing() -> Self {
        Self::default()
            .update_interval(Duration::from_millis(2))
            .timeouts(TimeoutSetting::custom(
                Duration::from_secs(2),
                Duration::from_millis(50),
                Duration::from_millis(20),
                Duration::from_secs(1),
            ))
    }
}
