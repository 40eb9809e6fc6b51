//! Timeout configuration shared by every connection

use crate::error::{CoreError, CoreResult};
use std::time::Duration;

/// Upper bound accepted for any timing knob
pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Timing knobs of a single connection.
///
/// Every connection created by one manager shares the same setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutSetting {
    /// Silence on the receive side after which the connection is dropped
    pub connection_timeout: Duration,
    /// Handshake retry period, and idle period before a heartbeat is sent
    pub connection_retry_interval: Duration,
    /// Retransmission period of unacknowledged reliable datagrams
    pub imp_retry_interval: Duration,
    /// How long an acknowledged reliability id is remembered for duplicate suppression
    pub reply_keep_duration: Duration,
}

impl Default for TimeoutSetting {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            connection_retry_interval: Duration::from_millis(500),
            imp_retry_interval: Duration::from_millis(100),
            reply_keep_duration: Duration::from_secs(5),
        }
    }
}

impl TimeoutSetting {
    /// Low-latency networks: quick retries, short silence tolerance
    pub fn lan() -> Self {
        Self {
            connection_timeout: Duration::from_secs(3),
            connection_retry_interval: Duration::from_millis(100),
            imp_retry_interval: Duration::from_millis(30),
            reply_keep_duration: Duration::from_secs(2),
        }
    }

    /// High-latency or lossy links
    pub fn relaxed() -> Self {
        Self {
            connection_timeout: Duration::from_secs(30),
            connection_retry_interval: Duration::from_secs(1),
            imp_retry_interval: Duration::from_millis(300),
            reply_keep_duration: Duration::from_secs(15),
        }
    }

    pub fn custom(
        connection_timeout: Duration,
        connection_retry_interval: Duration,
        imp_retry_interval: Duration,
        reply_keep_duration: Duration,
    ) -> Self {
        Self {
            connection_timeout,
            connection_retry_interval,
            imp_retry_interval,
            reply_keep_duration,
        }
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.connection_timeout.is_zero()
            || self.connection_retry_interval.is_zero()
            || self.imp_retry_interval.is_zero()
            || self.reply_keep_duration.is_zero()
        {
            return Err(CoreError::config("Timeouts must be greater than 0"));
        }
        if self.connection_timeout > MAX_TIMEOUT || self.reply_keep_duration > MAX_TIMEOUT {
            return Err(CoreError::config(format!(
                "Timeouts must not exceed {} seconds",
                MAX_TIMEOUT.as_secs()
            )));
        }
        if self.connection_retry_interval >= self.connection_timeout {
            return Err(CoreError::config(
                "Retry interval must be shorter than the connection timeout",
            ));
        }
        // A duplicate can only be suppressed while its ack is still cached.
        if self.reply_keep_duration < self.imp_retry_interval {
            return Err(CoreError::config(
                "Reply keep duration must cover at least one retransmission interval",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        assert!(TimeoutSetting::default().validate().is_ok());
        assert!(TimeoutSetting::lan().validate().is_ok());
        assert!(TimeoutSetting::relaxed().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_and_inverted_intervals() {
        let mut setting = TimeoutSetting::default();
        setting.imp_retry_interval = Duration::ZERO;
        assert!(setting.validate().is_err());

        let setting = TimeoutSetting::custom(
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(10),
            Duration::from_millis(50),
        );
        assert!(setting.validate().is_err());

        let setting = TimeoutSetting::custom(
            Duration::from_secs(1),
            Duration::from_millis(100),
            Duration::from_millis(50),
            Duration::from_millis(10),
        );
        assert!(matches!(setting.validate(), Err(CoreError::Config { .. })));
    }

    #[test]
    fn test_rejects_unbounded_timeouts() {
        let mut setting = TimeoutSetting::default();
        setting.reply_keep_duration = Duration::MAX;
        assert!(setting.validate().is_err());

        let setting = TimeoutSetting::custom(
            Duration::MAX,
            Duration::from_millis(500),
            Duration::from_millis(100),
            Duration::from_secs(5),
        );
        assert!(setting.validate().is_err());

        let at_cap = TimeoutSetting::custom(
            MAX_TIMEOUT,
            Duration::from_secs(1),
            Duration::from_millis(100),
            MAX_TIMEOUT,
        );
        assert!(at_cap.validate().is_ok());
    }
}
