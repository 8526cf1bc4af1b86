//! Configuration for the central system
//!
//! Nothing here is read from the environment or disk; callers build the
//! values and pass them in.

use std::time::Duration;

/// OCPP 1.6-J WebSocket subprotocol
pub const OCPP_SUBPROTOCOL: &str = "ocpp1.6";

/// Central system settings
#[derive(Debug, Clone)]
pub struct CentralSystemConfig {
    /// Subprotocol echoed back to stations that offer it
    pub subprotocol: String,

    /// How long an outbound call waits for the charge point's answer
    pub response_timeout: Duration,

    /// Heartbeat interval (seconds) handed out in BootNotification responses
    pub heartbeat_interval: i32,

    /// Largest accepted WebSocket message
    pub max_message_size: usize,

    /// Outbound queue depth per connection
    pub outgoing_capacity: usize,
}

impl Default for CentralSystemConfig {
    fn default() -> Self {
        Self {
            subprotocol: OCPP_SUBPROTOCOL.to_string(),
            response_timeout: Duration::from_secs(30),
            heartbeat_interval: 5,
            max_message_size: 64 * 1024,
            outgoing_capacity: 64,
        }
    }
}

impl CentralSystemConfig {
    /// Set the outbound call timeout
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Set the heartbeat interval returned to booting charge points
    pub fn with_heartbeat_interval(mut self, seconds: i32) -> Self {
        self.heartbeat_interval = seconds;
        self
    }

    /// Set the maximum WebSocket message size
    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }
}

/// Settings for the keyword facade used by test suites
#[derive(Debug, Clone)]
pub struct KeywordsConfig {
    pub central_system: CentralSystemConfig,

    /// Pause after a charge point connects so its start-up traffic settles
    pub settle_delay: Duration,

    /// Default timeout for `wait_for_msg`
    pub wait_timeout: Duration,
}

impl Default for KeywordsConfig {
    fn default() -> Self {
        Self {
            central_system: CentralSystemConfig::default(),
            settle_delay: Duration::from_millis(500),
            wait_timeout: Duration::from_secs(1),
        }
    }
}

impl KeywordsConfig {
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn with_central_system(mut self, config: CentralSystemConfig) -> Self {
        self.central_system = config;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = KeywordsConfig::default()
            .with_settle_delay(Duration::ZERO)
            .with_wait_timeout(Duration::from_millis(250))
            .with_central_system(
                CentralSystemConfig::default()
                    .with_response_timeout(Duration::from_secs(2))
                    .with_heartbeat_interval(60),
            );

        assert_eq!(config.settle_delay, Duration::ZERO);
        assert_eq!(config.wait_timeout, Duration::from_millis(250));
        assert_eq!(config.central_system.response_timeout, Duration::from_secs(2));
        assert_eq!(config.central_system.heartbeat_interval, 60);
        assert_eq!(config.central_system.subprotocol, "ocpp1.6");
    }
}
