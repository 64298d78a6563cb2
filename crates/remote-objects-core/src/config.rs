//! Deadlines for the handshake, call and close phases of a session.

use std::time::Duration;

/// Time allowed for the transport to open.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Time allowed between open and a resolved control envelope.
pub const RECEIVE_CONTROL_TIMEOUT: Duration = Duration::from_secs(3);
/// Time allowed for the transport to confirm a close request.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
/// Time allowed for the server to acknowledge a call.
pub const CALL_ACK_TIMEOUT: Duration = Duration::from_secs(3);
/// Time allowed for an acknowledged call to produce a result.
///
/// Calls can drive long-running operations on the server.
pub const CALL_RESULT_TIMEOUT: Duration = Duration::from_secs(240);

/// Session configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Deadline for the transport `open` event.
    pub handshake_timeout: Duration,
    /// Deadline for the first control envelope to be resolved.
    pub control_timeout: Duration,
    /// Deadline for `close()` to observe the transport closing.
    pub close_timeout: Duration,
    /// Deadline for a call acknowledgment.
    pub ack_timeout: Duration,
    /// Deadline for a call result, armed when the acknowledgment arrives.
    pub result_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionConfig {
    /// Create a configuration with the default deadlines.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            handshake_timeout: HANDSHAKE_TIMEOUT,
            control_timeout: RECEIVE_CONTROL_TIMEOUT,
            close_timeout: CLOSE_TIMEOUT,
            ack_timeout: CALL_ACK_TIMEOUT,
            result_timeout: CALL_RESULT_TIMEOUT,
        }
    }

    /// Set the handshake deadline.
    #[must_use]
    pub const fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the control envelope deadline.
    #[must_use]
    pub const fn with_control_timeout(mut self, timeout: Duration) -> Self {
        self.control_timeout = timeout;
        self
    }

    /// Set the close deadline.
    #[must_use]
    pub const fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Set the acknowledgment deadline.
    #[must_use]
    pub const fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Set the result deadline.
    #[must_use]
    pub const fn with_result_timeout(mut self, timeout: Duration) -> Self {
        self.result_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.control_timeout, Duration::from_secs(3));
        assert_eq!(config.close_timeout, Duration::from_secs(1));
        assert_eq!(config.ack_timeout, Duration::from_secs(3));
        assert_eq!(config.result_timeout, Duration::from_secs(240));
    }

    #[test]
    fn test_setters_only_touch_their_field() {
        let config = SessionConfig::new().with_ack_timeout(Duration::from_millis(50));
        assert_eq!(config.ack_timeout, Duration::from_millis(50));
        assert_eq!(config.result_timeout, CALL_RESULT_TIMEOUT);
    }
}
