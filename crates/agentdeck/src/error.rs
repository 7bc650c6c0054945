//! Gateway client error types.

use std::time::Duration;

use thiserror::Error;

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors that can occur while talking to the agent gateway or the
/// capture multiplexer.
///
/// Connection-level failures drive the reconnect state machine and are
/// never fatal to the process. Request-level failures are returned to
/// the specific caller only.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Transport dropped before the operation completed.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The gateway rejected our challenge signature, or the handshake
    /// did not complete in time.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// No response within the request deadline. The request may still
    /// have executed gateway-side; callers must treat the operation as
    /// ambiguous unless it is read-only.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The gateway replied with an explicit error payload.
    #[error("gateway error: {message} (code: {code})")]
    Remote { code: String, message: String },

    /// A response arrived for a request id we are not tracking.
    /// Logged and dropped, never fatal.
    #[error("response for unknown request id {0}")]
    UnknownCorrelation(u64),

    /// The external terminal multiplexer or the requested pane is missing.
    #[error("capture unavailable: {0}")]
    CaptureUnavailable(String),
}

impl GatewayError {
    /// Whether this error means the upstream link itself is gone (as
    /// opposed to a single request failing).
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost(_) | Self::AuthenticationFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_level_classification() {
        assert!(GatewayError::ConnectionLost("eof".into()).is_connection_level());
        assert!(GatewayError::AuthenticationFailed("bad sig".into()).is_connection_level());
        assert!(!GatewayError::Timeout(Duration::from_secs(30)).is_connection_level());
        assert!(
            !GatewayError::Remote {
                code: "NOT_FOUND".into(),
                message: "no such session".into()
            }
            .is_connection_level()
        );
    }
}
