//! Gateway error types.

use thiserror::Error;

/// Errors raised by the orchestrator and the media gateways.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Missing or unparsable configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Every port in the configured RTP range is allocated
    #[error("no free RTP port in range {0}-{1}")]
    PortRangeExhausted(u16, u16),

    /// The requested UDP port already belongs to a live session
    #[error("port {0} is already registered")]
    PortInUse(u16),

    /// Socket-level failure (bind, send, receive)
    #[error("socket error: {0}")]
    Socket(String),

    /// The framed downstream TCP peer failed
    #[error("downstream connection error: {0}")]
    Downstream(String),

    /// The upstream streaming socket failed
    #[error("upstream streaming error: {0}")]
    Upstream(String),

    /// HTTP signaling between components failed
    #[error("signaling error: {0}")]
    Signaling(String),

    /// A PBX control-plane operation failed
    #[error("control-plane error: {0}")]
    ControlPlane(String),

    /// The session has already emitted END; no further writes are allowed
    #[error("session already ended")]
    SessionEnded,
}

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        GatewayError::Socket(e.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        GatewayError::Signaling(e.to_string())
    }
}
