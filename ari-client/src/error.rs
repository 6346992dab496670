//! Error types for the ARI client.

use thiserror::Error;

/// Errors produced by REST calls and the stasis event stream.
#[derive(Debug, Error)]
pub enum AriError {
    /// The configured base URL could not be parsed or normalized
    #[error("invalid ARI base URL: {0}")]
    InvalidUrl(String),

    /// Transport-level failure talking to the PBX
    #[error("ARI transport error: {0}")]
    Transport(String),

    /// The PBX answered with a non-2xx status
    #[error("ARI request failed with status {status}: {body}")]
    Rest { status: u16, body: String },

    /// The stasis event stream failed to connect or died
    #[error("ARI event stream error: {0}")]
    EventStream(String),

    /// A channel could not be resolved by id or name
    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    /// The client behind a handle has been dropped
    #[error("ARI client is gone")]
    ClientGone,
}

/// Result type for ARI operations.
pub type AriResult<T> = Result<T, AriError>;

impl From<reqwest::Error> for AriError {
    fn from(e: reqwest::Error) -> Self {
        AriError::Transport(e.to_string())
    }
}

impl AriError {
    /// Whether this error is the PBX telling us the resource does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, AriError::Rest { status: 404, .. })
            || matches!(self, AriError::ChannelNotFound(_))
    }
}
