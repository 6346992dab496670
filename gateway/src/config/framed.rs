//! Framed gateway configuration.

use std::path::PathBuf;
use std::time::Duration;

use super::{dump_dir, flag, parse_or, require};
use crate::error::GatewayResult;

/// Configuration for the framed-TCP gateway.
#[derive(Debug, Clone)]
pub struct FramedConfig {
    /// HTTP port for `/register`, `/unregister` and `/metrics`.
    pub http_port: u16,
    /// Downstream framed-TCP peer.
    pub downstream_host: String,
    pub downstream_port: u16,
    /// Seconds of RTP silence after which a connected session is closed.
    pub inactivity: Duration,
    /// Write the first seconds of each call's PCM to a WAV file.
    pub dump_enabled: bool,
    pub dump_dir: PathBuf,
}

impl FramedConfig {
    pub fn from_env() -> GatewayResult<Self> {
        Ok(FramedConfig {
            http_port: parse_or("FRAMED_HTTP_PORT", 9991)?,
            downstream_host: require("FRAMED_TCP_HOST")?,
            downstream_port: parse_or("FRAMED_TCP_PORT", 9099)?,
            inactivity: Duration::from_secs(parse_or("FRAMED_INACTIVITY_SECS", 8u64)?),
            dump_enabled: flag("FRAMED_DUMP", false),
            dump_dir: dump_dir("FRAMED_DUMP_DIR"),
        })
    }

    /// The downstream peer as `host:port`.
    pub fn downstream_addr(&self) -> String {
        format!("{}:{}", self.downstream_host, self.downstream_port)
    }

    /// A config suitable for tests: loopback downstream, fast inactivity.
    pub fn for_tests(downstream_port: u16, inactivity: Duration) -> Self {
        FramedConfig {
            http_port: 0,
            downstream_host: "127.0.0.1".to_string(),
            downstream_port,
            inactivity,
            dump_enabled: false,
            dump_dir: std::env::temp_dir(),
        }
    }
}
