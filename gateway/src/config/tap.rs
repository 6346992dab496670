//! Orchestrator configuration.

use ari_client::EventEndpoint;

use super::{events_endpoint, flag, optional, parse_or, require};
use crate::error::GatewayResult;

/// Configuration for the tap orchestrator.
#[derive(Debug, Clone)]
pub struct TapConfig {
    /// ARI REST base URL; may already include the path prefix.
    pub ari_url: String,
    pub ari_username: String,
    pub ari_password: String,
    /// Path prefix applied when the base URL does not carry it.
    pub ari_path_prefix: Option<String>,
    /// Event-stream endpoint layout (auto-detected from the base by default).
    pub ari_events_endpoint: EventEndpoint,
    /// Stasis application name; only events for this application are handled.
    pub stasis_app: String,

    /// HTTP port for `/start_tap` and `/metrics`.
    pub http_port: u16,

    /// Framed gateway control URL, e.g. `http://127.0.0.1:9991`.
    pub framed_control_url: String,
    /// RTP host the PBX should send framed-backend media to.
    pub framed_rtp_host: String,
    /// Inclusive UDP port range drawn from for framed taps.
    pub framed_port_min: u16,
    pub framed_port_max: u16,

    /// Streaming gateway control URL, e.g. `http://127.0.0.1:9992`.
    pub stream_control_url: String,
    /// RTP `host:port` the PBX should send inbound-direction media to.
    pub stream_rtp_in: String,
    /// RTP `host:port` the PBX should send outbound-direction media to.
    pub stream_rtp_out: String,

    /// External-media channels re-enter stasis under this name prefix and
    /// are ignored there.
    pub external_media_prefix: String,
    /// Whether the diagnostic WAV dump is requested from the gateways.
    pub dump_enabled: bool,
}

impl TapConfig {
    pub fn from_env() -> GatewayResult<Self> {
        let config = TapConfig {
            ari_url: require("ARI_URL")?,
            ari_username: require("ARI_USERNAME")?,
            ari_password: require("ARI_PASSWORD")?,
            ari_path_prefix: optional("ARI_PATH_PREFIX"),
            ari_events_endpoint: events_endpoint("ARI_EVENTS_ENDPOINT")?,
            stasis_app: optional("ARI_APP").unwrap_or_else(|| "tapgate".to_string()),
            http_port: parse_or("TAP_HTTP_PORT", 9990)?,
            framed_control_url: optional("FRAMED_CONTROL_URL")
                .unwrap_or_else(|| "http://127.0.0.1:9991".to_string()),
            framed_rtp_host: optional("FRAMED_RTP_HOST")
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            framed_port_min: parse_or("FRAMED_PORT_MIN", 40000)?,
            framed_port_max: parse_or("FRAMED_PORT_MAX", 40999)?,
            stream_control_url: optional("STREAM_CONTROL_URL")
                .unwrap_or_else(|| "http://127.0.0.1:9992".to_string()),
            stream_rtp_in: optional("STREAM_RTP_IN")
                .unwrap_or_else(|| "127.0.0.1:5004".to_string()),
            stream_rtp_out: optional("STREAM_RTP_OUT")
                .unwrap_or_else(|| "127.0.0.1:5006".to_string()),
            external_media_prefix: optional("EXTERNAL_MEDIA_PREFIX")
                .unwrap_or_else(|| "UnicastRTP".to_string()),
            dump_enabled: flag("TAP_DUMP", false),
        };

        if config.framed_port_min > config.framed_port_max {
            return Err(crate::error::GatewayError::Configuration(format!(
                "FRAMED_PORT_MIN ({}) must not exceed FRAMED_PORT_MAX ({})",
                config.framed_port_min, config.framed_port_max
            )));
        }
        Ok(config)
    }
}
