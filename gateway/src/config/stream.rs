//! Streaming gateway configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use super::{dump_dir, flag, optional, parse_or, require, socket_addr};
use crate::error::{GatewayError, GatewayResult};

/// Which physical direction carries the caller's voice.
///
/// `CallerIn` is the normal deployment: the inbound leg is the caller and the
/// outbound leg is the agent. `AgentIn` inverts the mapping for PBXes that
/// snoop from the agent's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoleMode {
    #[default]
    CallerIn,
    AgentIn,
}

impl FromStr for RoleMode {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "caller-in" | "caller_in" => Ok(RoleMode::CallerIn),
            "agent-in" | "agent_in" => Ok(RoleMode::AgentIn),
            other => Err(GatewayError::Configuration(format!(
                "invalid role mode '{other}' (expected caller-in or agent-in)"
            ))),
        }
    }
}

/// Upstream speech endpoint settings.
#[derive(Debug, Clone)]
pub struct SpeechConfig {
    /// Streaming endpoint base, e.g. `wss://api.deepgram.com/v1/listen`.
    pub url: String,
    /// Bearer-style token sent as `Authorization: Token <key>`.
    pub api_key: String,
    pub language: String,
    pub interim_results: bool,
    pub punctuate: bool,
    pub smart_format: bool,
    pub diarize: bool,
}

impl SpeechConfig {
    /// Build the connection URL with the fixed audio parameters.
    pub fn connection_url(&self) -> String {
        format!(
            "{}?encoding=linear16&sample_rate=16000&language={}&interim_results={}&punctuate={}&smart_format={}&diarize={}",
            self.url.trim_end_matches('/'),
            self.language,
            self.interim_results,
            self.punctuate,
            self.smart_format,
            self.diarize,
        )
    }
}

/// Generative assistant settings; `None` when disabled.
#[derive(Debug, Clone)]
pub struct AssistConfig {
    /// Engine label included in request payloads for the remote side's logs.
    pub engine: String,
    pub url: String,
    /// Raw `Authorization` header value, if the endpoint wants one.
    pub authorization: Option<String>,
    /// Speaker name `assist` events are published under.
    pub speaker: String,
    /// Sampling period.
    pub interval: Duration,
    /// Trailing character window applied to the conversation payload.
    pub tail_chars: usize,
    /// Conversations below this size are never sampled.
    pub min_chars: usize,
}

impl AssistConfig {
    fn from_env() -> GatewayResult<Option<Self>> {
        if !flag("ASSIST_ENABLED", false) {
            return Ok(None);
        }
        Ok(Some(AssistConfig {
            engine: optional("ASSIST_ENGINE").unwrap_or_else(|| "default".to_string()),
            url: require("ASSIST_URL")?,
            authorization: optional("ASSIST_AUTHORIZATION"),
            speaker: optional("ASSIST_SPEAKER").unwrap_or_else(|| "Assistant".to_string()),
            interval: Duration::from_secs(parse_or("ASSIST_INTERVAL_SECS", 10u64)?),
            tail_chars: parse_or("ASSIST_TAIL_CHARS", 4000usize)?,
            min_chars: parse_or("ASSIST_MIN_CHARS", 80usize)?,
        }))
    }
}

/// Configuration for the streaming gateway.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// HTTP port for control endpoints and the widget socket.
    pub http_port: u16,
    /// UDP bind address for the inbound direction.
    pub rtp_in: SocketAddr,
    /// UDP bind address for the outbound direction.
    pub rtp_out: SocketAddr,
    pub speech: SpeechConfig,
    /// Swap PCM byte order before writing upstream.
    pub byte_swap: bool,
    /// Hard cap on concurrent sessions; new SSRCs beyond it are dropped.
    pub max_sessions: usize,
    /// Seconds of RTP silence after which a session is torn down.
    pub inactivity: Duration,
    /// Age beyond which a pending binding is invisible.
    pub pending_ttl: Duration,
    /// Payloads buffered while the upstream socket is still opening.
    pub boot_frames: usize,
    pub role_mode: RoleMode,
    pub dump_enabled: bool,
    pub dump_dir: PathBuf,
    pub assist: Option<AssistConfig>,
}

impl StreamConfig {
    pub fn from_env() -> GatewayResult<Self> {
        Ok(StreamConfig {
            http_port: parse_or("STREAM_HTTP_PORT", 9992)?,
            rtp_in: socket_addr("STREAM_RTP_IN_BIND", "0.0.0.0:5004")?,
            rtp_out: socket_addr("STREAM_RTP_OUT_BIND", "0.0.0.0:5006")?,
            speech: SpeechConfig {
                url: optional("SPEECH_URL")
                    .unwrap_or_else(|| "wss://api.deepgram.com/v1/listen".to_string()),
                api_key: require("SPEECH_API_KEY")?,
                language: optional("SPEECH_LANGUAGE").unwrap_or_else(|| "en".to_string()),
                interim_results: flag("SPEECH_INTERIM_RESULTS", true),
                punctuate: flag("SPEECH_PUNCTUATE", true),
                smart_format: flag("SPEECH_SMART_FORMAT", false),
                diarize: flag("SPEECH_DIARIZE", false),
            },
            byte_swap: flag("STREAM_BYTE_SWAP", false),
            max_sessions: parse_or("STREAM_MAX_SESSIONS", 64usize)?,
            inactivity: Duration::from_secs(parse_or("STREAM_INACTIVITY_SECS", 8u64)?),
            pending_ttl: Duration::from_millis(parse_or("STREAM_PENDING_TTL_MS", 4000u64)?),
            boot_frames: parse_or("STREAM_BOOT_FRAMES", 50usize)?,
            role_mode: optional("STREAM_ROLE_MODE")
                .map(|raw| raw.parse())
                .transpose()?
                .unwrap_or_default(),
            dump_enabled: flag("STREAM_DUMP", false),
            dump_dir: dump_dir("STREAM_DUMP_DIR"),
            assist: AssistConfig::from_env()?,
        })
    }
}
