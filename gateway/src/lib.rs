//! Call-audio tap and media gateway for an Asterisk PBX.
//!
//! Three components share this crate and are selected by CLI subcommand:
//!
//! - [`tap`] — the orchestrator: drives the PBX over ARI to attach snoops,
//!   mixing bridges and external-media channels per call, and signs each
//!   call in at the chosen media gateway.
//! - [`framed`] — the framed-TCP gateway: per-call UDP RTP intake on
//!   dynamically registered ports, fixed-size PCM framing, one downstream
//!   TCP connection per call.
//! - [`stream`] — the streaming gateway: SSRC-keyed RTP intake on two fixed
//!   direction ports, one upstream speech socket per source, transcript
//!   pub/sub to browser widgets, optional generative-assistant sampling.

pub mod config;
pub mod error;
pub mod framed;
pub mod metrics;
pub mod rtp;
pub mod shutdown;
pub mod stream;
pub mod tap;
pub mod wav;

pub use config::{FramedConfig, StreamConfig, TapConfig};
pub use error::{GatewayError, GatewayResult};
