//! Binary framing for the downstream TCP protocol.
//!
//! Every message is `[TYPE:1][LENGTH:2 big-endian][PAYLOAD:LENGTH]`. A
//! connection carries exactly one START, zero or more AUDIO frames, and
//! exactly one END, in that order.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

/// END: empty payload, closes the stream.
pub const TYPE_END: u8 = 0x00;
/// START: UTF-8 JSON call metadata.
pub const TYPE_START: u8 = 0x01;
/// AUDIO: exactly [`FRAME_BYTES`] bytes of PCM.
pub const TYPE_AUDIO: u8 = 0x12;

/// 320 samples x 2 bytes at 16 kHz = 20 ms of audio.
pub const FRAME_BYTES: usize = 640;

/// START payload. Absent agent fields serialize as empty strings.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StartInfo {
    pub call_uuid: String,
    pub agent_extension: String,
    pub agent_username: String,
    pub agent_id: String,
}

/// Encode one frame.
pub fn frame(frame_type: u8, payload: &[u8]) -> Bytes {
    debug_assert!(payload.len() <= u16::MAX as usize);
    let mut buf = BytesMut::with_capacity(3 + payload.len());
    buf.put_u8(frame_type);
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    buf.freeze()
}

/// The START frame for a session.
pub fn start_frame(info: &StartInfo) -> Bytes {
    // StartInfo has no non-serializable fields, so this cannot fail.
    let payload = serde_json::to_vec(info).unwrap_or_default();
    frame(TYPE_START, &payload)
}

/// An AUDIO frame; `pcm` must be exactly [`FRAME_BYTES`] long.
pub fn audio_frame(pcm: &[u8]) -> Bytes {
    debug_assert_eq!(pcm.len(), FRAME_BYTES);
    frame(TYPE_AUDIO, pcm)
}

/// The END frame.
pub fn end_frame() -> Bytes {
    frame(TYPE_END, &[])
}
