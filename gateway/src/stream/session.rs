//! Streaming session state and speaker labeling.

use std::sync::atomic::{AtomicBool, AtomicU32};
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::Direction;
use crate::config::RoleMode;
use crate::wav::WavDump;

/// Sentinel call id for sessions whose SSRC arrived before any register.
pub const UNKNOWN_CALL: &str = "unknown";
/// Room used for unbound sessions.
pub const UNKNOWN_ROOM: &str = "mix";

/// Call metadata captured at `/register` time.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub uuid: String,
    pub extension: String,
    pub caller: String,
    pub caller_name: String,
}

/// One upstream streaming session, keyed by `(direction, SSRC)`.
///
/// The binding to a call context is made once, when the session is created,
/// and never changes afterwards.
pub struct SgwSession {
    pub ssrc: u32,
    pub direction: Direction,
    pub context: CallContext,
    /// Room transcripts are published into (the extension, or "mix").
    pub room: String,
    /// Speaker label resolved from the role-mode policy.
    pub speaker: String,

    /// Audio path to the upstream task. The channel's buffer is the boot
    /// buffer: payloads queued while the socket is opening are flushed in
    /// order on OPEN; overflow is dropped.
    pub(crate) audio_tx: mpsc::Sender<Bytes>,
    /// Deliberate teardown flag; suppresses reconnects.
    pub(crate) closing: AtomicBool,
    /// Reconnect attempt counter.
    pub(crate) attempts: AtomicU32,
    /// Wakes the upstream task for teardown; a watch channel cannot lose
    /// the signal.
    pub(crate) shutdown_tx: watch::Sender<bool>,
    pub(crate) last_rtp: Mutex<Instant>,
    pub(crate) dump: Mutex<Option<WavDump>>,
}

impl SgwSession {
    pub(crate) fn touch(&self) {
        *self.last_rtp.lock() = Instant::now();
    }

    /// Whether this session was bound to a real call.
    pub fn is_bound(&self) -> bool {
        self.context.uuid != UNKNOWN_CALL
    }
}

/// Resolve the speaker label for a direction under a role mode.
///
/// The caller side resolves caller-name, then caller, then "Caller"; the
/// agent side resolves the extension, then "Agent".
pub fn speaker_label(mode: RoleMode, direction: Direction, context: &CallContext) -> String {
    if caller_side(mode, direction) {
        caller_label(context)
    } else {
        agent_label(context)
    }
}

/// Conversation role for a direction under a role mode: the caller side is
/// "user", the agent side is "agent".
pub fn conversation_role(mode: RoleMode, direction: Direction) -> super::assist::Role {
    if caller_side(mode, direction) {
        super::assist::Role::User
    } else {
        super::assist::Role::Agent
    }
}

fn caller_side(mode: RoleMode, direction: Direction) -> bool {
    match mode {
        RoleMode::CallerIn => direction == Direction::In,
        RoleMode::AgentIn => direction == Direction::Out,
    }
}

pub(crate) fn caller_label(context: &CallContext) -> String {
    if !context.caller_name.is_empty() {
        context.caller_name.clone()
    } else if !context.caller.is_empty() {
        context.caller.clone()
    } else {
        "Caller".to_string()
    }
}

pub(crate) fn agent_label(context: &CallContext) -> String {
    if !context.extension.is_empty() {
        context.extension.clone()
    } else {
        "Agent".to_string()
    }
}
