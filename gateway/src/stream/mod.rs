//! Streaming gateway.
//!
//! Accepts RTP on two fixed direction-coded UDP ports, keys sessions by
//! synchronization source, binds each new source to a call context announced
//! out-of-band via `/register`, and maintains one upstream streaming
//! connection per source. Transcripts are republished to widget subscribers
//! grouped by room (the agent extension), with optional generative-assistant
//! sampling on top.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::metrics::StreamMetrics;
use crate::rtp;
use crate::shutdown;
use crate::wav::WavDump;

pub mod assist;
mod pending;
pub mod results;
pub mod rooms;
pub mod routes;
mod session;
mod upstream;

pub use session::{CallContext, SgwSession, UNKNOWN_CALL, UNKNOWN_ROOM};
pub use session::{conversation_role, speaker_label};

use assist::AssistState;
use pending::PendingBindings;
use rooms::{Rooms, WidgetEvent, now_millis};

/// How often the inactivity sweeper looks at sessions.
const SWEEP_PERIOD: Duration = Duration::from_secs(2);

/// Media direction, as coded by the two UDP intake ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

impl FromStr for Direction {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" => Ok(Direction::In),
            "out" => Ok(Direction::Out),
            other => Err(GatewayError::Configuration(format!(
                "invalid direction '{other}'"
            ))),
        }
    }
}

/// The streaming gateway: session table, pending bindings, registrations,
/// rooms, and the optional assistant state.
pub struct StreamGateway {
    config: StreamConfig,
    metrics: StreamMetrics,
    sessions: Mutex<HashMap<(Direction, u32), Arc<SgwSession>>>,
    pending: PendingBindings,
    registrations: Mutex<HashMap<String, CallContext>>,
    rooms: Rooms,
    assist: Option<Arc<AssistState>>,
}

impl StreamGateway {
    pub fn new(config: StreamConfig) -> Arc<Self> {
        let pending = PendingBindings::new(config.pending_ttl);
        let assist = config.assist.clone().map(AssistState::new);
        Arc::new(StreamGateway {
            config,
            metrics: StreamMetrics::default(),
            sessions: Mutex::new(HashMap::new()),
            pending,
            registrations: Mutex::new(HashMap::new()),
            rooms: Rooms::default(),
            assist,
        })
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn metrics(&self) -> &StreamMetrics {
        &self.metrics
    }

    pub fn rooms(&self) -> &Rooms {
        &self.rooms
    }

    pub fn assist(&self) -> Option<&Arc<AssistState>> {
        self.assist.as_ref()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn has_session(&self, direction: Direction, ssrc: u32) -> bool {
        self.sessions.lock().contains_key(&(direction, ssrc))
    }

    pub fn session(&self, direction: Direction, ssrc: u32) -> Option<Arc<SgwSession>> {
        self.sessions.lock().get(&(direction, ssrc)).cloned()
    }

    /// The room a call publishes into, resolved from its registration.
    pub fn room_for_call(&self, uuid: &str) -> Option<String> {
        self.registrations
            .lock()
            .get(uuid)
            .map(|ctx| ctx.extension.clone())
    }

    /// Record a `/register`: store the context, enqueue the pending binding
    /// for the direction, and emit `call-start` for a new (or forced) call.
    pub fn register_call(&self, context: CallContext, direction: Direction, force_start: bool) {
        let known = {
            let mut registrations = self.registrations.lock();
            let known = registrations.contains_key(&context.uuid);
            registrations.insert(context.uuid.clone(), context.clone());
            known
        };
        self.pending.push(direction, &context.uuid);

        if !known || force_start {
            let from = speaker_label(self.config.role_mode, Direction::In, &context);
            let to = speaker_label(self.config.role_mode, Direction::Out, &context);
            self.rooms.publish(
                &context.extension,
                &WidgetEvent::CallStart {
                    uuid: context.uuid.clone(),
                    exten: context.extension.clone(),
                    caller: context.caller.clone(),
                    callername: context.caller_name.clone(),
                    from,
                    to,
                    timestamp: now_millis(),
                },
            );
        }
        debug!(call = %context.uuid, dir = direction.as_str(), "call registered");
    }

    /// Record an `/unregister`: drop the registration and any assistant
    /// state, and tell the room the call is over.
    pub fn unregister_call(&self, uuid: &str) {
        let context = self.registrations.lock().remove(uuid);
        if let Some(context) = context {
            self.rooms.publish(
                &context.extension,
                &WidgetEvent::SttEnd {
                    uuid: uuid.to_string(),
                },
            );
        }
        if let Some(assist) = &self.assist {
            assist.remove(uuid);
        }
        info!(call = %uuid, "call unregistered");
    }

    /// Feed one UDP datagram into the gateway.
    pub fn intake(self: &Arc<Self>, direction: Direction, datagram: &[u8]) {
        let Some(ssrc) = rtp::ssrc(datagram) else {
            return;
        };
        let Some(payload) = rtp::payload(datagram) else {
            debug!(dir = direction.as_str(), "dropping malformed RTP datagram");
            return;
        };
        self.metrics.rtp_packets.inc();

        let existing = self.sessions.lock().get(&(direction, ssrc)).cloned();
        let session = match existing {
            Some(session) => session,
            None => match self.admit(direction, ssrc) {
                Some(session) => session,
                None => return,
            },
        };

        session.touch();
        if payload.is_empty() {
            return;
        }

        if let Some(dump) = session.dump.lock().as_mut() {
            dump.write(payload);
        }

        let mut data = payload.to_vec();
        if self.config.byte_swap {
            for pair in data.chunks_exact_mut(2) {
                pair.swap(0, 1);
            }
        }

        if session.audio_tx.try_send(Bytes::from(data)).is_err() {
            self.metrics.boot_frames_dropped.inc();
        }
    }

    /// Create the session for a previously-unknown SSRC: consume the head of
    /// the direction's pending FIFO, or fall back to the unknown binding.
    /// The binding is permanent for the lifetime of the session.
    fn admit(self: &Arc<Self>, direction: Direction, ssrc: u32) -> Option<Arc<SgwSession>> {
        if self.sessions.lock().len() >= self.config.max_sessions {
            self.metrics.dropped_over_capacity.inc();
            return None;
        }

        let context = match self.pending.pop_fresh(direction) {
            Some(uuid) => self
                .registrations
                .lock()
                .get(&uuid)
                .cloned()
                .unwrap_or_else(|| CallContext {
                    uuid: uuid.clone(),
                    ..Default::default()
                }),
            None => {
                self.metrics.unknown_bindings.inc();
                CallContext {
                    uuid: UNKNOWN_CALL.to_string(),
                    extension: UNKNOWN_ROOM.to_string(),
                    ..Default::default()
                }
            }
        };

        let room = context.extension.clone();
        let speaker = speaker_label(self.config.role_mode, direction, &context);
        let (audio_tx, audio_rx) = mpsc::channel::<Bytes>(self.config.boot_frames.max(1));

        let dump = if self.config.dump_enabled {
            WavDump::create(
                &self.config.dump_dir,
                &format!("{}-{}-{ssrc:08x}", context.uuid, direction.as_str()),
            )
        } else {
            None
        };

        info!(
            ssrc = %format_args!("{ssrc:08x}"),
            dir = direction.as_str(),
            call = %context.uuid,
            room = %room,
            "streaming session created"
        );

        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        let session = Arc::new(SgwSession {
            ssrc,
            direction,
            context,
            room,
            speaker,
            audio_tx,
            closing: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            shutdown_tx,
            last_rtp: Mutex::new(Instant::now()),
            dump: Mutex::new(dump),
        });

        {
            // Re-check the cap at insert; the two intake tasks race here.
            let mut sessions = self.sessions.lock();
            if sessions.len() >= self.config.max_sessions {
                self.metrics.dropped_over_capacity.inc();
                return None;
            }
            sessions.insert((direction, ssrc), session.clone());
        }
        self.metrics.sessions_active.inc();
        tokio::spawn(upstream::run(self.clone(), session.clone(), audio_rx));
        Some(session)
    }

    /// Deliberately tear a session down. Idempotent; removal from the table
    /// is the latch. Assistant state follows the call's last session out.
    pub fn remove_session(&self, direction: Direction, ssrc: u32, reason: &'static str) {
        let Some(session) = self.sessions.lock().remove(&(direction, ssrc)) else {
            return;
        };
        self.metrics.sessions_active.dec();
        session.closing.store(true, std::sync::atomic::Ordering::Release);
        let _ = session.shutdown_tx.send(true);
        if let Some(dump) = session.dump.lock().as_mut() {
            dump.finish();
        }
        info!(
            ssrc = %format_args!("{ssrc:08x}"),
            dir = direction.as_str(),
            call = %session.context.uuid,
            reason,
            "streaming session removed"
        );

        if session.is_bound() {
            let last = !self
                .sessions
                .lock()
                .values()
                .any(|s| s.context.uuid == session.context.uuid);
            if last && let Some(assist) = &self.assist {
                assist.remove(&session.context.uuid);
            }
        }
    }

    /// Handle one text message from a session's upstream socket.
    pub fn handle_transcript(&self, session: &Arc<SgwSession>, text: &str) {
        let Some(transcript) = results::Transcript::from_message(text) else {
            return;
        };
        self.metrics.transcripts.inc();

        if transcript.is_final
            && session.is_bound()
            && let Some(assist) = &self.assist
        {
            assist.append(
                &session.context.uuid,
                conversation_role(self.config.role_mode, session.direction),
                &transcript.text,
            );
        }

        self.rooms.publish(
            &session.room,
            &WidgetEvent::Stt {
                text: transcript.text,
                is_final: transcript.is_final,
                words: transcript.words,
                uuid: session.context.uuid.clone(),
                dir: session.direction.as_str().to_string(),
                speaker: session.speaker.clone(),
                exten: session.context.extension.clone(),
                caller: session.context.caller.clone(),
            },
        );
    }

    fn sweep(&self) {
        let expired: Vec<(Direction, u32)> = {
            let sessions = self.sessions.lock();
            sessions
                .iter()
                .filter(|(_, s)| s.last_rtp.lock().elapsed() > self.config.inactivity)
                .map(|(key, _)| *key)
                .collect()
        };
        for (direction, ssrc) in expired {
            self.remove_session(direction, ssrc, "inactivity");
        }
    }

    /// Run the gateway until a shutdown signal arrives.
    pub async fn run(config: StreamConfig) -> GatewayResult<()> {
        let gateway = StreamGateway::new(config);

        let socket_in = UdpSocket::bind(gateway.config.rtp_in).await?;
        let socket_out = UdpSocket::bind(gateway.config.rtp_out).await?;
        info!(
            rtp_in = %gateway.config.rtp_in,
            rtp_out = %gateway.config.rtp_out,
            "streaming gateway RTP intake bound"
        );

        tokio::spawn(intake_loop(gateway.clone(), socket_in, Direction::In));
        tokio::spawn(intake_loop(gateway.clone(), socket_out, Direction::Out));
        tokio::spawn(sweeper(gateway.clone()));
        if let Some(assist) = &gateway.assist {
            tokio::spawn(assist::sampler(gateway.clone(), assist.clone()));
        }

        let app = routes::router(gateway.clone());
        let addr = SocketAddr::from(([0, 0, 0, 0], gateway.config.http_port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "streaming gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown::signal())
            .await
            .map_err(|e| GatewayError::Socket(e.to_string()))?;

        let keys: Vec<(Direction, u32)> = gateway.sessions.lock().keys().copied().collect();
        for (direction, ssrc) in keys {
            gateway.remove_session(direction, ssrc, "shutdown");
        }
        Ok(())
    }
}

async fn intake_loop(gateway: Arc<StreamGateway>, socket: UdpSocket, direction: Direction) {
    let mut datagram = [0u8; 4096];
    loop {
        match socket.recv_from(&mut datagram).await {
            Ok((len, _peer)) => gateway.intake(direction, &datagram[..len]),
            Err(e) => {
                warn!(dir = direction.as_str(), "UDP receive error: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn sweeper(gateway: Arc<StreamGateway>) {
    let mut ticker = tokio::time::interval(SWEEP_PERIOD);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        gateway.sweep();
    }
}
