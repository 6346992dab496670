//! Per-call framed session.
//!
//! One session owns one UDP listening port, one downstream TCP connection,
//! and the tasks between them:
//!
//! - the UDP task reassembles RTP payloads into 640-byte AUDIO frames,
//! - the writer task eagerly connects TCP, writes START, then drains the
//!   frame channel (which doubles as the pre-connect queue), and finally
//!   writes END,
//! - the watchdog closes the session when RTP stops arriving.
//!
//! All terminal causes funnel into [`super::FramedGateway::cleanup`], which
//! is idempotent; the END latch inside the session absorbs overlapping
//! signals.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::FramedGateway;
use super::codec::{self, FRAME_BYTES, StartInfo};
use crate::rtp;
use crate::wav::WavDump;

/// Frames buffered while the TCP connect is still in flight. At 20 ms per
/// frame this holds well over 10 s of audio.
const FRAME_QUEUE: usize = 1024;

/// Registration metadata supplied by the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub call_uuid: String,
    pub agent_extension: String,
    pub agent_username: String,
    pub agent_id: String,
}

impl Registration {
    fn start_info(&self) -> StartInfo {
        StartInfo {
            call_uuid: self.call_uuid.clone(),
            agent_extension: self.agent_extension.clone(),
            agent_username: self.agent_username.clone(),
            agent_id: self.agent_id.clone(),
        }
    }
}

pub(crate) struct FramedSession {
    pub(crate) port: u16,
    pub(crate) call_uuid: String,
    audio_tx: mpsc::Sender<Bytes>,
    end_tx: Mutex<Option<oneshot::Sender<&'static str>>>,
    /// Stops the UDP and watchdog tasks. A watch channel cannot lose the
    /// signal even when a task is mid-iteration when it fires.
    shutdown_tx: watch::Sender<bool>,
    /// Set once END has been sent or scheduled; no AUDIO may follow.
    ended: AtomicBool,
    connected: AtomicBool,
    last_rtp: Mutex<Instant>,
}

impl FramedSession {
    /// Start all tasks for a freshly bound port and insert the session into
    /// the gateway's table. The TCP connect starts immediately.
    pub(crate) async fn spawn(
        gateway: &Arc<FramedGateway>,
        socket: UdpSocket,
        port: u16,
        registration: Registration,
    ) {
        let (audio_tx, audio_rx) = mpsc::channel::<Bytes>(FRAME_QUEUE);
        let (end_tx, end_rx) = oneshot::channel::<&'static str>();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let session = Arc::new(FramedSession {
            port,
            call_uuid: registration.call_uuid.clone(),
            audio_tx,
            end_tx: Mutex::new(Some(end_tx)),
            shutdown_tx,
            ended: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            last_rtp: Mutex::new(Instant::now()),
        });

        // Insert before any task runs: a task failing instantly must find
        // the session in the table for its cleanup to take effect.
        gateway.sessions.lock().insert(port, session.clone());
        gateway.metrics().sessions_active.inc();

        tokio::spawn(writer_task(
            gateway.clone(),
            session.clone(),
            registration,
            audio_rx,
            end_rx,
        ));
        tokio::spawn(udp_task(
            gateway.clone(),
            session.clone(),
            socket,
            shutdown_rx.clone(),
        ));
        tokio::spawn(watchdog_task(gateway.clone(), session, shutdown_rx));
    }

    /// Schedule END and stop the session tasks. First caller wins; later
    /// calls are no-ops.
    pub(crate) fn end(&self, reason: &'static str) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(port = self.port, call = %self.call_uuid, reason, "framed session ending");
        let _ = self.shutdown_tx.send(true);
        if let Some(tx) = self.end_tx.lock().take() {
            let _ = tx.send(reason);
        }
    }

    fn touch(&self) {
        *self.last_rtp.lock() = Instant::now();
    }
}

/// Eagerly connect downstream, then write START, queued and live AUDIO, END.
async fn writer_task(
    gateway: Arc<FramedGateway>,
    session: Arc<FramedSession>,
    registration: Registration,
    mut audio_rx: mpsc::Receiver<Bytes>,
    mut end_rx: oneshot::Receiver<&'static str>,
) {
    let addr = gateway.config().downstream_addr();
    let mut stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(port = session.port, %addr, "downstream connect failed: {e}");
            gateway.cleanup(session.port, "downstream connect failed");
            return;
        }
    };

    session.connected.store(true, Ordering::Release);
    debug!(port = session.port, %addr, "downstream connected");

    let mut reason = "downstream closed";
    let start = codec::start_frame(&registration.start_info());
    if stream.write_all(&start).await.is_err() {
        warn!(port = session.port, "failed to write START");
        gateway.cleanup(session.port, "downstream write failed");
        return;
    }

    loop {
        tokio::select! {
            maybe_frame = audio_rx.recv() => match maybe_frame {
                Some(frame) => {
                    if let Err(e) = stream.write_all(&frame).await {
                        warn!(port = session.port, "downstream write failed: {e}");
                        reason = "downstream write failed";
                        break;
                    }
                    gateway.metrics().frames_sent.inc();
                }
                None => {
                    reason = "session dropped";
                    break;
                }
            },
            end = &mut end_rx => {
                reason = end.unwrap_or("session dropped");
                // Frames queued before the end signal still belong to the
                // stream; the ended latch guarantees no new ones arrive.
                while let Ok(frame) = audio_rx.try_recv() {
                    if stream.write_all(&frame).await.is_err() {
                        break;
                    }
                    gateway.metrics().frames_sent.inc();
                }
                break;
            }
        }
    }

    // END exactly once, then close. The ended latch is already set when the
    // end signal fired; set it here for the write-failure paths too.
    session.ended.store(true, Ordering::Release);
    if let Err(e) = stream.write_all(&codec::end_frame()).await {
        debug!(port = session.port, "END not delivered: {e}");
    }
    let _ = stream.shutdown().await;
    gateway.metrics().sessions_ended.inc();
    gateway.cleanup(session.port, reason);
}

/// Receive RTP, reassemble into fixed-size AUDIO frames.
async fn udp_task(
    gateway: Arc<FramedGateway>,
    session: Arc<FramedSession>,
    socket: UdpSocket,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut datagram = [0u8; 4096];
    let mut pending = BytesMut::new();
    let mut dump = if gateway.config().dump_enabled {
        WavDump::create(&gateway.config().dump_dir, &session.call_uuid)
    } else {
        None
    };

    loop {
        tokio::select! {
            received = socket.recv_from(&mut datagram) => {
                let len = match received {
                    Ok((len, _peer)) => len,
                    Err(e) => {
                        warn!(port = session.port, "UDP receive error: {e}");
                        gateway.cleanup(session.port, "udp error");
                        break;
                    }
                };

                let Some(payload) = rtp::payload(&datagram[..len]) else {
                    debug!(port = session.port, "dropping malformed RTP datagram");
                    continue;
                };

                if session.ended.load(Ordering::Acquire) {
                    break;
                }

                session.touch();
                gateway.metrics().rtp_packets.inc();
                gateway.metrics().rtp_bytes.add(payload.len() as u64);
                if let Some(dump) = dump.as_mut() {
                    dump.write(payload);
                }

                pending.extend_from_slice(payload);
                while pending.len() >= FRAME_BYTES {
                    let chunk = pending.split_to(FRAME_BYTES);
                    if session.audio_tx.try_send(codec::audio_frame(&chunk)).is_err() {
                        debug!(port = session.port, "frame queue full, dropping frame");
                    }
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }

    if let Some(mut dump) = dump {
        dump.finish();
    }
}

/// Close the session when RTP stops arriving on a connected session.
async fn watchdog_task(
    gateway: Arc<FramedGateway>,
    session: Arc<FramedSession>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(super::WATCHDOG_PERIOD);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if session.ended.load(Ordering::Acquire) {
                    break;
                }
                if !session.connected.load(Ordering::Acquire) {
                    continue;
                }
                let idle = session.last_rtp.lock().elapsed();
                if idle > gateway.config().inactivity {
                    info!(
                        port = session.port,
                        idle_secs = idle.as_secs(),
                        "no RTP activity, closing framed session"
                    );
                    gateway.metrics().inactivity_closes.inc();
                    gateway.cleanup(session.port, "inactivity");
                    break;
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }
}
