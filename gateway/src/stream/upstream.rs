//! Upstream speech socket.
//!
//! One WebSocket per session. While the socket is opening, payloads wait in
//! the session's bounded audio channel (the boot buffer) and are flushed in
//! order on OPEN; anything beyond the buffer is dropped. A close that is not
//! a deliberate teardown is retried with exponential backoff and jitter, but
//! only while the session is still present in the session table.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};
use url::Url;

use super::StreamGateway;
use super::session::SgwSession;
use crate::config::SpeechConfig;
use crate::error::{GatewayError, GatewayResult};

/// Idle keep-alive period on the upstream socket.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(8);

pub(crate) const BACKOFF_BASE_MS: u64 = 500;
pub(crate) const BACKOFF_CAP_MS: u64 = 8_000;
pub(crate) const BACKOFF_JITTER_MS: u64 = 200;

/// Wait before reconnect attempt `attempt` (0-based): `base * 2^attempt`
/// capped, plus up to [`BACKOFF_JITTER_MS`] of jitter.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let exponential = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(16));
    let wait = exponential.min(BACKOFF_CAP_MS);
    let jitter = rand::thread_rng().gen_range(0..=BACKOFF_JITTER_MS);
    Duration::from_millis(wait + jitter)
}

enum Outcome {
    /// Socket died; reconnect if the session still exists.
    Lost,
    /// Teardown was requested; do not reconnect.
    Deliberate,
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(speech: &SpeechConfig) -> GatewayResult<WsStream> {
    let url = speech.connection_url();
    let parsed = Url::parse(&url).map_err(|e| GatewayError::Upstream(e.to_string()))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| GatewayError::Upstream(format!("no host in {url}")))?;
    let host = match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let request = tokio_tungstenite::tungstenite::http::Request::builder()
        .method("GET")
        .uri(&url)
        .header("Host", host)
        .header("Upgrade", "websocket")
        .header("Connection", "upgrade")
        .header("Sec-WebSocket-Key", generate_key())
        .header("Sec-WebSocket-Version", "13")
        .header("Authorization", format!("Token {}", speech.api_key))
        .body(())
        .map_err(|e| GatewayError::Upstream(e.to_string()))?;

    let (stream, _response) = connect_async(request)
        .await
        .map_err(|e| GatewayError::Upstream(e.to_string()))?;
    Ok(stream)
}

/// Session task: connect, stream, reconnect until torn down.
pub(crate) async fn run(
    gateway: Arc<StreamGateway>,
    session: Arc<SgwSession>,
    mut audio_rx: mpsc::Receiver<Bytes>,
) {
    let mut shutdown_rx = session.shutdown_tx.subscribe();
    loop {
        if session.closing.load(Ordering::Acquire) {
            break;
        }

        match connect(&gateway.config().speech).await {
            Ok(stream) => {
                info!(
                    ssrc = %format_args!("{:08x}", session.ssrc),
                    dir = session.direction.as_str(),
                    call = %session.context.uuid,
                    "upstream speech socket open"
                );
                match drive(&gateway, &session, stream, &mut audio_rx, &mut shutdown_rx).await {
                    Outcome::Deliberate => break,
                    Outcome::Lost => {}
                }
            }
            Err(e) => {
                warn!(
                    ssrc = %format_args!("{:08x}", session.ssrc),
                    "upstream connect failed: {e}"
                );
            }
        }

        if session.closing.load(Ordering::Acquire)
            || !gateway.has_session(session.direction, session.ssrc)
        {
            break;
        }

        let attempt = session.attempts.fetch_add(1, Ordering::AcqRel);
        let delay = backoff_delay(attempt);
        gateway.metrics().upstream_reconnects.inc();
        debug!(
            ssrc = %format_args!("{:08x}", session.ssrc),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "reconnecting upstream"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => break,
        }
    }

    debug!(
        ssrc = %format_args!("{:08x}", session.ssrc),
        "upstream task finished"
    );
}

async fn drive(
    gateway: &Arc<StreamGateway>,
    session: &Arc<SgwSession>,
    stream: WsStream,
    audio_rx: &mut mpsc::Receiver<Bytes>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Outcome {
    session.attempts.store(0, Ordering::Release);
    let (mut sink, mut stream) = stream.split();

    let start = tokio::time::Instant::now() + KEEPALIVE_PERIOD;
    let mut keepalive = tokio::time::interval_at(start, KEEPALIVE_PERIOD);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe_payload = audio_rx.recv() => match maybe_payload {
                Some(payload) => {
                    if sink.send(Message::Binary(payload)).await.is_err() {
                        return Outcome::Lost;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Outcome::Deliberate;
                }
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    gateway.handle_transcript(session, text.as_str());
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = sink.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(ssrc = %format_args!("{:08x}", session.ssrc), ?frame, "upstream closed");
                    return Outcome::Lost;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(ssrc = %format_args!("{:08x}", session.ssrc), "upstream error: {e}");
                    return Outcome::Lost;
                }
                None => return Outcome::Lost,
            },
            _ = keepalive.tick() => {
                let _ = sink.send(Message::Text(r#"{"type":"KeepAlive"}"#.into())).await;
            }
            _ = shutdown_rx.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                return Outcome::Deliberate;
            }
        }
    }
}
