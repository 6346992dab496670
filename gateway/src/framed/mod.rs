//! Framed-TCP gateway.
//!
//! Accepts per-call RTP on dynamically registered UDP ports, reassembles the
//! PCM into fixed-size frames, and forwards each call over one downstream
//! TCP connection using the typed binary framing in [`codec`]. Driven by an
//! HTTP control API (`/register`, `/unregister`).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tracing::{debug, info};

use crate::config::FramedConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::metrics::FramedMetrics;
use crate::shutdown;

pub mod codec;
pub mod routes;
mod session;

pub use session::Registration;
use session::FramedSession;

/// How often watchdogs look at session activity.
pub(crate) const WATCHDOG_PERIOD: Duration = Duration::from_secs(2);

/// The framed gateway: session table plus configuration and metrics.
pub struct FramedGateway {
    config: FramedConfig,
    metrics: FramedMetrics,
    sessions: Mutex<HashMap<u16, Arc<FramedSession>>>,
}

impl FramedGateway {
    pub fn new(config: FramedConfig) -> Arc<Self> {
        Arc::new(FramedGateway {
            config,
            metrics: FramedMetrics::default(),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &FramedConfig {
        &self.config
    }

    pub fn metrics(&self) -> &FramedMetrics {
        &self.metrics
    }

    /// Number of live sessions, for observability and tests.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Bind `port` and start a session for it. The downstream TCP connect
    /// begins immediately; RTP arriving before it completes is queued.
    pub async fn register(
        self: &Arc<Self>,
        port: u16,
        registration: Registration,
    ) -> GatewayResult<()> {
        // The bind also arbitrates concurrent registers for the same port:
        // the second one fails at the OS level.
        let socket = UdpSocket::bind(("0.0.0.0", port)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                GatewayError::PortInUse(port)
            } else {
                GatewayError::Socket(e.to_string())
            }
        })?;

        if self.sessions.lock().contains_key(&port) {
            return Err(GatewayError::PortInUse(port));
        }

        info!(port, call = %registration.call_uuid, "framed session registered");
        FramedSession::spawn(self, socket, port, registration).await;
        Ok(())
    }

    /// Tear a session down and free its port. Idempotent: the session is
    /// removed from the table first, so concurrent terminal events collapse
    /// onto one teardown.
    pub fn cleanup(&self, port: u16, reason: &'static str) {
        let Some(session) = self.sessions.lock().remove(&port) else {
            debug!(port, reason, "cleanup for unknown port ignored");
            return;
        };
        self.metrics.sessions_active.dec();
        session.end(reason);
    }

    /// End every live session (process shutdown).
    pub fn shutdown_all(&self) {
        let sessions: Vec<Arc<FramedSession>> = {
            let mut map = self.sessions.lock();
            let drained: Vec<_> = map.drain().map(|(_, s)| s).collect();
            drained
        };
        for session in &sessions {
            self.metrics.sessions_active.dec();
            session.end("shutdown");
        }
        if !sessions.is_empty() {
            info!(count = sessions.len(), "framed sessions ended on shutdown");
        }
    }

    /// Run the gateway until a shutdown signal arrives.
    pub async fn run(config: FramedConfig) -> GatewayResult<()> {
        let gateway = FramedGateway::new(config);
        let app = routes::router(gateway.clone());

        let addr = SocketAddr::from(([0, 0, 0, 0], gateway.config.http_port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(
            addr = %listener.local_addr()?,
            downstream = %gateway.config.downstream_addr(),
            "framed gateway listening"
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown::signal())
            .await
            .map_err(|e| GatewayError::Socket(e.to_string()))?;

        gateway.shutdown_all();
        // Give writer tasks a moment to flush END frames.
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(())
    }
}
