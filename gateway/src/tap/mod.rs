//! Tap orchestrator.
//!
//! Owns each tapped call's resource graph on the PBX: snoop channels, mixing
//! bridges, and external-media channels, plus the port or context
//! registration at the chosen media gateway. All failures stay on the tap
//! side; the live call is never disturbed.
//!
//! The pipeline is event-driven: `/start_tap` only creates the snoop(s), and
//! the real assembly happens when each snoop enters stasis. External-media
//! channels re-enter the stasis application when created and are explicitly
//! ignored there.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ari_client::{AriClient, AriEvent, AriOptions, BridgeHandle, ChannelHandle, SpyDirection};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::TapConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::metrics::TapMetrics;
use crate::shutdown;
use crate::stream::Direction;

mod ports;
pub mod routes;
mod session;
mod signal;
mod singleflight;

pub use session::{Backend, CallMetadata, TapSession};
use ports::PortAllocator;
use session::original_id_from_snoop_name;
use signal::GatewaySignals;
use singleflight::{BridgeKey, BridgeSlots};

/// Attempts for add-to-bridge races against the PBX channel registry.
const BRIDGE_ADD_ATTEMPTS: u32 = 5;
const BRIDGE_ADD_DELAY: Duration = Duration::from_millis(200);

/// Audio format requested for external-media channels: 16 kHz signed linear.
const EXTERNAL_MEDIA_FORMAT: &str = "slin16";

pub struct TapOrchestrator {
    config: TapConfig,
    ari: AriClient,
    metrics: TapMetrics,
    sessions: Mutex<HashMap<String, Arc<TapSession>>>,
    /// Channel id → call uuid, for routing terminal events.
    reverse: Mutex<HashMap<String, String>>,
    ports: PortAllocator,
    bridges: BridgeSlots,
    signals: GatewaySignals,
}

/// Parameters of one `/start_tap`.
#[derive(Debug, Clone)]
pub struct StartTapRequest {
    pub channel: String,
    pub uuid: String,
    pub backend: Backend,
    pub metadata: CallMetadata,
}

impl TapOrchestrator {
    pub fn new(config: TapConfig) -> GatewayResult<Arc<Self>> {
        let ari = AriClient::with_options(
            &config.ari_url,
            &config.ari_username,
            &config.ari_password,
            AriOptions {
                path_prefix: config.ari_path_prefix.clone(),
                event_endpoint: config.ari_events_endpoint,
            },
        )
        .map_err(|e| GatewayError::Configuration(e.to_string()))?;

        let ports = PortAllocator::new(config.framed_port_min, config.framed_port_max);
        let signals = GatewaySignals::new(&config.framed_control_url, &config.stream_control_url);

        Ok(Arc::new(TapOrchestrator {
            config,
            ari,
            metrics: TapMetrics::default(),
            sessions: Mutex::new(HashMap::new()),
            reverse: Mutex::new(HashMap::new()),
            ports,
            bridges: BridgeSlots::default(),
            signals,
        }))
    }

    pub fn metrics(&self) -> &TapMetrics {
        &self.metrics
    }

    /// The underlying control-plane client.
    pub fn ari(&self) -> &AriClient {
        &self.ari
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Register the stasis event handlers. Handlers hold a weak reference so
    /// the client's subscription maps do not keep the orchestrator alive.
    pub fn wire_events(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        {
            let weak = weak.clone();
            self.ari.on("StasisStart", move |event, channel| {
                let orchestrator = weak.clone();
                async move {
                    if let Some(orchestrator) = orchestrator.upgrade() {
                        orchestrator.on_stasis_start(event, channel).await;
                    }
                }
            });
        }
        for terminal in ["StasisEnd", "ChannelHangupRequest"] {
            let weak = weak.clone();
            self.ari.on(terminal, move |_event, channel| {
                let orchestrator = weak.clone();
                async move {
                    if let (Some(orchestrator), Some(channel)) = (orchestrator.upgrade(), channel)
                    {
                        orchestrator.on_terminal_event(&channel).await;
                    }
                }
            });
        }
    }

    /// Handle `/start_tap`: ensure the session exists and install the
    /// snoop(s). Bridges and external media follow once the snoops enter
    /// stasis.
    pub async fn start_tap(self: &Arc<Self>, request: StartTapRequest) -> GatewayResult<()> {
        let session = self.ensure_session(&request);
        if session.is_cleaned() {
            return Err(GatewayError::SessionEnded);
        }
        self.metrics.taps_started.inc();
        info!(
            call = %request.uuid,
            channel = %request.channel,
            backend = ?request.backend,
            "starting tap"
        );

        let app = self.config.stasis_app.as_str();
        let result = match request.backend {
            Backend::Framed => {
                let args = format!("snoop,{},both", request.uuid);
                self.ari
                    .snoop_channel(&request.channel, app, SpyDirection::Both, &args)
                    .await
                    .map(|_| ())
            }
            Backend::Streaming => {
                let args_in = format!("snoop,{},in", request.uuid);
                let args_out = format!("snoop,{},out", request.uuid);
                match self
                    .ari
                    .snoop_channel(&request.channel, app, SpyDirection::In, &args_in)
                    .await
                {
                    Ok(_) => self
                        .ari
                        .snoop_channel(&request.channel, app, SpyDirection::Out, &args_out)
                        .await
                        .map(|_| ()),
                    Err(e) => Err(e),
                }
            }
        };

        if let Err(e) = result {
            error!(call = %request.uuid, "snoop creation failed: {e}");
            self.metrics.taps_failed.inc();
            self.cleanup_session(&request.uuid, "snoop creation failed")
                .await;
            return Err(GatewayError::ControlPlane(e.to_string()));
        }
        Ok(())
    }

    fn ensure_session(&self, request: &StartTapRequest) -> Arc<TapSession> {
        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(&request.uuid) {
            existing.refresh_metadata(request.metadata.clone());
            return existing.clone();
        }
        let session = Arc::new(TapSession::new(
            &request.uuid,
            request.backend,
            request.metadata.clone(),
        ));
        sessions.insert(request.uuid.clone(), session.clone());
        self.metrics.sessions_active.inc();
        session
    }

    async fn on_stasis_start(self: &Arc<Self>, event: AriEvent, channel: Option<ChannelHandle>) {
        if event.application.as_deref() != Some(self.config.stasis_app.as_str()) {
            return;
        }
        let Some(channel) = channel else { return };

        let role = event.args.first().map(String::as_str);
        if role == Some("em")
            || channel
                .name()
                .starts_with(&self.config.external_media_prefix)
        {
            debug!(channel = %channel.id(), "external-media channel re-entered stasis");
            return;
        }

        if role != Some("snoop") {
            debug!(channel = %channel.id(), ?role, "unrelated stasis entry ignored");
            return;
        }
        let Some(uuid) = event.args.get(1).cloned() else {
            warn!(channel = %channel.id(), "snoop entered stasis without a call uuid");
            return;
        };
        let spy = event.args.get(2).cloned().unwrap_or_default();

        if let Err(e) = self.handle_snoop_start(&uuid, &spy, channel).await {
            error!(call = %uuid, "tap setup failed: {e}");
            self.metrics.taps_failed.inc();
            self.cleanup_session(&uuid, "setup failed").await;
        }
    }

    /// A snoop for `uuid` entered stasis: bind it, then assemble the bridge
    /// and external-media leg for its backend.
    async fn handle_snoop_start(
        self: &Arc<Self>,
        uuid: &str,
        spy: &str,
        snoop: ChannelHandle,
    ) -> GatewayResult<()> {
        let session = self.sessions.lock().get(uuid).cloned();
        let Some(session) = session else {
            warn!(call = %uuid, snoop = %snoop.id(), "snoop for unknown call, hanging up");
            let _ = snoop.hangup().await;
            return Ok(());
        };
        if session.is_cleaned() {
            debug!(call = %uuid, "snoop arrived after cleanup, hanging up");
            let _ = snoop.hangup().await;
            return Ok(());
        }

        {
            let mut reverse = self.reverse.lock();
            reverse.insert(snoop.id().to_string(), uuid.to_string());
            if let Some(original) = original_id_from_snoop_name(&snoop.name()) {
                reverse.insert(original, uuid.to_string());
            }
        }
        session.add_snoop(snoop.clone());

        // The snoop leaving stasis ends the tap.
        {
            let weak = Arc::downgrade(self);
            let call = uuid.to_string();
            snoop.on("StasisEnd", move |_event| {
                let orchestrator = weak.clone();
                let call = call.clone();
                async move {
                    if let Some(orchestrator) = orchestrator.upgrade() {
                        orchestrator.cleanup_session(&call, "snoop ended").await;
                    }
                }
            });
        }

        match session.backend {
            Backend::Framed => self.assemble_framed(&session, &snoop).await,
            Backend::Streaming => {
                let direction: Direction = spy.parse()?;
                self.assemble_streaming(&session, &snoop, direction).await
            }
        }
    }

    /// Framed backend: one bridge, one dynamically allocated port registered
    /// at the framed gateway before the external-media channel exists.
    async fn assemble_framed(
        self: &Arc<Self>,
        session: &Arc<TapSession>,
        snoop: &ChannelHandle,
    ) -> GatewayResult<()> {
        let ari = self.ari.clone();
        let bridge = self
            .bridges
            .get_or_create(&session.uuid, BridgeKey::Mixed, || async move {
                ari.create_bridge("mixing").await
            })
            .await
            .map_err(|e| GatewayError::ControlPlane(e.to_string()))?;
        session.set_bridge(BridgeKey::Mixed, bridge.clone());

        bridge
            .add_channel(snoop.id())
            .await
            .map_err(|e| GatewayError::ControlPlane(e.to_string()))?;

        let port = self.ports.allocate()?;
        if let Err(e) = self
            .signals
            .framed_register(port, &session.uuid, &session.metadata())
            .await
        {
            self.ports.free(port);
            return Err(e);
        }
        session.set_port(port);

        let external_host = format!("{}:{}", self.config.framed_rtp_host, port);
        self.attach_external_media(session, &bridge, &external_host)
            .await
    }

    /// Streaming backend: per-direction bridge (single-flight against the
    /// sibling snoop), context registration, then the direction's
    /// external-media leg.
    async fn assemble_streaming(
        self: &Arc<Self>,
        session: &Arc<TapSession>,
        snoop: &ChannelHandle,
        direction: Direction,
    ) -> GatewayResult<()> {
        let ari = self.ari.clone();
        let bridge = self
            .bridges
            .get_or_create(
                &session.uuid,
                BridgeKey::Direction(direction),
                || async move { ari.create_bridge("mixing").await },
            )
            .await
            .map_err(|e| GatewayError::ControlPlane(e.to_string()))?;
        session.set_bridge(BridgeKey::Direction(direction), bridge.clone());

        bridge
            .add_channel(snoop.id())
            .await
            .map_err(|e| GatewayError::ControlPlane(e.to_string()))?;

        // Context must be pending at the gateway before RTP can flow, but a
        // rejected registration does not kill the tap.
        if let Err(e) = self
            .signals
            .stream_register(&session.uuid, &session.metadata(), direction)
            .await
        {
            warn!(call = %session.uuid, dir = direction.as_str(), "stream register failed: {e}");
        }

        let external_host = match direction {
            Direction::In => self.config.stream_rtp_in.clone(),
            Direction::Out => self.config.stream_rtp_out.clone(),
        };
        self.attach_external_media(session, &bridge, &external_host)
            .await
    }

    /// Create the external-media channel and add it to the bridge, retrying
    /// the add while the PBX materializes the channel.
    async fn attach_external_media(
        self: &Arc<Self>,
        session: &Arc<TapSession>,
        bridge: &BridgeHandle,
        external_host: &str,
    ) -> GatewayResult<()> {
        let media = self
            .ari
            .external_media(
                &self.config.stasis_app,
                "em",
                external_host,
                EXTERNAL_MEDIA_FORMAT,
                "udp",
                "rtp",
            )
            .await
            .map_err(|e| GatewayError::ControlPlane(e.to_string()))?;
        session.add_external_media(media.clone());
        self.reverse
            .lock()
            .insert(media.id().to_string(), session.uuid.clone());

        let mut attempt = 0;
        loop {
            match bridge.add_channel(media.id()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_not_found() && attempt + 1 < BRIDGE_ADD_ATTEMPTS => {
                    attempt += 1;
                    self.metrics.bridge_add_retries.inc();
                    debug!(
                        channel = %media.id(),
                        attempt,
                        "external-media channel not yet visible, retrying add"
                    );
                    tokio::time::sleep(BRIDGE_ADD_DELAY).await;
                }
                Err(e) => return Err(GatewayError::ControlPlane(e.to_string())),
            }
        }
    }

    /// Terminal stasis events for any known channel clean the whole call.
    async fn on_terminal_event(self: &Arc<Self>, channel: &ChannelHandle) {
        let uuid = self.reverse.lock().get(channel.id()).cloned();
        if let Some(uuid) = uuid {
            self.cleanup_session(&uuid, "channel ended").await;
        }
    }

    /// Tear down everything a tap owns. Idempotent: the session's cleaned
    /// latch is set before any effectful step, so duplicate terminal events
    /// collapse onto one execution. Hangups and destroys are best-effort.
    pub async fn cleanup_session(&self, uuid: &str, reason: &str) {
        let session = self.sessions.lock().get(uuid).cloned();
        let Some(session) = session else {
            debug!(call = %uuid, reason, "cleanup for unknown call ignored");
            return;
        };
        if session.mark_cleaned() {
            debug!(call = %uuid, reason, "cleanup already ran");
            return;
        }

        self.metrics.cleanups.inc();
        info!(call = %uuid, reason, "cleaning up tap session");
        let resources = session.take_resources();

        match session.backend {
            Backend::Framed => {
                if let Some(port) = resources.port {
                    if let Err(e) = self.signals.framed_unregister(port).await {
                        warn!(port, "framed unregister failed: {e}");
                    }
                    self.ports.free(port);
                }
            }
            Backend::Streaming => {
                if let Err(e) = self.signals.stream_unregister(uuid).await {
                    warn!(call = %uuid, "stream unregister failed: {e}");
                }
            }
        }

        for bridge in resources.bridges.values() {
            if let Err(e) = bridge.destroy().await {
                warn!(bridge = %bridge.id(), "bridge destroy failed: {e}");
            }
        }
        for snoop in &resources.snoops {
            if let Err(e) = snoop.hangup().await {
                warn!(channel = %snoop.id(), "snoop hangup failed: {e}");
            }
        }
        for media in &resources.external_media {
            if let Err(e) = media.hangup().await {
                warn!(channel = %media.id(), "external-media hangup failed: {e}");
            }
        }

        self.reverse.lock().retain(|_, call| call != uuid);
        for channel in resources.snoops.iter().chain(resources.external_media.iter()) {
            self.ari.forget_channel(channel.id());
        }
        self.bridges.forget_call(uuid);

        self.sessions.lock().remove(uuid);
        self.metrics.sessions_active.dec();
    }

    /// Run the orchestrator until a shutdown signal arrives or the stasis
    /// event stream dies.
    pub async fn run(config: TapConfig) -> GatewayResult<()> {
        let app_name = config.stasis_app.clone();
        let orchestrator = TapOrchestrator::new(config)?;
        orchestrator.wire_events();

        let stream_task = orchestrator
            .ari
            .start(&app_name)
            .await
            .map_err(|e| GatewayError::ControlPlane(e.to_string()))?;

        let router = routes::router(orchestrator.clone());
        let addr = SocketAddr::from(([0, 0, 0, 0], orchestrator.config.http_port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, app = %app_name, "tap orchestrator listening");

        let serve = axum::serve(listener, router).with_graceful_shutdown(shutdown::signal());
        let stream_died = tokio::select! {
            result = serve => {
                result.map_err(|e| GatewayError::Socket(e.to_string()))?;
                false
            }
            _ = stream_task => {
                error!("stasis event stream ended");
                true
            }
        };

        let uuids: Vec<String> = orchestrator.sessions.lock().keys().cloned().collect();
        for uuid in uuids {
            orchestrator.cleanup_session(&uuid, "shutdown").await;
        }
        orchestrator.ari.stop();

        if stream_died {
            return Err(GatewayError::ControlPlane(
                "stasis event stream ended".to_string(),
            ));
        }
        Ok(())
    }
}
