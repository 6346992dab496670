//! Orchestrator integration tests against a stub PBX.
//!
//! The stub exposes the same ARI surface the orchestrator consumes (snoop,
//! externalMedia, bridges, channel listing, the stasis event stream) and
//! records every destructive call, so the tests can assert the full tap
//! lifecycle: assembly on snoop entry, registration at the media gateways,
//! and idempotent cleanup on terminal events.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::broadcast;

use ari_client::EventEndpoint;
use tapgate::config::TapConfig;
use tapgate::tap::{Backend, CallMetadata, StartTapRequest, TapOrchestrator};

// ---------------------------------------------------------------------------
// Stub PBX
// ---------------------------------------------------------------------------

struct PbxState {
    app: String,
    events: broadcast::Sender<String>,
    /// 404 the first snoop POST for name-looking targets.
    reject_snoop_by_name: bool,
    /// 404 the first addChannel for each external-media channel.
    fail_first_em_add: bool,
    /// Channels reported by GET /channels.
    channels: Vec<(String, String)>,

    snoop_seq: AtomicUsize,
    em_seq: AtomicUsize,
    bridge_seq: AtomicUsize,
    snoop_targets: Mutex<Vec<String>>,
    em_hosts: Mutex<Vec<String>>,
    added: Mutex<Vec<(String, String)>>,
    add_attempts: Mutex<HashMap<String, u32>>,
    destroyed_bridges: Mutex<Vec<String>>,
    hungup_channels: Mutex<Vec<String>>,
}

impl PbxState {
    fn new(app: &str) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(PbxState {
            app: app.to_string(),
            events,
            reject_snoop_by_name: false,
            fail_first_em_add: false,
            channels: Vec::new(),
            snoop_seq: AtomicUsize::new(0),
            em_seq: AtomicUsize::new(0),
            bridge_seq: AtomicUsize::new(0),
            snoop_targets: Mutex::new(Vec::new()),
            em_hosts: Mutex::new(Vec::new()),
            added: Mutex::new(Vec::new()),
            add_attempts: Mutex::new(HashMap::new()),
            destroyed_bridges: Mutex::new(Vec::new()),
            hungup_channels: Mutex::new(Vec::new()),
        })
    }

    fn send_event(&self, event: serde_json::Value) {
        let _ = self.events.send(event.to_string());
    }

    fn hangup_request(&self, channel_id: &str, channel_name: &str) {
        self.send_event(json!({
            "type": "ChannelHangupRequest",
            "application": self.app,
            "channel": {"id": channel_id, "name": channel_name},
        }));
    }

    fn stasis_end(&self, channel_id: &str, channel_name: &str) {
        self.send_event(json!({
            "type": "StasisEnd",
            "application": self.app,
            "channel": {"id": channel_id, "name": channel_name},
        }));
    }
}

fn pbx_router(state: Arc<PbxState>) -> Router {
    Router::new()
        .route("/ari/channels", get(list_channels))
        .route("/ari/channels/{id}/snoop", post(snoop))
        .route("/ari/channels/externalMedia", post(external_media))
        .route("/ari/channels/{id}", delete(hangup))
        .route("/ari/bridges", post(create_bridge))
        .route("/ari/bridges/{id}/addChannel", post(add_channel))
        .route("/ari/bridges/{id}", delete(destroy_bridge))
        .route("/ari/events", get(events))
        .with_state(state)
}

async fn list_channels(State(state): State<Arc<PbxState>>) -> Json<serde_json::Value> {
    let channels: Vec<_> = state
        .channels
        .iter()
        .map(|(id, name)| json!({"id": id, "name": name}))
        .collect();
    Json(json!(channels))
}

async fn snoop(
    State(state): State<Arc<PbxState>>,
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if state.reject_snoop_by_name && id.contains('/') {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"message": "Channel not found"})),
        )
            .into_response();
    }
    state.snoop_targets.lock().push(id.clone());

    let n = state.snoop_seq.fetch_add(1, Ordering::SeqCst) + 1;
    let snoop_id = format!("snoop-{n}");
    let name = format!("Snoop/{id}-{n:08}");

    let args: Vec<String> = query
        .get("appArgs")
        .map(|raw| raw.split(',').map(str::to_string).collect())
        .unwrap_or_default();
    state.send_event(json!({
        "type": "StasisStart",
        "application": state.app,
        "args": args,
        "channel": {"id": snoop_id, "name": name},
    }));

    Json(json!({"id": snoop_id, "name": name})).into_response()
}

async fn external_media(
    State(state): State<Arc<PbxState>>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let host = query.get("external_host").cloned().unwrap_or_default();
    state.em_hosts.lock().push(host.clone());

    let n = state.em_seq.fetch_add(1, Ordering::SeqCst) + 1;
    let em_id = format!("em-{n}");
    let name = format!("UnicastRTP/{host}-{n:08x}");

    // External-media channels re-enter the stasis app on creation.
    state.send_event(json!({
        "type": "StasisStart",
        "application": state.app,
        "args": ["em"],
        "channel": {"id": em_id, "name": name},
    }));

    Json(json!({"id": em_id, "name": name})).into_response()
}

async fn hangup(State(state): State<Arc<PbxState>>, Path(id): Path<String>) -> StatusCode {
    state.hungup_channels.lock().push(id);
    StatusCode::NO_CONTENT
}

async fn create_bridge(State(state): State<Arc<PbxState>>) -> Json<serde_json::Value> {
    let n = state.bridge_seq.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({"id": format!("bridge-{n}"), "technology": "softmix"}))
}

async fn add_channel(
    State(state): State<Arc<PbxState>>,
    Path(bridge_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let channel = query.get("channel").cloned().unwrap_or_default();
    let attempts = {
        let mut map = state.add_attempts.lock();
        let entry = map.entry(channel.clone()).or_insert(0);
        *entry += 1;
        *entry
    };

    if state.fail_first_em_add && channel.starts_with("em-") && attempts == 1 {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"message": "Channel not found"})),
        )
            .into_response();
    }

    state.added.lock().push((bridge_id, channel));
    StatusCode::NO_CONTENT.into_response()
}

async fn destroy_bridge(State(state): State<Arc<PbxState>>, Path(id): Path<String>) -> StatusCode {
    state.destroyed_bridges.lock().push(id);
    StatusCode::NO_CONTENT
}

async fn events(State(state): State<Arc<PbxState>>, ws: WebSocketUpgrade) -> Response {
    // Subscribe before the upgrade completes so no event is missed.
    let rx = state.events.subscribe();
    ws.on_upgrade(move |socket| forward_events(socket, rx))
}

async fn forward_events(mut socket: WebSocket, mut rx: broadcast::Receiver<String>) {
    while let Ok(event) = rx.recv().await {
        if socket.send(Message::Text(event.into())).await.is_err() {
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Stub media gateways
// ---------------------------------------------------------------------------

#[derive(Default)]
struct GatewayStubState {
    registers: Mutex<Vec<HashMap<String, String>>>,
    unregisters: Mutex<Vec<HashMap<String, String>>>,
}

fn gateway_stub_router(state: Arc<GatewayStubState>) -> Router {
    async fn register(
        State(state): State<Arc<GatewayStubState>>,
        Query(query): Query<HashMap<String, String>>,
    ) -> &'static str {
        state.registers.lock().push(query);
        "OK"
    }
    async fn unregister(
        State(state): State<Arc<GatewayStubState>>,
        Query(query): Query<HashMap<String, String>>,
    ) -> &'static str {
        state.unregisters.lock().push(query);
        "OK"
    }
    Router::new()
        .route("/register", get(register))
        .route("/unregister", get(unregister))
        .with_state(state)
}

async fn serve(app: Router) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    pbx: Arc<PbxState>,
    fgw: Arc<GatewayStubState>,
    sgw: Arc<GatewayStubState>,
    orchestrator: Arc<TapOrchestrator>,
}

const APP: &str = "tap-test";

async fn harness(customize: impl FnOnce(&mut PbxState)) -> Harness {
    let mut pbx_state = PbxState::new(APP);
    customize(Arc::get_mut(&mut pbx_state).unwrap());

    let pbx_addr = serve(pbx_router(pbx_state.clone())).await;
    let fgw = Arc::new(GatewayStubState::default());
    let fgw_addr = serve(gateway_stub_router(fgw.clone())).await;
    let sgw = Arc::new(GatewayStubState::default());
    let sgw_addr = serve(gateway_stub_router(sgw.clone())).await;

    let config = TapConfig {
        ari_url: format!("http://{pbx_addr}/ari"),
        ari_username: "tap".to_string(),
        ari_password: "secret".to_string(),
        ari_path_prefix: None,
        ari_events_endpoint: EventEndpoint::Auto,
        stasis_app: APP.to_string(),
        http_port: 0,
        framed_control_url: format!("http://{fgw_addr}"),
        framed_rtp_host: "127.0.0.1".to_string(),
        framed_port_min: 45000,
        framed_port_max: 45099,
        stream_control_url: format!("http://{sgw_addr}"),
        stream_rtp_in: "127.0.0.1:5004".to_string(),
        stream_rtp_out: "127.0.0.1:5006".to_string(),
        external_media_prefix: "UnicastRTP".to_string(),
        dump_enabled: false,
    };

    let orchestrator = TapOrchestrator::new(config).unwrap();
    orchestrator.wire_events();
    orchestrator.ari().start(APP).await.unwrap();

    Harness {
        pbx: pbx_state,
        fgw,
        sgw,
        orchestrator,
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn start_request(channel: &str, uuid: &str, backend: Backend) -> StartTapRequest {
    StartTapRequest {
        channel: channel.to_string(),
        uuid: uuid.to_string(),
        backend,
        metadata: CallMetadata {
            extension: "200".to_string(),
            caller: "+34600000000".to_string(),
            caller_name: "Ana".to_string(),
            agent_extension: "100".to_string(),
            agent_username: String::new(),
            agent_id: String::new(),
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn framed_tap_assembles_registers_and_cleans_up() {
    let h = harness(|pbx| pbx.fail_first_em_add = true).await;

    h.orchestrator
        .start_tap(start_request("100.1", "A1", Backend::Framed))
        .await
        .unwrap();

    // Snoop + external media both end up in the bridge; the gateway got the
    // registration before the external-media channel was created.
    wait_for(|| h.pbx.added.lock().len() == 2, "bridge assembly").await;
    assert_eq!(h.pbx.bridge_seq.load(Ordering::SeqCst), 1);

    let registers = h.fgw.registers.lock().clone();
    assert_eq!(registers.len(), 1);
    assert_eq!(registers[0].get("uuid").unwrap(), "A1");
    assert_eq!(registers[0].get("agent_extension").unwrap(), "100");
    let port: u16 = registers[0].get("port").unwrap().parse().unwrap();
    assert!((45000..=45099).contains(&port));

    let hosts = h.pbx.em_hosts.lock().clone();
    assert_eq!(hosts, vec![format!("127.0.0.1:{port}")]);

    // The first add of the external-media channel 404ed and was retried.
    assert_eq!(*h.pbx.add_attempts.lock().get("em-1").unwrap(), 2);
    assert!(h.orchestrator.metrics().bridge_add_retries.get() >= 1);

    // Hangup of the original channel tears the whole graph down.
    h.pbx.hangup_request("100.1", "SIP/100-000001");
    wait_for(|| h.orchestrator.session_count() == 0, "cleanup").await;

    assert_eq!(h.pbx.destroyed_bridges.lock().clone(), vec!["bridge-1"]);
    let hungup = h.pbx.hungup_channels.lock().clone();
    assert!(hungup.contains(&"snoop-1".to_string()));
    assert!(hungup.contains(&"em-1".to_string()));

    let unregisters = h.fgw.unregisters.lock().clone();
    assert_eq!(unregisters.len(), 1);
    assert_eq!(
        unregisters[0].get("port").unwrap(),
        &port.to_string()
    );

    // A late StasisEnd for the snoop is absorbed by the latch.
    h.pbx.stasis_end("snoop-1", "Snoop/100.1-00000001");
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.orchestrator.metrics().cleanups.get(), 1);
}

#[tokio::test]
async fn streaming_tap_builds_one_bridge_per_direction() {
    let h = harness(|_| {}).await;

    h.orchestrator
        .start_tap(start_request("200.1", "B1", Backend::Streaming))
        .await
        .unwrap();

    // Two snoops and two external-media channels across two bridges.
    wait_for(|| h.pbx.added.lock().len() == 4, "dual-direction assembly").await;
    assert_eq!(h.pbx.bridge_seq.load(Ordering::SeqCst), 2);

    let hosts = h.pbx.em_hosts.lock().clone();
    assert!(hosts.contains(&"127.0.0.1:5004".to_string()));
    assert!(hosts.contains(&"127.0.0.1:5006".to_string()));

    let registers = h.sgw.registers.lock().clone();
    assert_eq!(registers.len(), 2);
    let dirs: Vec<_> = registers
        .iter()
        .map(|q| q.get("dir").unwrap().as_str())
        .collect();
    assert!(dirs.contains(&"in") && dirs.contains(&"out"));
    assert!(registers.iter().all(|q| q.get("uuid").unwrap() == "B1"));
    assert!(registers.iter().all(|q| q.get("exten").unwrap() == "200"));

    // Each bridge received exactly two members (its snoop and its media leg).
    let added = h.pbx.added.lock().clone();
    let mut per_bridge: HashMap<String, usize> = HashMap::new();
    for (bridge, _channel) in &added {
        *per_bridge.entry(bridge.clone()).or_insert(0) += 1;
    }
    assert_eq!(per_bridge.len(), 2);
    assert!(per_bridge.values().all(|count| *count == 2));

    // Terminal event on the original channel cleans both directions.
    h.pbx.hangup_request("200.1", "SIP/200-000001");
    wait_for(|| h.orchestrator.session_count() == 0, "cleanup").await;

    assert_eq!(h.pbx.destroyed_bridges.lock().len(), 2);
    assert_eq!(h.pbx.hungup_channels.lock().len(), 4);

    let unregisters = h.sgw.unregisters.lock().clone();
    assert_eq!(unregisters.len(), 1);
    assert_eq!(unregisters[0].get("uuid").unwrap(), "B1");
}

#[tokio::test]
async fn snoop_by_name_is_resolved_through_the_channel_list() {
    let h = harness(|pbx| {
        pbx.reject_snoop_by_name = true;
        pbx.channels = vec![("100.1".to_string(), "SIP/100-000001".to_string())];
    })
    .await;

    h.orchestrator
        .start_tap(start_request("SIP/100-000001", "C1", Backend::Framed))
        .await
        .unwrap();

    wait_for(|| h.pbx.added.lock().len() == 2, "assembly after resolution").await;
    let targets = h.pbx.snoop_targets.lock().clone();
    assert_eq!(targets, vec!["100.1".to_string()]);
}

#[tokio::test]
async fn start_tap_validates_parameters() {
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    let h = harness(|_| {}).await;
    let app = tapgate::tap::routes::router(h.orchestrator.clone());

    let missing = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/start_tap?chan=SIP%2F100-000001")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
    let body = axum::body::to_bytes(missing.into_body(), 1024).await.unwrap();
    assert_eq!(&body[..], b"Missing chan or uuid");

    let bad_gw = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/start_tap?chan=100.1&uuid=D1&gw=tape")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(bad_gw.status(), StatusCode::BAD_REQUEST);

    let metrics = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(metrics.status(), StatusCode::OK);
}
