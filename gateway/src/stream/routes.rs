//! HTTP control surface and widget socket for the streaming gateway.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::debug;

use super::{CallContext, Direction, StreamGateway};

#[derive(Debug, Deserialize)]
pub struct RegisterParams {
    uuid: Option<String>,
    #[serde(default)]
    exten: Option<String>,
    #[serde(default)]
    caller: Option<String>,
    #[serde(default)]
    callername: Option<String>,
    dir: Option<String>,
    #[serde(default)]
    force_start: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UnregisterParams {
    uuid: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WidgetParams {
    room: Option<String>,
}

pub fn router(gateway: Arc<StreamGateway>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/register", get(register))
        .route("/unregister", get(unregister))
        .route("/metrics", get(metrics))
        .route("/ws", get(widget))
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

async fn health() -> &'static str {
    "OK"
}

async fn register(
    State(gateway): State<Arc<StreamGateway>>,
    Query(params): Query<RegisterParams>,
) -> impl IntoResponse {
    let Some(uuid) = params.uuid else {
        return (StatusCode::BAD_REQUEST, "missing uuid");
    };
    let direction = match params.dir.as_deref().map(str::parse::<Direction>) {
        Some(Ok(direction)) => direction,
        _ => return (StatusCode::BAD_REQUEST, "missing or invalid dir"),
    };

    let context = CallContext {
        uuid,
        extension: params.exten.unwrap_or_default(),
        caller: params.caller.unwrap_or_default(),
        caller_name: params.callername.unwrap_or_default(),
    };
    let force_start = params.force_start.as_deref() == Some("1");

    gateway.register_call(context, direction, force_start);
    (StatusCode::OK, "OK")
}

async fn unregister(
    State(gateway): State<Arc<StreamGateway>>,
    Query(params): Query<UnregisterParams>,
) -> impl IntoResponse {
    let Some(uuid) = params.uuid else {
        return (StatusCode::BAD_REQUEST, "missing uuid");
    };
    gateway.unregister_call(&uuid);
    (StatusCode::OK, "OK")
}

async fn metrics(State(gateway): State<Arc<StreamGateway>>) -> String {
    gateway.metrics().render()
}

/// Widget subscription socket, keyed by the `room` query parameter.
async fn widget(
    State(gateway): State<Arc<StreamGateway>>,
    Query(params): Query<WidgetParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(room) = params.room.filter(|room| !room.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing room").into_response();
    };
    ws.on_upgrade(move |socket| widget_socket(socket, gateway, room))
}

async fn widget_socket(mut socket: WebSocket, gateway: Arc<StreamGateway>, room: String) {
    let mut events = gateway.rooms().subscribe(&room);
    gateway.metrics().widget_clients.inc();
    debug!(room, "widget subscriber attached");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(payload) => {
                    if socket.send(Message::Text(payload.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = socket.recv() => match incoming {
                // The widget socket is publish-only; inbound text is ignored.
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    gateway.metrics().widget_clients.dec();
    debug!(room, "widget subscriber detached");
}
