//! HTTP surface of the tap orchestrator.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use super::{Backend, CallMetadata, StartTapRequest, TapOrchestrator};

#[derive(Debug, Deserialize)]
pub struct StartTapParams {
    chan: Option<String>,
    uuid: Option<String>,
    gw: Option<String>,
    #[serde(default)]
    exten: Option<String>,
    #[serde(default)]
    caller: Option<String>,
    #[serde(default)]
    callername: Option<String>,
    #[serde(default)]
    agent_extension: Option<String>,
    #[serde(default)]
    agent_username: Option<String>,
    #[serde(default)]
    agent_id: Option<String>,
}

pub fn router(orchestrator: Arc<TapOrchestrator>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/start_tap", get(start_tap))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(orchestrator)
}

async fn health() -> &'static str {
    "OK"
}

/// The dialplan's entry point. A 500 here must never disturb the call; the
/// dialplan continues regardless.
async fn start_tap(
    State(orchestrator): State<Arc<TapOrchestrator>>,
    Query(params): Query<StartTapParams>,
) -> impl IntoResponse {
    let (Some(channel), Some(uuid)) = (params.chan, params.uuid) else {
        return (StatusCode::BAD_REQUEST, "Missing chan or uuid");
    };
    let Some(backend) = Backend::from_query(params.gw.as_deref()) else {
        return (StatusCode::BAD_REQUEST, "Invalid gw");
    };

    let request = StartTapRequest {
        channel,
        uuid,
        backend,
        metadata: CallMetadata {
            extension: params.exten.unwrap_or_default(),
            caller: params.caller.unwrap_or_default(),
            caller_name: params.callername.unwrap_or_default(),
            agent_extension: params.agent_extension.unwrap_or_default(),
            agent_username: params.agent_username.unwrap_or_default(),
            agent_id: params.agent_id.unwrap_or_default(),
        },
    };

    match orchestrator.start_tap(request).await {
        Ok(()) => (StatusCode::OK, "OK"),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ERROR"),
    }
}

async fn metrics(State(orchestrator): State<Arc<TapOrchestrator>>) -> String {
    orchestrator.metrics().render()
}
