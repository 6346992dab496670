//! HTTP control surface for the framed gateway.

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
use tracing::warn;

use super::{FramedGateway, Registration};
use crate::error::GatewayError;

#[derive(Debug, Deserialize)]
pub struct RegisterParams {
    uuid: Option<String>,
    port: Option<u16>,
    #[serde(default)]
    agent_extension: Option<String>,
    #[serde(default)]
    agent_username: Option<String>,
    #[serde(default)]
    agent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UnregisterParams {
    port: Option<u16>,
}

pub fn router(gateway: Arc<FramedGateway>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/register", get(register))
        .route("/unregister", get(unregister))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

async fn health() -> &'static str {
    "OK"
}

async fn register(
    State(gateway): State<Arc<FramedGateway>>,
    Query(params): Query<RegisterParams>,
) -> impl IntoResponse {
    let (Some(uuid), Some(port)) = (params.uuid, params.port) else {
        return (StatusCode::BAD_REQUEST, "missing uuid or port");
    };

    let registration = Registration {
        call_uuid: uuid,
        agent_extension: params.agent_extension.unwrap_or_default(),
        agent_username: params.agent_username.unwrap_or_default(),
        agent_id: params.agent_id.unwrap_or_default(),
    };

    match gateway.register(port, registration).await {
        Ok(()) => (StatusCode::OK, "OK"),
        Err(GatewayError::PortInUse(_)) => {
            gateway.metrics().register_conflicts.inc();
            (StatusCode::CONFLICT, "port already registered")
        }
        Err(e) => {
            warn!(port, "register failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "ERROR")
        }
    }
}

async fn unregister(
    State(gateway): State<Arc<FramedGateway>>,
    Query(params): Query<UnregisterParams>,
) -> impl IntoResponse {
    let Some(port) = params.port else {
        return (StatusCode::BAD_REQUEST, "missing port");
    };
    gateway.cleanup(port, "unregister");
    (StatusCode::OK, "OK")
}

async fn metrics(State(gateway): State<Arc<FramedGateway>>) -> String {
    gateway.metrics().render()
}
