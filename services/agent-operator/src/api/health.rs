//! Health check endpoints.
//!
//! These endpoints are used by kubelet probes to determine if the operator
//! is alive and whether its messaging API can serve traffic.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

const SERVICE_NAME: &str = "agent-operator";

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status: "ok" or "degraded".
    pub status: String,

    pub service: String,

    pub version: String,

    /// Current timestamp (RFC 3339).
    pub timestamp: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub components: Option<ComponentHealth>,
}

/// Component health details.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ComponentHealth {
    /// Message stream store behind the bridge.
    pub stream_store: ComponentStatus,
}

/// Individual component status.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ComponentStatus {
    /// Status: "ok" or "unavailable".
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Create health check routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
}

fn response(status: &str, components: Option<ComponentHealth>) -> HealthResponse {
    HealthResponse {
        status: status.to_string(),
        service: SERVICE_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        components,
    }
}

/// Static liveness answer; checks no dependencies.
async fn healthz() -> impl IntoResponse {
    Json(response("ok", None))
}

/// Ready when the stream store answers a ping.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let store = match state.bridge() {
        Some(bridge) => match bridge.store().ping().await {
            Ok(()) => ComponentStatus {
                status: "ok".to_string(),
                message: None,
            },
            Err(e) => ComponentStatus {
                status: "unavailable".to_string(),
                message: Some(e.to_string()),
            },
        },
        None => ComponentStatus {
            status: "unavailable".to_string(),
            message: Some("stream store not connected".to_string()),
        },
    };

    let ok = store.status == "ok";
    let body = response(
        if ok { "ok" } else { "degraded" },
        Some(ComponentHealth {
            stream_store: store,
        }),
    );

    if ok {
        (StatusCode::OK, Json(body))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body))
    }
}

async fn livez() -> impl IntoResponse {
    StatusCode::OK
}
