//! Agent messaging endpoints.
//!
//! Requests are checked in a fixed order: stream store availability (503),
//! agent existence (404), then the request body (400).

use std::collections::BTreeMap;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::bridge::{MessageBridge, StreamEntry};
use crate::state::AppState;

/// Create message routes, nested under `/agents/{name}`.
pub fn routes() -> Router<AppState> {
    Router::new().route("/messages", get(list_messages).post(send_message))
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Request to send a message to an agent.
#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    /// Opaque JSON handed to the agent as-is.
    pub payload: serde_json::Value,

    /// Seconds to wait for a reply. Missing or non-positive means the
    /// default.
    #[serde(default)]
    pub timeout: Option<i64>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct SendMessageResponse {
    pub reply: BTreeMap<String, String>,
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct ListMessagesQuery {
    /// Kept as text so that a malformed value falls back to the default
    /// instead of rejecting the request.
    pub limit: Option<String>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct MessageItem {
    pub id: String,
    pub values: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct ListMessagesResponse {
    pub messages: Vec<MessageItem>,
}

impl From<StreamEntry> for MessageItem {
    fn from(entry: StreamEntry) -> Self {
        Self {
            id: entry.id,
            values: entry.fields,
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Send a message and wait for the agent's reply.
///
/// POST /api/v1/agents/{name}/messages
async fn send_message(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let bridge = require_agent(&state, &ctx, &name).await?;

    let req: SendMessageRequest = serde_json::from_slice(&body).map_err(|e| {
        ApiError::bad_request("invalid_request_body", format!("Invalid request body: {e}"))
            .with_request_id(ctx.request_id.clone())
    })?;

    let timeout = req
        .timeout
        .filter(|t| *t > 0)
        .and_then(|t| u64::try_from(t).ok())
        .map(Duration::from_secs);
    let payload = req.payload.to_string();

    let reply = bridge
        .send_and_wait(&name, &payload, ctx.sender.as_deref(), timeout)
        .await
        .map_err(|e| {
            warn!(agent = %name, request_id = %ctx.request_id, error = %e, "Message exchange failed");
            ApiError::from(e).with_request_id(ctx.request_id.clone())
        })?;

    Ok(Json(SendMessageResponse {
        reply: reply.fields,
        id: reply.id,
    }))
}

/// List the agent's most recent replies, newest first.
///
/// GET /api/v1/agents/{name}/messages?limit=N
async fn list_messages(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
    Query(query): Query<ListMessagesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let bridge = require_agent(&state, &ctx, &name).await?;

    let limit = query.limit.and_then(|l| l.trim().parse::<i64>().ok());
    let replies = bridge
        .recent_replies(&name, limit)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;

    Ok(Json(ListMessagesResponse {
        messages: replies.into_iter().map(MessageItem::from).collect(),
    }))
}

/// The bridge, once the store is known to be connected and the agent to
/// exist.
async fn require_agent<'a>(
    state: &'a AppState,
    ctx: &RequestContext,
    name: &str,
) -> Result<&'a MessageBridge, ApiError> {
    let bridge = state.bridge().ok_or_else(|| {
        ApiError::service_unavailable(
            "stream_store_unavailable",
            "Valkey connection not available",
        )
        .with_request_id(ctx.request_id.clone())
    })?;

    let agent = state.cluster().find_agent(name).await.map_err(|e| {
        ApiError::internal("agent_lookup_failed", format!("Failed to look up agent: {e}"))
            .with_request_id(ctx.request_id.clone())
    })?;
    if agent.is_none() {
        return Err(
            ApiError::not_found("agent_not_found", format!("Agent '{name}' not found"))
                .with_request_id(ctx.request_id.clone()),
        );
    }

    Ok(bridge)
}
