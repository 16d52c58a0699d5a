//! API v1 routes.

mod messages;

use axum::Router;

use crate::state::AppState;

pub use messages::{ListMessagesResponse, MessageItem, SendMessageRequest, SendMessageResponse};

/// Create API v1 routes.
pub fn routes() -> Router<AppState> {
    // Messages are nested under agents: /api/v1/agents/{name}/messages
    Router::new().nest("/agents/{name}", messages::routes())
}
