//! HTTP API handlers and routing.

pub mod error;
mod health;
pub mod request_context;
mod v1;

pub use v1::{ListMessagesResponse, MessageItem, SendMessageRequest, SendMessageResponse};

use axum::{
    http::{header, HeaderName, Method},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::state::AppState;

/// Create the main API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static("x-user-id"),
            HeaderName::from_static("x-request-id"),
        ])
        .allow_origin(Any);

    Router::new()
        // Health endpoints
        .merge(health::routes())
        // API v1 routes
        .nest("/api/v1", v1::routes())
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        // Application state
        .with_state(state)
}
