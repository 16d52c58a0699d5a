//! Request-scoped context extracted from HTTP requests.

use std::convert::Infallible;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Identity of the caller, forwarded to agents as the `sender` field.
pub const USER_ID_HEADER: &str = "X-User-ID";

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub sender: Option<String>,
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl RequestContext {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let request_id = header_string(headers, REQUEST_ID_HEADER)
            .unwrap_or_else(|| format!("req_{}", uuid::Uuid::now_v7().simple()));
        Self {
            request_id,
            sender: header_string(headers, USER_ID_HEADER),
        }
    }
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_headers(&parts.headers))
    }
}
