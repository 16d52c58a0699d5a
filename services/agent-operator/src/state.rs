//! Application state shared across request handlers.

use std::sync::Arc;

use crate::bridge::MessageBridge;
use crate::cluster::ClusterApi;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    cluster: Arc<dyn ClusterApi>,
    bridge: Option<MessageBridge>,
}

impl AppState {
    /// `bridge` is `None` when the stream store could not be reached at
    /// startup; messaging endpoints then answer 503.
    pub fn new(cluster: Arc<dyn ClusterApi>, bridge: Option<MessageBridge>) -> Self {
        Self {
            inner: Arc::new(AppStateInner { cluster, bridge }),
        }
    }

    pub fn cluster(&self) -> &Arc<dyn ClusterApi> {
        &self.inner.cluster
    }

    pub fn bridge(&self) -> Option<&MessageBridge> {
        self.inner.bridge.as_ref()
    }
}
