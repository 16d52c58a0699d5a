//! Object-store interface.
//!
//! The controller and the messaging bridge reach the cluster only through
//! [`ClusterApi`], which covers the handful of get/create/replace/delete
//! calls they need with optimistic concurrency on status writes:
//! - [`KubeCluster`] talks to the Kubernetes API via kube-rs
//! - [`MockCluster`] is an in-memory store for tests and local development

mod kubernetes;
mod mock;

pub use kubernetes::KubeCluster;
pub use mock::{CallCounts, MockCluster};

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod, Secret};
use thiserror::Error;

use crate::crd::Agent;

/// Result type for object-store calls.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Object-store errors.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Create raced with another writer that created the same object.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The write was based on a stale resource version.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The object could not be encoded for the API.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any other API failure.
    #[error("kubernetes api error: {0}")]
    Api(#[source] kube::Error),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<kube::Error> for ClusterError {
    fn from(e: kube::Error) -> Self {
        match &e {
            kube::Error::Api(ae) if ae.code == 404 => Self::NotFound(ae.message.clone()),
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                Self::AlreadyExists(ae.message.clone())
            }
            kube::Error::Api(ae) if ae.code == 409 => Self::Conflict(ae.message.clone()),
            _ => Self::Api(e),
        }
    }
}

/// Namespace and name of a namespaced object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Object-store operations used by the operator.
///
/// `get_*` calls return `Ok(None)` for missing objects. `create_*` calls
/// fail with [`ClusterError::AlreadyExists`] when the object is present, and
/// [`ClusterApi::replace_agent_status`] fails with
/// [`ClusterError::Conflict`] when the caller's resource version is stale.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetch an Agent by namespace and name.
    async fn get_agent(&self, key: &ObjectKey) -> ClusterResult<Option<Agent>>;

    /// Find an Agent by name in any namespace.
    async fn find_agent(&self, name: &str) -> ClusterResult<Option<Agent>>;

    /// Write the status subresource of `agent`, guarded by its resource
    /// version. Returns the stored object.
    async fn replace_agent_status(&self, agent: &Agent) -> ClusterResult<Agent>;

    async fn get_namespace(&self, name: &str) -> ClusterResult<Option<Namespace>>;

    async fn create_namespace(&self, namespace: &Namespace) -> ClusterResult<()>;

    async fn get_secret(&self, key: &ObjectKey) -> ClusterResult<Option<Secret>>;

    async fn create_secret(&self, secret: &Secret) -> ClusterResult<()>;

    async fn replace_secret(&self, secret: &Secret) -> ClusterResult<()>;

    async fn get_pod(&self, key: &ObjectKey) -> ClusterResult<Option<Pod>>;

    async fn create_pod(&self, pod: &Pod) -> ClusterResult<()>;

    /// Delete a pod. Fails with [`ClusterError::NotFound`] if it is absent.
    async fn delete_pod(&self, key: &ObjectKey) -> ClusterResult<()>;
}

/// Namespace and name of any object, for building keys from metadata.
pub(crate) fn key_of(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> ObjectKey {
    ObjectKey::new(
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}
