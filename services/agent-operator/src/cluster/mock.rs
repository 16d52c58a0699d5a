//! In-memory object store.
//!
//! Mirrors the API server semantics the operator depends on: resource
//! versions bump on every write, status writes with a stale version
//! conflict, creates of existing objects fail, and deleting an Agent
//! garbage-collects the objects it owns.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod, PodStatus, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use parking_lot::Mutex;
use tracing::debug;

use super::{key_of, ClusterApi, ClusterError, ClusterResult, ObjectKey};
use crate::crd::Agent;

/// Write calls observed by the mock.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CallCounts {
    pub status_writes: u32,
    pub namespace_creates: u32,
    pub secret_creates: u32,
    pub secret_replaces: u32,
    pub pod_creates: u32,
    pub pod_deletes: u32,
}

#[derive(Default)]
struct State {
    agents: BTreeMap<ObjectKey, Agent>,
    namespaces: BTreeSet<String>,
    secrets: BTreeMap<ObjectKey, Secret>,
    pods: BTreeMap<ObjectKey, Pod>,
    version: u64,
    injected_conflicts: u32,
    fail_pod_creates: bool,
    fail_pod_deletes: bool,
    calls: CallCounts,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

/// Mock object store for tests and development.
#[derive(Default)]
pub struct MockCluster {
    state: Mutex<State>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an Agent as if a user had applied it. Assigns a uid and a
    /// resource version.
    pub fn apply_agent(&self, mut agent: Agent) -> Agent {
        let mut state = self.state.lock();
        if agent.metadata.uid.is_none() {
            agent.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        agent.metadata.resource_version = Some(state.next_version());
        state.agents.insert(agent.key(), agent.clone());
        agent
    }

    /// Delete an Agent and everything it owns.
    pub fn delete_agent(&self, key: &ObjectKey) {
        let mut state = self.state.lock();
        let Some(agent) = state.agents.remove(key) else {
            return;
        };
        let uid = agent.metadata.uid.unwrap_or_default();
        let owned_by_agent = |owners: &[OwnerReference]| owners.iter().any(|o| o.uid == uid);
        state.pods.retain(|_, pod| !owned_by_agent(pod.owner_references()));
        state
            .secrets
            .retain(|_, secret| !owned_by_agent(secret.owner_references()));
    }

    pub fn agent(&self, key: &ObjectKey) -> Option<Agent> {
        self.state.lock().agents.get(key).cloned()
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.state.lock().namespaces.contains(name)
    }

    pub fn secret(&self, key: &ObjectKey) -> Option<Secret> {
        self.state.lock().secrets.get(key).cloned()
    }

    pub fn pod(&self, key: &ObjectKey) -> Option<Pod> {
        self.state.lock().pods.get(key).cloned()
    }

    /// Simulate the kubelet reporting a pod phase.
    pub fn set_pod_phase(&self, key: &ObjectKey, phase: &str, reason: Option<&str>) {
        let mut state = self.state.lock();
        let version = state.next_version();
        if let Some(pod) = state.pods.get_mut(key) {
            pod.status = Some(PodStatus {
                phase: Some(phase.to_string()),
                reason: reason.map(str::to_string),
                ..Default::default()
            });
            pod.metadata.resource_version = Some(version);
        }
    }

    /// Remove a pod without going through the API, as an external actor
    /// would.
    pub fn remove_pod(&self, key: &ObjectKey) {
        self.state.lock().pods.remove(key);
    }

    /// Make the next `n` status writes fail with a conflict.
    pub fn inject_status_conflicts(&self, n: u32) {
        self.state.lock().injected_conflicts = n;
    }

    pub fn fail_pod_creates(&self, fail: bool) {
        self.state.lock().fail_pod_creates = fail;
    }

    pub fn fail_pod_deletes(&self, fail: bool) {
        self.state.lock().fail_pod_deletes = fail;
    }

    pub fn calls(&self) -> CallCounts {
        self.state.lock().calls.clone()
    }
}

fn injected_failure(what: &str) -> ClusterError {
    ClusterError::Api(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("[MOCK] {what} configured to fail"),
        reason: "InternalError".to_string(),
        code: 500,
    }))
}

#[async_trait]
impl ClusterApi for MockCluster {
    async fn get_agent(&self, key: &ObjectKey) -> ClusterResult<Option<Agent>> {
        Ok(self.agent(key))
    }

    async fn find_agent(&self, name: &str) -> ClusterResult<Option<Agent>> {
        let state = self.state.lock();
        Ok(state.agents.values().find(|a| a.name_any() == name).cloned())
    }

    async fn replace_agent_status(&self, agent: &Agent) -> ClusterResult<Agent> {
        let key = agent.key();
        let mut state = self.state.lock();

        if state.injected_conflicts > 0 {
            state.injected_conflicts -= 1;
            return Err(ClusterError::Conflict(format!("[MOCK] injected conflict on {key}")));
        }

        let version = state.next_version();
        let stored = state
            .agents
            .get_mut(&key)
            .ok_or_else(|| ClusterError::NotFound(format!("agents {key}")))?;
        if stored.metadata.resource_version != agent.metadata.resource_version {
            return Err(ClusterError::Conflict(format!(
                "agents {key}: the object has been modified"
            )));
        }

        stored.status = agent.status.clone();
        stored.metadata.resource_version = Some(version);
        let stored = stored.clone();
        state.calls.status_writes += 1;

        debug!(agent = %key, "[MOCK] Replaced agent status");
        Ok(stored)
    }

    async fn get_namespace(&self, name: &str) -> ClusterResult<Option<Namespace>> {
        if !self.has_namespace(name) {
            return Ok(None);
        }
        let mut ns = Namespace::default();
        ns.metadata.name = Some(name.to_string());
        Ok(Some(ns))
    }

    async fn create_namespace(&self, namespace: &Namespace) -> ClusterResult<()> {
        let name = namespace.name_any();
        let mut state = self.state.lock();
        if !state.namespaces.insert(name.clone()) {
            return Err(ClusterError::AlreadyExists(format!("namespaces {name}")));
        }
        state.calls.namespace_creates += 1;
        Ok(())
    }

    async fn get_secret(&self, key: &ObjectKey) -> ClusterResult<Option<Secret>> {
        Ok(self.secret(key))
    }

    async fn create_secret(&self, secret: &Secret) -> ClusterResult<()> {
        let key = key_of(&secret.metadata);
        let mut state = self.state.lock();
        if state.secrets.contains_key(&key) {
            return Err(ClusterError::AlreadyExists(format!("secrets {key}")));
        }
        let mut secret = into_stored_secret(secret.clone());
        secret.metadata.resource_version = Some(state.next_version());
        state.secrets.insert(key, secret);
        state.calls.secret_creates += 1;
        Ok(())
    }

    async fn replace_secret(&self, secret: &Secret) -> ClusterResult<()> {
        let key = key_of(&secret.metadata);
        let mut state = self.state.lock();
        if !state.secrets.contains_key(&key) {
            return Err(ClusterError::NotFound(format!("secrets {key}")));
        }
        let mut secret = into_stored_secret(secret.clone());
        secret.metadata.resource_version = Some(state.next_version());
        state.secrets.insert(key, secret);
        state.calls.secret_replaces += 1;
        Ok(())
    }

    async fn get_pod(&self, key: &ObjectKey) -> ClusterResult<Option<Pod>> {
        Ok(self.pod(key))
    }

    async fn create_pod(&self, pod: &Pod) -> ClusterResult<()> {
        let key = key_of(&pod.metadata);
        let mut state = self.state.lock();
        if state.fail_pod_creates {
            return Err(injected_failure("pod create"));
        }
        if state.pods.contains_key(&key) {
            return Err(ClusterError::AlreadyExists(format!("pods {key}")));
        }
        let mut pod = pod.clone();
        pod.metadata.resource_version = Some(state.next_version());
        pod.status = Some(PodStatus {
            phase: Some("Pending".to_string()),
            ..Default::default()
        });
        state.pods.insert(key, pod);
        state.calls.pod_creates += 1;
        Ok(())
    }

    async fn delete_pod(&self, key: &ObjectKey) -> ClusterResult<()> {
        let mut state = self.state.lock();
        if state.fail_pod_deletes {
            return Err(injected_failure("pod delete"));
        }
        state
            .pods
            .remove(key)
            .ok_or_else(|| ClusterError::NotFound(format!("pods {key}")))?;
        state.calls.pod_deletes += 1;
        Ok(())
    }
}

/// The API server folds `stringData` into `data` on write.
fn into_stored_secret(mut secret: Secret) -> Secret {
    if let Some(string_data) = secret.string_data.take() {
        let data = secret.data.get_or_insert_with(BTreeMap::new);
        for (k, v) in string_data {
            data.insert(k, k8s_openapi::ByteString(v.into_bytes()));
        }
    }
    secret
}
