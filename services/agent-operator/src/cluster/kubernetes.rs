//! kube-rs implementation of [`ClusterApi`].

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod, Secret};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

use super::{key_of, ClusterApi, ClusterError, ClusterResult, ObjectKey};
use crate::crd::Agent;

/// Cluster access through the Kubernetes API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Wrap an existing client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the in-cluster or kubeconfig environment.
    pub async fn try_default() -> ClusterResult<Self> {
        let client = Client::try_default().await.map_err(ClusterError::Api)?;
        Ok(Self { client })
    }

    /// The underlying client, for the watch machinery.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn agents(&self, namespace: &str) -> Api<Agent> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_agent(&self, key: &ObjectKey) -> ClusterResult<Option<Agent>> {
        Ok(self.agents(&key.namespace).get_opt(&key.name).await?)
    }

    async fn find_agent(&self, name: &str) -> ClusterResult<Option<Agent>> {
        let api: Api<Agent> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("metadata.name={name}"));
        let list = api.list(&params).await?;
        Ok(list.items.into_iter().next())
    }

    async fn replace_agent_status(&self, agent: &Agent) -> ClusterResult<Agent> {
        let key = agent.key();
        let body = serde_json::to_vec(agent)?;
        let stored = self
            .agents(&key.namespace)
            .replace_status(&key.name, &PostParams::default(), body)
            .await?;
        debug!(
            agent = %key,
            resource_version = ?stored.resource_version(),
            "Replaced agent status"
        );
        Ok(stored)
    }

    async fn get_namespace(&self, name: &str) -> ClusterResult<Option<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn create_namespace(&self, namespace: &Namespace) -> ClusterResult<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.create(&PostParams::default(), namespace).await?;
        Ok(())
    }

    async fn get_secret(&self, key: &ObjectKey) -> ClusterResult<Option<Secret>> {
        Ok(self.secrets(&key.namespace).get_opt(&key.name).await?)
    }

    async fn create_secret(&self, secret: &Secret) -> ClusterResult<()> {
        let key = key_of(&secret.metadata);
        self.secrets(&key.namespace)
            .create(&PostParams::default(), secret)
            .await?;
        Ok(())
    }

    async fn replace_secret(&self, secret: &Secret) -> ClusterResult<()> {
        let key = key_of(&secret.metadata);
        self.secrets(&key.namespace)
            .replace(&key.name, &PostParams::default(), secret)
            .await?;
        Ok(())
    }

    async fn get_pod(&self, key: &ObjectKey) -> ClusterResult<Option<Pod>> {
        Ok(self.pods(&key.namespace).get_opt(&key.name).await?)
    }

    async fn create_pod(&self, pod: &Pod) -> ClusterResult<()> {
        let key = key_of(&pod.metadata);
        self.pods(&key.namespace)
            .create(&PostParams::default(), pod)
            .await?;
        Ok(())
    }

    async fn delete_pod(&self, key: &ObjectKey) -> ClusterResult<()> {
        self.pods(&key.namespace)
            .delete(&key.name, &DeleteParams::background())
            .await?;
        Ok(())
    }
}
