//! Backing pod construction.

use std::collections::BTreeMap;

use agentbox_credentials::StoreKind;
use k8s_openapi::api::core::v1::{
    Container, EnvVar, Pod, PodSpec, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use thiserror::Error;

use crate::crd::Agent;
use crate::naming;

/// Name of the agent container within the pod.
pub const CONTAINER_NAME: &str = "agent";

pub const ENV_AGENT_ID: &str = "AGENT_ID";
pub const ENV_AGENT_TYPE: &str = "AGENT_TYPE";

/// Pod construction errors.
#[derive(Debug, Error)]
pub enum PodError {
    /// The Agent has no uid yet, so an owner reference can't be formed.
    #[error("agent {0} has no uid")]
    MissingUid(String),
}

/// Restart policy for the agent container: one-shot agents never restart
/// in place, long-running ones restart on failure within the pod's lifetime.
pub fn restart_policy(run_once: bool) -> &'static str {
    if run_once {
        "Never"
    } else {
        "OnFailure"
    }
}

/// Labels carried by every agent pod.
pub fn pod_labels(agent: &Agent) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), "agent".to_string()),
        ("agent-name".to_string(), agent.name_any()),
        ("agent-type".to_string(), agent.agent_type().to_string()),
    ])
}

/// Build the backing pod for `agent`, mounting one read-only volume per
/// credential secret in `credentials`.
pub fn build_pod(agent: &Agent, credentials: &[StoreKind]) -> Result<Pod, PodError> {
    let owner = agent
        .controller_owner_ref(&())
        .ok_or_else(|| PodError::MissingUid(agent.name_any()))?;
    let agent_type = agent.agent_type();

    let mut env: Vec<EnvVar> = agent
        .spec
        .env
        .iter()
        .map(|var| EnvVar {
            name: var.name.clone(),
            value: Some(var.value.clone()),
            ..Default::default()
        })
        .collect();
    env.push(EnvVar {
        name: ENV_AGENT_ID.to_string(),
        value: Some(agent.name_any()),
        ..Default::default()
    });
    env.push(EnvVar {
        name: ENV_AGENT_TYPE.to_string(),
        value: Some(agent_type.to_string()),
        ..Default::default()
    });

    let volumes: Vec<Volume> = credentials
        .iter()
        .map(|kind| Volume {
            name: kind.volume_name(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(kind.secret_name(agent_type)),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect();
    let mounts: Vec<VolumeMount> = credentials
        .iter()
        .map(|kind| VolumeMount {
            name: kind.volume_name(),
            mount_path: kind.mount_path(),
            read_only: Some(true),
            ..Default::default()
        })
        .collect();

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(naming::pod_name(&agent.name_any())),
            namespace: agent.namespace(),
            labels: Some(pod_labels(agent)),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some(restart_policy(agent.spec.run_once).to_string()),
            containers: vec![Container {
                name: CONTAINER_NAME.to_string(),
                image: Some(agent.spec.image.clone()),
                env: Some(env),
                volume_mounts: (!mounts.is_empty()).then_some(mounts),
                ..Default::default()
            }],
            volumes: (!volumes.is_empty()).then_some(volumes),
            ..Default::default()
        }),
        status: None,
    })
}
