//! The `Agent` custom resource.
//!
//! An Agent is a declared workload instance: a container image of a given
//! class (`type`) that either runs to completion (`runOnce`) or runs
//! continuously under a restart budget (`maxRestarts`).
//!
//! Status is written only by the controller's status path. `phase` is
//! derived from the backing pod on every pass; `restartCount` only grows.

use std::fmt;

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::cluster::ObjectKey;

fn default_max_restarts() -> i32 {
    5
}

/// Desired state of an Agent.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "agents.algoluna.com",
    version = "v1alpha1",
    kind = "Agent",
    plural = "agents",
    namespaced,
    status = "AgentStatus",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    /// Workload class, e.g. `scouting-agent`. Determines the namespace and
    /// the shared datastore identities.
    #[serde(rename = "type")]
    pub agent_type: String,

    /// Container image reference.
    pub image: String,

    /// Extra environment variables for the agent container.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<AgentEnvVar>,

    /// One-shot (`true`) or long-running (`false`).
    #[serde(default)]
    pub run_once: bool,

    /// Restart budget for long-running agents; `-1` means unlimited.
    /// Ignored when `runOnce` is set.
    #[serde(default = "default_max_restarts")]
    #[schemars(range(min = -1))]
    pub max_restarts: i32,

    /// Idle lifetime in seconds before automatic deletion. `0` disables it.
    /// Accepted and stored; not enforced by the controller.
    #[serde(default)]
    pub ttl: i64,

    /// Last time the agent was actively used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema_ref: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema_ref: Option<String>,
}

/// A name/value environment variable.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct AgentEnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// Observed state of an Agent.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<AgentPhase>,

    /// Human-readable diagnostic.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Operator-driven restarts so far. Long-running agents only.
    #[serde(default)]
    pub restart_count: i32,

    /// Why the agent is Failed, when it is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
}

/// Agent lifecycle phase.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum AgentPhase {
    Pending,
    Running,
    Completed,
    Failed,
}

impl AgentPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        }
    }
}

impl fmt::Display for AgentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cause of a Failed phase.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum FailureReason {
    /// Datastore credentials could not be issued. Retried on a schedule.
    ProvisioningFailed,
    /// The backing pod could not be created.
    PodCreateFailed,
    /// The backing pod reported phase Failed.
    PodFailed,
    /// A long-running agent's pod exited cleanly.
    UnexpectedExit,
    /// The failed pod could not be deleted for a restart.
    RestartFailed,
    /// The restart budget is spent. Terminal.
    RestartBudgetExhausted,
}

impl FailureReason {
    /// Whether the controller keeps retrying after this failure.
    pub fn is_retried(&self) -> bool {
        matches!(
            self,
            Self::ProvisioningFailed | Self::PodCreateFailed | Self::RestartFailed
        )
    }
}

impl Agent {
    /// Namespace/name of this object.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    pub fn agent_type(&self) -> &str {
        &self.spec.agent_type
    }

    pub fn phase(&self) -> Option<AgentPhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    pub fn message(&self) -> &str {
        self.status.as_ref().map(|s| s.message.as_str()).unwrap_or("")
    }

    pub fn reason(&self) -> Option<FailureReason> {
        self.status.as_ref().and_then(|s| s.reason)
    }

    pub fn restart_count(&self) -> i32 {
        self.status.as_ref().map(|s| s.restart_count).unwrap_or(0)
    }

    /// Whether the agent has reached a phase in which a missing pod must
    /// not be recreated.
    ///
    /// Failures caused by the operator's own steps are not terminal: those
    /// steps are retried, and once they succeed the pod still has to exist.
    pub fn is_terminal(&self) -> bool {
        match self.phase() {
            Some(AgentPhase::Completed) => true,
            Some(AgentPhase::Failed) => !self.reason().is_some_and(|r| r.is_retried()),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    fn agent_with_status(status: Option<AgentStatus>) -> Agent {
        let mut agent = Agent::new(
            "scout-1",
            AgentSpec {
                agent_type: "scouting-agent".to_string(),
                image: "scout:latest".to_string(),
                env: vec![],
                run_once: false,
                max_restarts: 5,
                ttl: 0,
                last_activity_time: None,
                input_schema_ref: None,
                output_schema_ref: None,
            },
        );
        agent.status = status;
        agent
    }

    #[test]
    fn test_spec_defaults() {
        let spec: AgentSpec = serde_json::from_value(serde_json::json!({
            "type": "scouting-agent",
            "image": "scout:latest"
        }))
        .unwrap();

        assert!(!spec.run_once);
        assert_eq!(spec.max_restarts, 5);
        assert_eq!(spec.ttl, 0);
        assert!(spec.env.is_empty());
    }

    #[test]
    fn test_status_wire_format() {
        let status = AgentStatus {
            phase: Some(AgentPhase::Failed),
            message: "Agent pod failed: Evicted".to_string(),
            restart_count: 2,
            reason: Some(FailureReason::PodFailed),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["phase"], "Failed");
        assert_eq!(json["restartCount"], 2);
        assert_eq!(json["reason"], "PodFailed");
    }

    #[test]
    fn test_terminal_phases() {
        let status = |phase, reason| {
            Some(AgentStatus {
                phase: Some(phase),
                reason,
                ..Default::default()
            })
        };

        assert!(!agent_with_status(None).is_terminal());
        assert!(!agent_with_status(status(AgentPhase::Pending, None)).is_terminal());
        assert!(!agent_with_status(status(AgentPhase::Running, None)).is_terminal());
        assert!(agent_with_status(status(AgentPhase::Completed, None)).is_terminal());
        assert!(
            agent_with_status(status(AgentPhase::Failed, Some(FailureReason::PodFailed)))
                .is_terminal()
        );
        assert!(agent_with_status(status(
            AgentPhase::Failed,
            Some(FailureReason::RestartBudgetExhausted)
        ))
        .is_terminal());
        for reason in [
            FailureReason::ProvisioningFailed,
            FailureReason::PodCreateFailed,
            FailureReason::RestartFailed,
        ] {
            assert!(!agent_with_status(status(AgentPhase::Failed, Some(reason))).is_terminal());
        }
    }

    #[test]
    fn test_crd_shape() {
        let crd = Agent::crd();
        assert_eq!(crd.spec.group, "agents.algoluna.com");
        assert_eq!(crd.spec.names.kind, "Agent");
        assert_eq!(crd.spec.scope, "Namespaced");
        let version = &crd.spec.versions[0];
        assert_eq!(version.name, "v1alpha1");
        assert!(version.subresources.as_ref().and_then(|s| s.status.as_ref()).is_some());
        assert_eq!(version.additional_printer_columns.as_ref().map(Vec::len), Some(3));
    }

    #[test]
    fn test_max_restarts_schema_floor_is_unlimited() {
        let crd = serde_json::to_value(Agent::crd()).unwrap();
        let minimum = crd.pointer(
            "/spec/versions/0/schema/openAPIV3Schema/properties/spec/properties/maxRestarts/minimum",
        );
        assert_eq!(minimum.and_then(serde_json::Value::as_f64), Some(-1.0));
    }
}
