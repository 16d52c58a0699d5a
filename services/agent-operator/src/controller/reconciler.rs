//! Agent reconciler.
//!
//! One pass converges a single Agent:
//! 1. Ensure the class namespace exists
//! 2. Ensure the class credential secrets exist
//! 3. Ensure the backing pod exists, or derive the phase from it
//! 4. Apply the restart budget to failed long-running agents
//! 5. Publish the derived status if it changed
//!
//! Passes are level-triggered: everything is re-derived from what the
//! cluster currently holds, so a missed event heals on the next pass.

use std::sync::Arc;

use agentbox_reconcile::{
    RestartBudget, RestartDecision, Requeue, PROVISION_RETRY_DELAY, RESTART_REQUEUE_DELAY,
};
use k8s_openapi::api::core::v1::{Namespace, Pod};
use tracing::{debug, info, instrument, warn};

use crate::cluster::{ClusterApi, ClusterError, ObjectKey};
use crate::crd::{Agent, AgentPhase, FailureReason};
use crate::naming;
use crate::pod::{build_pod, PodError};
use crate::provisioner::CredentialProvisioner;
use crate::status::{StatusError, StatusUpdate, StatusUpdater, StatusWrite};

/// Result type for reconciliation.
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Errors that end a pass early and are retried by the worker.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("status update failed: {0}")]
    Status(#[from] StatusError),

    #[error(transparent)]
    Pod(#[from] PodError),
}

/// Phase, message and failure cause observed from a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodObservation {
    pub phase: AgentPhase,
    pub message: String,
    pub reason: Option<FailureReason>,
}

impl PodObservation {
    fn into_update(self) -> StatusUpdate {
        StatusUpdate {
            phase: self.phase,
            message: self.message,
            reason: self.reason,
            restart_count: None,
        }
    }
}

/// Map a pod's reported phase to the Agent's phase.
pub fn observe_pod(run_once: bool, pod: &Pod) -> PodObservation {
    let status = pod.status.as_ref();
    let phase = status.and_then(|s| s.phase.as_deref()).unwrap_or("Pending");
    let pod_reason = status
        .and_then(|s| s.reason.as_deref())
        .filter(|r| !r.is_empty())
        .unwrap_or("Unknown");

    let (phase, message, reason) = match phase {
        "Running" => (AgentPhase::Running, "Agent pod is running".to_string(), None),
        "Succeeded" if run_once => (
            AgentPhase::Completed,
            "Agent pod completed successfully".to_string(),
            None,
        ),
        "Succeeded" => (
            AgentPhase::Failed,
            "Long-running agent pod completed unexpectedly".to_string(),
            Some(FailureReason::UnexpectedExit),
        ),
        "Failed" => (
            AgentPhase::Failed,
            format!("Agent pod failed: {pod_reason}"),
            Some(FailureReason::PodFailed),
        ),
        "Pending" => (AgentPhase::Pending, "Agent pod is pending".to_string(), None),
        other => (
            AgentPhase::Pending,
            format!("Agent pod in unknown phase: {other}"),
            None,
        ),
    };
    PodObservation {
        phase,
        message,
        reason,
    }
}

/// Converges Agents towards their declared state.
#[derive(Clone)]
pub struct AgentReconciler {
    cluster: Arc<dyn ClusterApi>,
    provisioner: CredentialProvisioner,
    status: StatusUpdater,
}

impl AgentReconciler {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        provisioner: CredentialProvisioner,
        status: StatusUpdater,
    ) -> Self {
        Self {
            cluster,
            provisioner,
            status,
        }
    }

    /// Run one reconciliation pass for the Agent at `key`.
    #[instrument(skip(self), fields(agent = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> ReconcileResult<Requeue> {
        let Some(agent) = self.cluster.get_agent(key).await? else {
            debug!("Agent not found; already deleted");
            return Ok(Requeue::Done);
        };

        let class_namespace = naming::class_namespace(agent.agent_type());
        self.ensure_namespace(&class_namespace).await?;
        if key.namespace != class_namespace {
            warn!(
                namespace = %key.namespace,
                expected_namespace = %class_namespace,
                "Agent is not in its class namespace; leaving it in place"
            );
            return Ok(Requeue::Done);
        }

        let credentials = match self.provisioner.ensure_all(&agent).await {
            Ok(kinds) => kinds,
            Err(e) => {
                warn!(error = %e, "Credential provisioning failed");
                let update = StatusUpdate::failed(
                    FailureReason::ProvisioningFailed,
                    format!("Failed to provision credentials: {e}"),
                );
                self.publish(key, &update).await?;
                return Ok(Requeue::After(PROVISION_RETRY_DELAY));
            }
        };

        let pod_key = ObjectKey::new(&key.namespace, naming::pod_name(&key.name));
        let Some(pod) = self.cluster.get_pod(&pod_key).await? else {
            return self.create_pod(&agent, &credentials, &pod_key).await;
        };

        if pod.metadata.deletion_timestamp.is_some() {
            debug!(pod = %pod_key, "Pod is terminating; waiting for it to go away");
            return Ok(Requeue::After(RESTART_REQUEUE_DELAY));
        }

        let observed = observe_pod(agent.spec.run_once, &pod);
        if observed.phase == AgentPhase::Failed && !agent.spec.run_once {
            return self.apply_restart_policy(&agent, &pod_key, observed).await;
        }

        self.publish(key, &observed.into_update()).await?;
        Ok(Requeue::Done)
    }

    /// Create the class namespace if it is absent.
    async fn ensure_namespace(&self, name: &str) -> ReconcileResult<()> {
        if self.cluster.get_namespace(name).await?.is_some() {
            return Ok(());
        }

        let mut namespace = Namespace::default();
        namespace.metadata.name = Some(name.to_string());
        match self.cluster.create_namespace(&namespace).await {
            Ok(()) => {
                info!(namespace = %name, "Created class namespace");
                Ok(())
            }
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_pod(
        &self,
        agent: &Agent,
        credentials: &[agentbox_credentials::StoreKind],
        pod_key: &ObjectKey,
    ) -> ReconcileResult<Requeue> {
        let key = agent.key();
        if agent.is_terminal() {
            debug!(phase = ?agent.phase(), "Agent is terminal; not recreating pod");
            return Ok(Requeue::Done);
        }

        let pod = build_pod(agent, credentials)?;
        match self.cluster.create_pod(&pod).await {
            Ok(()) => {
                info!(pod = %pod_key, image = %agent.spec.image, "Created agent pod");
            }
            Err(e) if e.is_already_exists() => {
                // Created by a concurrent pass; observe it next time round.
                return Ok(Requeue::Immediately);
            }
            Err(e) => {
                let update = StatusUpdate::failed(
                    FailureReason::PodCreateFailed,
                    format!("Failed to create pod: {e}"),
                );
                self.publish(&key, &update).await?;
                return Err(e.into());
            }
        }

        let update = StatusUpdate::new(AgentPhase::Pending, "Pod created, waiting for it to start");
        self.publish(&key, &update).await?;
        Ok(Requeue::Done)
    }

    async fn apply_restart_policy(
        &self,
        agent: &Agent,
        pod_key: &ObjectKey,
        observed: PodObservation,
    ) -> ReconcileResult<Requeue> {
        let key = agent.key();
        let budget = RestartBudget::new(agent.spec.max_restarts);

        match budget.evaluate(agent.restart_count()) {
            RestartDecision::Restart { attempt } => {
                match self.cluster.delete_pod(pod_key).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        let update = StatusUpdate::failed(
                            FailureReason::RestartFailed,
                            format!("Failed to delete pod for restart: {e}"),
                        );
                        self.publish(&key, &update).await?;
                        return Err(e.into());
                    }
                }

                info!(
                    attempt,
                    max_restarts = agent.spec.max_restarts,
                    cause = %observed.message,
                    "Restarting agent pod"
                );
                let update = StatusUpdate::new(
                    AgentPhase::Pending,
                    format!("Restarting pod (attempt {attempt})"),
                )
                .with_restart_count(attempt);
                self.publish(&key, &update).await?;
                Ok(Requeue::After(RESTART_REQUEUE_DELAY))
            }
            RestartDecision::Exhausted { max_restarts } => {
                let cause = observed
                    .message
                    .strip_prefix("Agent pod failed: ")
                    .unwrap_or(&observed.message);
                let update = StatusUpdate::failed(
                    FailureReason::RestartBudgetExhausted,
                    format!("Agent pod failed and exceeded max restarts ({max_restarts}): {cause}"),
                );
                if self.publish(&key, &update).await? == StatusWrite::Written {
                    warn!(max_restarts, "Restart budget exhausted");
                }
                Ok(Requeue::Done)
            }
        }
    }

    async fn publish(&self, key: &ObjectKey, update: &StatusUpdate) -> ReconcileResult<StatusWrite> {
        Ok(self.status.update(key, update).await?)
    }
}
