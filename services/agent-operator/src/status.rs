//! The single write path for Agent status.
//!
//! Every write re-reads the Agent, changes only the fields the caller set,
//! and replaces the status subresource under the fresh resource version.
//! Conflicts are retried with bounded backoff. The restart counter never
//! decreases, whatever the caller asks for.

use std::sync::Arc;

use agentbox_reconcile::{ConflictBackoff, RetryError};
use tracing::debug;

use crate::cluster::{ClusterApi, ClusterError, ObjectKey};
use crate::crd::{AgentPhase, AgentStatus, FailureReason};

/// Error from the status path.
pub type StatusError = RetryError<ClusterError>;

/// A requested status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub phase: AgentPhase,
    pub message: String,
    pub reason: Option<FailureReason>,
    pub restart_count: Option<i32>,
}

impl StatusUpdate {
    pub fn new(phase: AgentPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            reason: None,
            restart_count: None,
        }
    }

    pub fn failed(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason: Some(reason),
            ..Self::new(AgentPhase::Failed, message)
        }
    }

    pub fn with_restart_count(mut self, restart_count: i32) -> Self {
        self.restart_count = Some(restart_count);
        self
    }

    /// The status that results from applying this update to `current`.
    pub fn apply_to(&self, current: &AgentStatus) -> AgentStatus {
        let restart_count = match self.restart_count {
            Some(n) => n.max(current.restart_count),
            None => current.restart_count,
        };
        let reason = if self.phase == AgentPhase::Failed {
            self.reason
        } else {
            None
        };
        AgentStatus {
            phase: Some(self.phase),
            message: self.message.clone(),
            restart_count,
            reason,
        }
    }
}

/// Result of a status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWrite {
    Written,
    /// The stored status already matched; nothing was sent.
    Unchanged,
    /// The Agent was deleted in the meantime.
    AgentGone,
}

/// Writes Agent status with conflict retries.
#[derive(Clone)]
pub struct StatusUpdater {
    cluster: Arc<dyn ClusterApi>,
    backoff: ConflictBackoff,
}

impl StatusUpdater {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self {
            cluster,
            backoff: ConflictBackoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: ConflictBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Apply `update` to the Agent at `key`.
    pub async fn update(
        &self,
        key: &ObjectKey,
        update: &StatusUpdate,
    ) -> Result<StatusWrite, StatusError> {
        self.backoff
            .retry_on_conflict(ClusterError::is_conflict, |attempt| {
                self.try_update(key, update, attempt)
            })
            .await
    }

    async fn try_update(
        &self,
        key: &ObjectKey,
        update: &StatusUpdate,
        attempt: u32,
    ) -> Result<StatusWrite, ClusterError> {
        let Some(mut agent) = self.cluster.get_agent(key).await? else {
            return Ok(StatusWrite::AgentGone);
        };

        let current = agent.status.clone().unwrap_or_default();
        let desired = update.apply_to(&current);
        if agent.status.is_some() && desired == current {
            return Ok(StatusWrite::Unchanged);
        }

        agent.status = Some(desired);
        match self.cluster.replace_agent_status(&agent).await {
            Ok(_) => {
                debug!(
                    agent = %key,
                    phase = %update.phase,
                    attempt,
                    "Updated agent status"
                );
                Ok(StatusWrite::Written)
            }
            Err(e) if e.is_not_found() => Ok(StatusWrite::AgentGone),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockCluster;
    use crate::crd::{Agent, AgentSpec};
    use std::time::Duration;

    fn apply_agent(cluster: &MockCluster) -> ObjectKey {
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
        agent.metadata.namespace = Some("default".to_string());
        cluster.apply_agent(agent).key()
    }

    fn fast_backoff() -> ConflictBackoff {
        ConflictBackoff {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[test]
    fn test_restart_count_never_decreases() {
        let current = AgentStatus {
            phase: Some(AgentPhase::Running),
            restart_count: 3,
            ..Default::default()
        };
        let update = StatusUpdate::new(AgentPhase::Pending, "Restarting").with_restart_count(1);
        assert_eq!(update.apply_to(&current).restart_count, 3);

        let kept = StatusUpdate::new(AgentPhase::Running, "Agent pod is running");
        assert_eq!(kept.apply_to(&current).restart_count, 3);
    }

    #[test]
    fn test_reason_cleared_outside_failed() {
        let current = AgentStatus {
            phase: Some(AgentPhase::Failed),
            reason: Some(FailureReason::ProvisioningFailed),
            ..Default::default()
        };
        let update = StatusUpdate::new(AgentPhase::Pending, "Pod created");
        assert_eq!(update.apply_to(&current).reason, None);
    }

    #[tokio::test]
    async fn test_identical_update_is_not_written() {
        let cluster = Arc::new(MockCluster::new());
        let key = apply_agent(&cluster);
        let updater = StatusUpdater::new(cluster.clone());
        let update = StatusUpdate::new(AgentPhase::Running, "Agent pod is running");

        assert_eq!(updater.update(&key, &update).await.unwrap(), StatusWrite::Written);
        assert_eq!(updater.update(&key, &update).await.unwrap(), StatusWrite::Unchanged);
        assert_eq!(cluster.calls().status_writes, 1);
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let cluster = Arc::new(MockCluster::new());
        let key = apply_agent(&cluster);
        cluster.inject_status_conflicts(2);
        let updater = StatusUpdater::new(cluster.clone()).with_backoff(fast_backoff());

        let update = StatusUpdate::new(AgentPhase::Pending, "Pod created, waiting for it to start");
        assert_eq!(updater.update(&key, &update).await.unwrap(), StatusWrite::Written);
        assert_eq!(cluster.agent(&key).unwrap().phase(), Some(AgentPhase::Pending));
    }

    #[tokio::test]
    async fn test_conflict_budget_exhausted() {
        let cluster = Arc::new(MockCluster::new());
        let key = apply_agent(&cluster);
        cluster.inject_status_conflicts(10);
        let updater = StatusUpdater::new(cluster.clone()).with_backoff(fast_backoff());

        let update = StatusUpdate::new(AgentPhase::Pending, "Pod created");
        let err = updater.update(&key, &update).await.unwrap_err();
        assert!(matches!(err, RetryError::Exhausted { attempts: 5, .. }));
    }

    #[tokio::test]
    async fn test_deleted_agent_is_noop() {
        let cluster = Arc::new(MockCluster::new());
        let updater = StatusUpdater::new(cluster.clone());
        let update = StatusUpdate::new(AgentPhase::Running, "Agent pod is running");

        let result = updater
            .update(&ObjectKey::new("default", "missing"), &update)
            .await
            .unwrap();
        assert_eq!(result, StatusWrite::AgentGone);
    }
}
