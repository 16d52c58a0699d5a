//! Watch-driven controller loop.
//!
//! Agents and the pods they own are watched cluster-wide. Any change to
//! either queues a pass for the owning Agent; kube-runtime keeps at most
//! one pass in flight per Agent and coalesces events that arrive while one
//! is running.

use std::sync::Arc;
use std::time::Duration;

use agentbox_reconcile::Requeue;
use futures_util::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::Client;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::reconciler::{AgentReconciler, ReconcileError};
use crate::crd::Agent;

/// Delay before retrying a pass that returned an error.
pub const ERROR_REQUEUE_DELAY: Duration = Duration::from_secs(10);

/// Label selector for pods the operator owns.
const POD_SELECTOR: &str = "app=agent";

struct Context {
    reconciler: AgentReconciler,
}

/// Runs [`AgentReconciler`] from cluster watch events.
pub struct ControllerWorker {
    client: Client,
    reconciler: AgentReconciler,
}

impl ControllerWorker {
    pub fn new(client: Client, reconciler: AgentReconciler) -> Self {
        Self { client, reconciler }
    }

    /// Run the controller until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting agent controller");

        let agents: Api<Agent> = Api::all(self.client.clone());
        let pods: Api<Pod> = Api::all(self.client.clone());
        let context = Arc::new(Context {
            reconciler: self.reconciler,
        });

        let controller = Controller::new(agents, watcher::Config::default())
            .owns(pods, watcher::Config::default().labels(POD_SELECTOR))
            .run(reconcile, error_policy, context)
            .for_each(|result| async move {
                match result {
                    Ok((agent, action)) => {
                        debug!(agent = %agent.name, ?action, "Reconciled agent");
                    }
                    Err(e) => {
                        warn!(error = %e, "Agent controller error");
                    }
                }
            });

        tokio::select! {
            _ = controller => {
                warn!("Agent controller stream ended");
            }
            _ = wait_for_shutdown(&mut shutdown) => {
                info!("Agent controller shutting down");
            }
        }
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn reconcile(agent: Arc<Agent>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let requeue = ctx.reconciler.reconcile(&agent.key()).await?;
    Ok(to_action(requeue))
}

fn error_policy(agent: Arc<Agent>, error: &ReconcileError, _ctx: Arc<Context>) -> Action {
    warn!(
        agent = %agent.key(),
        error = %error,
        retry_secs = ERROR_REQUEUE_DELAY.as_secs(),
        "Reconciliation failed"
    );
    Action::requeue(ERROR_REQUEUE_DELAY)
}

/// Translate a requeue hint into a controller action.
pub fn to_action(requeue: Requeue) -> Action {
    match requeue.delay() {
        None => Action::await_change(),
        Some(delay) => Action::requeue(delay),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requeue_to_action() {
        assert_eq!(to_action(Requeue::Done), Action::await_change());
        assert_eq!(
            to_action(Requeue::After(Duration::from_secs(30))),
            Action::requeue(Duration::from_secs(30))
        );
        assert_eq!(
            to_action(Requeue::Immediately),
            Action::requeue(Duration::ZERO)
        );
    }

    #[tokio::test]
    async fn test_wait_for_shutdown_returns_on_signal() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { wait_for_shutdown(&mut rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
