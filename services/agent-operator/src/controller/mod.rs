//! Agent reconciliation.
//!
//! `reconciler` holds the convergence logic for a single Agent and is
//! independent of how passes are triggered; `worker` drives it from
//! Kubernetes watch events.

mod reconciler;
mod worker;

pub use reconciler::{observe_pod, AgentReconciler, PodObservation, ReconcileError, ReconcileResult};
pub use worker::{to_action, ControllerWorker, ERROR_REQUEUE_DELAY};
