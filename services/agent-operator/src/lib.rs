//! agentbox agent operator library.
//!
//! This crate primarily ships the `agent-operator` binary, but we expose the
//! reconciler, messaging bridge and in-memory fakes to enable integration
//! testing.

pub mod api;
pub mod bridge;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod crd;
pub mod db;
pub mod naming;
pub mod pod;
pub mod provisioner;
pub mod state;
pub mod status;
