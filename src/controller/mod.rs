//! Controller module for fleet-upgrade-operator.
//!
//! The engine (`batch_orchestrator` and the state machines it drives) only
//! talks to the outside world through the traits in `collaborators`;
//! `kube_collaborators` implements them against the hub API server and
//! `upgrade_reconciler` plugs the engine into the kube-rs controller.

// Shared modules
pub mod common;
pub mod conditions;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod status;

// Engine
pub mod backup_state_machine;
pub mod batch_orchestrator;
pub mod collaborators;
pub mod job_phase;
pub mod policy_progression;
pub mod precache_state_machine;
pub mod remediation_plan;
pub mod validation;

// Kubernetes wiring
pub mod kube_collaborators;
pub mod upgrade_reconciler;
