// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Functional tests for the remediation engine.
//!
//! These tests drive `BatchOrchestrator::run_pass` over many passes against an
//! in-memory fleet, WITHOUT requiring a hub cluster. The fleet scripts policy
//! compliance and remote job outcomes; the engine code under test is the
//! production code.
//!
//! ```bash
//! # Run all functional tests
//! cargo test --test functional
//!
//! # Run a single scenario
//! cargo test --test functional test_two_cluster_upgrade
//! ```
//!
//! ## Test Categories
//!
//! - **Scenario tests**: batches, canaries, soak, timeouts and regression
//! - **Phase tests**: backup and pre-caching gates
//! - **Validation tests**: cluster and policy resolution failures

#[path = "../common/mod.rs"]
mod common;

mod fake_fleet;
mod phase_tests;
mod validation_tests;
