// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for fleet-upgrade-operator.
//!
//! Uses proptest to generate random fleets, compliance signals and phase
//! states and verify the engine's invariants.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use jiff::{SignedDuration, Timestamp};
use proptest::prelude::*;

use fleet_upgrade_operator::controller::backup_state_machine::{
    BackupStateMachine, determine_backup_event,
};
use fleet_upgrade_operator::controller::collaborators::JobCondition;
use fleet_upgrade_operator::controller::conditions::{PhaseSummary, summarize_phase};
use fleet_upgrade_operator::controller::policy_progression::{
    ComplianceSnapshot, WalkStop, apply_walk, walk_policies,
};
use fleet_upgrade_operator::controller::precache_state_machine::{
    PrecacheObservation, PrecacheStateMachine, determine_precache_event,
};
use fleet_upgrade_operator::controller::remediation_plan::{
    build_remediation_plan, calculate_batch_timeout, canary_batch_count,
};
use fleet_upgrade_operator::crd::{
    BackupState, ClusterRemediationProgress, ClusterRemediationState, Compliance, PhaseState,
    PrecacheState,
};

fn base_time() -> Timestamp {
    "2026-03-01T00:00:00Z".parse().unwrap()
}

/// Strategy for a fleet of uniquely named clusters plus a canary subset.
fn fleet_and_canaries() -> impl Strategy<Value = (Vec<String>, Vec<String>)> {
    (1usize..40).prop_flat_map(|n| {
        let clusters: Vec<String> = (0..n).map(|i| format!("spoke{i}")).collect();
        let picks = proptest::collection::vec(any::<bool>(), n);
        (Just(clusters), picks).prop_map(|(clusters, picks)| {
            let canaries: Vec<String> = clusters
                .iter()
                .zip(picks)
                .filter(|(_, pick)| *pick)
                .map(|(c, _)| c.clone())
                .rev()
                .collect();
            (clusters, canaries)
        })
    })
}

fn any_compliance() -> impl Strategy<Value = Compliance> {
    prop_oneof![
        Just(Compliance::Compliant),
        Just(Compliance::NonCompliant),
        Just(Compliance::NotMatched),
    ]
}

fn any_backup_state() -> impl Strategy<Value = BackupState> {
    prop_oneof![
        Just(BackupState::PreparingToStart),
        Just(BackupState::Starting),
        Just(BackupState::Active),
        Just(BackupState::Succeeded),
        Just(BackupState::Timeout),
        Just(BackupState::UnrecoverableError),
    ]
}

fn any_precache_state() -> impl Strategy<Value = PrecacheState> {
    prop_oneof![
        Just(PrecacheState::NotStarted),
        Just(PrecacheState::Starting),
        Just(PrecacheState::Restarting),
        Just(PrecacheState::Active),
        Just(PrecacheState::Succeeded),
        Just(PrecacheState::Timeout),
        Just(PrecacheState::UnrecoverableError),
    ]
}

fn any_job_condition() -> impl Strategy<Value = JobCondition> {
    prop_oneof![
        Just(JobCondition::DependenciesMissing),
        Just(JobCondition::ViewMissing),
        Just(JobCondition::Missing),
        Just(JobCondition::Active),
        Just(JobCondition::Succeeded),
        Just(JobCondition::DeadlineExceeded),
        Just(JobCondition::BackoffExceeded),
    ]
}

fn snapshot_for(cluster: &str, signals: &[Compliance]) -> ComplianceSnapshot {
    let mut snapshot = ComplianceSnapshot::new();
    for (index, compliance) in signals.iter().enumerate() {
        snapshot.insert_compliance(cluster, index, *compliance);
    }
    snapshot
}

proptest! {
    /// Every cluster is planned exactly once and batches respect the limit.
    #[test]
    fn test_plan_partitions_clusters(
        (clusters, canaries) in fleet_and_canaries(),
        max_concurrency in 1usize..12,
    ) {
        let plan = build_remediation_plan(&clusters, &canaries, max_concurrency);

        let flat: Vec<&String> = plan.iter().flatten().collect();
        prop_assert_eq!(flat.len(), clusters.len());
        let unique: BTreeSet<&String> = flat.iter().copied().collect();
        prop_assert_eq!(unique.len(), clusters.len());
        prop_assert!(plan.iter().all(|batch| !batch.is_empty()));

        let canary_batches = canary_batch_count(&plan, &canaries);
        prop_assert_eq!(canary_batches, canaries.len());
        for (batch, canary) in plan.iter().zip(&canaries) {
            prop_assert_eq!(batch, &vec![canary.clone()]);
        }
        for batch in plan.iter().skip(canary_batches) {
            prop_assert!(batch.len() <= max_concurrency);
        }

        // Non-canaries keep their declared order
        let rest: Vec<&String> = plan.iter().skip(canary_batches).flatten().collect();
        let expected: Vec<&String> = clusters.iter().filter(|c| !canaries.contains(*c)).collect();
        prop_assert_eq!(rest, expected);
    }

    /// Only the last batch may be smaller than the limit.
    #[test]
    fn test_plan_batches_are_full_but_last(
        n in 1usize..60,
        max_concurrency in 1usize..12,
    ) {
        let clusters: Vec<String> = (0..n).map(|i| format!("spoke{i}")).collect();
        let plan = build_remediation_plan(&clusters, &[], max_concurrency);
        prop_assert_eq!(plan.len(), n.div_ceil(max_concurrency));
        if let Some((_, head)) = plan.split_last() {
            prop_assert!(head.iter().all(|b| b.len() == max_concurrency));
        }
    }

    /// A walk never moves backwards and stops on the first non-compliant policy.
    #[test]
    fn test_walk_is_monotonic(
        signals in proptest::collection::vec(any_compliance(), 1..10),
        start in 0usize..10,
    ) {
        let policy_count = signals.len();
        let start = start.min(policy_count);
        let snapshot = snapshot_for("spoke1", &signals);
        let progress = ClusterRemediationProgress {
            state: ClusterRemediationState::InProgress,
            policy_index: start,
            first_compliant_at: None,
        };

        let outcome = walk_policies("spoke1", &progress, policy_count, &snapshot, base_time());
        prop_assert!(outcome.policy_index >= start);

        let blocker = signals
            .iter()
            .enumerate()
            .skip(start)
            .find(|(_, c)| **c == Compliance::NonCompliant)
            .map(|(i, _)| i);
        match blocker {
            Some(index) => {
                prop_assert_eq!(outcome.stop, WalkStop::NonCompliant);
                prop_assert_eq!(outcome.policy_index, index);
            }
            None => {
                prop_assert_eq!(outcome.stop, WalkStop::Completed);
                prop_assert_eq!(outcome.policy_index, policy_count);
            }
        }
    }

    /// Re-walking with unchanged signals changes nothing.
    #[test]
    fn test_walk_is_idempotent(
        signals in proptest::collection::vec(any_compliance(), 1..10),
        soak_secs in proptest::option::of(1u64..600),
        elapsed in 0i64..1200,
    ) {
        let policy_count = signals.len();
        let mut snapshot = snapshot_for("spoke1", &signals);
        if let Some(secs) = soak_secs {
            snapshot.insert_soak(0, Duration::from_secs(secs));
        }
        let now = base_time().checked_add(SignedDuration::from_secs(elapsed)).unwrap();

        let mut progress = ClusterRemediationProgress::default();
        let first = walk_policies("spoke1", &progress, policy_count, &snapshot, now);
        apply_walk(&mut progress, &first);
        let snapshot_after = progress.clone();

        let second = walk_policies("spoke1", &progress, policy_count, &snapshot, now);
        prop_assert!(!apply_walk(&mut progress, &second));
        prop_assert_eq!(progress, snapshot_after);
    }

    /// Terminal backup states never react to anything.
    #[test]
    fn test_backup_terminal_states_are_final(
        state in any_backup_state(),
        observation in proptest::option::of(any_job_condition()),
        timed_out in any::<bool>(),
    ) {
        let event = determine_backup_event(state, observation, timed_out);
        if state.is_terminal() {
            prop_assert!(event.is_none());
            prop_assert!(BackupStateMachine::new().valid_transitions(state).is_empty());
        } else if timed_out {
            prop_assert!(event.is_some());
        }
    }

    /// Terminal pre-caching states never react to anything.
    #[test]
    fn test_precache_terminal_states_are_final(
        state in any_precache_state(),
        condition in any_job_condition(),
        namespace in any::<bool>(),
        timed_out in any::<bool>(),
    ) {
        for observation in [
            Some(PrecacheObservation::Job(condition)),
            Some(PrecacheObservation::Namespace(namespace)),
            None,
        ] {
            let event = determine_precache_event(state, observation, timed_out);
            if state.is_terminal() {
                prop_assert!(event.is_none());
            }
        }
        if state.is_terminal() {
            prop_assert!(PrecacheStateMachine::new().valid_transitions(state).is_empty());
        }
    }

    /// A phase is done iff every cluster succeeded.
    #[test]
    fn test_phase_summary_aggregation(
        states in proptest::collection::vec(any_backup_state(), 1..20),
    ) {
        let map: BTreeMap<String, BackupState> = states
            .iter()
            .enumerate()
            .map(|(i, s)| (format!("spoke{i}"), *s))
            .collect();
        let summary = summarize_phase(&map);

        let pending = states.iter().filter(|s| !s.is_terminal()).count();
        let succeeded = states.iter().filter(|s| s.is_success()).count();
        let failed = states.len() - pending - succeeded;

        match &summary {
            PhaseSummary::Done => prop_assert_eq!(succeeded, states.len()),
            PhaseSummary::InProgress(n) => prop_assert_eq!(*n, pending),
            PhaseSummary::Failed(clusters) => {
                prop_assert_eq!(pending, 0);
                prop_assert_eq!(succeeded, 0);
                prop_assert_eq!(clusters.len(), failed);
            }
            PhaseSummary::PartiallyDone(clusters) => {
                prop_assert_eq!(pending, 0);
                prop_assert!(succeeded > 0);
                prop_assert_eq!(clusters.len(), failed);
            }
        }
        // The gate opens whenever at least one cluster can go on
        prop_assert_eq!(summary.opens_gate(), pending == 0 && succeeded > 0);
    }

    /// Batch budgets split the remaining job time; the last batch gets it all.
    #[test]
    fn test_batch_timeout_arithmetic(
        timeout_minutes in 1u64..1000,
        num_batches in 1usize..20,
        current_batch in 1usize..20,
        elapsed_minutes in 0i64..1200,
    ) {
        let current_batch = current_batch.min(num_batches);
        let job_timeout = Duration::from_secs(timeout_minutes * 60);
        let started = base_time();
        let batch_started = started
            .checked_add(SignedDuration::from_secs(elapsed_minutes * 60))
            .unwrap();

        let budget = calculate_batch_timeout(
            job_timeout,
            started,
            batch_started,
            num_batches,
            current_batch,
        );
        let remaining = job_timeout.saturating_sub(Duration::from_secs(
            u64::try_from(elapsed_minutes * 60).unwrap(),
        ));
        prop_assert!(budget <= remaining);
        if current_batch == num_batches {
            prop_assert_eq!(budget, remaining);
        } else {
            let left = u32::try_from(num_batches - current_batch + 1).unwrap();
            prop_assert_eq!(budget, remaining / left);
        }
    }
}
