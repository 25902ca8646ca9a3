//! Backup and pre-caching gates in front of remediation.

use fleet_upgrade_operator::controller::collaborators::{JobCondition, JobPhase};
use fleet_upgrade_operator::controller::config::Requeue;
use fleet_upgrade_operator::controller::events::EventReason;
use fleet_upgrade_operator::crd::{
    BackupState, ClusterOutcome, ConditionType, PrecacheSpec, PrecacheState,
};

use crate::common::fixtures::{FleetUpgradeBuilder, names};
use crate::fake_fleet::{FakeFleet, Harness};

const RELEASE_IMAGE: &str = "quay.io/openshift-release-dev/ocp-release:4.16.0-x86_64";

/// Two clusters already compliant with one policy, so remediation finishes
/// in the pass that opens the gate.
fn ready_fleet() -> FakeFleet {
    let fleet = FakeFleet::new()
        .with_clusters(&["c1", "c2"])
        .with_policies(&["p1"]);
    fleet.set_compliant("c1", &["p1"]);
    fleet.set_compliant("c2", &["p1"]);
    fleet
}

fn builder() -> FleetUpgradeBuilder {
    FleetUpgradeBuilder::new("fu-1")
        .clusters(&["c1", "c2"])
        .policies(&["p1"])
        .max_concurrency(2)
}

fn release_spec() -> PrecacheSpec {
    PrecacheSpec {
        platform_image: RELEASE_IMAGE.to_string(),
        ..Default::default()
    }
}

fn backup_state(h: &Harness, cluster: &str) -> BackupState {
    h.status.backup.as_ref().unwrap().status[cluster]
}

fn precache_state(h: &Harness, cluster: &str) -> PrecacheState {
    h.status.precaching.as_ref().unwrap().status[cluster]
}

fn cluster_outcome(h: &Harness, cluster: &str) -> Option<ClusterOutcome> {
    h.status
        .clusters
        .iter()
        .find(|c| c.name == cluster)
        .map(|c| c.state)
}

// ============================================================================
// Backup
// ============================================================================

#[tokio::test]
async fn test_backup_completes_before_remediation() {
    let fleet = ready_fleet();
    let mut h = Harness::new(fleet.clone(), builder().backup().spec());

    let outcome = h.pass().await;
    assert_eq!(outcome.requeue, Requeue::Short);
    assert_eq!(backup_state(&h, "c1"), BackupState::Starting);
    assert_eq!(h.reason(ConditionType::BackupDone), Some("BackupNotDone"));
    assert_eq!(h.reason(ConditionType::Progressing), Some("NotStarted"));
    assert!(h.status.status.started_at.is_none());

    h.passes(2).await;
    assert!(h.status.status.started_at.is_none());
    assert_eq!(fleet.deploy_count("c1", JobPhase::Backup), 1);

    // The gate opens and remediation runs in the same pass
    let outcome = h.pass().await;
    assert_eq!(backup_state(&h, "c1"), BackupState::Succeeded);
    assert_eq!(backup_state(&h, "c2"), BackupState::Succeeded);
    assert!(h.is_true(ConditionType::BackupDone));
    assert_eq!(h.count(EventReason::BackupStarted), 1);
    assert_eq!(h.count(EventReason::BackupCompleted), 1);
    assert_eq!(outcome.requeue, Requeue::Long);
    assert!(h.is_true(ConditionType::Succeeded));
}

#[tokio::test]
async fn test_backup_failure_skips_only_that_cluster() {
    let fleet = ready_fleet();
    fleet.script_job("c2", JobPhase::Backup, 0, JobCondition::BackoffExceeded);
    let mut h = Harness::new(fleet.clone(), builder().backup().keep_objects().spec());

    // The healthy cluster goes on to remediation in the pass the phase settles
    let outcome = h.passes(4).await;
    assert_eq!(outcome.requeue, Requeue::Long);
    assert_eq!(backup_state(&h, "c1"), BackupState::Succeeded);
    assert_eq!(backup_state(&h, "c2"), BackupState::UnrecoverableError);
    assert!(h.is_true(ConditionType::BackupDone));
    assert_eq!(h.reason(ConditionType::BackupDone), Some("PartiallyDone"));
    assert_eq!(h.count(EventReason::BackupFailed), 1);

    assert_eq!(cluster_outcome(&h, "c1"), Some(ClusterOutcome::Complete));
    assert_eq!(cluster_outcome(&h, "c2"), Some(ClusterOutcome::BackupFailed));
    assert_eq!(fleet.bindings()[&(1, "p1".to_string())], names(&["c1"]));
    assert_eq!(h.count(EventReason::ClusterUpgradeStarted), 1);
    assert!(h.is_true(ConditionType::Succeeded));
    assert!(
        h.condition(ConditionType::Succeeded)
            .unwrap()
            .message
            .contains("c2")
    );

    // Settled: later passes neither move nor repeat the event
    let before = h.status.clone();
    let outcome = h.passes(2).await;
    assert_eq!(outcome.requeue, Requeue::Long);
    assert_eq!(h.status, before);
    assert_eq!(h.count(EventReason::BackupFailed), 1);
}

#[tokio::test]
async fn test_backup_failure_on_every_cluster_blocks_remediation() {
    let fleet = ready_fleet();
    fleet.script_job("c1", JobPhase::Backup, 0, JobCondition::BackoffExceeded);
    fleet.script_job("c2", JobPhase::Backup, 0, JobCondition::BackoffExceeded);
    let mut h = Harness::new(fleet.clone(), builder().backup().spec());

    let outcome = h.passes(4).await;
    assert_eq!(outcome.requeue, Requeue::Long);
    assert!(!h.is_true(ConditionType::BackupDone));
    assert_eq!(h.reason(ConditionType::BackupDone), Some("Failed"));
    assert_eq!(h.reason(ConditionType::Progressing), Some("Failed"));

    h.passes(2).await;
    assert_eq!(h.count(EventReason::BackupFailed), 1);
    assert!(h.status.status.started_at.is_none());
    assert!(h.status.clusters.is_empty());
    assert!(fleet.bindings().is_empty());
}

#[tokio::test]
async fn test_backup_phase_timeout() {
    let fleet = ready_fleet();
    fleet.script_job("c1", JobPhase::Backup, 1000, JobCondition::Succeeded);
    fleet.script_job("c2", JobPhase::Backup, 1000, JobCondition::Succeeded);
    let mut h = Harness::new(fleet, builder().backup().spec());

    h.passes(4).await;
    assert_eq!(backup_state(&h, "c1"), BackupState::Active);

    h.advance(1201);
    let outcome = h.pass().await;
    assert_eq!(outcome.requeue, Requeue::Long);
    assert_eq!(backup_state(&h, "c1"), BackupState::Timeout);
    assert_eq!(backup_state(&h, "c2"), BackupState::Timeout);
    assert_eq!(h.reason(ConditionType::BackupDone), Some("Failed"));
    assert_eq!(h.count(EventReason::BackupFailed), 1);
    assert_eq!(h.count(EventReason::BackupTimedOut), 1);

    // Settled phases do not time out again
    h.pass().await;
    assert_eq!(h.count(EventReason::BackupTimedOut), 1);
    assert_eq!(h.count(EventReason::BackupStarted), 1);
}

#[tokio::test]
async fn test_backup_timeout_on_one_cluster_lets_the_rest_continue() {
    let fleet = ready_fleet();
    fleet.script_job("c2", JobPhase::Backup, 1000, JobCondition::Succeeded);
    let mut h = Harness::new(fleet, builder().backup().spec());

    h.passes(4).await;
    assert_eq!(backup_state(&h, "c1"), BackupState::Succeeded);
    assert_eq!(backup_state(&h, "c2"), BackupState::Active);
    assert_eq!(h.count(EventReason::BackupTimedOut), 0);

    h.advance(1201);
    h.pass().await;
    assert_eq!(backup_state(&h, "c2"), BackupState::Timeout);
    let timed_out: Vec<_> = h
        .events
        .iter()
        .filter(|e| e.reason == EventReason::BackupTimedOut)
        .collect();
    assert_eq!(timed_out.len(), 1);
    assert!(timed_out[0].is_warning());
    assert_eq!(timed_out[0].message, "Backup timed out on 1 of 2 clusters");
    assert_eq!(h.reason(ConditionType::BackupDone), Some("PartiallyDone"));
    assert_eq!(cluster_outcome(&h, "c2"), Some(ClusterOutcome::BackupFailed));
    assert!(h.is_true(ConditionType::Succeeded));
}

#[tokio::test]
async fn test_unreachable_cluster_slows_backup() {
    let fleet = ready_fleet();
    fleet.make_unreachable("c2");
    let mut h = Harness::new(fleet.clone(), builder().backup().spec());

    let outcome = h.passes(4).await;
    assert_eq!(outcome.requeue, Requeue::Medium);
    assert_eq!(backup_state(&h, "c1"), BackupState::Succeeded);
    assert_eq!(backup_state(&h, "c2"), BackupState::PreparingToStart);
    assert!(!h.is_true(ConditionType::BackupDone));

    fleet.heal("c2");
    h.passes(4).await;
    assert_eq!(backup_state(&h, "c2"), BackupState::Succeeded);
    assert!(h.is_true(ConditionType::BackupDone));
}

// ============================================================================
// Pre-caching
// ============================================================================

#[tokio::test]
async fn test_precaching_completes_before_remediation() {
    let fleet = ready_fleet();
    fleet.set_precache_spec(release_spec());
    let mut h = Harness::new(fleet.clone(), builder().pre_caching().spec());

    let outcome = h.pass().await;
    assert_eq!(outcome.requeue, Requeue::Short);
    assert!(h.is_true(ConditionType::PrecacheSpecValid));
    assert_eq!(
        h.status.precaching.as_ref().unwrap().spec,
        Some(release_spec())
    );
    assert_eq!(precache_state(&h, "c1"), PrecacheState::Starting);

    h.pass().await;
    assert_eq!(fleet.staged_spec("c1"), Some(release_spec()));
    assert_eq!(fleet.staged_spec("c2"), Some(release_spec()));

    h.pass().await;
    assert_eq!(fleet.deploy_count("c1", JobPhase::Precache), 1);
    assert!(h.status.status.started_at.is_none());

    let outcome = h.pass().await;
    assert_eq!(precache_state(&h, "c1"), PrecacheState::Succeeded);
    assert!(h.is_true(ConditionType::PrecachingDone));
    // Start-up conditions are dropped once every cluster is done
    assert!(h.condition(ConditionType::PrecacheSpecValid).is_none());
    assert!(h.condition(ConditionType::PrecachingCanStart).is_none());
    assert_eq!(h.count(EventReason::PrecachingStarted), 1);
    assert_eq!(h.count(EventReason::PrecachingCompleted), 1);
    assert_eq!(outcome.requeue, Requeue::Long);
    assert!(h.is_true(ConditionType::Succeeded));
}

#[tokio::test]
async fn test_backup_runs_before_precaching() {
    let fleet = ready_fleet();
    fleet.set_precache_spec(release_spec());
    let mut h = Harness::new(fleet, builder().backup().pre_caching().spec());

    h.passes(3).await;
    assert!(h.status.precaching.is_none());

    // Backup finishes and pre-caching starts in the same pass
    h.pass().await;
    assert!(h.is_true(ConditionType::BackupDone));
    assert_eq!(precache_state(&h, "c1"), PrecacheState::Starting);

    h.passes(3).await;
    assert!(h.is_true(ConditionType::PrecachingDone));
    assert!(h.is_true(ConditionType::Succeeded));
}

#[tokio::test]
async fn test_incomplete_precache_spec_waits() {
    let fleet = ready_fleet();
    fleet.set_precache_spec(PrecacheSpec {
        operators_indexes: vec!["registry.example.com/redhat-operators:v4.16".to_string()],
        ..Default::default()
    });
    let mut h = Harness::new(fleet.clone(), builder().pre_caching().spec());

    let outcome = h.pass().await;
    assert_eq!(outcome.requeue, Requeue::Long);
    assert_eq!(
        h.reason(ConditionType::PrecacheSpecValid),
        Some("PrecacheSpecIncomplete")
    );
    assert!(h.status.precaching.is_none());
    assert!(h.status.status.started_at.is_none());
    assert_eq!(h.count(EventReason::PrecachingStarted), 0);

    // The spec is checked again on the next pass
    fleet.set_precache_spec(release_spec());
    let outcome = h.pass().await;
    assert_eq!(outcome.requeue, Requeue::Short);
    assert!(h.is_true(ConditionType::PrecacheSpecValid));
    assert!(h.status.precaching.is_some());
}

#[tokio::test]
async fn test_precache_restarts_after_early_deadline() {
    let fleet = ready_fleet();
    fleet.set_precache_spec(release_spec());
    fleet.script_job("c1", JobPhase::Precache, 0, JobCondition::DeadlineExceeded);
    let mut h = Harness::new(fleet.clone(), builder().pre_caching().spec());

    // The restart tears the old job down and asks for its namespace to go
    h.passes(4).await;
    assert_eq!(precache_state(&h, "c1"), PrecacheState::Restarting);
    assert_eq!(precache_state(&h, "c2"), PrecacheState::Succeeded);
    assert!(!fleet.namespace_present("c1", JobPhase::Precache));
    assert!(fleet.namespace_present("c2", JobPhase::Precache));

    h.pass().await;
    assert_eq!(precache_state(&h, "c1"), PrecacheState::Starting);

    h.passes(3).await;
    assert_eq!(precache_state(&h, "c1"), PrecacheState::Succeeded);
    assert_eq!(fleet.deploy_count("c1", JobPhase::Precache), 2);
    assert!(h.is_true(ConditionType::PrecachingDone));
}

#[tokio::test]
async fn test_precache_deadline_while_active_times_out() {
    let fleet = ready_fleet();
    fleet.set_precache_spec(release_spec());
    fleet.script_job("c1", JobPhase::Precache, 2, JobCondition::DeadlineExceeded);
    let mut h = Harness::new(fleet, builder().pre_caching().spec());

    h.passes(4).await;
    assert_eq!(precache_state(&h, "c1"), PrecacheState::Active);

    h.passes(2).await;
    assert_eq!(precache_state(&h, "c1"), PrecacheState::Timeout);
    assert_eq!(h.reason(ConditionType::PrecachingDone), Some("PartiallyDone"));
    assert!(h.is_true(ConditionType::PrecachingDone));
    assert_eq!(h.count(EventReason::PrecachingFailed), 1);
    // A job deadline is a cluster failure, not a phase timeout
    assert_eq!(h.count(EventReason::PrecachingTimedOut), 0);

    assert_eq!(cluster_outcome(&h, "c1"), Some(ClusterOutcome::PrecachingFailed));
    assert_eq!(cluster_outcome(&h, "c2"), Some(ClusterOutcome::Complete));
    assert!(h.is_true(ConditionType::Succeeded));
}

#[tokio::test]
async fn test_precache_phase_timeout() {
    let fleet = ready_fleet();
    fleet.set_precache_spec(release_spec());
    fleet.script_job("c1", JobPhase::Precache, 1000, JobCondition::Succeeded);
    fleet.script_job("c2", JobPhase::Precache, 1000, JobCondition::Succeeded);
    let mut h = Harness::new(fleet, builder().pre_caching().spec());

    h.passes(4).await;
    assert_eq!(precache_state(&h, "c1"), PrecacheState::Active);
    assert_eq!(h.count(EventReason::PrecachingStarted), 1);

    h.advance(3601);
    let outcome = h.pass().await;
    assert_eq!(outcome.requeue, Requeue::Long);
    assert_eq!(precache_state(&h, "c1"), PrecacheState::Timeout);
    assert_eq!(precache_state(&h, "c2"), PrecacheState::Timeout);
    assert_eq!(h.reason(ConditionType::PrecachingDone), Some("Failed"));
    assert_eq!(h.count(EventReason::PrecachingTimedOut), 1);
    assert_eq!(h.count(EventReason::PrecachingFailed), 1);
    assert!(h.status.status.started_at.is_none());
}

#[tokio::test]
async fn test_backup_failure_keeps_cluster_out_of_precaching() {
    let fleet = ready_fleet();
    fleet.set_precache_spec(release_spec());
    fleet.script_job("c2", JobPhase::Backup, 0, JobCondition::BackoffExceeded);
    let mut h = Harness::new(fleet.clone(), builder().backup().pre_caching().spec());

    h.passes(4).await;
    assert_eq!(h.reason(ConditionType::BackupDone), Some("PartiallyDone"));
    let precaching = h.status.precaching.as_ref().unwrap();
    assert_eq!(precaching.clusters, names(&["c1"]));
    assert!(!precaching.status.contains_key("c2"));

    h.passes(3).await;
    assert!(h.is_true(ConditionType::PrecachingDone));
    assert_eq!(fleet.deploy_count("c2", JobPhase::Precache), 0);
    assert_eq!(cluster_outcome(&h, "c2"), Some(ClusterOutcome::BackupFailed));
    assert!(h.is_true(ConditionType::Succeeded));
}

#[tokio::test]
async fn test_precache_start_failures_are_reported() {
    let fleet = ready_fleet();
    fleet.set_precache_spec(release_spec());
    fleet.make_unreachable("c2");
    let mut h = Harness::new(fleet.clone(), builder().pre_caching().spec());

    let outcome = h.pass().await;
    assert_eq!(outcome.requeue, Requeue::Medium);
    assert_eq!(precache_state(&h, "c2"), PrecacheState::NotStarted);
    let condition = h.condition(ConditionType::PrecachingCanStart).unwrap();
    assert!(!condition.is_true());
    assert_eq!(condition.reason, "ClustersFailedToStart");
    assert!(condition.message.contains("c2"));

    fleet.heal("c2");
    h.pass().await;
    assert!(h.condition(ConditionType::PrecachingCanStart).is_none());
    assert_eq!(precache_state(&h, "c2"), PrecacheState::Starting);
}
