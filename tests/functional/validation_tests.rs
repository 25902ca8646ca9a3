//! Cluster and policy resolution at the start of every job.

use fleet_upgrade_operator::controller::config::Requeue;
use fleet_upgrade_operator::controller::events::EventReason;
use fleet_upgrade_operator::crd::ConditionType;

use crate::common::fixtures::{FleetUpgradeBuilder, labels, names};
use crate::fake_fleet::{FakeFleet, Harness};

#[tokio::test]
async fn test_missing_cluster_fails_validation() {
    let fleet = FakeFleet::new()
        .with_clusters(&["c1"])
        .with_policies(&["p1"]);
    let spec = FleetUpgradeBuilder::new("fu-1")
        .clusters(&["c1", "ghost"])
        .policies(&["p1"])
        .spec();
    let mut h = Harness::new(fleet.clone(), spec);

    let outcome = h.pass().await;
    assert_eq!(outcome.requeue, Requeue::Long);
    let validated = h.condition(ConditionType::Validated).unwrap();
    assert!(!validated.is_true());
    assert_eq!(validated.reason, "ClusterNotFound");
    assert!(validated.message.contains("ghost"));
    assert!(h.status.remediation_plan.is_empty());
    assert!(fleet.bindings().is_empty());
    assert_eq!(h.count(EventReason::ValidationFailed), 1);

    // Same failure again: no new event
    h.pass().await;
    assert_eq!(h.count(EventReason::ValidationFailed), 1);

    // Fixed by registering the cluster
    fleet.add_cluster("ghost", labels(&[]));
    h.pass().await;
    assert!(h.is_true(ConditionType::Validated));
    assert_eq!(h.status.remediation_plan, vec![names(&["c1"]), names(&["ghost"])]);
    assert_eq!(h.count(EventReason::UpgradeCreated), 1);
}

#[tokio::test]
async fn test_missing_policy_fails_validation() {
    let fleet = FakeFleet::new()
        .with_clusters(&["c1"])
        .with_policies(&["p1"]);
    let spec = FleetUpgradeBuilder::new("fu-1")
        .clusters(&["c1"])
        .policies(&["p1", "p2"])
        .spec();
    let mut h = Harness::new(fleet, spec);

    h.pass().await;
    assert_eq!(
        h.reason(ConditionType::Validated),
        Some("NotAllManagedPoliciesExist")
    );
    assert!(h.status.managed_policies_for_upgrade.is_empty());
}

#[tokio::test]
async fn test_invalid_policy_fails_validation() {
    let fleet = FakeFleet::new()
        .with_clusters(&["c1"])
        .with_policies(&["p1", "p2"]);
    fleet.mark_invalid("p2");
    let spec = FleetUpgradeBuilder::new("fu-1")
        .clusters(&["c1"])
        .policies(&["p1", "p2"])
        .spec();
    let mut h = Harness::new(fleet, spec);

    h.pass().await;
    assert_eq!(h.reason(ConditionType::Validated), Some("InvalidPolicies"));
}

#[tokio::test]
async fn test_ambiguous_policy_fails_validation() {
    let fleet = FakeFleet::new()
        .with_clusters(&["c1"])
        .with_policies(&["p1"]);
    fleet.add_policy("p1", "other-policies");
    let spec = FleetUpgradeBuilder::new("fu-1")
        .clusters(&["c1"])
        .policies(&["p1"])
        .spec();
    let mut h = Harness::new(fleet, spec);

    h.pass().await;
    let validated = h.condition(ConditionType::Validated).unwrap();
    assert_eq!(validated.reason, "AmbiguousPolicies");
    assert!(validated.message.contains("other-policies"));
}

#[tokio::test]
async fn test_unknown_canary_fails_validation() {
    let fleet = FakeFleet::new()
        .with_clusters(&["c1", "c2"])
        .with_policies(&["p1"]);
    let spec = FleetUpgradeBuilder::new("fu-1")
        .clusters(&["c1"])
        .policies(&["p1"])
        .canaries(&["c2"])
        .spec();
    let mut h = Harness::new(fleet, spec);

    h.pass().await;
    assert_eq!(
        h.reason(ConditionType::Validated),
        Some("InvalidRemediationStrategy")
    );
}

#[tokio::test]
async fn test_label_selector_adds_clusters() {
    let fleet = FakeFleet::new().with_policies(&["p1"]);
    fleet.add_cluster("c1", labels(&[("env", "prod")]));
    fleet.add_cluster("c2", labels(&[("env", "prod"), ("zone", "east")]));
    fleet.add_cluster("c3", labels(&[("env", "lab")]));
    let spec = FleetUpgradeBuilder::new("fu-1")
        .clusters(&["c3"])
        .selector("env", "prod")
        .policies(&["p1"])
        .max_concurrency(5)
        .spec();
    let mut h = Harness::new(fleet, spec);

    h.pass().await;
    assert!(h.is_true(ConditionType::Validated));
    assert_eq!(h.status.remediation_plan, vec![names(&["c3", "c1", "c2"])]);
    assert_eq!(h.status.total_clusters(), 3);
}

#[tokio::test]
async fn test_empty_selection_fails_validation() {
    let fleet = FakeFleet::new().with_policies(&["p1"]);
    fleet.add_cluster("c1", labels(&[("env", "lab")]));
    let spec = FleetUpgradeBuilder::new("fu-1")
        .selector("env", "prod")
        .policies(&["p1"])
        .spec();
    let mut h = Harness::new(fleet, spec);

    h.pass().await;
    assert_eq!(h.reason(ConditionType::Validated), Some("ClusterNotFound"));
}

#[tokio::test]
async fn test_new_generation_revalidates_without_replanning() {
    let fleet = FakeFleet::new()
        .with_clusters(&["c1", "c2"])
        .with_policies(&["p1"]);
    let spec = FleetUpgradeBuilder::new("fu-1")
        .clusters(&["c1", "c2"])
        .policies(&["p1"])
        .max_concurrency(2)
        .spec();
    let mut h = Harness::new(fleet.clone(), spec);

    h.pass().await;
    let plan = h.status.remediation_plan.clone();
    assert_eq!(h.status.observed_generation, Some(1));

    h.generation = Some(2);
    h.spec.remediation_strategy.max_concurrency = 1;
    h.pass().await;
    assert_eq!(h.status.observed_generation, Some(2));
    assert_eq!(h.status.remediation_plan, plan);
    assert_eq!(h.count(EventReason::UpgradeCreated), 1);

    // A new generation that breaks validation stops progress
    h.generation = Some(3);
    h.spec.managed_policies.push("p-missing".to_string());
    fleet.set_compliant("c1", &["p1"]);
    fleet.set_compliant("c2", &["p1"]);
    let outcome = h.pass().await;
    assert_eq!(outcome.requeue, Requeue::Long);
    assert!(!h.is_true(ConditionType::Validated));
    assert!(h.status.status.completed_at.is_none());
}
