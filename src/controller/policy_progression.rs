//! Per-cluster policy progression.
//!
//! Each pass walks a cluster forward through the ordered managed policies,
//! starting at its persisted `policyIndex`:
//!
//! - NotMatched: skip to the next policy, soak clock untouched
//! - NonCompliant: stop here and reset the soak clock
//! - Compliant: advance, unless the policy declares a soak time that has not
//!   elapsed since `firstCompliantAt`, in which case stop and (re)start the clock
//!
//! The walk itself is pure and runs over a [`ComplianceOracle`]. The
//! orchestrator gathers a [`ComplianceSnapshot`] from the policy store first so
//! that every decision in a pass sees the same signals.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use jiff::Timestamp;
use tracing::{debug, warn};

use crate::controller::collaborators::PolicyStore;
use crate::controller::error::Result;
use crate::controller::status::parse_timestamp;
use crate::crd::{ClusterRemediationProgress, ClusterRemediationState, Compliance, ManagedPolicyRef};

// ============================================================================
// Oracle
// ============================================================================

/// Read-only view of compliance signals for one pass.
pub trait ComplianceOracle {
    /// Compliance of `cluster` with the policy at `policy_index`.
    fn compliance(&self, cluster: &str, policy_index: usize) -> Compliance;

    /// Soak time declared by the policy at `policy_index`.
    fn soak_duration(&self, policy_index: usize) -> Option<Duration>;
}

/// Compliance signals captured from the policy store.
///
/// Pairs that were never captured read as NonCompliant, which stops the walk
/// rather than skipping a policy nobody looked at.
#[derive(Debug, Clone, Default)]
pub struct ComplianceSnapshot {
    compliance: HashMap<(String, usize), Compliance>,
    soak: HashMap<usize, Duration>,
}

impl ComplianceSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a compliance signal.
    pub fn insert_compliance(&mut self, cluster: &str, policy_index: usize, compliance: Compliance) {
        self.compliance
            .insert((cluster.to_string(), policy_index), compliance);
    }

    /// Record a policy's soak time.
    pub fn insert_soak(&mut self, policy_index: usize, soak: Duration) {
        self.soak.insert(policy_index, soak);
    }

    /// Capture the signals needed to walk `targets` from their start index.
    ///
    /// Each policy is read once for all the clusters that still need it. Any
    /// compliance error aborts the capture so the pass leaves progress
    /// untouched. Invalid soak declarations are logged and read as no soak.
    pub async fn collect(
        store: &dyn PolicyStore,
        policies: &[ManagedPolicyRef],
        targets: &[(String, usize)],
    ) -> Result<Self> {
        let mut snapshot = Self::new();
        let Some(lowest) = targets.iter().map(|(_, start)| *start).min() else {
            return Ok(snapshot);
        };

        for (index, policy) in policies.iter().enumerate().skip(lowest) {
            match store.soak_duration(policy).await {
                Ok(Some(soak)) => snapshot.insert_soak(index, soak),
                Ok(None) => {}
                Err(e) => warn!(
                    policy = %policy,
                    error = %e,
                    "Ignoring invalid soak declaration"
                ),
            }

            let clusters: Vec<String> = targets
                .iter()
                .filter(|(_, start)| *start <= index)
                .map(|(cluster, _)| cluster.clone())
                .collect();
            for (cluster, compliance) in store.cluster_compliance(policy, &clusters).await? {
                snapshot.insert_compliance(&cluster, index, compliance);
            }
        }

        debug!(
            clusters = targets.len(),
            signals = snapshot.compliance.len(),
            "Captured compliance snapshot"
        );
        Ok(snapshot)
    }

    /// Capture every policy's signal for clusters that already finished.
    ///
    /// Unlike [`ComplianceSnapshot::collect`] a failed lookup does not abort
    /// the capture: the cluster is retried on its own and, if it still fails,
    /// returned as unavailable so callers can leave it out of this pass.
    pub async fn collect_settled(
        store: &dyn PolicyStore,
        policies: &[ManagedPolicyRef],
        clusters: &[String],
    ) -> (Self, BTreeSet<String>) {
        let mut snapshot = Self::new();
        let mut unavailable = BTreeSet::new();
        if clusters.is_empty() {
            return (snapshot, unavailable);
        }

        for (index, policy) in policies.iter().enumerate() {
            let pending: Vec<String> = clusters
                .iter()
                .filter(|c| !unavailable.contains(*c))
                .cloned()
                .collect();
            match store.cluster_compliance(policy, &pending).await {
                Ok(compliance) => {
                    for (cluster, signal) in compliance {
                        snapshot.insert_compliance(&cluster, index, signal);
                    }
                }
                Err(e) => {
                    debug!(policy = %policy, error = %e, "Batched compliance read failed, retrying per cluster");
                    for cluster in pending {
                        match store.compliance_of(&cluster, policy).await {
                            Ok(signal) => snapshot.insert_compliance(&cluster, index, signal),
                            Err(e) => {
                                warn!(
                                    cluster = %cluster,
                                    policy = %policy,
                                    error = %e,
                                    "Skipping regression check for cluster"
                                );
                                unavailable.insert(cluster);
                            }
                        }
                    }
                }
            }
        }
        (snapshot, unavailable)
    }
}

impl ComplianceOracle for ComplianceSnapshot {
    fn compliance(&self, cluster: &str, policy_index: usize) -> Compliance {
        self.compliance
            .get(&(cluster.to_string(), policy_index))
            .copied()
            .unwrap_or(Compliance::NonCompliant)
    }

    fn soak_duration(&self, policy_index: usize) -> Option<Duration> {
        self.soak.get(&policy_index).copied()
    }
}

// ============================================================================
// Soak predicate
// ============================================================================

/// Soak decision for a compliant policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoakDecision {
    /// The policy declares no soak time.
    NotRequired,
    /// Keep holding the cluster on this policy.
    Soaking,
    /// The soak window is over.
    Elapsed,
}

/// Decide whether a compliant cluster must keep soaking.
///
/// No clock yet means soaking starts now. The window is over once strictly
/// more than `soak` has passed.
pub fn should_soak(
    soak: Option<Duration>,
    first_compliant_at: Option<Timestamp>,
    now: Timestamp,
) -> SoakDecision {
    let Some(soak) = soak else {
        return SoakDecision::NotRequired;
    };
    let Some(first) = first_compliant_at else {
        return SoakDecision::Soaking;
    };
    let elapsed = Duration::try_from(now.duration_since(first)).unwrap_or_default();
    if elapsed > soak {
        SoakDecision::Elapsed
    } else {
        SoakDecision::Soaking
    }
}

// ============================================================================
// Walk
// ============================================================================

/// Where a walk stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkStop {
    /// Every policy is satisfied.
    Completed,
    /// Waiting for the cluster to become compliant with the policy.
    NonCompliant,
    /// Compliant, holding for the policy's soak time.
    Soaking,
}

/// Result of walking one cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkOutcome {
    /// Index of the policy the cluster stopped on; the policy count when completed.
    pub policy_index: usize,
    pub stop: WalkStop,
    pub first_compliant_at: Option<Timestamp>,
}

impl WalkOutcome {
    pub fn is_completed(&self) -> bool {
        self.stop == WalkStop::Completed
    }
}

/// Walk a cluster forward from its persisted progress.
pub fn walk_policies(
    cluster: &str,
    progress: &ClusterRemediationProgress,
    policy_count: usize,
    oracle: &impl ComplianceOracle,
    now: Timestamp,
) -> WalkOutcome {
    let mut index = progress.policy_index;
    let mut first_compliant_at = parse_timestamp(progress.first_compliant_at.as_deref());

    while index < policy_count {
        match oracle.compliance(cluster, index) {
            Compliance::NotMatched => index += 1,
            Compliance::NonCompliant => {
                return WalkOutcome {
                    policy_index: index,
                    stop: WalkStop::NonCompliant,
                    first_compliant_at: None,
                };
            }
            Compliance::Compliant => {
                match should_soak(oracle.soak_duration(index), first_compliant_at, now) {
                    SoakDecision::NotRequired | SoakDecision::Elapsed => {
                        first_compliant_at = None;
                        index += 1;
                    }
                    SoakDecision::Soaking => {
                        return WalkOutcome {
                            policy_index: index,
                            stop: WalkStop::Soaking,
                            first_compliant_at: Some(first_compliant_at.unwrap_or(now)),
                        };
                    }
                }
            }
        }
    }

    WalkOutcome {
        policy_index: policy_count,
        stop: WalkStop::Completed,
        first_compliant_at: None,
    }
}

/// Store a walk outcome into the cluster's progress entry.
///
/// Returns true if the entry changed.
pub fn apply_walk(progress: &mut ClusterRemediationProgress, outcome: &WalkOutcome) -> bool {
    let updated = ClusterRemediationProgress {
        state: if outcome.is_completed() {
            ClusterRemediationState::Completed
        } else {
            ClusterRemediationState::InProgress
        },
        // The index never moves backwards within a batch
        policy_index: outcome.policy_index.max(progress.policy_index),
        first_compliant_at: outcome.first_compliant_at.map(|t| t.to_string()),
    };
    if *progress == updated {
        return false;
    }
    *progress = updated;
    true
}

/// Whether a cluster still satisfies every policy, from the first one.
///
/// Used for clusters of finished batches. No soak applies: a compliant
/// policy simply counts as satisfied.
pub fn is_fully_compliant(
    cluster: &str,
    policy_count: usize,
    oracle: &impl ComplianceOracle,
) -> bool {
    (0..policy_count).all(|index| oracle.compliance(cluster, index) != Compliance::NonCompliant)
}
