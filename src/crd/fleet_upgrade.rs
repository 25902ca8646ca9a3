//! FleetUpgrade Custom Resource Definition.
//!
//! A FleetUpgrade rolls an ordered list of configuration policies out to a set
//! of managed clusters in controlled batches. Before remediation starts it can
//! back up every cluster and pre-cache upgrade content on them.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::condition::Condition;

// ============================================================================
// FleetUpgrade CRD
// ============================================================================

/// FleetUpgrade drives staged, policy-driven remediation across clusters.
///
/// Example:
/// ```yaml
/// apiVersion: fleet-operator.smoketurner.com/v1alpha1
/// kind: FleetUpgrade
/// metadata:
///   name: ocp-4-16
/// spec:
///   clusters: [spoke1, spoke2, spoke3]
///   managedPolicies: [platform-upgrade, operator-subscriptions]
///   remediationStrategy:
///     maxConcurrency: 2
///     canaries: [spoke2]
///     timeout: 240
///   backup: true
///   preCaching: true
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "fleet-operator.smoketurner.com",
    version = "v1alpha1",
    kind = "FleetUpgrade",
    plural = "fleetupgrades",
    shortname = "fu",
    status = "FleetUpgradeStatus",
    namespaced,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].reason"}"#,
    printcolumn = r#"{"name":"Batch","type":"integer","jsonPath":".status.status.currentBatch"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FleetUpgradeSpec {
    /// Clusters to remediate, in rollout order.
    #[serde(default)]
    pub clusters: Vec<String>,

    /// Additional clusters selected by label (matchLabels semantics).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cluster_label_selector: BTreeMap<String, String>,

    /// Policy names in remediation priority order.
    #[serde(default)]
    pub managed_policies: Vec<String>,

    /// Batching, canary and timeout settings.
    #[serde(default)]
    pub remediation_strategy: RemediationStrategySpec,

    /// Whether batches may be opened. Backup and pre-caching run either way.
    #[serde(default = "default_true")]
    pub enable: bool,

    /// Back up every cluster before remediation.
    #[serde(default)]
    pub backup: bool,

    /// Pre-cache upgrade content on every cluster before remediation.
    #[serde(default)]
    pub pre_caching: bool,

    /// Delete the policy bindings created for this job once it succeeds.
    #[serde(default = "default_true")]
    pub delete_objects_on_completion: bool,
}

impl Default for FleetUpgradeSpec {
    fn default() -> Self {
        Self {
            clusters: Vec::new(),
            cluster_label_selector: BTreeMap::new(),
            managed_policies: Vec::new(),
            remediation_strategy: RemediationStrategySpec::default(),
            enable: true,
            backup: false,
            pre_caching: false,
            delete_objects_on_completion: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// How clusters are grouped and paced during remediation.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RemediationStrategySpec {
    /// Maximum number of clusters remediated together in one batch.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,

    /// Overall remediation timeout in minutes.
    #[serde(default = "default_timeout_minutes")]
    pub timeout: u64,

    /// Clusters remediated alone, ahead of the main batches, in this order.
    #[serde(default)]
    pub canaries: Vec<String>,

    /// What to do when a non-canary batch times out.
    #[serde(default)]
    pub batch_timeout_action: BatchTimeoutAction,
}

impl Default for RemediationStrategySpec {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            timeout: default_timeout_minutes(),
            canaries: Vec::new(),
            batch_timeout_action: BatchTimeoutAction::default(),
        }
    }
}

fn default_max_concurrency() -> u32 {
    1
}

fn default_timeout_minutes() -> u64 {
    240
}

/// Behavior after a batch times out.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum BatchTimeoutAction {
    /// Move on to the next batch.
    #[default]
    Continue,
    /// Stop the whole job.
    Abort,
}

impl std::fmt::Display for BatchTimeoutAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchTimeoutAction::Continue => write!(f, "Continue"),
            BatchTimeoutAction::Abort => write!(f, "Abort"),
        }
    }
}

// ============================================================================
// FleetUpgrade Status
// ============================================================================

/// Persisted progress of a FleetUpgrade.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FleetUpgradeStatus {
    /// Conditions representing the current state.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Ordered batches of cluster names. Computed once.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remediation_plan: Vec<Vec<String>>,

    /// Resolved policies, in remediation order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub managed_policies_for_upgrade: Vec<ManagedPolicyRef>,

    /// Final outcome of every cluster that left its batch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clusters: Vec<ClusterState>,

    /// Clusters from finished batches that are no longer compliant.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regressed_clusters: Vec<String>,

    /// Batch progress.
    #[serde(default)]
    pub status: UpgradeProgress,

    /// Backup phase status, present when backup was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupStatus>,

    /// Pre-caching phase status, present when pre-caching was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precaching: Option<PrecachingStatus>,

    /// Observed generation of the FleetUpgrade spec.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl FleetUpgradeStatus {
    /// Total number of clusters in the remediation plan.
    pub fn total_clusters(&self) -> usize {
        self.remediation_plan.iter().map(Vec::len).sum()
    }

    /// Number of clusters recorded as complete.
    pub fn completed_clusters(&self) -> usize {
        self.clusters
            .iter()
            .filter(|c| c.state == ClusterOutcome::Complete)
            .count()
    }

    /// Clusters left out of remediation by a failed backup or pre-caching.
    pub fn skipped_clusters(&self) -> Vec<String> {
        self.clusters
            .iter()
            .filter(|c| c.state.is_skipped())
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn is_skipped(&self, cluster: &str) -> bool {
        self.clusters
            .iter()
            .any(|c| c.name == cluster && c.state.is_skipped())
    }

    /// The clusters of the current batch, if a batch is open.
    pub fn current_batch_clusters(&self) -> Option<&[String]> {
        let index = self.status.current_batch.checked_sub(1)?;
        self.remediation_plan.get(index).map(Vec::as_slice)
    }
}

/// A policy resolved to its namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedPolicyRef {
    /// Policy name.
    pub name: String,
    /// Namespace the policy lives in.
    pub namespace: String,
}

impl ManagedPolicyRef {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl std::fmt::Display for ManagedPolicyRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Batch-level progress of the remediation.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeProgress {
    /// When remediation started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,

    /// When the job finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,

    /// 1-based index of the open batch; 0 before remediation starts.
    #[serde(default)]
    pub current_batch: usize,

    /// When the open batch started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_batch_started_at: Option<String>,

    /// Per-cluster progress for the open batch only.
    #[serde(default)]
    pub current_batch_remediation_progress: BTreeMap<String, ClusterRemediationProgress>,
}

/// Progress of one cluster through the managed policies.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRemediationProgress {
    /// Remediation state.
    #[serde(default)]
    pub state: ClusterRemediationState,

    /// Index into `managedPoliciesForUpgrade` the cluster is working on.
    #[serde(default)]
    pub policy_index: usize,

    /// Start of the current soak window. Absent when not soaking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_compliant_at: Option<String>,
}

/// Remediation state of a cluster within the open batch.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum ClusterRemediationState {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    TimedOut,
}

impl ClusterRemediationState {
    /// Completed and TimedOut are final for the batch.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClusterRemediationState::Completed | ClusterRemediationState::TimedOut
        )
    }
}

impl std::fmt::Display for ClusterRemediationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterRemediationState::NotStarted => write!(f, "NotStarted"),
            ClusterRemediationState::InProgress => write!(f, "InProgress"),
            ClusterRemediationState::Completed => write!(f, "Completed"),
            ClusterRemediationState::TimedOut => write!(f, "TimedOut"),
        }
    }
}

/// Final outcome of a cluster after its batch closed.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterState {
    /// Cluster name.
    pub name: String,
    /// Outcome.
    pub state: ClusterOutcome,
    /// The policy the cluster was stuck on, for timed-out clusters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_policy: Option<PolicyStatus>,
}

/// Outcome recorded in `status.clusters`.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClusterOutcome {
    Complete,
    Timedout,
    /// Left out of remediation after its backup did not succeed.
    BackupFailed,
    /// Left out of remediation after its pre-caching did not succeed.
    PrecachingFailed,
}

impl ClusterOutcome {
    /// The cluster never entered remediation.
    pub fn is_skipped(&self) -> bool {
        matches!(self, ClusterOutcome::BackupFailed | ClusterOutcome::PrecachingFailed)
    }
}

/// Compliance of a cluster with a named policy.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatus {
    /// Policy name.
    pub name: String,
    /// Last observed compliance.
    pub status: Compliance,
}

/// Compliance signal reported by the policy store.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "PascalCase")]
pub enum Compliance {
    Compliant,
    NonCompliant,
    /// The policy does not apply to the cluster.
    NotMatched,
}

impl std::fmt::Display for Compliance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Compliance::Compliant => write!(f, "Compliant"),
            Compliance::NonCompliant => write!(f, "NonCompliant"),
            Compliance::NotMatched => write!(f, "NotMatched"),
        }
    }
}

// ============================================================================
// Backup and Pre-caching Status
// ============================================================================

/// Per-cluster lifecycle state of a pre-remediation job phase.
pub trait PhaseState: Copy + Eq + std::fmt::Display {
    /// Terminal states never change for the life of the job.
    fn is_terminal(&self) -> bool;

    /// The one terminal state that counts as success.
    fn is_success(&self) -> bool;
}

/// Backup phase status.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    /// When the backup phase started; the phase timeout counts from here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,

    /// Clusters taking part in the backup.
    #[serde(default)]
    pub clusters: Vec<String>,

    /// Per-cluster backup state.
    #[serde(default)]
    pub status: BTreeMap<String, BackupState>,
}

/// Backup lifecycle state of a cluster.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "PascalCase")]
pub enum BackupState {
    /// Leftovers from a previous attempt are being removed.
    #[default]
    PreparingToStart,
    /// Dependencies and the backup job are being created.
    Starting,
    /// The backup job is running.
    Active,
    Succeeded,
    Timeout,
    UnrecoverableError,
}

impl PhaseState for BackupState {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            BackupState::Succeeded | BackupState::Timeout | BackupState::UnrecoverableError
        )
    }

    fn is_success(&self) -> bool {
        *self == BackupState::Succeeded
    }
}

impl std::fmt::Display for BackupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupState::PreparingToStart => write!(f, "PreparingToStart"),
            BackupState::Starting => write!(f, "Starting"),
            BackupState::Active => write!(f, "Active"),
            BackupState::Succeeded => write!(f, "Succeeded"),
            BackupState::Timeout => write!(f, "Timeout"),
            BackupState::UnrecoverableError => write!(f, "UnrecoverableError"),
        }
    }
}

/// Pre-caching phase status.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PrecachingStatus {
    /// When the pre-caching phase started; the phase timeout counts from here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,

    /// Content to pre-cache, extracted from the managed policies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<PrecacheSpec>,

    /// Clusters taking part in pre-caching.
    #[serde(default)]
    pub clusters: Vec<String>,

    /// Per-cluster pre-caching state.
    #[serde(default)]
    pub status: BTreeMap<String, PrecacheState>,
}

/// Content a pre-cache job pulls onto a cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PrecacheSpec {
    /// Platform release image.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub platform_image: String,

    /// Operator catalog index images.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operators_indexes: Vec<String>,

    /// Operator `package:channel` pairs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operators_packages_and_channels: Vec<String>,

    /// Extra images to pull.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_images: Vec<String>,

    /// Image name patterns to skip.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_precache_patterns: Vec<String>,

    /// Disk space the job requires, e.g. "35 GiB".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space_required: Option<String>,
}

impl PrecacheSpec {
    /// Check the spec describes something to pre-cache.
    ///
    /// Returns a human-readable reason when it does not.
    pub fn consistency_error(&self) -> Option<&'static str> {
        let operators_requested = !self.operators_indexes.is_empty();
        let platform_requested = !self.platform_image.is_empty();
        if operators_requested && self.operators_packages_and_channels.is_empty() {
            return Some("operator index provided, but no packages");
        }
        if !operators_requested && !platform_requested {
            return Some("no software spec provided");
        }
        None
    }
}

/// Pre-caching lifecycle state of a cluster.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "PascalCase")]
pub enum PrecacheState {
    #[default]
    NotStarted,
    /// Dependencies, job view and job are being created.
    Starting,
    /// A job that ran out of time is being torn down before a fresh attempt.
    Restarting,
    /// The pre-cache job is running.
    Active,
    Succeeded,
    Timeout,
    UnrecoverableError,
}

impl PhaseState for PrecacheState {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            PrecacheState::Succeeded | PrecacheState::Timeout | PrecacheState::UnrecoverableError
        )
    }

    fn is_success(&self) -> bool {
        *self == PrecacheState::Succeeded
    }
}

impl std::fmt::Display for PrecacheState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrecacheState::NotStarted => write!(f, "NotStarted"),
            PrecacheState::Starting => write!(f, "Starting"),
            PrecacheState::Restarting => write!(f, "Restarting"),
            PrecacheState::Active => write!(f, "Active"),
            PrecacheState::Succeeded => write!(f, "Succeeded"),
            PrecacheState::Timeout => write!(f, "Timeout"),
            PrecacheState::UnrecoverableError => write!(f, "UnrecoverableError"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::get_unwrap
)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_defaults_from_minimal_yaml() {
        let spec: FleetUpgradeSpec = serde_json::from_value(serde_json::json!({
            "clusters": ["spoke1"],
            "managedPolicies": ["p1"]
        }))
        .unwrap();

        assert!(spec.enable);
        assert!(!spec.backup);
        assert!(!spec.pre_caching);
        assert!(spec.delete_objects_on_completion);
        assert_eq!(spec.remediation_strategy.max_concurrency, 1);
        assert_eq!(spec.remediation_strategy.timeout, 240);
        assert_eq!(
            spec.remediation_strategy.batch_timeout_action,
            BatchTimeoutAction::Continue
        );
    }

    #[test]
    fn test_backup_state_terminal() {
        assert!(!BackupState::PreparingToStart.is_terminal());
        assert!(!BackupState::Starting.is_terminal());
        assert!(!BackupState::Active.is_terminal());
        assert!(BackupState::Succeeded.is_terminal());
        assert!(BackupState::Timeout.is_terminal());
        assert!(BackupState::UnrecoverableError.is_terminal());
        assert!(BackupState::Succeeded.is_success());
        assert!(!BackupState::Timeout.is_success());
    }

    #[test]
    fn test_precache_state_terminal() {
        assert!(!PrecacheState::NotStarted.is_terminal());
        assert!(!PrecacheState::Restarting.is_terminal());
        assert!(PrecacheState::Timeout.is_terminal());
        assert!(PrecacheState::Succeeded.is_success());
        assert!(!PrecacheState::UnrecoverableError.is_success());
    }

    #[test]
    fn test_unknown_state_is_rejected() {
        let parsed: Result<BackupState, _> = serde_json::from_value(serde_json::json!("Bogus"));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_cluster_outcome_lowercase() {
        assert_eq!(
            serde_json::to_value(ClusterOutcome::Timedout).unwrap(),
            serde_json::json!("timedout")
        );
        assert_eq!(
            serde_json::to_value(ClusterOutcome::PrecachingFailed).unwrap(),
            serde_json::json!("precachingfailed")
        );
        assert!(ClusterOutcome::BackupFailed.is_skipped());
        assert!(!ClusterOutcome::Timedout.is_skipped());
    }

    #[test]
    fn test_current_batch_clusters() {
        let mut status = FleetUpgradeStatus {
            remediation_plan: vec![vec!["c3".into()], vec!["c1".into(), "c2".into()]],
            ..Default::default()
        };
        assert!(status.current_batch_clusters().is_none());

        status.status.current_batch = 2;
        assert_eq!(
            status.current_batch_clusters().unwrap(),
            &["c1".to_string(), "c2".to_string()]
        );
        assert_eq!(status.total_clusters(), 3);
    }

    #[test]
    fn test_precache_spec_consistency() {
        let empty = PrecacheSpec::default();
        assert_eq!(empty.consistency_error(), Some("no software spec provided"));

        let index_only = PrecacheSpec {
            operators_indexes: vec!["registry/index:v4.16".into()],
            ..Default::default()
        };
        assert_eq!(
            index_only.consistency_error(),
            Some("operator index provided, but no packages")
        );

        let platform = PrecacheSpec {
            platform_image: "quay.io/release:4.16.3".into(),
            ..Default::default()
        };
        assert_eq!(platform.consistency_error(), None);
    }
}
