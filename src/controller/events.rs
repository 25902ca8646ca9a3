//! Operator-facing events produced by the remediation engine.
//!
//! The engine returns events as data; the reconciler publishes them through
//! the kube-rs event recorder. Structured metadata travels as annotations
//! rendered into the event note.

use std::collections::BTreeMap;

use crate::controller::collaborators::JobPhase;

/// Prefix shared by every event annotation key.
pub const ANNOTATION_PREFIX: &str = "fleet-operator.smoketurner.com/";

/// Kubernetes rejects event notes above this size.
pub const MAX_NOTE_BYTES: usize = 1024;

/// Budget for a single list-valued annotation.
const MAX_LIST_BYTES: usize = 256;

/// Structured metadata keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AnnotationKey {
    EventType,
    BatchClusters,
    BatchClustersCount,
    ClusterName,
    TimedoutClusters,
    TimedoutClustersCount,
    TotalBatchesCount,
    TotalClustersCount,
    MissingClusters,
    MissingPolicies,
    InvalidPolicies,
    AmbiguousPolicies,
}

impl AnnotationKey {
    /// Suffix after [`ANNOTATION_PREFIX`].
    pub const fn suffix(&self) -> &'static str {
        match self {
            AnnotationKey::EventType => "event-type",
            AnnotationKey::BatchClusters => "batch-clusters",
            AnnotationKey::BatchClustersCount => "batch-clusters-count",
            AnnotationKey::ClusterName => "cluster-name",
            AnnotationKey::TimedoutClusters => "timedout-clusters",
            AnnotationKey::TimedoutClustersCount => "timedout-clusters-count",
            AnnotationKey::TotalBatchesCount => "total-batches-count",
            AnnotationKey::TotalClustersCount => "total-clusters-count",
            AnnotationKey::MissingClusters => "missing-clusters",
            AnnotationKey::MissingPolicies => "missing-policies",
            AnnotationKey::InvalidPolicies => "invalid-policies",
            AnnotationKey::AmbiguousPolicies => "ambiguous-policies",
        }
    }

    /// Full annotation key.
    pub fn key(&self) -> String {
        format!("{ANNOTATION_PREFIX}{}", self.suffix())
    }
}

/// Severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    Normal,
    Warning,
}

/// What an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventScope {
    Global,
    Batch,
    Cluster,
}

impl std::fmt::Display for EventScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventScope::Global => write!(f, "global"),
            EventScope::Batch => write!(f, "batch"),
            EventScope::Cluster => write!(f, "cluster"),
        }
    }
}

/// Event reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventReason {
    UpgradeCreated,
    UpgradeStarted,
    UpgradeSucceeded,
    UpgradeTimedOut,
    ValidationFailed,
    BatchStarted,
    BatchSucceeded,
    BatchTimedOut,
    ClusterUpgradeStarted,
    ClusterUpgradeSucceeded,
    ClusterRegressed,
    BackupStarted,
    BackupCompleted,
    BackupFailed,
    BackupTimedOut,
    PrecachingStarted,
    PrecachingCompleted,
    PrecachingFailed,
    PrecachingTimedOut,
}

impl EventReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            EventReason::UpgradeCreated => "UpgradeCreated",
            EventReason::UpgradeStarted => "UpgradeStarted",
            EventReason::UpgradeSucceeded => "UpgradeSucceeded",
            EventReason::UpgradeTimedOut => "UpgradeTimedOut",
            EventReason::ValidationFailed => "ValidationFailed",
            EventReason::BatchStarted => "BatchStarted",
            EventReason::BatchSucceeded => "BatchSucceeded",
            EventReason::BatchTimedOut => "BatchTimedOut",
            EventReason::ClusterUpgradeStarted => "ClusterUpgradeStarted",
            EventReason::ClusterUpgradeSucceeded => "ClusterUpgradeSucceeded",
            EventReason::ClusterRegressed => "ClusterRegressed",
            EventReason::BackupStarted => "BackupStarted",
            EventReason::BackupCompleted => "BackupCompleted",
            EventReason::BackupFailed => "BackupFailed",
            EventReason::BackupTimedOut => "BackupTimedOut",
            EventReason::PrecachingStarted => "PrecachingStarted",
            EventReason::PrecachingCompleted => "PrecachingCompleted",
            EventReason::PrecachingFailed => "PrecachingFailed",
            EventReason::PrecachingTimedOut => "PrecachingTimedOut",
        }
    }

    /// The kube event `action` field.
    pub const fn action(&self) -> &'static str {
        match self {
            EventReason::UpgradeCreated | EventReason::ValidationFailed => "Validate",
            EventReason::UpgradeStarted
            | EventReason::UpgradeSucceeded
            | EventReason::UpgradeTimedOut => "Upgrade",
            EventReason::BatchStarted | EventReason::BatchSucceeded | EventReason::BatchTimedOut => {
                "RemediateBatch"
            }
            EventReason::ClusterUpgradeStarted
            | EventReason::ClusterUpgradeSucceeded
            | EventReason::ClusterRegressed => "RemediateCluster",
            EventReason::BackupStarted
            | EventReason::BackupCompleted
            | EventReason::BackupFailed
            | EventReason::BackupTimedOut => "Backup",
            EventReason::PrecachingStarted
            | EventReason::PrecachingCompleted
            | EventReason::PrecachingFailed
            | EventReason::PrecachingTimedOut => "Precache",
        }
    }
}

impl std::fmt::Display for EventReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeEventRecord {
    pub severity: EventSeverity,
    pub reason: EventReason,
    pub scope: EventScope,
    pub message: String,
    pub annotations: BTreeMap<String, String>,
}

impl UpgradeEventRecord {
    fn new(severity: EventSeverity, reason: EventReason, scope: EventScope, message: String) -> Self {
        let mut annotations = BTreeMap::new();
        annotations.insert(AnnotationKey::EventType.key(), scope.to_string());
        Self {
            severity,
            reason,
            scope,
            message,
            annotations,
        }
    }

    pub fn normal(reason: EventReason, scope: EventScope, message: impl Into<String>) -> Self {
        Self::new(EventSeverity::Normal, reason, scope, message.into())
    }

    pub fn warning(reason: EventReason, scope: EventScope, message: impl Into<String>) -> Self {
        Self::new(EventSeverity::Warning, reason, scope, message.into())
    }

    /// Attach a scalar annotation.
    pub fn with(mut self, key: AnnotationKey, value: impl ToString) -> Self {
        self.annotations.insert(key.key(), value.to_string());
        self
    }

    /// Attach a list annotation, truncated to fit the note.
    pub fn with_list(mut self, key: AnnotationKey, values: &[String]) -> Self {
        self.annotations.insert(key.key(), truncate_list(values));
        self
    }

    /// Event note: the message followed by one `key=value` line per annotation.
    pub fn note(&self) -> String {
        let mut note = self.message.clone();
        for (key, value) in &self.annotations {
            note.push('\n');
            note.push_str(key);
            note.push('=');
            note.push_str(value);
        }
        truncate_bytes(&note, MAX_NOTE_BYTES).to_string()
    }

    pub fn is_warning(&self) -> bool {
        self.severity == EventSeverity::Warning
    }
}

/// Join names with commas, dropping trailing names that do not fit.
pub fn truncate_list(values: &[String]) -> String {
    let mut out = String::new();
    for (i, value) in values.iter().enumerate() {
        let sep = if out.is_empty() { "" } else { "," };
        if out.len() + sep.len() + value.len() > MAX_LIST_BYTES {
            let left = values.len() - i;
            out.push_str(&format!("{sep}...(+{left})"));
            break;
        }
        out.push_str(sep);
        out.push_str(value);
    }
    out
}

fn truncate_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.get(..end).unwrap_or_default()
}

// ============================================================================
// Builders
// ============================================================================

pub fn upgrade_created(total_clusters: usize, total_batches: usize) -> UpgradeEventRecord {
    UpgradeEventRecord::normal(
        EventReason::UpgradeCreated,
        EventScope::Global,
        "FleetUpgrade created and validated",
    )
    .with(AnnotationKey::TotalClustersCount, total_clusters)
    .with(AnnotationKey::TotalBatchesCount, total_batches)
}

pub fn upgrade_started(total_clusters: usize, total_batches: usize) -> UpgradeEventRecord {
    UpgradeEventRecord::normal(
        EventReason::UpgradeStarted,
        EventScope::Global,
        "FleetUpgrade started remediating clusters",
    )
    .with(AnnotationKey::TotalClustersCount, total_clusters)
    .with(AnnotationKey::TotalBatchesCount, total_batches)
}

pub fn upgrade_succeeded(total_clusters: usize, total_batches: usize) -> UpgradeEventRecord {
    UpgradeEventRecord::normal(
        EventReason::UpgradeSucceeded,
        EventScope::Global,
        "FleetUpgrade completed on all clusters",
    )
    .with(AnnotationKey::TotalClustersCount, total_clusters)
    .with(AnnotationKey::TotalBatchesCount, total_batches)
}

pub fn upgrade_timed_out(timed_out: &[String], total_clusters: usize) -> UpgradeEventRecord {
    UpgradeEventRecord::warning(
        EventReason::UpgradeTimedOut,
        EventScope::Global,
        format!(
            "FleetUpgrade timed out on {} of {} clusters",
            timed_out.len(),
            total_clusters
        ),
    )
    .with_list(AnnotationKey::TimedoutClusters, timed_out)
    .with(AnnotationKey::TimedoutClustersCount, timed_out.len())
    .with(AnnotationKey::TotalClustersCount, total_clusters)
}

pub fn batch_started(batch: usize, total_batches: usize, clusters: &[String]) -> UpgradeEventRecord {
    UpgradeEventRecord::normal(
        EventReason::BatchStarted,
        EventScope::Batch,
        format!("Batch {batch} of {total_batches} started"),
    )
    .with_list(AnnotationKey::BatchClusters, clusters)
    .with(AnnotationKey::BatchClustersCount, clusters.len())
    .with(AnnotationKey::TotalBatchesCount, total_batches)
}

pub fn batch_succeeded(batch: usize, total_batches: usize, clusters: &[String]) -> UpgradeEventRecord {
    UpgradeEventRecord::normal(
        EventReason::BatchSucceeded,
        EventScope::Batch,
        format!("Batch {batch} of {total_batches} completed"),
    )
    .with_list(AnnotationKey::BatchClusters, clusters)
    .with(AnnotationKey::BatchClustersCount, clusters.len())
    .with(AnnotationKey::TotalBatchesCount, total_batches)
}

pub fn batch_timed_out(
    batch: usize,
    total_batches: usize,
    clusters: &[String],
    timed_out: &[String],
) -> UpgradeEventRecord {
    UpgradeEventRecord::warning(
        EventReason::BatchTimedOut,
        EventScope::Batch,
        format!(
            "Batch {batch} of {total_batches} timed out with {} incomplete clusters",
            timed_out.len()
        ),
    )
    .with_list(AnnotationKey::BatchClusters, clusters)
    .with(AnnotationKey::BatchClustersCount, clusters.len())
    .with_list(AnnotationKey::TimedoutClusters, timed_out)
    .with(AnnotationKey::TimedoutClustersCount, timed_out.len())
    .with(AnnotationKey::TotalBatchesCount, total_batches)
}

/// A backup or pre-caching phase began on its clusters.
pub fn phase_started(phase: JobPhase, clusters: &[String]) -> UpgradeEventRecord {
    let (reason, label) = match phase {
        JobPhase::Backup => (EventReason::BackupStarted, "Backup"),
        JobPhase::Precache => (EventReason::PrecachingStarted, "Pre-caching"),
    };
    UpgradeEventRecord::normal(
        reason,
        EventScope::Global,
        format!("{label} started on {} clusters", clusters.len()),
    )
    .with(AnnotationKey::TotalClustersCount, clusters.len())
}

/// A backup or pre-caching phase ran out of time with unfinished clusters.
pub fn phase_timed_out(
    phase: JobPhase,
    timed_out: &[String],
    total_clusters: usize,
) -> UpgradeEventRecord {
    let (reason, label) = match phase {
        JobPhase::Backup => (EventReason::BackupTimedOut, "Backup"),
        JobPhase::Precache => (EventReason::PrecachingTimedOut, "Pre-caching"),
    };
    UpgradeEventRecord::warning(
        reason,
        EventScope::Global,
        format!(
            "{label} timed out on {} of {} clusters",
            timed_out.len(),
            total_clusters
        ),
    )
    .with_list(AnnotationKey::TimedoutClusters, timed_out)
    .with(AnnotationKey::TimedoutClustersCount, timed_out.len())
    .with(AnnotationKey::TotalClustersCount, total_clusters)
}

pub fn cluster_started(cluster: &str) -> UpgradeEventRecord {
    UpgradeEventRecord::normal(
        EventReason::ClusterUpgradeStarted,
        EventScope::Cluster,
        format!("Cluster {cluster} started remediation"),
    )
    .with(AnnotationKey::ClusterName, cluster)
}

pub fn cluster_succeeded(cluster: &str) -> UpgradeEventRecord {
    UpgradeEventRecord::normal(
        EventReason::ClusterUpgradeSucceeded,
        EventScope::Cluster,
        format!("Cluster {cluster} is compliant with all managed policies"),
    )
    .with(AnnotationKey::ClusterName, cluster)
}

pub fn cluster_regressed(cluster: &str) -> UpgradeEventRecord {
    UpgradeEventRecord::warning(
        EventReason::ClusterRegressed,
        EventScope::Cluster,
        format!("Cluster {cluster} is no longer compliant with all managed policies"),
    )
    .with(AnnotationKey::ClusterName, cluster)
}
