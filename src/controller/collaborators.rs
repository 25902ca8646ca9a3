//! Collaborator interfaces consumed by the remediation engine.
//!
//! The engine never talks to the API server directly. Everything it needs to
//! know about policies, remote jobs and clusters comes through these traits as
//! typed values, so the state machines can be driven by in-memory fakes in
//! tests and by the Kubernetes adapters in `kube_collaborators` in production.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;

#[cfg(test)]
use mockall::automock;

use crate::controller::error::Result;
use crate::crd::{Compliance, FleetUpgrade, FleetUpgradeSpec, ManagedPolicyRef, PrecacheSpec};

/// Identity of a FleetUpgrade, used to name the objects created for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub namespace: String,
    pub name: String,
}

impl JobKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key for a FleetUpgrade object.
    pub fn from_upgrade(upgrade: &FleetUpgrade) -> Self {
        Self::new(
            upgrade.namespace().unwrap_or_else(|| "default".to_string()),
            upgrade.name_any(),
        )
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Pre-remediation job phase a remote job belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobPhase {
    Backup,
    Precache,
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPhase::Backup => write!(f, "backup"),
            JobPhase::Precache => write!(f, "precache"),
        }
    }
}

/// What the applier can observe about a phase's remote job on one cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobCondition {
    /// Namespace, service account or other job prerequisites are absent.
    DependenciesMissing,
    /// The hub-side view that mirrors the job status does not exist.
    ViewMissing,
    /// The view exists but no job was found on the cluster.
    Missing,
    Active,
    Succeeded,
    /// The job hit its active deadline.
    DeadlineExceeded,
    /// The job exhausted its retries.
    BackoffExceeded,
}

impl std::fmt::Display for JobCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobCondition::DependenciesMissing => write!(f, "DependenciesMissing"),
            JobCondition::ViewMissing => write!(f, "ViewMissing"),
            JobCondition::Missing => write!(f, "Missing"),
            JobCondition::Active => write!(f, "Active"),
            JobCondition::Succeeded => write!(f, "Succeeded"),
            JobCondition::DeadlineExceeded => write!(f, "DeadlineExceeded"),
            JobCondition::BackoffExceeded => write!(f, "BackoffExceeded"),
        }
    }
}

/// Result of resolving `spec.managedPolicies`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyLookup {
    /// Resolved policies in spec order.
    pub policies: Vec<ManagedPolicyRef>,
    /// Names with no matching policy.
    pub missing: Vec<String>,
    /// Names whose policy cannot be used for remediation.
    pub invalid: Vec<String>,
    /// Names found in more than one namespace, with those namespaces.
    pub ambiguous: BTreeMap<String, Vec<String>>,
}

impl PolicyLookup {
    /// Every requested policy resolved to exactly one usable policy.
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.invalid.is_empty() && self.ambiguous.is_empty()
    }
}

/// Result of resolving the target cluster set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterSelection {
    /// Existing target clusters, explicit list first, without duplicates.
    pub clusters: Vec<String>,
    /// Explicitly named clusters the registry does not know.
    pub missing: Vec<String>,
}

/// Source of policies and per-cluster compliance.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Resolve the job's managed policies, in order.
    async fn policy_list(&self, job: &JobKey, spec: &FleetUpgradeSpec) -> Result<PolicyLookup>;

    /// Compliance of one cluster with one policy.
    async fn compliance_of(&self, cluster: &str, policy: &ManagedPolicyRef) -> Result<Compliance>;

    /// Compliance of several clusters with one policy.
    ///
    /// Clusters absent from the result were not captured. The default asks
    /// cluster by cluster; stores that can read a policy's status once
    /// override it.
    async fn cluster_compliance(
        &self,
        policy: &ManagedPolicyRef,
        clusters: &[String],
    ) -> Result<BTreeMap<String, Compliance>> {
        let mut compliance = BTreeMap::new();
        for cluster in clusters {
            let signal = self.compliance_of(cluster, policy).await?;
            compliance.insert(cluster.clone(), signal);
        }
        Ok(compliance)
    }

    /// Minimum soak time the policy declares, if any.
    ///
    /// An invalid declaration is an error; callers treat it as no soak.
    async fn soak_duration(&self, policy: &ManagedPolicyRef) -> Result<Option<Duration>>;

    /// Content to pre-cache, extracted from the policies.
    async fn precache_spec(&self, policies: &[ManagedPolicyRef]) -> Result<PrecacheSpec>;
}

/// Creates and removes the objects that make things happen on clusters.
///
/// Every mutating call is idempotent: creating something that already exists
/// or deleting something that is gone succeeds.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceApplier: Send + Sync {
    /// Bind a policy to the clusters of a batch so it gets enforced there.
    async fn ensure_binding(
        &self,
        job: &JobKey,
        batch_index: usize,
        clusters: &[String],
        policy: &ManagedPolicyRef,
    ) -> Result<()>;

    /// Remove every binding created for the job.
    async fn delete_bindings(&self, job: &JobKey) -> Result<()>;

    /// Deploy the phase's job on the cluster, together with its status view.
    async fn ensure_job_resources(&self, cluster: &str, phase: JobPhase) -> Result<()>;

    /// Create the prerequisites the phase's job needs on the cluster.
    async fn ensure_dependencies(&self, cluster: &str, phase: JobPhase) -> Result<()>;

    /// Ship the pre-cache content list to the cluster for the pre-cache job.
    async fn stage_precache_spec(&self, cluster: &str, spec: &PrecacheSpec) -> Result<()>;

    /// Create the hub-side view of the phase's job.
    async fn ensure_job_view(&self, cluster: &str, phase: JobPhase) -> Result<()>;

    /// Observe the phase's job on the cluster.
    async fn observe_job_condition(&self, cluster: &str, phase: JobPhase) -> Result<JobCondition>;

    /// Whether the namespace of a previous job is still on the cluster.
    async fn job_namespace_present(&self, cluster: &str, phase: JobPhase) -> Result<bool>;

    /// Request deletion of the job namespace on the cluster and watch it go.
    async fn delete_job_namespace(&self, cluster: &str, phase: JobPhase) -> Result<()>;

    /// Remove the views that watch the job's prerequisites.
    async fn delete_dependency_views(&self, cluster: &str, phase: JobPhase) -> Result<()>;

    /// Remove every view and action left by the phase on the cluster.
    ///
    /// The job namespace is left alone; see [`ResourceApplier::delete_job_namespace`].
    async fn cleanup_job_resources(&self, cluster: &str, phase: JobPhase) -> Result<()>;
}

/// Resolves which clusters belong to a job.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterRegistry: Send + Sync {
    async fn resolve_clusters(&self, job: &JobKey, spec: &FleetUpgradeSpec)
    -> Result<ClusterSelection>;
}

/// The three collaborators bundled for the engine.
#[derive(Clone)]
pub struct Collaborators {
    pub policies: Arc<dyn PolicyStore>,
    pub applier: Arc<dyn ResourceApplier>,
    pub registry: Arc<dyn ClusterRegistry>,
}

impl Collaborators {
    pub fn new(
        policies: Arc<dyn PolicyStore>,
        applier: Arc<dyn ResourceApplier>,
        registry: Arc<dyn ClusterRegistry>,
    ) -> Self {
        Self {
            policies,
            applier,
            registry,
        }
    }
}
