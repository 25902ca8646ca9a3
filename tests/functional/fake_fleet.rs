//! In-memory fleet for driving the remediation engine without a hub cluster.
//!
//! `FakeFleet` implements all three collaborator traits over shared state.
//! Tests script the fleet (cluster labels, policy compliance, job outcomes)
//! and the engine sees it exactly the way it sees the Kubernetes adapters.
//!
//! Remote jobs follow the same resource lifecycle as the real adapters: a job
//! needs its dependencies and its view before it can be observed, and a
//! cleanup removes everything except the job namespace.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jiff::{SignedDuration, Timestamp};

use fleet_upgrade_operator::controller::batch_orchestrator::{BatchOrchestrator, PassOutcome};
use fleet_upgrade_operator::controller::collaborators::{
    ClusterRegistry, ClusterSelection, Collaborators, JobCondition, JobKey, JobPhase,
    PolicyLookup, PolicyStore, ResourceApplier,
};
use fleet_upgrade_operator::controller::config::OperatorConfig;
use fleet_upgrade_operator::controller::error::{Error, Result};
use fleet_upgrade_operator::controller::events::{EventReason, UpgradeEventRecord};
use fleet_upgrade_operator::controller::status::{find_condition, get_condition_reason};
use fleet_upgrade_operator::crd::{
    ClusterRemediationProgress, Compliance, Condition, ConditionType, FleetUpgradeSpec,
    FleetUpgradeStatus, ManagedPolicyRef, PrecacheSpec,
};

/// One scripted job run: how many polls it stays active, then how it ends.
#[derive(Debug, Clone, Copy)]
struct JobScript {
    active_polls: u32,
    outcome: JobCondition,
}

impl Default for JobScript {
    fn default() -> Self {
        Self {
            active_polls: 0,
            outcome: JobCondition::Succeeded,
        }
    }
}

/// Remote resources of one job on one cluster.
#[derive(Debug, Default)]
struct RemoteJob {
    dependencies: bool,
    view: bool,
    deployed: Option<JobScript>,
    namespace: bool,
    deploys: u32,
}

#[derive(Debug, Default)]
struct FleetState {
    clusters: BTreeMap<String, BTreeMap<String, String>>,
    policies: Vec<ManagedPolicyRef>,
    invalid: BTreeSet<String>,
    compliance: HashMap<(String, String), Compliance>,
    soak: HashMap<String, Duration>,
    invalid_soak: BTreeSet<String>,
    precache_spec: PrecacheSpec,
    scripts: HashMap<(String, JobPhase), VecDeque<JobScript>>,
    jobs: HashMap<(String, JobPhase), RemoteJob>,
    bindings: BTreeMap<(usize, String), Vec<String>>,
    binding_deletions: u32,
    staged: BTreeMap<String, PrecacheSpec>,
    unreachable: BTreeSet<String>,
    compliance_outage: bool,
    compliance_failures: BTreeSet<String>,
}

/// Shared in-memory fleet. Clones see the same state.
#[derive(Clone, Debug, Default)]
pub struct FakeFleet {
    state: Arc<Mutex<FleetState>>,
}

impl FakeFleet {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut FleetState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    /// Register managed clusters without labels.
    pub fn with_clusters(self, clusters: &[&str]) -> Self {
        for cluster in clusters {
            self.add_cluster(cluster, BTreeMap::new());
        }
        self
    }

    /// Register root policies in the `policies` namespace.
    pub fn with_policies(self, policies: &[&str]) -> Self {
        for policy in policies {
            self.add_policy(policy, "policies");
        }
        self
    }

    pub fn add_cluster(&self, name: &str, labels: BTreeMap<String, String>) {
        self.with(|s| s.clusters.insert(name.to_string(), labels));
    }

    pub fn add_policy(&self, name: &str, namespace: &str) {
        self.with(|s| s.policies.push(ManagedPolicyRef::new(name, namespace)));
    }

    /// Make a policy fail the structural checks.
    pub fn mark_invalid(&self, policy: &str) {
        self.with(|s| s.invalid.insert(policy.to_string()));
    }

    pub fn set_compliance(&self, cluster: &str, policy: &str, compliance: Compliance) {
        self.with(|s| {
            s.compliance
                .insert((cluster.to_string(), policy.to_string()), compliance)
        });
    }

    pub fn set_compliant(&self, cluster: &str, policies: &[&str]) {
        for policy in policies {
            self.set_compliance(cluster, policy, Compliance::Compliant);
        }
    }

    pub fn set_soak(&self, policy: &str, secs: u64) {
        self.with(|s| s.soak.insert(policy.to_string(), Duration::from_secs(secs)));
    }

    pub fn set_invalid_soak(&self, policy: &str) {
        self.with(|s| s.invalid_soak.insert(policy.to_string()));
    }

    pub fn set_precache_spec(&self, spec: PrecacheSpec) {
        self.with(|s| s.precache_spec = spec);
    }

    /// Queue the behavior of the next job deployed for `cluster`.
    pub fn script_job(&self, cluster: &str, phase: JobPhase, active_polls: u32, outcome: JobCondition) {
        self.with(|s| {
            s.scripts
                .entry((cluster.to_string(), phase))
                .or_default()
                .push_back(JobScript {
                    active_polls,
                    outcome,
                })
        });
    }

    /// Every remote call for `cluster` fails until healed.
    pub fn make_unreachable(&self, cluster: &str) {
        self.with(|s| s.unreachable.insert(cluster.to_string()));
    }

    pub fn heal(&self, cluster: &str) {
        self.with(|s| s.unreachable.remove(cluster));
    }

    pub fn set_compliance_outage(&self, outage: bool) {
        self.with(|s| s.compliance_outage = outage);
    }

    /// Compliance lookups for `cluster` alone fail until restored.
    pub fn fail_compliance(&self, cluster: &str) {
        self.with(|s| s.compliance_failures.insert(cluster.to_string()));
    }

    pub fn restore_compliance(&self, cluster: &str) {
        self.with(|s| s.compliance_failures.remove(cluster));
    }

    /// Placement bindings keyed by (batch, policy).
    pub fn bindings(&self) -> BTreeMap<(usize, String), Vec<String>> {
        self.with(|s| s.bindings.clone())
    }

    pub fn binding_deletions(&self) -> u32 {
        self.with(|s| s.binding_deletions)
    }

    pub fn staged_spec(&self, cluster: &str) -> Option<PrecacheSpec> {
        self.with(|s| s.staged.get(cluster).cloned())
    }

    pub fn deploy_count(&self, cluster: &str, phase: JobPhase) -> u32 {
        self.with(|s| {
            s.jobs
                .get(&(cluster.to_string(), phase))
                .map(|j| j.deploys)
                .unwrap_or_default()
        })
    }

    pub fn namespace_present(&self, cluster: &str, phase: JobPhase) -> bool {
        self.with(|s| {
            s.jobs
                .get(&(cluster.to_string(), phase))
                .is_some_and(|j| j.namespace)
        })
    }

    fn remote(&self, cluster: &str, phase: JobPhase, f: impl FnOnce(&mut RemoteJob)) -> Result<()> {
        self.with(|s| {
            if s.unreachable.contains(cluster) {
                return Err(Error::Transient(format!("cluster {cluster} is unreachable")));
            }
            f(s.jobs.entry((cluster.to_string(), phase)).or_default());
            Ok(())
        })
    }
}

#[async_trait]
impl PolicyStore for FakeFleet {
    async fn policy_list(&self, _job: &JobKey, spec: &FleetUpgradeSpec) -> Result<PolicyLookup> {
        Ok(self.with(|s| {
            let mut lookup = PolicyLookup::default();
            for name in &spec.managed_policies {
                let matches: Vec<&ManagedPolicyRef> =
                    s.policies.iter().filter(|p| &p.name == name).collect();
                match matches.as_slice() {
                    [] => lookup.missing.push(name.clone()),
                    [policy] if s.invalid.contains(name) => {
                        lookup.invalid.push(policy.name.clone());
                    }
                    [policy] => lookup.policies.push((*policy).clone()),
                    many => {
                        lookup.ambiguous.insert(
                            name.clone(),
                            many.iter().map(|p| p.namespace.clone()).collect(),
                        );
                    }
                }
            }
            lookup
        }))
    }

    async fn compliance_of(&self, cluster: &str, policy: &ManagedPolicyRef) -> Result<Compliance> {
        self.with(|s| {
            if s.compliance_outage {
                return Err(Error::Transient("policy status unavailable".to_string()));
            }
            if s.compliance_failures.contains(cluster) {
                return Err(Error::Transient(format!(
                    "policy status unavailable for cluster {cluster}"
                )));
            }
            Ok(s.compliance
                .get(&(cluster.to_string(), policy.name.clone()))
                .copied()
                .unwrap_or(Compliance::NonCompliant))
        })
    }

    async fn soak_duration(&self, policy: &ManagedPolicyRef) -> Result<Option<Duration>> {
        self.with(|s| {
            if s.invalid_soak.contains(&policy.name) {
                return Err(Error::Validation(format!(
                    "policy {} has an invalid soak annotation",
                    policy.name
                )));
            }
            Ok(s.soak.get(&policy.name).copied())
        })
    }

    async fn precache_spec(&self, _policies: &[ManagedPolicyRef]) -> Result<PrecacheSpec> {
        Ok(self.with(|s| s.precache_spec.clone()))
    }
}

#[async_trait]
impl ResourceApplier for FakeFleet {
    async fn ensure_binding(
        &self,
        _job: &JobKey,
        batch_index: usize,
        clusters: &[String],
        policy: &ManagedPolicyRef,
    ) -> Result<()> {
        self.with(|s| {
            s.bindings
                .insert((batch_index, policy.name.clone()), clusters.to_vec())
        });
        Ok(())
    }

    async fn delete_bindings(&self, _job: &JobKey) -> Result<()> {
        self.with(|s| {
            s.bindings.clear();
            s.binding_deletions += 1;
        });
        Ok(())
    }

    async fn ensure_job_resources(&self, cluster: &str, phase: JobPhase) -> Result<()> {
        self.with(|s| {
            if s.unreachable.contains(cluster) {
                return Err(Error::Transient(format!("cluster {cluster} is unreachable")));
            }
            let key = (cluster.to_string(), phase);
            let script = s
                .scripts
                .get_mut(&key)
                .and_then(VecDeque::pop_front)
                .unwrap_or_default();
            let job = s.jobs.entry(key).or_default();
            job.view = true;
            job.deployed = Some(script);
            job.deploys += 1;
            Ok(())
        })
    }

    async fn ensure_dependencies(&self, cluster: &str, phase: JobPhase) -> Result<()> {
        self.remote(cluster, phase, |job| {
            job.dependencies = true;
            job.namespace = true;
        })
    }

    async fn stage_precache_spec(&self, cluster: &str, spec: &PrecacheSpec) -> Result<()> {
        self.remote(cluster, JobPhase::Precache, |_| {})?;
        self.with(|s| s.staged.insert(cluster.to_string(), spec.clone()));
        Ok(())
    }

    async fn ensure_job_view(&self, cluster: &str, phase: JobPhase) -> Result<()> {
        self.remote(cluster, phase, |job| job.view = true)
    }

    async fn observe_job_condition(&self, cluster: &str, phase: JobPhase) -> Result<JobCondition> {
        let mut condition = JobCondition::Missing;
        self.remote(cluster, phase, |job| {
            condition = match (&mut job.deployed, job.view, job.dependencies) {
                (_, false, true) => JobCondition::ViewMissing,
                (_, _, false) => JobCondition::DependenciesMissing,
                (None, true, true) => JobCondition::Missing,
                (Some(script), true, true) if script.active_polls > 0 => {
                    script.active_polls -= 1;
                    JobCondition::Active
                }
                (Some(script), true, true) => script.outcome,
            };
        })?;
        Ok(condition)
    }

    async fn job_namespace_present(&self, cluster: &str, phase: JobPhase) -> Result<bool> {
        let mut present = false;
        self.remote(cluster, phase, |job| present = job.namespace)?;
        Ok(present)
    }

    async fn delete_job_namespace(&self, cluster: &str, phase: JobPhase) -> Result<()> {
        self.remote(cluster, phase, |job| job.namespace = false)
    }

    async fn delete_dependency_views(&self, cluster: &str, phase: JobPhase) -> Result<()> {
        self.remote(cluster, phase, |_| {})
    }

    async fn cleanup_job_resources(&self, cluster: &str, phase: JobPhase) -> Result<()> {
        self.remote(cluster, phase, |job| {
            job.dependencies = false;
            job.view = false;
            job.deployed = None;
        })
    }
}

#[async_trait]
impl ClusterRegistry for FakeFleet {
    async fn resolve_clusters(&self, _job: &JobKey, spec: &FleetUpgradeSpec) -> Result<ClusterSelection> {
        Ok(self.with(|s| {
            let mut selection = ClusterSelection::default();
            for name in &spec.clusters {
                if s.clusters.contains_key(name) {
                    if !selection.clusters.contains(name) {
                        selection.clusters.push(name.clone());
                    }
                } else {
                    selection.missing.push(name.clone());
                }
            }
            if !spec.cluster_label_selector.is_empty() {
                for (name, labels) in &s.clusters {
                    let matches = spec
                        .cluster_label_selector
                        .iter()
                        .all(|(k, v)| labels.get(k) == Some(v));
                    if matches && !selection.clusters.contains(name) {
                        selection.clusters.push(name.clone());
                    }
                }
            }
            selection
        }))
    }
}

/// Drives repeated engine passes against a fake fleet with a controllable clock.
///
/// Each pass works on a copy of the status and keeps it only when the pass
/// succeeds, the same way the reconciler only commits successful passes.
pub struct Harness {
    pub fleet: FakeFleet,
    pub engine: BatchOrchestrator,
    pub job: JobKey,
    pub spec: FleetUpgradeSpec,
    pub generation: Option<i64>,
    pub status: FleetUpgradeStatus,
    pub now: Timestamp,
    pub events: Vec<UpgradeEventRecord>,
}

impl Harness {
    pub fn new(fleet: FakeFleet, spec: FleetUpgradeSpec) -> Self {
        Self::with_config(fleet, spec, OperatorConfig::default())
    }

    pub fn with_config(fleet: FakeFleet, spec: FleetUpgradeSpec, config: OperatorConfig) -> Self {
        let collaborators = Collaborators::new(
            Arc::new(fleet.clone()),
            Arc::new(fleet.clone()),
            Arc::new(fleet.clone()),
        );
        Self {
            engine: BatchOrchestrator::new(collaborators, Arc::new(config)),
            fleet,
            job: JobKey::new("fleet", "fu-1"),
            spec,
            generation: Some(1),
            status: FleetUpgradeStatus::default(),
            now: "2026-03-01T00:00:00Z".parse().unwrap(),
            events: Vec::new(),
        }
    }

    pub async fn try_pass(&mut self) -> Result<PassOutcome> {
        let mut status = self.status.clone();
        let outcome = self
            .engine
            .run_pass(&self.job, &self.spec, self.generation, &mut status, self.now)
            .await?;
        self.status = status;
        self.events.extend(outcome.events.iter().cloned());
        Ok(outcome)
    }

    pub async fn pass(&mut self) -> PassOutcome {
        self.try_pass().await.expect("pass should succeed")
    }

    /// Run `n` passes and return the last outcome.
    pub async fn passes(&mut self, n: usize) -> PassOutcome {
        let mut last = None;
        for _ in 0..n {
            last = Some(self.pass().await);
        }
        last.expect("at least one pass")
    }

    pub fn advance(&mut self, secs: i64) {
        self.now = self
            .now
            .checked_add(SignedDuration::from_secs(secs))
            .unwrap();
    }

    pub fn condition(&self, condition_type: ConditionType) -> Option<&Condition> {
        find_condition(&self.status.conditions, condition_type)
    }

    pub fn reason(&self, condition_type: ConditionType) -> Option<&str> {
        get_condition_reason(&self.status.conditions, condition_type)
    }

    pub fn is_true(&self, condition_type: ConditionType) -> bool {
        self.condition(condition_type).is_some_and(Condition::is_true)
    }

    pub fn progress(&self, cluster: &str) -> &ClusterRemediationProgress {
        &self.status.status.current_batch_remediation_progress[cluster]
    }

    pub fn count(&self, reason: EventReason) -> usize {
        self.events.iter().filter(|e| e.reason == reason).count()
    }
}
