//! Top-level driver of one reconciliation pass.
//!
//! A pass walks the gates in order and stops at the first one that is not
//! satisfied yet:
//!
//! 1. Validation (clusters, policies, strategy) and the one-time plan
//! 2. Backup, when requested, until `BackupDone=True`
//! 3. Pre-caching, when requested, until `PrecachingDone=True`
//!
//! A phase that succeeds on some clusters only opens its gate too; the
//! clusters it failed on are recorded in `status.clusters` and skipped by
//! every later step.
//! 4. `spec.enable`
//! 5. Remediation of the current batch
//!
//! All changes are made to the in-memory status; the reconciler commits the
//! whole record at the end of the pass. Collaborator errors abort the pass
//! before anything is committed, so the next pass retries the same step.

use std::sync::Arc;
use std::time::Duration;

use jiff::Timestamp;
use tracing::{debug, info, warn};

use crate::controller::backup_state_machine::{BackupStateMachine, run_backup_phase, start_backup};
use crate::controller::collaborators::{Collaborators, JobKey, JobPhase};
use crate::controller::conditions::{
    PhaseSummary, record_phase_summary, record_precache_spec, record_precache_start_failures,
    record_progressing, record_remediation_outcome, summarize_phase,
};
use crate::controller::config::{OperatorConfig, Requeue};
use crate::controller::error::Result;
use crate::controller::events::{self, UpgradeEventRecord};
use crate::controller::job_phase::PhaseRun;
use crate::controller::policy_progression::{
    ComplianceSnapshot, apply_walk, is_fully_compliant, walk_policies,
};
use crate::controller::precache_state_machine::{
    PrecacheStateMachine, failed_to_start, run_precache_phase, start_precaching,
};
use crate::controller::remediation_plan::{
    batch_timed_out, build_remediation_plan, calculate_batch_timeout, canary_batch_count,
};
use crate::controller::status::{is_condition_true, parse_timestamp, set_condition};
use crate::controller::validation::validate_upgrade;
use crate::crd::{
    BatchTimeoutAction, ClusterOutcome, ClusterRemediationProgress, ClusterRemediationState,
    ClusterState, Compliance, Condition, ConditionReason, ConditionType, FleetUpgradeSpec,
    FleetUpgradeStatus, PolicyStatus,
};

/// Coarse stage of a job, for logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStage {
    Validating,
    Backup,
    Precaching,
    Disabled,
    Remediating,
    Completed,
    TimedOut,
}

impl JobStage {
    pub const fn as_str(&self) -> &'static str {
        match self {
            JobStage::Validating => "Validating",
            JobStage::Backup => "Backup",
            JobStage::Precaching => "Precaching",
            JobStage::Disabled => "Disabled",
            JobStage::Remediating => "Remediating",
            JobStage::Completed => "Completed",
            JobStage::TimedOut => "TimedOut",
        }
    }

    /// All stages, for metric initialization.
    pub const ALL: [JobStage; 7] = [
        JobStage::Validating,
        JobStage::Backup,
        JobStage::Precaching,
        JobStage::Disabled,
        JobStage::Remediating,
        JobStage::Completed,
        JobStage::TimedOut,
    ];
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage a job is in according to its persisted status.
pub fn job_stage(spec: &FleetUpgradeSpec, status: &FleetUpgradeStatus) -> JobStage {
    let conditions = &status.conditions;
    if status.status.completed_at.is_some() {
        return if is_condition_true(conditions, ConditionType::Succeeded) {
            JobStage::Completed
        } else {
            JobStage::TimedOut
        };
    }
    if !is_condition_true(conditions, ConditionType::Validated) {
        return JobStage::Validating;
    }
    if spec.backup && !is_condition_true(conditions, ConditionType::BackupDone) {
        return JobStage::Backup;
    }
    if spec.pre_caching && !is_condition_true(conditions, ConditionType::PrecachingDone) {
        return JobStage::Precaching;
    }
    if !spec.enable {
        return JobStage::Disabled;
    }
    JobStage::Remediating
}

/// What a pass decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassOutcome {
    pub requeue: Requeue,
    pub events: Vec<UpgradeEventRecord>,
    /// A batch timed out during this pass.
    pub batch_timed_out: bool,
}

impl PassOutcome {
    fn new(requeue: Requeue, events: Vec<UpgradeEventRecord>) -> Self {
        Self {
            requeue,
            events,
            batch_timed_out: false,
        }
    }
}

/// Gate result: either keep going or stop the pass with a requeue.
enum Gate {
    Open,
    Closed(Requeue),
}

/// The remediation engine.
#[derive(Clone)]
pub struct BatchOrchestrator {
    collaborators: Collaborators,
    config: Arc<OperatorConfig>,
    backup_sm: Arc<BackupStateMachine>,
    precache_sm: Arc<PrecacheStateMachine>,
}

impl BatchOrchestrator {
    pub fn new(collaborators: Collaborators, config: Arc<OperatorConfig>) -> Self {
        Self {
            collaborators,
            config,
            backup_sm: Arc::new(BackupStateMachine::new()),
            precache_sm: Arc::new(PrecacheStateMachine::new()),
        }
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    /// Remove the placement objects of a job that is being deleted.
    pub async fn release(&self, job: &JobKey) -> Result<()> {
        info!(job = %job, "Releasing placement objects");
        self.collaborators.applier.delete_bindings(job).await
    }

    /// Run one reconciliation pass over `status`.
    pub async fn run_pass(
        &self,
        job: &JobKey,
        spec: &FleetUpgradeSpec,
        generation: Option<i64>,
        status: &mut FleetUpgradeStatus,
        now: Timestamp,
    ) -> Result<PassOutcome> {
        let mut events = Vec::new();

        if status.status.completed_at.is_some() {
            debug!(job = %job, "Job already finished");
            return Ok(PassOutcome::new(Requeue::Long, events));
        }

        if let Gate::Closed(requeue) = self
            .validate(job, spec, generation, status, &mut events)
            .await?
        {
            return Ok(PassOutcome::new(requeue, events));
        }

        if spec.backup && !is_condition_true(&status.conditions, ConditionType::BackupDone) {
            let gate = self.backup_gate(job, generation, status, now, &mut events).await;
            if let Gate::Closed(requeue) = gate {
                return Ok(PassOutcome::new(requeue, events));
            }
        }

        if spec.pre_caching && !is_condition_true(&status.conditions, ConditionType::PrecachingDone)
        {
            let gate = self
                .precache_gate(job, generation, status, now, &mut events)
                .await?;
            if let Gate::Closed(requeue) = gate {
                return Ok(PassOutcome::new(requeue, events));
            }
        }

        if !spec.enable {
            debug!(job = %job, "Remediation not enabled");
            record_progressing(
                &mut status.conditions,
                false,
                ConditionReason::NotEnabled,
                "Not enabled",
                generation,
            );
            return Ok(PassOutcome::new(Requeue::Long, events));
        }

        self.remediate(job, spec, generation, status, now, events)
            .await
    }

    // ========================================================================
    // Validation
    // ========================================================================

    async fn validate(
        &self,
        job: &JobKey,
        spec: &FleetUpgradeSpec,
        generation: Option<i64>,
        status: &mut FleetUpgradeStatus,
        events: &mut Vec<UpgradeEventRecord>,
    ) -> Result<Gate> {
        let validated = is_condition_true(&status.conditions, ConditionType::Validated);
        if validated && status.observed_generation == generation {
            return Ok(Gate::Open);
        }

        let selection = self
            .collaborators
            .registry
            .resolve_clusters(job, spec)
            .await?;
        let lookup = self.collaborators.policies.policy_list(job, spec).await?;
        status.observed_generation = generation;

        if let Err(failure) = validate_upgrade(spec, &selection, &lookup) {
            warn!(job = %job, reason = %failure.reason, "{}", failure.message);
            let changed = set_condition(
                &mut status.conditions,
                Condition::new(
                    ConditionType::Validated,
                    false,
                    failure.reason,
                    &failure.message,
                    generation,
                ),
            );
            if changed {
                events.push(failure.event);
            }
            return Ok(Gate::Closed(Requeue::Long));
        }

        status.managed_policies_for_upgrade = lookup.policies;
        let first_validation = status.remediation_plan.is_empty();
        if first_validation {
            status.remediation_plan = build_remediation_plan(
                &selection.clusters,
                &spec.remediation_strategy.canaries,
                usize::try_from(spec.remediation_strategy.max_concurrency).unwrap_or(usize::MAX),
            );
            let total = status.total_clusters();
            let batches = status.remediation_plan.len();
            info!(job = %job, clusters = total, batches = batches, "Remediation plan built");
            set_condition(
                &mut status.conditions,
                Condition::new(
                    ConditionType::ClustersSelected,
                    true,
                    ConditionReason::ClusterSelectionCompleted,
                    &format!("{total} clusters selected in {batches} batches"),
                    generation,
                ),
            );
            events.push(events::upgrade_created(total, batches));
        }

        set_condition(
            &mut status.conditions,
            Condition::new(
                ConditionType::Validated,
                true,
                ConditionReason::ValidationCompleted,
                "Completed validation",
                generation,
            ),
        );
        if !first_validation {
            debug!(job = %job, "Validation re-run for new generation");
        }
        Ok(Gate::Open)
    }

    // ========================================================================
    // Backup and pre-caching gates
    // ========================================================================

    async fn backup_gate(
        &self,
        job: &JobKey,
        generation: Option<i64>,
        status: &mut FleetUpgradeStatus,
        now: Timestamp,
        events: &mut Vec<UpgradeEventRecord>,
    ) -> Gate {
        let clusters = plan_clusters(status);
        if status.backup.is_none() {
            info!(job = %job, clusters = clusters.len(), "Starting backup");
            events.push(events::phase_started(JobPhase::Backup, &clusters));
        }
        let backup = status
            .backup
            .get_or_insert_with(|| start_backup(&clusters, now));
        let run = run_backup_phase(
            &self.backup_sm,
            self.collaborators.applier.as_ref(),
            backup,
            self.config.backup_timeout,
            now,
        )
        .await;
        let summary = summarize_phase(&backup.status);

        self.settle_phase(job, JobPhase::Backup, &run, &summary, generation, status, events)
    }

    async fn precache_gate(
        &self,
        job: &JobKey,
        generation: Option<i64>,
        status: &mut FleetUpgradeStatus,
        now: Timestamp,
        events: &mut Vec<UpgradeEventRecord>,
    ) -> Result<Gate> {
        if status.precaching.is_none() {
            let precache_spec = self
                .collaborators
                .policies
                .precache_spec(&status.managed_policies_for_upgrade)
                .await?;
            let problem = precache_spec.consistency_error();
            record_precache_spec(&mut status.conditions, problem, generation);
            if let Some(problem) = problem {
                warn!(job = %job, problem = %problem, "Pre-caching spec is incomplete");
                record_progressing(
                    &mut status.conditions,
                    false,
                    ConditionReason::NotStarted,
                    "Waiting for a valid pre-caching spec",
                    generation,
                );
                return Ok(Gate::Closed(Requeue::Long));
            }
            let clusters = eligible_clusters(status);
            info!(job = %job, clusters = clusters.len(), "Starting pre-caching");
            events.push(events::phase_started(JobPhase::Precache, &clusters));
            status.precaching = Some(start_precaching(&clusters, precache_spec, now));
        }

        let Some(precaching) = status.precaching.as_mut() else {
            return Ok(Gate::Closed(Requeue::Medium));
        };
        let run = run_precache_phase(
            &self.precache_sm,
            self.collaborators.applier.as_ref(),
            precaching,
            self.config.precache_timeout,
            now,
        )
        .await;
        let start_failures = failed_to_start(&run, precaching);
        let summary = summarize_phase(&precaching.status);

        record_precache_start_failures(&mut status.conditions, &start_failures, generation);
        Ok(self.settle_phase(job, JobPhase::Precache, &run, &summary, generation, status, events))
    }

    #[allow(clippy::too_many_arguments)]
    fn settle_phase(
        &self,
        job: &JobKey,
        phase: JobPhase,
        run: &PhaseRun,
        summary: &PhaseSummary,
        generation: Option<i64>,
        status: &mut FleetUpgradeStatus,
        events: &mut Vec<UpgradeEventRecord>,
    ) -> Gate {
        if !run.timed_out.is_empty() {
            let total = match phase {
                JobPhase::Backup => status.backup.as_ref().map_or(0, |b| b.clusters.len()),
                JobPhase::Precache => status.precaching.as_ref().map_or(0, |p| p.clusters.len()),
            };
            warn!(
                job = %job,
                phase = %phase,
                timed_out = run.timed_out.len(),
                total = total,
                "Phase timed out"
            );
            events.push(events::phase_timed_out(phase, &run.timed_out, total));
        }
        if let Some(event) = record_phase_summary(&mut status.conditions, phase, summary, generation)
        {
            events.push(event);
        }

        match summary {
            PhaseSummary::Done => Gate::Open,
            PhaseSummary::PartiallyDone(failed) => {
                let outcome = match phase {
                    JobPhase::Backup => ClusterOutcome::BackupFailed,
                    JobPhase::Precache => ClusterOutcome::PrecachingFailed,
                };
                for cluster in failed {
                    record_cluster_outcome(status, cluster, outcome, None);
                }
                warn!(
                    job = %job,
                    phase = %phase,
                    skipped = failed.len(),
                    "Continuing without clusters that did not complete the phase"
                );
                Gate::Open
            }
            PhaseSummary::InProgress(pending) => {
                debug!(
                    job = %job,
                    phase = %phase,
                    pending = *pending,
                    transitions = run.transitions.len(),
                    "Phase in progress"
                );
                record_progressing(
                    &mut status.conditions,
                    false,
                    ConditionReason::NotStarted,
                    &format!("Waiting for {phase} to complete"),
                    generation,
                );
                if run.has_failures() {
                    Gate::Closed(Requeue::Medium)
                } else {
                    Gate::Closed(Requeue::Short)
                }
            }
            PhaseSummary::Failed(_) => {
                record_progressing(
                    &mut status.conditions,
                    false,
                    ConditionReason::Failed,
                    &format!("Remediation blocked: {phase} did not succeed on any cluster"),
                    generation,
                );
                Gate::Closed(Requeue::Long)
            }
        }
    }

    // ========================================================================
    // Remediation
    // ========================================================================

    async fn remediate(
        &self,
        job: &JobKey,
        spec: &FleetUpgradeSpec,
        generation: Option<i64>,
        status: &mut FleetUpgradeStatus,
        now: Timestamp,
        mut events: Vec<UpgradeEventRecord>,
    ) -> Result<PassOutcome> {
        let total_batches = status.remediation_plan.len();
        let total_clusters = status.total_clusters();

        if status.status.started_at.is_none() {
            info!(job = %job, batches = total_batches, "Starting remediation");
            status.status.started_at = Some(now.to_string());
            events.push(events::upgrade_started(total_clusters, total_batches));
            if let Some(event) = open_batch(status, 1, now) {
                events.push(event);
            }
        }

        let batch = status.status.current_batch;
        let Some(batch_clusters) = status.current_batch_clusters().map(|clusters| {
            clusters
                .iter()
                .filter(|c| !status.is_skipped(c))
                .cloned()
                .collect::<Vec<_>>()
        }) else {
            // Nothing left to remediate
            return self.finish(job, spec, generation, status, now, events).await;
        };

        if !batch_clusters.is_empty() {
            for policy in &status.managed_policies_for_upgrade {
                self.collaborators
                    .applier
                    .ensure_binding(job, batch, &batch_clusters, policy)
                    .await?;
            }
        }

        let policy_count = status.managed_policies_for_upgrade.len();
        let targets: Vec<(String, usize)> = status
            .status
            .current_batch_remediation_progress
            .iter()
            .filter(|(_, p)| !p.state.is_terminal())
            .map(|(c, p)| (c.clone(), p.policy_index))
            .collect();

        let snapshot = ComplianceSnapshot::collect(
            self.collaborators.policies.as_ref(),
            &status.managed_policies_for_upgrade,
            &targets,
        )
        .await?;

        // Clusters of earlier batches only feed the regression list, so a
        // failed lookup there never holds up the current batch
        let previous_complete = previous_complete_clusters(status, batch);
        let (settled, unavailable) = ComplianceSnapshot::collect_settled(
            self.collaborators.policies.as_ref(),
            &status.managed_policies_for_upgrade,
            &previous_complete,
        )
        .await;

        // Current batch
        for cluster in &batch_clusters {
            let Some(progress) = status
                .status
                .current_batch_remediation_progress
                .get_mut(cluster)
            else {
                continue;
            };
            if progress.state.is_terminal() {
                continue;
            }
            let was_not_started = progress.state == ClusterRemediationState::NotStarted;
            let outcome = walk_policies(cluster, progress, policy_count, &snapshot, now);
            let from_index = progress.policy_index;
            if apply_walk(progress, &outcome) {
                debug!(
                    job = %job,
                    cluster = %cluster,
                    batch = batch,
                    from = from_index,
                    to = outcome.policy_index,
                    stop = ?outcome.stop,
                    "Cluster progress updated"
                );
            }
            if was_not_started {
                events.push(events::cluster_started(cluster));
            }
            if outcome.is_completed() {
                info!(job = %job, cluster = %cluster, batch = batch, "Cluster completed all policies");
                record_cluster_outcome(status, cluster, ClusterOutcome::Complete, None);
                events.push(events::cluster_succeeded(cluster));
            }
        }

        // Previous batches
        for cluster in previous_complete {
            if unavailable.contains(&cluster) {
                continue;
            }
            let compliant = is_fully_compliant(&cluster, policy_count, &settled);
            let listed = status.regressed_clusters.contains(&cluster);
            if !compliant && !listed {
                warn!(job = %job, cluster = %cluster, "Cluster regressed from compliance");
                status.regressed_clusters.push(cluster.clone());
                events.push(events::cluster_regressed(&cluster));
            } else if compliant && listed {
                info!(job = %job, cluster = %cluster, "Regressed cluster is compliant again");
                status.regressed_clusters.retain(|c| *c != cluster);
            }
        }

        let all_completed = status
            .status
            .current_batch_remediation_progress
            .values()
            .all(|p| p.state == ClusterRemediationState::Completed);

        if all_completed {
            info!(job = %job, batch = batch, "Batch completed");
            events.push(events::batch_succeeded(batch, total_batches, &batch_clusters));
            return self
                .advance(job, spec, generation, status, now, events, false)
                .await;
        }

        if self.batch_expired(spec, status, now) {
            let timed_out = self.time_out_batch(status);
            warn!(
                job = %job,
                batch = batch,
                timed_out = timed_out.len(),
                "Batch timed out"
            );
            events.push(events::batch_timed_out(
                batch,
                total_batches,
                &batch_clusters,
                &timed_out,
            ));

            let is_canary =
                batch <= canary_batch_count(&status.remediation_plan, &spec.remediation_strategy.canaries);
            let abort = is_canary
                || spec.remediation_strategy.batch_timeout_action == BatchTimeoutAction::Abort;
            let mut outcome = if abort {
                info!(job = %job, batch = batch, canary = is_canary, "Stopping remediation after batch timeout");
                self.finish(job, spec, generation, status, now, events).await?
            } else {
                self.advance(job, spec, generation, status, now, events, true)
                    .await?
            };
            outcome.batch_timed_out = true;
            return Ok(outcome);
        }

        record_progressing(
            &mut status.conditions,
            true,
            ConditionReason::InProgress,
            &format!("Remediating batch {batch} of {total_batches}"),
            generation,
        );
        Ok(PassOutcome::new(Requeue::Short, events))
    }

    fn batch_expired(&self, spec: &FleetUpgradeSpec, status: &FleetUpgradeStatus, now: Timestamp) -> bool {
        let progress = &status.status;
        let (Some(started), Some(batch_started)) = (
            parse_timestamp(progress.started_at.as_deref()),
            parse_timestamp(progress.current_batch_started_at.as_deref()),
        ) else {
            return false;
        };
        let job_timeout = Duration::from_secs(spec.remediation_strategy.timeout.saturating_mul(60));
        let batch_timeout = calculate_batch_timeout(
            job_timeout,
            started,
            batch_started,
            status.remediation_plan.len(),
            progress.current_batch,
        );
        batch_timed_out(batch_started, batch_timeout, now)
    }

    /// Mark every unfinished cluster of the current batch as timed out.
    fn time_out_batch(&self, status: &mut FleetUpgradeStatus) -> Vec<String> {
        let mut timed_out = Vec::new();
        let mut stuck_on = Vec::new();
        for (cluster, progress) in status.status.current_batch_remediation_progress.iter_mut() {
            if progress.state.is_terminal() {
                continue;
            }
            progress.state = ClusterRemediationState::TimedOut;
            timed_out.push(cluster.clone());
            let policy = status
                .managed_policies_for_upgrade
                .get(progress.policy_index)
                .map(|p| PolicyStatus {
                    name: p.name.clone(),
                    status: Compliance::NonCompliant,
                });
            stuck_on.push((cluster.clone(), policy));
        }
        for (cluster, policy) in stuck_on {
            record_cluster_outcome(status, &cluster, ClusterOutcome::Timedout, policy);
        }
        timed_out
    }

    #[allow(clippy::too_many_arguments)]
    async fn advance(
        &self,
        job: &JobKey,
        spec: &FleetUpgradeSpec,
        generation: Option<i64>,
        status: &mut FleetUpgradeStatus,
        now: Timestamp,
        mut events: Vec<UpgradeEventRecord>,
        after_timeout: bool,
    ) -> Result<PassOutcome> {
        let next = status.status.current_batch + 1;
        if next > status.remediation_plan.len() {
            return self.finish(job, spec, generation, status, now, events).await;
        }
        info!(job = %job, batch = next, after_timeout = after_timeout, "Opening next batch");
        if let Some(event) = open_batch(status, next, now) {
            events.push(event);
        }
        record_progressing(
            &mut status.conditions,
            true,
            ConditionReason::InProgress,
            &format!("Remediating batch {next} of {}", status.remediation_plan.len()),
            generation,
        );
        Ok(PassOutcome::new(Requeue::Short, events))
    }

    async fn finish(
        &self,
        job: &JobKey,
        spec: &FleetUpgradeSpec,
        generation: Option<i64>,
        status: &mut FleetUpgradeStatus,
        now: Timestamp,
        mut events: Vec<UpgradeEventRecord>,
    ) -> Result<PassOutcome> {
        let timed_out: Vec<String> = status
            .clusters
            .iter()
            .filter(|c| c.state == ClusterOutcome::Timedout)
            .map(|c| c.name.clone())
            .collect();
        let succeeded = timed_out.is_empty();
        let total = status.total_clusters();
        let skipped = status.skipped_clusters();

        if succeeded && spec.delete_objects_on_completion {
            self.collaborators.applier.delete_bindings(job).await?;
        }

        status.status.completed_at = Some(now.to_string());
        if succeeded {
            info!(job = %job, clusters = total, skipped = skipped.len(), "Upgrade completed");
            let message = if skipped.is_empty() {
                "All clusters are compliant with all the managed policies".to_string()
            } else {
                format!(
                    "All remediated clusters are compliant with all the managed policies; \
                     skipped after failed backup or pre-caching: {}",
                    skipped.join(", ")
                )
            };
            record_remediation_outcome(&mut status.conditions, true, &message, generation);
            events.push(events::upgrade_succeeded(total, status.remediation_plan.len()));
        } else {
            warn!(job = %job, timed_out = timed_out.len(), "Upgrade timed out");
            record_remediation_outcome(
                &mut status.conditions,
                false,
                &format!(
                    "Policy remediation took too long on {} of {} clusters",
                    timed_out.len(),
                    total
                ),
                generation,
            );
            events.push(events::upgrade_timed_out(&timed_out, total));
        }
        Ok(PassOutcome::new(Requeue::Long, events))
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Every planned cluster, in plan order.
fn plan_clusters(status: &FleetUpgradeStatus) -> Vec<String> {
    status.remediation_plan.iter().flatten().cloned().collect()
}

/// Planned clusters not skipped by a failed backup or pre-caching.
fn eligible_clusters(status: &FleetUpgradeStatus) -> Vec<String> {
    status
        .remediation_plan
        .iter()
        .flatten()
        .filter(|c| !status.is_skipped(c))
        .cloned()
        .collect()
}

/// Make `batch` (1-based) current and seed its progress entries.
///
/// Skipped clusters get no entry.
fn open_batch(status: &mut FleetUpgradeStatus, batch: usize, now: Timestamp) -> Option<UpgradeEventRecord> {
    let total_batches = status.remediation_plan.len();
    let clusters: Vec<String> = status
        .remediation_plan
        .get(batch.checked_sub(1)?)?
        .iter()
        .filter(|c| !status.is_skipped(c))
        .cloned()
        .collect();
    let progress = &mut status.status;
    progress.current_batch = batch;
    progress.current_batch_started_at = Some(now.to_string());
    progress.current_batch_remediation_progress = clusters
        .iter()
        .map(|c| (c.clone(), ClusterRemediationProgress::default()))
        .collect();
    Some(events::batch_started(batch, total_batches, &clusters))
}

/// Clusters of earlier batches that finished as complete.
fn previous_complete_clusters(status: &FleetUpgradeStatus, current_batch: usize) -> Vec<String> {
    status
        .remediation_plan
        .iter()
        .take(current_batch.saturating_sub(1))
        .flatten()
        .filter(|cluster| {
            status
                .clusters
                .iter()
                .any(|c| &c.name == *cluster && c.state == ClusterOutcome::Complete)
        })
        .cloned()
        .collect()
}

/// Record the outcome of a cluster that left its batch. Recorded once.
fn record_cluster_outcome(
    status: &mut FleetUpgradeStatus,
    cluster: &str,
    state: ClusterOutcome,
    current_policy: Option<PolicyStatus>,
) {
    if status.clusters.iter().any(|c| c.name == cluster) {
        return;
    }
    status.clusters.push(ClusterState {
        name: cluster.to_string(),
        state,
        current_policy,
    });
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::get_unwrap
)]
mod tests {
    use super::*;
    use crate::controller::collaborators::{
        ClusterSelection, MockClusterRegistry, MockPolicyStore, MockResourceApplier, PolicyLookup,
    };
    use crate::controller::status::get_condition_reason;
    use crate::crd::ManagedPolicyRef;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn orchestrator(
        policies: MockPolicyStore,
        applier: MockResourceApplier,
        registry: MockClusterRegistry,
    ) -> BatchOrchestrator {
        BatchOrchestrator::new(
            Collaborators::new(Arc::new(policies), Arc::new(applier), Arc::new(registry)),
            Arc::new(OperatorConfig::default()),
        )
    }

    #[test]
    fn test_job_stage() {
        let mut spec = FleetUpgradeSpec {
            backup: true,
            ..Default::default()
        };
        let mut status = FleetUpgradeStatus::default();
        assert_eq!(job_stage(&spec, &status), JobStage::Validating);

        status.conditions.push(Condition::new(
            ConditionType::Validated,
            true,
            ConditionReason::ValidationCompleted,
            "ok",
            None,
        ));
        assert_eq!(job_stage(&spec, &status), JobStage::Backup);

        spec.backup = false;
        spec.enable = false;
        assert_eq!(job_stage(&spec, &status), JobStage::Disabled);

        status.status.completed_at = Some("2026-01-01T00:00:00Z".into());
        assert_eq!(job_stage(&spec, &status), JobStage::TimedOut);
    }

    #[test]
    fn test_open_batch_seeds_progress() {
        let mut status = FleetUpgradeStatus {
            remediation_plan: vec![names(&["c3"]), names(&["c1", "c2"])],
            ..Default::default()
        };
        let event = open_batch(&mut status, 2, Timestamp::now()).unwrap();
        assert_eq!(event.reason, crate::controller::events::EventReason::BatchStarted);
        assert_eq!(status.status.current_batch, 2);
        assert_eq!(status.status.current_batch_remediation_progress.len(), 2);
        assert!(open_batch(&mut status, 3, Timestamp::now()).is_none());
    }

    #[tokio::test]
    async fn test_validation_failure_blocks_pass() {
        let mut registry = MockClusterRegistry::new();
        registry.expect_resolve_clusters().returning(|_, _| {
            Ok(ClusterSelection {
                clusters: vec!["spoke1".to_string()],
                missing: vec!["spoke2".to_string()],
            })
        });
        let mut policies = MockPolicyStore::new();
        policies.expect_policy_list().returning(|_, _| {
            Ok(PolicyLookup {
                policies: vec![ManagedPolicyRef::new("p1", "policies")],
                ..Default::default()
            })
        });
        // No applier expectations: nothing may be created
        let engine = orchestrator(policies, MockResourceApplier::new(), registry);

        let spec = FleetUpgradeSpec {
            clusters: names(&["spoke1", "spoke2"]),
            managed_policies: names(&["p1"]),
            ..Default::default()
        };
        let mut status = FleetUpgradeStatus::default();
        let job = JobKey::new("fleet", "fu-1");

        let outcome = engine
            .run_pass(&job, &spec, Some(1), &mut status, Timestamp::now())
            .await
            .unwrap();
        assert_eq!(outcome.requeue, Requeue::Long);
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(
            get_condition_reason(&status.conditions, ConditionType::Validated),
            Some("ClusterNotFound")
        );
        assert!(status.remediation_plan.is_empty());

        // Same failure again: no duplicate event
        let outcome = engine
            .run_pass(&job, &spec, Some(1), &mut status, Timestamp::now())
            .await
            .unwrap();
        assert!(outcome.events.is_empty());
    }

    #[tokio::test]
    async fn test_finished_job_is_left_alone() {
        let engine = orchestrator(
            MockPolicyStore::new(),
            MockResourceApplier::new(),
            MockClusterRegistry::new(),
        );
        let mut status = FleetUpgradeStatus::default();
        status.status.completed_at = Some("2026-01-01T00:00:00Z".into());
        let before = status.clone();

        let outcome = engine
            .run_pass(
                &JobKey::new("fleet", "fu-1"),
                &FleetUpgradeSpec::default(),
                Some(1),
                &mut status,
                Timestamp::now(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.requeue, Requeue::Long);
        assert_eq!(status, before);
    }

    #[tokio::test]
    async fn test_release_deletes_bindings() {
        let mut applier = MockResourceApplier::new();
        applier
            .expect_delete_bindings()
            .withf(|job| job.name == "fu-1")
            .times(1)
            .returning(|_| Ok(()));
        let engine = orchestrator(MockPolicyStore::new(), applier, MockClusterRegistry::new());
        engine.release(&JobKey::new("fleet", "fu-1")).await.unwrap();
    }
}
