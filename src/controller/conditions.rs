//! Folds per-cluster outcomes into job-level conditions.
//!
//! Phase conditions (`BackupDone`, `PrecachingDone`) are recomputed from the
//! per-cluster maps on every pass. An event is produced only when the summary
//! reason changes, so a settled phase is announced once.

use tracing::info;

use crate::controller::collaborators::JobPhase;
use crate::controller::events::{EventReason, EventScope, UpgradeEventRecord};
use crate::controller::status::{get_condition_reason, remove_condition, set_condition};
use crate::crd::{Condition, ConditionReason, ConditionType, PhaseState};

/// Aggregate outcome of a phase across clusters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseSummary {
    /// Every cluster succeeded.
    Done,
    /// Some clusters have not reached a terminal state.
    InProgress(usize),
    /// Every cluster settled and none succeeded.
    Failed(Vec<String>),
    /// Every cluster settled, some without success.
    PartiallyDone(Vec<String>),
}

impl PhaseSummary {
    /// Remediation may proceed past the phase.
    ///
    /// A partially done phase lets the clusters that succeeded continue.
    pub fn opens_gate(&self) -> bool {
        matches!(self, PhaseSummary::Done | PhaseSummary::PartiallyDone(_))
    }
}

/// Summarize per-cluster states of a phase.
///
/// Done holds iff every entry is the success state.
pub fn summarize_phase<'a, S, I>(states: I) -> PhaseSummary
where
    S: PhaseState + 'a,
    I: IntoIterator<Item = (&'a String, &'a S)>,
{
    let mut pending = 0usize;
    let mut succeeded = 0usize;
    let mut unsuccessful: Vec<String> = Vec::new();

    for (cluster, state) in states {
        if !state.is_terminal() {
            pending += 1;
        } else if state.is_success() {
            succeeded += 1;
        } else {
            unsuccessful.push(cluster.clone());
        }
    }

    if pending > 0 {
        PhaseSummary::InProgress(pending)
    } else if unsuccessful.is_empty() {
        PhaseSummary::Done
    } else if succeeded == 0 {
        PhaseSummary::Failed(unsuccessful)
    } else {
        PhaseSummary::PartiallyDone(unsuccessful)
    }
}

fn phase_labels(phase: JobPhase) -> (ConditionType, &'static str) {
    match phase {
        JobPhase::Backup => (ConditionType::BackupDone, "Backup"),
        JobPhase::Precache => (ConditionType::PrecachingDone, "Precaching"),
    }
}

/// Write the phase's done condition and return the event for a settled change.
pub fn record_phase_summary(
    conditions: &mut Vec<Condition>,
    phase: JobPhase,
    summary: &PhaseSummary,
    generation: Option<i64>,
) -> Option<UpgradeEventRecord> {
    let (condition_type, label) = phase_labels(phase);
    let (done_reason, not_done_reason, ok_event, failed_event) = match phase {
        JobPhase::Backup => (
            ConditionReason::BackupCompleted,
            ConditionReason::BackupNotDone,
            EventReason::BackupCompleted,
            EventReason::BackupFailed,
        ),
        JobPhase::Precache => (
            ConditionReason::PrecachingCompleted,
            ConditionReason::PrecachingNotDone,
            EventReason::PrecachingCompleted,
            EventReason::PrecachingFailed,
        ),
    };

    let (status, reason, message) = match summary {
        PhaseSummary::Done => (
            true,
            done_reason,
            format!("{label} is completed for all clusters"),
        ),
        PhaseSummary::InProgress(n) => (
            false,
            not_done_reason,
            format!("{label} in progress for {n} clusters"),
        ),
        PhaseSummary::Failed(clusters) => (
            false,
            ConditionReason::Failed,
            format!("{label} failed for all clusters: {}", clusters.join(", ")),
        ),
        PhaseSummary::PartiallyDone(clusters) => (
            true,
            ConditionReason::PartiallyDone,
            format!(
                "{label} failed for clusters: {}; they are left out of remediation",
                clusters.join(", ")
            ),
        ),
    };

    let previous = get_condition_reason(conditions, condition_type).map(str::to_string);
    set_condition(
        conditions,
        Condition::new(condition_type, status, reason, &message, generation),
    );

    if phase == JobPhase::Precache && *summary == PhaseSummary::Done {
        remove_condition(conditions, ConditionType::PrecachingCanStart);
        remove_condition(conditions, ConditionType::PrecacheSpecValid);
    }

    if previous.as_deref() == Some(reason.as_str()) {
        return None;
    }

    match summary {
        PhaseSummary::Done => {
            info!(phase = %phase, "Phase completed for all clusters");
            Some(UpgradeEventRecord::normal(ok_event, EventScope::Global, message))
        }
        PhaseSummary::Failed(_) | PhaseSummary::PartiallyDone(_) => Some(
            UpgradeEventRecord::warning(failed_event, EventScope::Global, message),
        ),
        PhaseSummary::InProgress(_) => None,
    }
}

/// Record which clusters could not start pre-caching.
///
/// The condition is removed once no cluster is failing to start.
pub fn record_precache_start_failures(
    conditions: &mut Vec<Condition>,
    failed: &[String],
    generation: Option<i64>,
) {
    if failed.is_empty() {
        remove_condition(conditions, ConditionType::PrecachingCanStart);
        return;
    }
    set_condition(
        conditions,
        Condition::new(
            ConditionType::PrecachingCanStart,
            false,
            ConditionReason::ClustersFailedToStart,
            &format!(
                "Pre-caching could not start on clusters: {}",
                failed.join(", ")
            ),
            generation,
        ),
    );
}

/// Record the pre-cache spec check.
pub fn record_precache_spec(
    conditions: &mut Vec<Condition>,
    problem: Option<&str>,
    generation: Option<i64>,
) {
    let condition = match problem {
        None => Condition::new(
            ConditionType::PrecacheSpecValid,
            true,
            ConditionReason::PrecacheSpecIsWellFormed,
            "Pre-caching spec is valid and consistent",
            generation,
        ),
        Some(problem) => Condition::new(
            ConditionType::PrecacheSpecValid,
            false,
            ConditionReason::PrecacheSpecIncomplete,
            &format!("Pre-caching spec is incomplete: {problem}"),
            generation,
        ),
    };
    set_condition(conditions, condition);
}

/// Record the remediation outcome: Progressing, Succeeded and Ready.
pub fn record_remediation_outcome(
    conditions: &mut Vec<Condition>,
    succeeded: bool,
    message: &str,
    generation: Option<i64>,
) {
    let reason = if succeeded {
        ConditionReason::Completed
    } else {
        ConditionReason::TimedOut
    };
    set_condition(
        conditions,
        Condition::progressing(false, reason, message, generation),
    );
    set_condition(
        conditions,
        Condition::new(ConditionType::Succeeded, succeeded, reason, message, generation),
    );
    set_condition(
        conditions,
        Condition::ready(succeeded, reason, message, generation),
    );
}

/// Record that remediation is running or waiting.
pub fn record_progressing(
    conditions: &mut Vec<Condition>,
    progressing: bool,
    reason: ConditionReason,
    message: &str,
    generation: Option<i64>,
) {
    set_condition(
        conditions,
        Condition::progressing(progressing, reason, message, generation),
    );
    // Ready stays False until the job finishes
    set_condition(
        conditions,
        Condition::ready(false, reason, message, generation),
    );
}
