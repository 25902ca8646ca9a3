//! State machine for the per-cluster backup phase.
//!
//! ```text
//! PreparingToStart --cleanup--> Starting --job active--> Active
//!                                  |  ^                     |
//!                                  |  +--job/deps missing---+
//!                                  v                        v
//!                   Succeeded | Timeout | UnrecoverableError
//! ```
//!
//! Missing dependencies, job or job view are recreated in place, so a cluster
//! recovers from lost objects and operator restarts on its own. Terminal
//! states are never left.

use std::time::Duration;

use jiff::Timestamp;
use tracing::{debug, info, warn};

use crate::controller::collaborators::{JobCondition, JobPhase, ResourceApplier};
use crate::controller::error::Result;
use crate::controller::job_phase::{JobAction, PhaseRun, phase_timed_out};
use crate::crd::{BackupState, BackupStatus, PhaseState};

// ============================================================================
// Backup Events
// ============================================================================

/// Events that drive a cluster's backup state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupEvent {
    /// Leftovers of a previous attempt were removed.
    Prepared,
    DependenciesMissing,
    JobViewMissing,
    JobMissing,
    JobActive,
    JobSucceeded,
    /// The job hit its active deadline.
    DeadlineExceeded,
    /// The job exhausted its retries.
    BackoffExceeded,
    /// The backup phase as a whole ran out of time.
    PhaseTimedOut,
}

impl BackupEvent {
    /// Event for an observed job condition.
    pub fn from_condition(condition: JobCondition) -> Self {
        match condition {
            JobCondition::DependenciesMissing => BackupEvent::DependenciesMissing,
            JobCondition::ViewMissing => BackupEvent::JobViewMissing,
            JobCondition::Missing => BackupEvent::JobMissing,
            JobCondition::Active => BackupEvent::JobActive,
            JobCondition::Succeeded => BackupEvent::JobSucceeded,
            JobCondition::DeadlineExceeded => BackupEvent::DeadlineExceeded,
            JobCondition::BackoffExceeded => BackupEvent::BackoffExceeded,
        }
    }
}

impl std::fmt::Display for BackupEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupEvent::Prepared => write!(f, "Prepared"),
            BackupEvent::DependenciesMissing => write!(f, "DependenciesMissing"),
            BackupEvent::JobViewMissing => write!(f, "JobViewMissing"),
            BackupEvent::JobMissing => write!(f, "JobMissing"),
            BackupEvent::JobActive => write!(f, "JobActive"),
            BackupEvent::JobSucceeded => write!(f, "JobSucceeded"),
            BackupEvent::DeadlineExceeded => write!(f, "DeadlineExceeded"),
            BackupEvent::BackoffExceeded => write!(f, "BackoffExceeded"),
            BackupEvent::PhaseTimedOut => write!(f, "PhaseTimedOut"),
        }
    }
}

// ============================================================================
// Backup Transition
// ============================================================================

/// Represents a single state transition.
#[derive(Debug, Clone)]
pub struct BackupTransition {
    pub from: BackupState,
    pub to: BackupState,
    pub event: BackupEvent,
    /// Side effect that must succeed before `to` is recorded.
    pub action: JobAction,
    pub description: &'static str,
}

// ============================================================================
// Backup State Machine
// ============================================================================

/// Transition table for the backup phase.
#[derive(Debug, Clone)]
pub struct BackupStateMachine {
    transitions: Vec<BackupTransition>,
}

impl Default for BackupStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl BackupStateMachine {
    /// Create a new state machine with all valid transitions.
    pub fn new() -> Self {
        use BackupEvent as E;
        use BackupState as S;

        let t = |from: S, event: E, to: S, action: JobAction, description: &'static str| {
            BackupTransition {
                from,
                to,
                event,
                action,
                description,
            }
        };

        let mut transitions = vec![
            // From PreparingToStart
            t(
                S::PreparingToStart,
                E::Prepared,
                S::Starting,
                JobAction::Cleanup,
                "Previous backup resources removed",
            ),
            // From Starting
            t(
                S::Starting,
                E::DependenciesMissing,
                S::Starting,
                JobAction::EnsureDependencies,
                "Create backup job prerequisites",
            ),
            t(
                S::Starting,
                E::JobViewMissing,
                S::Starting,
                JobAction::DeployJob,
                "Deploy backup job and its view",
            ),
            t(
                S::Starting,
                E::JobMissing,
                S::Starting,
                JobAction::DeployJob,
                "Deploy backup job",
            ),
            t(
                S::Starting,
                E::JobActive,
                S::Active,
                JobAction::None,
                "Backup job is running",
            ),
            // From Active
            t(
                S::Active,
                E::JobActive,
                S::Active,
                JobAction::None,
                "Backup job still running",
            ),
            t(
                S::Active,
                E::JobViewMissing,
                S::Active,
                JobAction::EnsureJobView,
                "Recreate backup job view",
            ),
            t(
                S::Active,
                E::JobMissing,
                S::Starting,
                JobAction::None,
                "Backup job disappeared, starting over",
            ),
            t(
                S::Active,
                E::DependenciesMissing,
                S::Starting,
                JobAction::None,
                "Backup job prerequisites disappeared, starting over",
            ),
        ];

        // Outcomes observed while starting or running
        for from in [S::Starting, S::Active] {
            transitions.push(t(
                from,
                E::JobSucceeded,
                S::Succeeded,
                JobAction::DeleteDependencyViews,
                "Backup completed",
            ));
            transitions.push(t(
                from,
                E::DeadlineExceeded,
                S::Timeout,
                JobAction::DeleteDependencyViews,
                "Backup job hit its deadline",
            ));
            transitions.push(t(
                from,
                E::BackoffExceeded,
                S::UnrecoverableError,
                JobAction::DeleteDependencyViews,
                "Backup job failed permanently",
            ));
        }

        for from in [S::PreparingToStart, S::Starting, S::Active] {
            transitions.push(t(
                from,
                E::PhaseTimedOut,
                S::Timeout,
                JobAction::DeleteDependencyViews,
                "Backup phase timed out",
            ));
        }

        Self { transitions }
    }

    /// Find the transition for a state and event.
    pub fn transition(&self, from: BackupState, event: BackupEvent) -> Option<&BackupTransition> {
        self.transitions
            .iter()
            .find(|t| t.from == from && t.event == event)
    }

    /// Check if a state transition is valid.
    pub fn can_transition(&self, from: BackupState, to: BackupState) -> bool {
        if from == to && !from.is_terminal() {
            return true;
        }
        self.transitions
            .iter()
            .any(|t| t.from == from && t.to == to)
    }

    /// Get the list of valid next states from a given state.
    pub fn valid_transitions(&self, from: BackupState) -> Vec<BackupState> {
        let mut states: Vec<BackupState> = Vec::new();
        for t in self.transitions.iter().filter(|t| t.from == from) {
            if !states.contains(&t.to) {
                states.push(t.to);
            }
        }
        states
    }

    /// Get all transitions from a state.
    pub fn transitions_from(&self, state: BackupState) -> Vec<&BackupTransition> {
        self.transitions
            .iter()
            .filter(|t| t.from == state)
            .collect()
    }
}

/// Determine the event for a cluster in `state`.
///
/// Event priority:
/// 1. Terminal states produce nothing
/// 2. Phase timeout
/// 3. State-specific events
pub fn determine_backup_event(
    state: BackupState,
    observation: Option<JobCondition>,
    timed_out: bool,
) -> Option<BackupEvent> {
    if state.is_terminal() {
        return None;
    }
    if timed_out {
        return Some(BackupEvent::PhaseTimedOut);
    }
    match state {
        BackupState::PreparingToStart => Some(BackupEvent::Prepared),
        BackupState::Starting | BackupState::Active => {
            observation.map(BackupEvent::from_condition)
        }
        BackupState::Succeeded | BackupState::Timeout | BackupState::UnrecoverableError => None,
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Fresh backup status for the given clusters.
pub fn start_backup(clusters: &[String], now: Timestamp) -> BackupStatus {
    BackupStatus {
        started_at: Some(now.to_string()),
        clusters: clusters.to_vec(),
        status: clusters
            .iter()
            .map(|c| (c.clone(), BackupState::PreparingToStart))
            .collect(),
    }
}

/// Advance one cluster by at most one transition.
///
/// On error the caller keeps the previous state.
pub async fn step_backup_cluster(
    sm: &BackupStateMachine,
    applier: &dyn ResourceApplier,
    cluster: &str,
    state: BackupState,
    timed_out: bool,
) -> Result<BackupState> {
    if state.is_terminal() {
        return Ok(state);
    }

    let observation = match state {
        BackupState::Starting | BackupState::Active if !timed_out => {
            Some(applier.observe_job_condition(cluster, JobPhase::Backup).await?)
        }
        _ => None,
    };

    let Some(event) = determine_backup_event(state, observation, timed_out) else {
        return Ok(state);
    };
    let Some(transition) = sm.transition(state, event) else {
        warn!(cluster = %cluster, state = %state, event = %event, "No backup transition for event");
        return Ok(state);
    };

    transition
        .action
        .execute(applier, cluster, JobPhase::Backup)
        .await?;

    if transition.to == state {
        debug!(cluster = %cluster, state = %state, event = %event, "Backup unchanged");
    } else {
        info!(
            cluster = %cluster,
            from = %state,
            to = %transition.to,
            event = %event,
            "{}",
            transition.description
        );
    }
    Ok(transition.to)
}

/// Run one pass of the backup phase over every participating cluster.
pub async fn run_backup_phase(
    sm: &BackupStateMachine,
    applier: &dyn ResourceApplier,
    backup: &mut BackupStatus,
    timeout: Duration,
    now: Timestamp,
) -> PhaseRun {
    if backup.started_at.is_none() {
        backup.started_at = Some(now.to_string());
    }
    let timed_out = phase_timed_out(backup.started_at.as_deref(), timeout, now);
    let mut run = PhaseRun::default();

    for cluster in backup.clusters.clone() {
        let state = *backup.status.entry(cluster.clone()).or_default();
        let next = match step_backup_cluster(sm, applier, &cluster, state, timed_out).await {
            Ok(next) => next,
            Err(e) => {
                warn!(cluster = %cluster, state = %state, error = %e, "Backup step failed");
                run.failed.push(cluster.clone());
                state
            }
        };
        if next != state {
            backup.status.insert(cluster.clone(), next);
            run.transitions
                .push((cluster.clone(), state.to_string(), next.to_string()));
            if timed_out {
                run.timed_out.push(cluster.clone());
            }
        }
        if !next.is_terminal() {
            run.pending += 1;
        }
    }
    run
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
    use crate::controller::collaborators::MockResourceApplier;
    use crate::controller::error::Error;

    const ALL_STATES: [BackupState; 6] = [
        BackupState::PreparingToStart,
        BackupState::Starting,
        BackupState::Active,
        BackupState::Succeeded,
        BackupState::Timeout,
        BackupState::UnrecoverableError,
    ];

    #[test]
    fn test_backup_transitions() {
        let sm = BackupStateMachine::new();
        assert!(sm.can_transition(BackupState::PreparingToStart, BackupState::Starting));
        assert!(sm.can_transition(BackupState::Starting, BackupState::Active));
        assert!(sm.can_transition(BackupState::Active, BackupState::Starting));
        assert!(sm.can_transition(BackupState::Active, BackupState::Succeeded));
        assert!(!sm.can_transition(BackupState::PreparingToStart, BackupState::Active));
        assert!(!sm.can_transition(BackupState::Succeeded, BackupState::Starting));
    }

    #[test]
    fn test_terminal_states_have_no_transitions() {
        let sm = BackupStateMachine::new();
        for state in ALL_STATES.into_iter().filter(|s| s.is_terminal()) {
            assert!(sm.transitions_from(state).is_empty(), "{state} has exits");
            assert!(!sm.can_transition(state, state));
        }
    }

    #[test]
    fn test_every_live_state_can_time_out() {
        let sm = BackupStateMachine::new();
        for state in ALL_STATES.into_iter().filter(|s| !s.is_terminal()) {
            let t = sm.transition(state, BackupEvent::PhaseTimedOut).unwrap();
            assert_eq!(t.to, BackupState::Timeout);
        }
    }

    #[test]
    fn test_determine_event_priority() {
        assert_eq!(
            determine_backup_event(BackupState::Active, Some(JobCondition::Succeeded), true),
            Some(BackupEvent::PhaseTimedOut)
        );
        assert_eq!(
            determine_backup_event(BackupState::PreparingToStart, None, false),
            Some(BackupEvent::Prepared)
        );
        assert_eq!(
            determine_backup_event(BackupState::Starting, Some(JobCondition::Missing), false),
            Some(BackupEvent::JobMissing)
        );
        assert_eq!(
            determine_backup_event(BackupState::Succeeded, Some(JobCondition::Active), true),
            None
        );
    }

    #[tokio::test]
    async fn test_preparing_cleans_up_then_starts() {
        let sm = BackupStateMachine::new();
        let mut applier = MockResourceApplier::new();
        applier
            .expect_cleanup_job_resources()
            .times(1)
            .returning(|_, _| Ok(()));

        let next = step_backup_cluster(&sm, &applier, "spoke1", BackupState::PreparingToStart, false)
            .await
            .unwrap();
        assert_eq!(next, BackupState::Starting);
    }

    #[tokio::test]
    async fn test_starting_deploys_missing_job() {
        let sm = BackupStateMachine::new();
        let mut applier = MockResourceApplier::new();
        applier
            .expect_observe_job_condition()
            .returning(|_, _| Ok(JobCondition::Missing));
        applier
            .expect_ensure_job_resources()
            .withf(|_, phase| *phase == JobPhase::Backup)
            .times(1)
            .returning(|_, _| Ok(()));

        let next = step_backup_cluster(&sm, &applier, "spoke1", BackupState::Starting, false)
            .await
            .unwrap();
        assert_eq!(next, BackupState::Starting);
    }

    #[tokio::test]
    async fn test_backoff_is_unrecoverable() {
        let sm = BackupStateMachine::new();
        let mut applier = MockResourceApplier::new();
        applier
            .expect_observe_job_condition()
            .returning(|_, _| Ok(JobCondition::BackoffExceeded));
        applier
            .expect_delete_dependency_views()
            .returning(|_, _| Ok(()));

        let next = step_backup_cluster(&sm, &applier, "spoke1", BackupState::Active, false)
            .await
            .unwrap();
        assert_eq!(next, BackupState::UnrecoverableError);
    }

    #[tokio::test]
    async fn test_terminal_state_ignores_collaborators() {
        let sm = BackupStateMachine::new();
        // No expectations: any call would panic
        let applier = MockResourceApplier::new();
        for state in [
            BackupState::Succeeded,
            BackupState::Timeout,
            BackupState::UnrecoverableError,
        ] {
            let next = step_backup_cluster(&sm, &applier, "spoke1", state, true)
                .await
                .unwrap();
            assert_eq!(next, state);
        }
    }

    #[tokio::test]
    async fn test_failed_action_keeps_state() {
        let sm = BackupStateMachine::new();
        let mut applier = MockResourceApplier::new();
        applier
            .expect_observe_job_condition()
            .returning(|_, _| Ok(JobCondition::DependenciesMissing));
        applier
            .expect_ensure_dependencies()
            .returning(|_, _| Err(Error::Transient("hub unavailable".into())));

        let now: Timestamp = "2026-01-01T00:00:00Z".parse().unwrap();
        let mut backup = start_backup(&["spoke1".to_string()], now);
        backup.status.insert("spoke1".into(), BackupState::Starting);

        let run = run_backup_phase(&sm, &applier, &mut backup, Duration::from_secs(1200), now).await;
        assert_eq!(run.failed, vec!["spoke1".to_string()]);
        assert_eq!(run.pending, 1);
        assert_eq!(backup.status["spoke1"], BackupState::Starting);
    }

    #[tokio::test]
    async fn test_phase_timeout_converts_live_clusters() {
        let sm = BackupStateMachine::new();
        let mut applier = MockResourceApplier::new();
        applier
            .expect_delete_dependency_views()
            .times(1)
            .returning(|_, _| Ok(()));

        let started: Timestamp = "2026-01-01T00:00:00Z".parse().unwrap();
        let clusters = vec!["spoke1".to_string(), "spoke2".to_string()];
        let mut backup = start_backup(&clusters, started);
        backup.status.insert("spoke1".into(), BackupState::Active);
        backup.status.insert("spoke2".into(), BackupState::Succeeded);

        let now: Timestamp = "2026-01-01T00:20:01Z".parse().unwrap();
        let run = run_backup_phase(&sm, &applier, &mut backup, Duration::from_secs(1200), now).await;
        assert_eq!(backup.status["spoke1"], BackupState::Timeout);
        assert_eq!(backup.status["spoke2"], BackupState::Succeeded);
        assert_eq!(run.pending, 0);
        assert_eq!(run.transitions.len(), 1);
        assert_eq!(run.timed_out, vec!["spoke1".to_string()]);
    }

    #[tokio::test]
    async fn test_job_deadline_is_not_a_phase_timeout() {
        let sm = BackupStateMachine::new();
        let mut applier = MockResourceApplier::new();
        applier
            .expect_observe_job_condition()
            .returning(|_, _| Ok(JobCondition::DeadlineExceeded));
        applier
            .expect_delete_dependency_views()
            .returning(|_, _| Ok(()));

        let now: Timestamp = "2026-01-01T00:00:00Z".parse().unwrap();
        let mut backup = start_backup(&["spoke1".to_string()], now);
        backup.status.insert("spoke1".into(), BackupState::Active);

        let run = run_backup_phase(&sm, &applier, &mut backup, Duration::from_secs(1200), now).await;
        assert_eq!(backup.status["spoke1"], BackupState::Timeout);
        assert!(run.timed_out.is_empty());
    }
}
