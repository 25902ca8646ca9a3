//! State machine for the per-cluster pre-caching phase.
//!
//! ```text
//! NotStarted --reset--> Starting --job active--> Active --job succeeded--> Succeeded
//!                       ^   |                      |
//!                       |   | deadline             +--> Timeout | UnrecoverableError
//!                       |   v
//!                       Restarting (waits for the old job namespace to go away)
//! ```
//!
//! `Starting` provisions dependencies, the job view and the job itself one
//! step per pass. A job that hits its deadline before it ever ran is torn down
//! and retried through `Restarting`. Terminal states are never left.

use std::time::Duration;

use jiff::Timestamp;
use tracing::{debug, info, warn};

use crate::controller::collaborators::{JobCondition, JobPhase, ResourceApplier};
use crate::controller::error::Result;
use crate::controller::job_phase::{JobAction, PhaseRun, phase_timed_out};
use crate::crd::{PhaseState, PrecacheSpec, PrecacheState, PrecachingStatus};

// ============================================================================
// Precache Events
// ============================================================================

/// Events that drive a cluster's pre-caching state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecacheEvent {
    /// Pre-caching was requested for the cluster.
    Start,
    DependenciesMissing,
    JobViewMissing,
    JobMissing,
    JobActive,
    JobSucceeded,
    DeadlineExceeded,
    BackoffExceeded,
    /// The namespace of the previous job still exists.
    NamespacePresent,
    /// The namespace of the previous job is gone.
    NamespaceGone,
    /// The pre-caching phase as a whole ran out of time.
    PhaseTimedOut,
}

impl PrecacheEvent {
    /// Event for an observed job condition.
    pub fn from_condition(condition: JobCondition) -> Self {
        match condition {
            JobCondition::DependenciesMissing => PrecacheEvent::DependenciesMissing,
            JobCondition::ViewMissing => PrecacheEvent::JobViewMissing,
            JobCondition::Missing => PrecacheEvent::JobMissing,
            JobCondition::Active => PrecacheEvent::JobActive,
            JobCondition::Succeeded => PrecacheEvent::JobSucceeded,
            JobCondition::DeadlineExceeded => PrecacheEvent::DeadlineExceeded,
            JobCondition::BackoffExceeded => PrecacheEvent::BackoffExceeded,
        }
    }
}

impl std::fmt::Display for PrecacheEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrecacheEvent::Start => write!(f, "Start"),
            PrecacheEvent::DependenciesMissing => write!(f, "DependenciesMissing"),
            PrecacheEvent::JobViewMissing => write!(f, "JobViewMissing"),
            PrecacheEvent::JobMissing => write!(f, "JobMissing"),
            PrecacheEvent::JobActive => write!(f, "JobActive"),
            PrecacheEvent::JobSucceeded => write!(f, "JobSucceeded"),
            PrecacheEvent::DeadlineExceeded => write!(f, "DeadlineExceeded"),
            PrecacheEvent::BackoffExceeded => write!(f, "BackoffExceeded"),
            PrecacheEvent::NamespacePresent => write!(f, "NamespacePresent"),
            PrecacheEvent::NamespaceGone => write!(f, "NamespaceGone"),
            PrecacheEvent::PhaseTimedOut => write!(f, "PhaseTimedOut"),
        }
    }
}

/// What the driver observed about a cluster before choosing an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecacheObservation {
    /// Condition of the pre-cache job.
    Job(JobCondition),
    /// Whether the previous job's namespace is still present.
    Namespace(bool),
}

// ============================================================================
// Precache Transition
// ============================================================================

/// Represents a single state transition.
#[derive(Debug, Clone)]
pub struct PrecacheTransition {
    pub from: PrecacheState,
    pub to: PrecacheState,
    pub event: PrecacheEvent,
    /// Side effect that must succeed before `to` is recorded.
    pub action: JobAction,
    pub description: &'static str,
}

// ============================================================================
// Precache State Machine
// ============================================================================

/// Transition table for the pre-caching phase.
#[derive(Debug, Clone)]
pub struct PrecacheStateMachine {
    transitions: Vec<PrecacheTransition>,
}

impl Default for PrecacheStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PrecacheStateMachine {
    /// Create a new state machine with all valid transitions.
    pub fn new() -> Self {
        use PrecacheEvent as E;
        use PrecacheState as S;

        let t = |from: S, event: E, to: S, action: JobAction, description: &'static str| {
            PrecacheTransition {
                from,
                to,
                event,
                action,
                description,
            }
        };

        let mut transitions = vec![
            // From NotStarted
            t(
                S::NotStarted,
                E::Start,
                S::Starting,
                JobAction::ResetJobView,
                "Stale pre-cache resources removed, job view created",
            ),
            // From Starting
            t(
                S::Starting,
                E::DependenciesMissing,
                S::Starting,
                JobAction::EnsureDependencies,
                "Create pre-cache job prerequisites",
            ),
            t(
                S::Starting,
                E::JobViewMissing,
                S::Starting,
                JobAction::EnsureJobView,
                "Recreate pre-cache job view",
            ),
            t(
                S::Starting,
                E::JobMissing,
                S::Starting,
                JobAction::DeployJob,
                "Deploy pre-cache job",
            ),
            t(
                S::Starting,
                E::JobActive,
                S::Active,
                JobAction::DeleteDependencyViews,
                "Pre-cache job is running",
            ),
            t(
                S::Starting,
                E::DeadlineExceeded,
                S::Restarting,
                JobAction::TriggerRestart,
                "Pre-cache job hit its deadline before running, restarting",
            ),
            // From Restarting
            t(
                S::Restarting,
                E::NamespacePresent,
                S::Restarting,
                JobAction::DeleteJobNamespace,
                "Waiting for previous pre-cache job to be removed",
            ),
            t(
                S::Restarting,
                E::NamespaceGone,
                S::Starting,
                JobAction::EnsureJobView,
                "Previous pre-cache job removed, starting again",
            ),
            // From Active
            t(
                S::Active,
                E::JobActive,
                S::Active,
                JobAction::None,
                "Pre-cache job still running",
            ),
            t(
                S::Active,
                E::JobViewMissing,
                S::Active,
                JobAction::EnsureJobView,
                "Recreate pre-cache job view",
            ),
            t(
                S::Active,
                E::JobMissing,
                S::Starting,
                JobAction::None,
                "Pre-cache job disappeared, starting over",
            ),
            t(
                S::Active,
                E::DependenciesMissing,
                S::Starting,
                JobAction::None,
                "Pre-cache job prerequisites disappeared, starting over",
            ),
            t(
                S::Active,
                E::DeadlineExceeded,
                S::Timeout,
                JobAction::DeleteDependencyViews,
                "Pre-cache job hit its deadline",
            ),
        ];

        for from in [S::Starting, S::Active] {
            transitions.push(t(
                from,
                E::JobSucceeded,
                S::Succeeded,
                JobAction::Cleanup,
                "Pre-caching completed",
            ));
            transitions.push(t(
                from,
                E::BackoffExceeded,
                S::UnrecoverableError,
                JobAction::DeleteDependencyViews,
                "Pre-cache job failed permanently",
            ));
        }

        for from in [S::NotStarted, S::Starting, S::Restarting, S::Active] {
            transitions.push(t(
                from,
                E::PhaseTimedOut,
                S::Timeout,
                JobAction::DeleteDependencyViews,
                "Pre-caching phase timed out",
            ));
        }

        Self { transitions }
    }

    /// Find the transition for a state and event.
    pub fn transition(
        &self,
        from: PrecacheState,
        event: PrecacheEvent,
    ) -> Option<&PrecacheTransition> {
        self.transitions
            .iter()
            .find(|t| t.from == from && t.event == event)
    }

    /// Check if a state transition is valid.
    pub fn can_transition(&self, from: PrecacheState, to: PrecacheState) -> bool {
        if from == to && !from.is_terminal() {
            return true;
        }
        self.transitions
            .iter()
            .any(|t| t.from == from && t.to == to)
    }

    /// Get the list of valid next states from a given state.
    pub fn valid_transitions(&self, from: PrecacheState) -> Vec<PrecacheState> {
        let mut states: Vec<PrecacheState> = Vec::new();
        for t in self.transitions.iter().filter(|t| t.from == from) {
            if !states.contains(&t.to) {
                states.push(t.to);
            }
        }
        states
    }

    /// Get all transitions from a state.
    pub fn transitions_from(&self, state: PrecacheState) -> Vec<&PrecacheTransition> {
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
/// 3. State-specific events; an observation of the wrong kind produces nothing
pub fn determine_precache_event(
    state: PrecacheState,
    observation: Option<PrecacheObservation>,
    timed_out: bool,
) -> Option<PrecacheEvent> {
    if state.is_terminal() {
        return None;
    }
    if timed_out {
        return Some(PrecacheEvent::PhaseTimedOut);
    }
    match (state, observation) {
        (PrecacheState::NotStarted, _) => Some(PrecacheEvent::Start),
        (PrecacheState::Restarting, Some(PrecacheObservation::Namespace(true))) => {
            Some(PrecacheEvent::NamespacePresent)
        }
        (PrecacheState::Restarting, Some(PrecacheObservation::Namespace(false))) => {
            Some(PrecacheEvent::NamespaceGone)
        }
        (
            PrecacheState::Starting | PrecacheState::Active,
            Some(PrecacheObservation::Job(condition)),
        ) => Some(PrecacheEvent::from_condition(condition)),
        _ => None,
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Fresh pre-caching status for the given clusters.
pub fn start_precaching(clusters: &[String], spec: PrecacheSpec, now: Timestamp) -> PrecachingStatus {
    PrecachingStatus {
        started_at: Some(now.to_string()),
        spec: Some(spec),
        clusters: clusters.to_vec(),
        status: clusters
            .iter()
            .map(|c| (c.clone(), PrecacheState::NotStarted))
            .collect(),
    }
}

/// Whether a state is still in its start-up steps.
pub fn is_starting(state: PrecacheState) -> bool {
    matches!(
        state,
        PrecacheState::NotStarted | PrecacheState::Starting | PrecacheState::Restarting
    )
}

async fn observe(
    applier: &dyn ResourceApplier,
    cluster: &str,
    state: PrecacheState,
) -> Result<Option<PrecacheObservation>> {
    let observation = match state {
        PrecacheState::Starting | PrecacheState::Active => Some(PrecacheObservation::Job(
            applier
                .observe_job_condition(cluster, JobPhase::Precache)
                .await?,
        )),
        PrecacheState::Restarting => Some(PrecacheObservation::Namespace(
            applier
                .job_namespace_present(cluster, JobPhase::Precache)
                .await?,
        )),
        _ => None,
    };
    Ok(observation)
}

/// Advance one cluster by at most one transition.
///
/// On error the caller keeps the previous state.
pub async fn step_precache_cluster(
    sm: &PrecacheStateMachine,
    applier: &dyn ResourceApplier,
    cluster: &str,
    spec: &PrecacheSpec,
    state: PrecacheState,
    timed_out: bool,
) -> Result<PrecacheState> {
    if state.is_terminal() {
        return Ok(state);
    }

    let observation = if timed_out {
        None
    } else {
        observe(applier, cluster, state).await?
    };

    let Some(event) = determine_precache_event(state, observation, timed_out) else {
        return Ok(state);
    };
    let Some(transition) = sm.transition(state, event) else {
        warn!(cluster = %cluster, state = %state, event = %event, "No pre-cache transition for event");
        return Ok(state);
    };

    if transition.action == JobAction::EnsureDependencies {
        applier.stage_precache_spec(cluster, spec).await?;
    }
    transition
        .action
        .execute(applier, cluster, JobPhase::Precache)
        .await?;

    if transition.to == state {
        debug!(cluster = %cluster, state = %state, event = %event, "Pre-caching unchanged");
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

/// Run one pass of the pre-caching phase over every participating cluster.
///
/// Clusters whose start-up step failed are listed in `failed`.
pub async fn run_precache_phase(
    sm: &PrecacheStateMachine,
    applier: &dyn ResourceApplier,
    precaching: &mut PrecachingStatus,
    timeout: Duration,
    now: Timestamp,
) -> PhaseRun {
    if precaching.started_at.is_none() {
        precaching.started_at = Some(now.to_string());
    }
    let timed_out = phase_timed_out(precaching.started_at.as_deref(), timeout, now);
    let mut run = PhaseRun::default();
    let spec = precaching.spec.clone().unwrap_or_default();

    for cluster in precaching.clusters.clone() {
        let state = *precaching.status.entry(cluster.clone()).or_default();
        let next = match step_precache_cluster(sm, applier, &cluster, &spec, state, timed_out).await
        {
            Ok(next) => next,
            Err(e) => {
                warn!(cluster = %cluster, state = %state, error = %e, "Pre-cache step failed");
                run.failed.push(cluster.clone());
                state
            }
        };
        if next != state {
            precaching.status.insert(cluster.clone(), next);
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

/// Clusters from a run whose failure happened during start-up.
pub fn failed_to_start(run: &PhaseRun, precaching: &PrecachingStatus) -> Vec<String> {
    run.failed
        .iter()
        .filter(|c| {
            precaching
                .status
                .get(c.as_str())
                .copied()
                .is_some_and(is_starting)
        })
        .cloned()
        .collect()
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
    use mockall::Sequence;

    fn now() -> Timestamp {
        "2026-01-01T00:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_precache_transitions() {
        let sm = PrecacheStateMachine::new();
        assert!(sm.can_transition(PrecacheState::NotStarted, PrecacheState::Starting));
        assert!(sm.can_transition(PrecacheState::Starting, PrecacheState::Restarting));
        assert!(sm.can_transition(PrecacheState::Restarting, PrecacheState::Starting));
        assert!(sm.can_transition(PrecacheState::Active, PrecacheState::Timeout));
        assert!(!sm.can_transition(PrecacheState::NotStarted, PrecacheState::Active));
        assert!(!sm.can_transition(PrecacheState::Restarting, PrecacheState::Active));

        let from_restarting = sm.valid_transitions(PrecacheState::Restarting);
        assert_eq!(
            from_restarting,
            vec![
                PrecacheState::Restarting,
                PrecacheState::Starting,
                PrecacheState::Timeout
            ]
        );
    }

    #[test]
    fn test_terminal_states_have_no_transitions() {
        let sm = PrecacheStateMachine::new();
        for state in [
            PrecacheState::Succeeded,
            PrecacheState::Timeout,
            PrecacheState::UnrecoverableError,
        ] {
            assert!(sm.transitions_from(state).is_empty());
            assert_eq!(
                determine_precache_event(
                    state,
                    Some(PrecacheObservation::Job(JobCondition::Active)),
                    false
                ),
                None
            );
        }
    }

    #[test]
    fn test_terminal_outcomes_stop_dependency_polling() {
        let sm = PrecacheStateMachine::new();
        let active_exit = |event| sm.transition(PrecacheState::Active, event).unwrap().action;
        assert_eq!(
            active_exit(PrecacheEvent::DeadlineExceeded),
            JobAction::DeleteDependencyViews
        );
        assert_eq!(
            active_exit(PrecacheEvent::BackoffExceeded),
            JobAction::DeleteDependencyViews
        );
        assert_eq!(active_exit(PrecacheEvent::JobSucceeded), JobAction::Cleanup);
    }

    #[test]
    fn test_fresh_start_and_restart_clear_old_resources() {
        let sm = PrecacheStateMachine::new();
        let start = sm
            .transition(PrecacheState::NotStarted, PrecacheEvent::Start)
            .unwrap();
        assert_eq!(start.action, JobAction::ResetJobView);
        let restart = sm
            .transition(PrecacheState::Starting, PrecacheEvent::DeadlineExceeded)
            .unwrap();
        assert_eq!(restart.action, JobAction::TriggerRestart);
        assert_ne!(start.action, restart.action);
    }

    #[test]
    fn test_restarting_ignores_job_observations() {
        assert_eq!(
            determine_precache_event(
                PrecacheState::Restarting,
                Some(PrecacheObservation::Job(JobCondition::Active)),
                false
            ),
            None
        );
    }

    #[tokio::test]
    async fn test_not_started_clears_stale_resources_then_creates_view() {
        let sm = PrecacheStateMachine::new();
        let mut seq = Sequence::new();
        let mut applier = MockResourceApplier::new();
        applier
            .expect_cleanup_job_resources()
            .withf(|cluster, phase| cluster == "spoke1" && *phase == JobPhase::Precache)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        applier
            .expect_ensure_job_view()
            .withf(|_, phase| *phase == JobPhase::Precache)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let next = step_precache_cluster(&sm, &applier, "spoke1", &PrecacheSpec::default(), PrecacheState::NotStarted, false)
            .await
            .unwrap();
        assert_eq!(next, PrecacheState::Starting);
    }

    #[tokio::test]
    async fn test_missing_dependencies_stage_spec_first() {
        let sm = PrecacheStateMachine::new();
        let mut applier = MockResourceApplier::new();
        applier
            .expect_observe_job_condition()
            .returning(|_, _| Ok(JobCondition::DependenciesMissing));
        applier
            .expect_stage_precache_spec()
            .withf(|cluster, spec| cluster == "spoke1" && spec.platform_image == "quay.io/release:4.16")
            .times(1)
            .returning(|_, _| Ok(()));
        applier
            .expect_ensure_dependencies()
            .times(1)
            .returning(|_, _| Ok(()));

        let spec = PrecacheSpec {
            platform_image: "quay.io/release:4.16".to_string(),
            ..Default::default()
        };
        let next = step_precache_cluster(&sm, &applier, "spoke1", &spec, PrecacheState::Starting, false)
            .await
            .unwrap();
        assert_eq!(next, PrecacheState::Starting);
    }

    #[tokio::test]
    async fn test_deadline_while_starting_restarts() {
        let sm = PrecacheStateMachine::new();
        let mut applier = MockResourceApplier::new();
        applier
            .expect_observe_job_condition()
            .returning(|_, _| Ok(JobCondition::DeadlineExceeded));
        applier
            .expect_cleanup_job_resources()
            .times(1)
            .returning(|_, _| Ok(()));
        applier
            .expect_delete_job_namespace()
            .times(1)
            .returning(|_, _| Ok(()));

        let next = step_precache_cluster(&sm, &applier, "spoke1", &PrecacheSpec::default(), PrecacheState::Starting, false)
            .await
            .unwrap();
        assert_eq!(next, PrecacheState::Restarting);
    }

    #[tokio::test]
    async fn test_restarting_waits_for_namespace() {
        let sm = PrecacheStateMachine::new();
        let mut applier = MockResourceApplier::new();
        applier
            .expect_job_namespace_present()
            .returning(|_, _| Ok(true));
        applier
            .expect_delete_job_namespace()
            .times(1)
            .returning(|_, _| Ok(()));

        let next = step_precache_cluster(&sm, &applier, "spoke1", &PrecacheSpec::default(), PrecacheState::Restarting, false)
            .await
            .unwrap();
        assert_eq!(next, PrecacheState::Restarting);
    }

    #[tokio::test]
    async fn test_restarting_returns_to_starting() {
        let sm = PrecacheStateMachine::new();
        let mut applier = MockResourceApplier::new();
        applier
            .expect_job_namespace_present()
            .returning(|_, _| Ok(false));
        applier
            .expect_ensure_job_view()
            .times(1)
            .returning(|_, _| Ok(()));

        let next = step_precache_cluster(&sm, &applier, "spoke1", &PrecacheSpec::default(), PrecacheState::Restarting, false)
            .await
            .unwrap();
        assert_eq!(next, PrecacheState::Starting);
    }

    #[tokio::test]
    async fn test_start_failures_are_reported() {
        let sm = PrecacheStateMachine::new();
        let mut applier = MockResourceApplier::new();
        applier
            .expect_cleanup_job_resources()
            .returning(|_, _| Ok(()));
        applier
            .expect_ensure_job_view()
            .returning(|cluster, _| {
                if cluster == "spoke2" {
                    Err(Error::Transient("view rejected".into()))
                } else {
                    Ok(())
                }
            });

        let clusters = vec!["spoke1".to_string(), "spoke2".to_string()];
        let mut precaching = start_precaching(&clusters, PrecacheSpec::default(), now());
        let run = run_precache_phase(
            &sm,
            &applier,
            &mut precaching,
            Duration::from_secs(3600),
            now(),
        )
        .await;

        assert_eq!(precaching.status["spoke1"], PrecacheState::Starting);
        assert_eq!(precaching.status["spoke2"], PrecacheState::NotStarted);
        assert_eq!(failed_to_start(&run, &precaching), vec!["spoke2".to_string()]);
        assert_eq!(run.pending, 2);
    }
}
