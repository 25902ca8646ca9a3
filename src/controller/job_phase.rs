//! Pieces shared by the backup and pre-caching state machines.
//!
//! Both phases drive a remote job per cluster. A transition names the side
//! effect it needs as a [`JobAction`]; the driver performs the action through
//! the resource applier and only commits the new state once it succeeded.

use std::time::Duration;

use jiff::Timestamp;

use crate::controller::collaborators::{JobPhase, ResourceApplier};
use crate::controller::error::Result;
use crate::controller::status::parse_timestamp;

/// Side effect attached to a phase transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobAction {
    /// Nothing to do besides recording the new state.
    None,
    /// Create the job's prerequisites on the cluster.
    EnsureDependencies,
    /// Create the hub-side view of the job.
    EnsureJobView,
    /// Drop views and actions of an earlier run, then create the job view.
    ResetJobView,
    /// Deploy the job and its view.
    DeployJob,
    /// Stop polling the job's prerequisites.
    DeleteDependencyViews,
    /// Tear down the job namespace of a previous attempt.
    DeleteJobNamespace,
    /// Drop views and actions, then delete the job namespace so a fresh
    /// job can be deployed.
    TriggerRestart,
    /// Remove the views and actions the phase created on the cluster.
    Cleanup,
}

impl JobAction {
    /// Perform the action for one cluster.
    pub async fn execute(
        self,
        applier: &dyn ResourceApplier,
        cluster: &str,
        phase: JobPhase,
    ) -> Result<()> {
        match self {
            JobAction::None => Ok(()),
            JobAction::Cleanup => applier.cleanup_job_resources(cluster, phase).await,
            JobAction::TriggerRestart => {
                applier.cleanup_job_resources(cluster, phase).await?;
                applier.delete_job_namespace(cluster, phase).await
            }
            JobAction::EnsureDependencies => applier.ensure_dependencies(cluster, phase).await,
            JobAction::EnsureJobView => applier.ensure_job_view(cluster, phase).await,
            JobAction::ResetJobView => {
                applier.cleanup_job_resources(cluster, phase).await?;
                applier.ensure_job_view(cluster, phase).await
            }
            JobAction::DeployJob => applier.ensure_job_resources(cluster, phase).await,
            JobAction::DeleteDependencyViews => {
                applier.delete_dependency_views(cluster, phase).await
            }
            JobAction::DeleteJobNamespace => applier.delete_job_namespace(cluster, phase).await,
        }
    }
}

impl std::fmt::Display for JobAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobAction::None => write!(f, "None"),
            JobAction::EnsureDependencies => write!(f, "EnsureDependencies"),
            JobAction::EnsureJobView => write!(f, "EnsureJobView"),
            JobAction::ResetJobView => write!(f, "ResetJobView"),
            JobAction::DeployJob => write!(f, "DeployJob"),
            JobAction::DeleteDependencyViews => write!(f, "DeleteDependencyViews"),
            JobAction::DeleteJobNamespace => write!(f, "DeleteJobNamespace"),
            JobAction::TriggerRestart => write!(f, "TriggerRestart"),
            JobAction::Cleanup => write!(f, "Cleanup"),
        }
    }
}

/// Whether a phase that started at `started_at` has run out of time.
///
/// A phase with no recorded start has not timed out.
pub fn phase_timed_out(started_at: Option<&str>, timeout: Duration, now: Timestamp) -> bool {
    let Some(started) = parse_timestamp(started_at) else {
        return false;
    };
    Duration::try_from(now.duration_since(started)).unwrap_or_default() > timeout
}

/// What one pass over a phase's clusters did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseRun {
    /// Clusters whose state changed, with (from, to) names.
    pub transitions: Vec<(String, String, String)>,
    /// Clusters whose step failed; their state was left as it was.
    pub failed: Vec<String>,
    /// Clusters still in a non-terminal state after the pass.
    pub pending: usize,
    /// Clusters moved to their timeout state because the phase ran out of time.
    pub timed_out: Vec<String>,
}

impl PhaseRun {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}
