//! Reconciliation loop for FleetUpgrade.
//!
//! Each reconcile runs one engine pass over a copy of the persisted status,
//! commits the result with a single merge patch and only then publishes the
//! events the pass produced.

use std::sync::Arc;
use std::time::{Duration, Instant};

use jiff::Timestamp;
use kube::{
    Api, ResourceExt,
    api::{Patch, PatchParams},
    runtime::controller::Action,
};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::controller::batch_orchestrator::{PassOutcome, job_stage};
use crate::controller::collaborators::JobKey;
use crate::controller::common::{add_finalizer, remove_finalizer, status_merge_patch};
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::crd::{FleetUpgrade, FleetUpgradeStatus};

/// Finalizer name for upgrade resources
pub const UPGRADE_FINALIZER: &str = "fleet-operator.smoketurner.com/upgrade-finalizer";

/// Reconcile a FleetUpgrade
pub async fn reconcile(obj: Arc<FleetUpgrade>, ctx: Arc<Context>) -> Result<Action> {
    let start_time = Instant::now();
    let job = JobKey::from_upgrade(&obj);

    debug!(job = %job, "Reconciling FleetUpgrade");

    let api: Api<FleetUpgrade> = Api::namespaced(ctx.client.clone(), &job.namespace);

    if obj.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&obj, &ctx, &api, &job).await;
    }

    if !obj.finalizers().iter().any(|f| f == UPGRADE_FINALIZER) {
        info!(job = %job, "Adding finalizer");
        add_finalizer(&api, &job.name, UPGRADE_FINALIZER).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let previous = obj.status.clone().unwrap_or_default();
    let mut status = previous.clone();
    let outcome = ctx
        .orchestrator
        .run_pass(
            &job,
            &obj.spec,
            obj.metadata.generation,
            &mut status,
            Timestamp::now(),
        )
        .await?;

    if status != previous {
        commit_status(&api, &job, &previous, &status, obj.resource_version().as_deref()).await?;
    }

    for record in &outcome.events {
        ctx.publish_upgrade_event(&obj, record).await;
    }

    ctx.clear_failures(&job.to_string());
    record_metrics(&ctx, &job, &obj, &status, &outcome, start_time);

    let requeue = ctx.config().requeue_interval(outcome.requeue);
    debug!(
        job = %job,
        stage = %job_stage(&obj.spec, &status),
        requeue = %outcome.requeue,
        requeue_secs = requeue.as_secs(),
        "Pass complete"
    );
    Ok(Action::requeue(requeue))
}

/// Error policy for the upgrade controller
pub fn error_policy(obj: Arc<FleetUpgrade>, error: &Error, ctx: Arc<Context>) -> Action {
    let job = JobKey::from_upgrade(&obj);

    if let Some(ref health_state) = ctx.health_state {
        health_state.metrics.record_error(&job.namespace, &job.name);
    }

    if error.is_not_found() {
        debug!(job = %job, "Resource not found (likely deleted)");
        return Action::await_change();
    }

    if error.is_retryable() {
        let retry_count = ctx.record_failure(&job.to_string());
        let backoff = error.requeue_after_with_retry_count(retry_count);
        warn!(
            job = %job,
            error = %error,
            retry_count = retry_count,
            backoff_secs = backoff.as_secs(),
            "Retryable error, will retry with exponential backoff"
        );
        Action::requeue(backoff)
    } else {
        error!(job = %job, error = %error, "Non-retryable error");
        Action::requeue(error.requeue_after())
    }
}

/// Release the job's placements, then let the object go.
async fn handle_deletion(
    obj: &FleetUpgrade,
    ctx: &Context,
    api: &Api<FleetUpgrade>,
    job: &JobKey,
) -> Result<Action> {
    info!(job = %job, "Handling deletion");

    if obj.finalizers().iter().any(|f| f == UPGRADE_FINALIZER) {
        ctx.orchestrator.release(job).await?;
        remove_finalizer(api, &job.name, UPGRADE_FINALIZER).await?;
    }

    if let Some(ref health_state) = ctx.health_state {
        health_state.metrics.forget_job(&job.namespace, &job.name);
    }
    ctx.clear_failures(&job.to_string());

    Ok(Action::await_change())
}

/// Merge patch turning the persisted status into `new`, if anything changed.
pub fn build_status_patch(
    previous: &FleetUpgradeStatus,
    new: &FleetUpgradeStatus,
    resource_version: Option<&str>,
) -> Result<Option<Value>> {
    let old = serde_json::to_value(previous)?;
    let new = serde_json::to_value(new)?;
    Ok(status_merge_patch(&old, &new, resource_version))
}

/// Map a failed status write; a version mismatch becomes [`Error::Conflict`].
pub fn commit_error(job: &JobKey, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ref e) if e.code == 409 => Error::Conflict(job.to_string()),
        other => Error::Kube(other),
    }
}

async fn commit_status(
    api: &Api<FleetUpgrade>,
    job: &JobKey,
    previous: &FleetUpgradeStatus,
    status: &FleetUpgradeStatus,
    resource_version: Option<&str>,
) -> Result<()> {
    let Some(patch) = build_status_patch(previous, status, resource_version)? else {
        return Ok(());
    };
    api.patch_status(&job.name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(|e| commit_error(job, e))?;
    debug!(job = %job, "Status committed");
    Ok(())
}

fn record_metrics(
    ctx: &Context,
    job: &JobKey,
    obj: &FleetUpgrade,
    status: &FleetUpgradeStatus,
    outcome: &PassOutcome,
    start_time: Instant,
) {
    let Some(ref health_state) = ctx.health_state else {
        return;
    };
    let metrics = &health_state.metrics;
    metrics.record_reconcile(
        &job.namespace,
        &job.name,
        start_time.elapsed().as_secs_f64(),
    );
    metrics.set_job_stage(&job.namespace, &job.name, job_stage(&obj.spec, status));
    metrics.set_cluster_progress(
        &job.namespace,
        &job.name,
        i64::try_from(status.completed_clusters()).unwrap_or(i64::MAX),
        i64::try_from(status.total_clusters()).unwrap_or(i64::MAX),
    );
    if outcome.batch_timed_out {
        metrics.record_batch_timeout(&job.namespace, &job.name);
    }
    health_state.last_reconcile.store(
        u64::try_from(Timestamp::now().as_second()).unwrap_or_default(),
        std::sync::atomic::Ordering::Relaxed,
    );
}
