//! Health server for Kubernetes probes and Prometheus metrics.
//!
//! Provides:
//! - `/healthz` - Liveness probe (always returns 200 if server is running)
//! - `/readyz` - Readiness probe (returns 200 when ready to serve traffic)
//! - `/metrics` - Prometheus metrics endpoint

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tracing::info;

use crate::controller::batch_orchestrator::JobStage;

/// Labels identifying one FleetUpgrade
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct JobLabels {
    pub namespace: String,
    pub name: String,
}

impl JobLabels {
    fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl EncodeLabelSet for JobLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for stage-based metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PhaseLabels {
    pub phase: String,
}

impl EncodeLabelSet for PhaseLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("phase", self.phase.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics for the operator
pub struct Metrics {
    /// Total reconciliations counter
    pub reconciliations_total: Family<JobLabels, Counter>,
    /// Failed reconciliations counter
    pub reconciliation_errors_total: Family<JobLabels, Counter>,
    /// Reconciliation duration histogram
    pub reconcile_duration_seconds: Family<JobLabels, Histogram>,
    /// Jobs by stage
    pub jobs_total: Family<PhaseLabels, Gauge>,
    /// Clusters recorded complete per job
    pub clusters_completed: Family<JobLabels, Gauge>,
    /// Clusters in the remediation plan per job
    pub clusters_total: Family<JobLabels, Gauge>,
    /// Batches that hit their timeout, per job
    pub batch_timeouts: Family<JobLabels, Counter>,
    /// Last stage seen for each job, source of `jobs_total`
    stages: Mutex<HashMap<JobLabels, JobStage>>,
    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics instance with registered metrics
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let reconciliations_total = Family::<JobLabels, Counter>::default();
        registry.register(
            "fleetupgrade_reconciliations",
            "Total number of reconciliations",
            reconciliations_total.clone(),
        );

        let reconciliation_errors_total = Family::<JobLabels, Counter>::default();
        registry.register(
            "fleetupgrade_reconciliation_errors",
            "Total number of reconciliation errors",
            reconciliation_errors_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<JobLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            });
        registry.register(
            "fleetupgrade_reconcile_duration_seconds",
            "Duration of reconciliation in seconds",
            reconcile_duration_seconds.clone(),
        );

        let jobs_total = Family::<PhaseLabels, Gauge>::default();
        registry.register(
            "fleetupgrade_jobs_total",
            "Number of FleetUpgrade jobs by stage",
            jobs_total.clone(),
        );
        for stage in JobStage::ALL {
            jobs_total
                .get_or_create(&PhaseLabels {
                    phase: stage.to_string(),
                })
                .set(0);
        }

        let clusters_completed = Family::<JobLabels, Gauge>::default();
        registry.register(
            "fleetupgrade_clusters_completed",
            "Clusters that finished remediation",
            clusters_completed.clone(),
        );

        let clusters_total = Family::<JobLabels, Gauge>::default();
        registry.register(
            "fleetupgrade_clusters_total",
            "Clusters in the remediation plan",
            clusters_total.clone(),
        );

        let batch_timeouts = Family::<JobLabels, Counter>::default();
        registry.register(
            "fleetupgrade_batch_timeouts",
            "Batches that reached their timeout",
            batch_timeouts.clone(),
        );

        Self {
            reconciliations_total,
            reconciliation_errors_total,
            reconcile_duration_seconds,
            jobs_total,
            clusters_completed,
            clusters_total,
            batch_timeouts,
            stages: Mutex::new(HashMap::new()),
            registry,
        }
    }

    /// Record a successful reconciliation
    pub fn record_reconcile(&self, namespace: &str, name: &str, duration_secs: f64) {
        let labels = JobLabels::new(namespace, name);
        self.reconciliations_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record a failed reconciliation
    pub fn record_error(&self, namespace: &str, name: &str) {
        self.reconciliation_errors_total
            .get_or_create(&JobLabels::new(namespace, name))
            .inc();
    }

    /// Record a batch timeout
    pub fn record_batch_timeout(&self, namespace: &str, name: &str) {
        self.batch_timeouts
            .get_or_create(&JobLabels::new(namespace, name))
            .inc();
    }

    /// Update cluster progress of a job
    pub fn set_cluster_progress(&self, namespace: &str, name: &str, completed: i64, total: i64) {
        let labels = JobLabels::new(namespace, name);
        self.clusters_completed.get_or_create(&labels).set(completed);
        self.clusters_total.get_or_create(&labels).set(total);
    }

    /// Record the stage a job is in and refresh the per-stage counts.
    pub fn set_job_stage(&self, namespace: &str, name: &str, stage: JobStage) {
        self.update_stages(|stages| {
            stages.insert(JobLabels::new(namespace, name), stage);
        });
    }

    /// Drop every series of a deleted job.
    pub fn forget_job(&self, namespace: &str, name: &str) {
        let labels = JobLabels::new(namespace, name);
        self.update_stages(|stages| {
            stages.remove(&labels);
        });
        self.clusters_completed.remove(&labels);
        self.clusters_total.remove(&labels);
    }

    fn update_stages(&self, update: impl FnOnce(&mut HashMap<JobLabels, JobStage>)) {
        let mut stages = match self.stages.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        update(&mut stages);
        for stage in JobStage::ALL {
            let count = stages.values().filter(|s| **s == stage).count();
            self.jobs_total
                .get_or_create(&PhaseLabels {
                    phase: stage.to_string(),
                })
                .set(i64::try_from(count).unwrap_or(i64::MAX));
        }
    }

    /// Encode metrics to Prometheus text format
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            tracing::error!("Failed to encode metrics");
            return "# Error encoding metrics".to_string();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the operator is ready (acquired leadership and running controller)
    ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Metrics,
    /// Last successful reconcile timestamp (Unix epoch seconds)
    pub last_reconcile: AtomicU64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (starts as not ready)
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
            last_reconcile: AtomicU64::new(0),
        }
    }

    /// Mark the operator as ready or not ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the operator is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }
}

/// Liveness probe handler
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 503 Service Unavailable until leadership is acquired.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Run the health server on 0.0.0.0:8080.
pub async fn run_health_server(state: Arc<HealthState>) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], 8080));
    info!(port = 8080, "Starting health server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
