//! fleet-upgrade-operator library crate
//!
//! Exports the FleetUpgrade CRD, the remediation engine and the controller
//! runner used by the binary.

pub mod controller;
pub mod crd;
pub mod health;

pub use health::HealthState;

use std::sync::Arc;

use futures::{Stream, StreamExt};
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{Controller, WatchStreamExt, predicates, reflector, watcher};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

use controller::batch_orchestrator::BatchOrchestrator;
use controller::collaborators::Collaborators;
use controller::config::OperatorConfig;
use controller::context::Context;
use controller::kube_collaborators::{KubeClusterRegistry, KubePolicyStore, KubeResourceApplier};
use controller::upgrade_reconciler::{error_policy, reconcile};
use crd::FleetUpgrade;

/// Create namespaced or cluster-wide API based on scope
pub fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

fn default_watcher_config() -> WatcherConfig {
    WatcherConfig::default().any_semantic()
}

/// Reflector-backed stream of applied objects, with status-only updates
/// filtered out by the generation predicate.
fn create_filtered_stream<K>(
    api: Api<K>,
    watcher_config: WatcherConfig,
) -> (
    reflector::Store<K>,
    impl Stream<Item = Result<K, watcher::Error>>,
)
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, watcher_config))
        .default_backoff()
        .applied_objects()
        .predicate_filter(predicates::generation);
    (reader, stream)
}

/// Wire the cluster-backed collaborators into a remediation engine.
pub fn build_orchestrator(client: Client, config: Arc<OperatorConfig>) -> BatchOrchestrator {
    let collaborators = Collaborators::new(
        Arc::new(KubePolicyStore::new(client.clone())),
        Arc::new(KubeResourceApplier::new(client.clone(), config.clone())),
        Arc::new(KubeClusterRegistry::new(client)),
    );
    BatchOrchestrator::new(collaborators, config)
}

/// Run the FleetUpgrade controller with optional namespace scoping.
///
/// When `namespace` is `Some(ns)`, only FleetUpgrades in that namespace are
/// watched.
pub async fn run_controller_scoped(
    client: Client,
    config: OperatorConfig,
    health_state: Option<Arc<HealthState>>,
    namespace: Option<&str>,
) {
    let scope_msg = namespace.unwrap_or("cluster-wide");
    info!(
        worker_limit = config.worker_limit,
        "Starting controller for FleetUpgrade resources (scope: {})", scope_msg
    );

    if let Some(ref state) = health_state {
        state.set_ready(true).await;
    }

    let worker_limit = config.worker_limit;
    let orchestrator = build_orchestrator(client.clone(), Arc::new(config));
    let ctx = Arc::new(Context::new(client.clone(), orchestrator, health_state));

    let upgrades: Api<FleetUpgrade> = scoped_api(client, namespace);
    let (reader, upgrade_stream) = create_filtered_stream(upgrades, default_watcher_config());

    Controller::for_stream(upgrade_stream, reader)
        .with_config(ControllerConfig::default().concurrency(worker_limit))
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    debug!("Reconciled: {}", obj.name);
                }
                Err(e) => {
                    let is_not_found = match &e {
                        kube::runtime::controller::Error::ObjectNotFound(_) => true,
                        kube::runtime::controller::Error::ReconcilerFailed(err, _) => {
                            err.is_not_found()
                        }
                        _ => false,
                    };
                    if is_not_found {
                        debug!("Object no longer exists (likely deleted): {:?}", e);
                    } else {
                        error!("Reconciliation error: {:?}", e);
                    }
                }
            }
        })
        .await;

    error!("Controller stream ended unexpectedly");
}
