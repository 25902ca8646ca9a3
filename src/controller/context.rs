//! Shared context for the controller.
//!
//! Holds the Kubernetes client, the event reporter identity, the remediation
//! engine and the optional health state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};

use crate::controller::batch_orchestrator::BatchOrchestrator;
use crate::controller::config::OperatorConfig;
use crate::controller::events::{EventSeverity, UpgradeEventRecord};
use crate::crd::FleetUpgrade;
use crate::health::HealthState;

/// Field manager name for the operator
pub const FIELD_MANAGER: &str = "fleet-upgrade-operator";

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Event reporter identity
    reporter: Reporter,
    /// Remediation engine wired to the cluster-backed collaborators
    pub orchestrator: BatchOrchestrator,
    /// Optional health state for metrics and readiness
    pub health_state: Option<Arc<HealthState>>,
    /// Consecutive failed reconciles per `namespace/name`, for backoff
    failures: Arc<Mutex<HashMap<String, u32>>>,
}

impl Context {
    pub fn new(
        client: Client,
        orchestrator: BatchOrchestrator,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
            orchestrator,
            health_state,
            failures: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Count a failed reconcile and return how many preceded it.
    pub fn record_failure(&self, key: &str) -> u32 {
        let mut failures = match self.failures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let count = failures.entry(key.to_string()).or_insert(0);
        let previous = *count;
        *count = count.saturating_add(1);
        previous
    }

    /// Reset the failure count after a successful reconcile.
    pub fn clear_failures(&self, key: &str) {
        let mut failures = match self.failures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        failures.remove(key);
    }

    pub fn config(&self) -> &OperatorConfig {
        self.orchestrator.config()
    }

    fn recorder(&self) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone())
    }

    /// Publish an upgrade event against the FleetUpgrade.
    ///
    /// Publishing failures are logged and otherwise ignored.
    pub async fn publish_upgrade_event(&self, upgrade: &FleetUpgrade, record: &UpgradeEventRecord) {
        let type_ = match record.severity {
            EventSeverity::Normal => EventType::Normal,
            EventSeverity::Warning => EventType::Warning,
        };
        let object_ref = upgrade.object_ref(&());
        if let Err(e) = self
            .recorder()
            .publish(
                &Event {
                    type_,
                    reason: record.reason.as_str().into(),
                    note: Some(record.note()),
                    action: record.reason.action().into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!(
                reason = %record.reason.as_str(),
                scope = %record.scope,
                error = %e,
                "Failed to publish event"
            );
        }
    }
}
