//! Test fixtures and builder patterns for FleetUpgrade.

use std::collections::BTreeMap;

use fleet_upgrade_operator::crd::{
    BatchTimeoutAction, FleetUpgrade, FleetUpgradeSpec, FleetUpgradeStatus,
    RemediationStrategySpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Turn string literals into owned names.
pub fn names(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Builder for creating FleetUpgrade test fixtures.
///
/// # Example
/// ```
/// let upgrade = FleetUpgradeBuilder::new("ocp-4-16")
///     .clusters(&["spoke1", "spoke2"])
///     .policies(&["platform-upgrade"])
///     .max_concurrency(2)
///     .build();
/// ```
#[derive(Clone, Debug)]
pub struct FleetUpgradeBuilder {
    name: String,
    namespace: String,
    generation: Option<i64>,
    spec: FleetUpgradeSpec,
    status: Option<FleetUpgradeStatus>,
}

impl FleetUpgradeBuilder {
    /// Create a new builder with the given resource name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: "fleet".to_string(),
            generation: Some(1),
            spec: FleetUpgradeSpec::default(),
            status: None,
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn generation(mut self, generation: i64) -> Self {
        self.generation = Some(generation);
        self
    }

    pub fn clusters(mut self, clusters: &[&str]) -> Self {
        self.spec.clusters = names(clusters);
        self
    }

    /// Add a label the selected clusters must carry.
    pub fn selector(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec
            .cluster_label_selector
            .insert(key.into(), value.into());
        self
    }

    pub fn policies(mut self, policies: &[&str]) -> Self {
        self.spec.managed_policies = names(policies);
        self
    }

    pub fn max_concurrency(mut self, max_concurrency: u32) -> Self {
        self.spec.remediation_strategy.max_concurrency = max_concurrency;
        self
    }

    pub fn canaries(mut self, canaries: &[&str]) -> Self {
        self.spec.remediation_strategy.canaries = names(canaries);
        self
    }

    /// Overall timeout in minutes.
    pub fn timeout_minutes(mut self, timeout: u64) -> Self {
        self.spec.remediation_strategy.timeout = timeout;
        self
    }

    pub fn abort_on_batch_timeout(mut self) -> Self {
        self.spec.remediation_strategy.batch_timeout_action = BatchTimeoutAction::Abort;
        self
    }

    pub fn enable(mut self, enable: bool) -> Self {
        self.spec.enable = enable;
        self
    }

    pub fn backup(mut self) -> Self {
        self.spec.backup = true;
        self
    }

    pub fn pre_caching(mut self) -> Self {
        self.spec.pre_caching = true;
        self
    }

    pub fn keep_objects(mut self) -> Self {
        self.spec.delete_objects_on_completion = false;
        self
    }

    pub fn status(mut self, status: FleetUpgradeStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// The spec alone, for driving the engine directly.
    pub fn spec(&self) -> FleetUpgradeSpec {
        self.spec.clone()
    }

    pub fn build(self) -> FleetUpgrade {
        FleetUpgrade {
            metadata: ObjectMeta {
                name: Some(self.name),
                namespace: Some(self.namespace),
                generation: self.generation,
                ..Default::default()
            },
            spec: self.spec,
            status: self.status,
        }
    }
}

impl Default for FleetUpgradeBuilder {
    fn default() -> Self {
        Self::new("test-upgrade")
    }
}

/// A strategy with the given batch size and defaults otherwise.
pub fn strategy(max_concurrency: u32) -> RemediationStrategySpec {
    RemediationStrategySpec {
        max_concurrency,
        ..Default::default()
    }
}

/// Labels map from pairs.
pub fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
