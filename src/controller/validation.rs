//! Validation of a FleetUpgrade before any batch starts.
//!
//! Checks, in order:
//! - every explicitly named cluster exists and the resolved set is not empty
//! - every managed policy resolves to exactly one usable policy
//! - the remediation strategy is consistent with the resolved clusters

use std::collections::BTreeSet;

use crate::controller::collaborators::{ClusterSelection, PolicyLookup};
use crate::controller::events::{AnnotationKey, EventReason, EventScope, UpgradeEventRecord};
use crate::crd::{ConditionReason, FleetUpgradeSpec};

/// A failed validation, reported as `Validated=False` plus a Warning event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    pub reason: ConditionReason,
    pub message: String,
    pub event: UpgradeEventRecord,
}

impl ValidationFailure {
    fn new(reason: ConditionReason, message: String) -> Self {
        let event = UpgradeEventRecord::warning(
            EventReason::ValidationFailed,
            EventScope::Global,
            message.clone(),
        );
        Self {
            reason,
            message,
            event,
        }
    }

    fn with_list(mut self, key: AnnotationKey, values: &[String]) -> Self {
        self.event = self.event.with_list(key, values);
        self
    }
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.reason, self.message)
    }
}

pub type ValidationResult = std::result::Result<(), ValidationFailure>;

/// Run every check against resolved clusters and policies.
pub fn validate_upgrade(
    spec: &FleetUpgradeSpec,
    selection: &ClusterSelection,
    lookup: &PolicyLookup,
) -> ValidationResult {
    validate_clusters(selection)?;
    validate_policies(spec, lookup)?;
    validate_strategy(spec, &selection.clusters)?;
    Ok(())
}

/// Every named cluster exists and at least one cluster is targeted.
pub fn validate_clusters(selection: &ClusterSelection) -> ValidationResult {
    if !selection.missing.is_empty() {
        return Err(ValidationFailure::new(
            ConditionReason::ClusterNotFound,
            format!(
                "Unable to find clusters: {}",
                selection.missing.join(", ")
            ),
        )
        .with_list(AnnotationKey::MissingClusters, &selection.missing));
    }
    if selection.clusters.is_empty() {
        return Err(ValidationFailure::new(
            ConditionReason::ClusterNotFound,
            "No clusters selected for remediation".to_string(),
        ));
    }
    Ok(())
}

/// Every managed policy resolved to exactly one usable policy.
pub fn validate_policies(spec: &FleetUpgradeSpec, lookup: &PolicyLookup) -> ValidationResult {
    if spec.managed_policies.is_empty() {
        return Err(ValidationFailure::new(
            ConditionReason::NotAllManagedPoliciesExist,
            "No managed policies specified".to_string(),
        ));
    }
    if !lookup.missing.is_empty() {
        return Err(ValidationFailure::new(
            ConditionReason::NotAllManagedPoliciesExist,
            format!(
                "Missing managed policies: {}",
                lookup.missing.join(", ")
            ),
        )
        .with_list(AnnotationKey::MissingPolicies, &lookup.missing));
    }
    if !lookup.invalid.is_empty() {
        return Err(ValidationFailure::new(
            ConditionReason::InvalidPolicies,
            format!(
                "Invalid managed policies: {}",
                lookup.invalid.join(", ")
            ),
        )
        .with_list(AnnotationKey::InvalidPolicies, &lookup.invalid));
    }
    if !lookup.ambiguous.is_empty() {
        let described: Vec<String> = lookup
            .ambiguous
            .iter()
            .map(|(name, namespaces)| format!("{name}:[{}]", namespaces.join(" ")))
            .collect();
        return Err(ValidationFailure::new(
            ConditionReason::AmbiguousPolicies,
            format!(
                "Managed policies found in more than one namespace: {}",
                described.join(", ")
            ),
        )
        .with_list(AnnotationKey::AmbiguousPolicies, &described));
    }
    Ok(())
}

/// Batch size and canaries make sense for the resolved clusters.
pub fn validate_strategy(spec: &FleetUpgradeSpec, clusters: &[String]) -> ValidationResult {
    let strategy = &spec.remediation_strategy;
    if strategy.max_concurrency < 1 {
        return Err(ValidationFailure::new(
            ConditionReason::InvalidRemediationStrategy,
            "maxConcurrency must be at least 1".to_string(),
        ));
    }

    let mut seen = BTreeSet::new();
    for canary in &strategy.canaries {
        if !seen.insert(canary.as_str()) {
            return Err(ValidationFailure::new(
                ConditionReason::InvalidRemediationStrategy,
                format!("Canary cluster {canary} is listed more than once"),
            ));
        }
    }

    let unknown: Vec<String> = strategy
        .canaries
        .iter()
        .filter(|c| !clusters.contains(*c))
        .cloned()
        .collect();
    if !unknown.is_empty() {
        return Err(ValidationFailure::new(
            ConditionReason::InvalidRemediationStrategy,
            format!(
                "Canary clusters are not part of the upgrade: {}",
                unknown.join(", ")
            ),
        )
        .with_list(AnnotationKey::MissingClusters, &unknown));
    }
    Ok(())
}
