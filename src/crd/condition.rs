//! Status conditions shared by the FleetUpgrade status.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition describes the state of an upgrade at a certain point.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition.
    pub r#type: String,
    /// Status of the condition ("True", "False", "Unknown").
    pub status: String,
    /// Machine-readable reason for the condition's last transition.
    pub reason: String,
    /// Human-readable message indicating details about last transition.
    pub message: String,
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: String,
    /// The generation of the resource this condition was observed for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new condition stamped with the current time.
    pub fn new(
        condition_type: ConditionType,
        status: bool,
        reason: ConditionReason,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status: if status {
                "True".to_string()
            } else {
                "False".to_string()
            },
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: jiff::Timestamp::now().to_string(),
            observed_generation: generation,
        }
    }

    /// Create a "Ready" condition.
    pub fn ready(ready: bool, reason: ConditionReason, message: &str, generation: Option<i64>) -> Self {
        Self::new(ConditionType::Ready, ready, reason, message, generation)
    }

    /// Create a "Progressing" condition.
    pub fn progressing(
        progressing: bool,
        reason: ConditionReason,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self::new(
            ConditionType::Progressing,
            progressing,
            reason,
            message,
            generation,
        )
    }

    /// Whether the condition status is "True".
    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// Types of conditions reported on a FleetUpgrade.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ConditionType {
    /// Clusters, policies and strategy were checked.
    Validated,
    /// The target cluster set was resolved and a remediation plan built.
    ClustersSelected,
    /// Every cluster finished its pre-remediation backup.
    BackupDone,
    /// The pre-cache content spec extracted from the policies is consistent.
    PrecacheSpecValid,
    /// Set to False while some clusters cannot start pre-caching.
    PrecachingCanStart,
    /// Every cluster finished pre-caching.
    PrecachingDone,
    /// Batches are being remediated.
    Progressing,
    /// The job finished remediating every batch.
    Succeeded,
    /// Summary condition, mirrors Succeeded.
    Ready,
}

impl ConditionType {
    /// Wire name of the condition type.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConditionType::Validated => "Validated",
            ConditionType::ClustersSelected => "ClustersSelected",
            ConditionType::BackupDone => "BackupDone",
            ConditionType::PrecacheSpecValid => "PrecacheSpecValid",
            ConditionType::PrecachingCanStart => "PrecachingCanStart",
            ConditionType::PrecachingDone => "PrecachingDone",
            ConditionType::Progressing => "Progressing",
            ConditionType::Succeeded => "Succeeded",
            ConditionType::Ready => "Ready",
        }
    }
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable reasons used on FleetUpgrade conditions.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ConditionReason {
    ValidationCompleted,
    ClusterNotFound,
    NotAllManagedPoliciesExist,
    InvalidPolicies,
    AmbiguousPolicies,
    InvalidRemediationStrategy,
    ClusterSelectionCompleted,
    BackupNotDone,
    BackupCompleted,
    PrecacheSpecIsWellFormed,
    PrecacheSpecIncomplete,
    ClustersFailedToStart,
    PrecachingNotDone,
    PrecachingCompleted,
    PartiallyDone,
    Failed,
    NotEnabled,
    NotStarted,
    InProgress,
    Completed,
    TimedOut,
}

impl ConditionReason {
    /// Wire name of the reason.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConditionReason::ValidationCompleted => "ValidationCompleted",
            ConditionReason::ClusterNotFound => "ClusterNotFound",
            ConditionReason::NotAllManagedPoliciesExist => "NotAllManagedPoliciesExist",
            ConditionReason::InvalidPolicies => "InvalidPolicies",
            ConditionReason::AmbiguousPolicies => "AmbiguousPolicies",
            ConditionReason::InvalidRemediationStrategy => "InvalidRemediationStrategy",
            ConditionReason::ClusterSelectionCompleted => "ClusterSelectionCompleted",
            ConditionReason::BackupNotDone => "BackupNotDone",
            ConditionReason::BackupCompleted => "BackupCompleted",
            ConditionReason::PrecacheSpecIsWellFormed => "PrecacheSpecIsWellFormed",
            ConditionReason::PrecacheSpecIncomplete => "PrecacheSpecIncomplete",
            ConditionReason::ClustersFailedToStart => "ClustersFailedToStart",
            ConditionReason::PrecachingNotDone => "PrecachingNotDone",
            ConditionReason::PrecachingCompleted => "PrecachingCompleted",
            ConditionReason::PartiallyDone => "PartiallyDone",
            ConditionReason::Failed => "Failed",
            ConditionReason::NotEnabled => "NotEnabled",
            ConditionReason::NotStarted => "NotStarted",
            ConditionReason::InProgress => "InProgress",
            ConditionReason::Completed => "Completed",
            ConditionReason::TimedOut => "TimedOut",
        }
    }
}

impl std::fmt::Display for ConditionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
