//! Status management utilities.
//!
//! Provides helpers for building and updating FleetUpgrade status conditions.

use crate::crd::{Condition, ConditionReason, ConditionType};

/// Builder for managing a conditions list.
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
}

impl ConditionBuilder {
    /// Create an empty condition builder.
    pub fn new() -> Self {
        Self {
            conditions: Vec::new(),
        }
    }

    /// Start from an existing conditions list.
    pub fn from_existing(conditions: Vec<Condition>) -> Self {
        Self { conditions }
    }

    /// Add or update a condition.
    pub fn set(&mut self, condition: Condition) -> &mut Self {
        set_condition(&mut self.conditions, condition);
        self
    }

    /// Set a typed condition.
    pub fn condition(
        &mut self,
        condition_type: ConditionType,
        status: bool,
        reason: ConditionReason,
        message: &str,
        generation: Option<i64>,
    ) -> &mut Self {
        self.set(Condition::new(
            condition_type,
            status,
            reason,
            message,
            generation,
        ))
    }

    /// Set Ready condition
    pub fn ready(
        &mut self,
        ready: bool,
        reason: ConditionReason,
        message: &str,
        generation: Option<i64>,
    ) -> &mut Self {
        self.set(Condition::ready(ready, reason, message, generation))
    }

    /// Set Progressing condition
    pub fn progressing(
        &mut self,
        progressing: bool,
        reason: ConditionReason,
        message: &str,
        generation: Option<i64>,
    ) -> &mut Self {
        self.set(Condition::progressing(
            progressing,
            reason,
            message,
            generation,
        ))
    }

    /// Drop a condition.
    pub fn remove(&mut self, condition_type: ConditionType) -> &mut Self {
        remove_condition(&mut self.conditions, condition_type);
        self
    }

    /// Build the conditions list
    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

impl Default for ConditionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Insert or replace a condition by type.
///
/// `lastTransitionTime` only moves when the status flips. Returns true when
/// anything other than the timestamp changed.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) -> bool {
    match conditions
        .iter_mut()
        .find(|c| c.r#type == condition.r#type)
    {
        Some(existing) => {
            if existing.status == condition.status {
                condition
                    .last_transition_time
                    .clone_from(&existing.last_transition_time);
            }
            let changed = *existing != condition;
            *existing = condition;
            changed
        }
        None => {
            conditions.push(condition);
            true
        }
    }
}

/// Remove a condition by type. Returns true if one was removed.
pub fn remove_condition(conditions: &mut Vec<Condition>, condition_type: ConditionType) -> bool {
    let before = conditions.len();
    conditions.retain(|c| c.r#type != condition_type.as_str());
    conditions.len() != before
}

/// Look up a condition by type.
pub fn find_condition(conditions: &[Condition], condition_type: ConditionType) -> Option<&Condition> {
    conditions
        .iter()
        .find(|c| c.r#type == condition_type.as_str())
}

/// Check if a condition type is true
pub fn is_condition_true(conditions: &[Condition], condition_type: ConditionType) -> bool {
    find_condition(conditions, condition_type).is_some_and(Condition::is_true)
}

/// Get the reason for a condition
pub fn get_condition_reason(
    conditions: &[Condition],
    condition_type: ConditionType,
) -> Option<&str> {
    find_condition(conditions, condition_type).map(|c| c.reason.as_str())
}

/// Whether a condition is present with the given reason.
pub fn has_reason(
    conditions: &[Condition],
    condition_type: ConditionType,
    reason: ConditionReason,
) -> bool {
    get_condition_reason(conditions, condition_type) == Some(reason.as_str())
}

/// Parse a persisted RFC 3339 timestamp. Unparseable values read as absent.
pub fn parse_timestamp(value: Option<&str>) -> Option<jiff::Timestamp> {
    value.and_then(|v| v.parse().ok())
}
