//! Custom Resource Definitions (CRDs) for fleet-upgrade-operator.
//!
//! - `FleetUpgrade`: staged, policy-driven remediation across managed clusters
//! - `Condition`: status conditions reported on it

mod condition;
mod fleet_upgrade;

pub use condition::*;
pub use fleet_upgrade::*;
