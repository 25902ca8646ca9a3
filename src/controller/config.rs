//! Operator configuration.
//!
//! Loaded once at startup from the environment and shared read-only through
//! the controller context. Invalid values fall back to defaults.

use std::time::Duration;

use tracing::warn;

/// Requeue interval buckets, chosen by how urgent the next pass is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Actively polling jobs or an open batch.
    Short,
    /// Retrying after a collaborator hiccup.
    Medium,
    /// Idle: disabled, blocked, invalid or finished.
    Long,
}

impl std::fmt::Display for Requeue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Requeue::Short => write!(f, "short"),
            Requeue::Medium => write!(f, "medium"),
            Requeue::Long => write!(f, "long"),
        }
    }
}

/// Immutable operator configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    pub short_requeue: Duration,
    pub medium_requeue: Duration,
    pub long_requeue: Duration,
    /// Backup phase deadline, measured from `status.backup.startedAt`.
    pub backup_timeout: Duration,
    /// Pre-caching phase deadline, measured from `status.precaching.startedAt`.
    pub precache_timeout: Duration,
    /// Maximum number of FleetUpgrades reconciled concurrently.
    pub worker_limit: u16,
    /// Image run by backup jobs on managed clusters.
    pub backup_image: String,
    /// Image run by pre-cache jobs on managed clusters.
    pub precache_image: String,
    /// Restrict the watch to one namespace; `None` watches cluster-wide.
    pub watch_namespace: Option<String>,
    pub lease_name: String,
    pub lease_ttl: Duration,
    pub lease_renew_interval: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            short_requeue: Duration::from_secs(10),
            medium_requeue: Duration::from_secs(60),
            long_requeue: Duration::from_secs(300),
            // 480s job deadline plus 720s buffer
            backup_timeout: Duration::from_secs(1200),
            precache_timeout: Duration::from_secs(3600),
            worker_limit: 4,
            backup_image: "quay.io/smoketurner/fleet-recovery:latest".to_string(),
            precache_image: "quay.io/smoketurner/fleet-precache:latest".to_string(),
            watch_namespace: None,
            lease_name: "fleet-upgrade-operator-leader".to_string(),
            lease_ttl: Duration::from_secs(15),
            lease_renew_interval: Duration::from_secs(5),
        }
    }
}

impl OperatorConfig {
    /// Load configuration from `FLEET_UPGRADE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(secs) = parse_secs(&lookup, "FLEET_UPGRADE_SHORT_REQUEUE_SECS") {
            cfg.short_requeue = secs;
        }
        if let Some(secs) = parse_secs(&lookup, "FLEET_UPGRADE_MEDIUM_REQUEUE_SECS") {
            cfg.medium_requeue = secs;
        }
        if let Some(secs) = parse_secs(&lookup, "FLEET_UPGRADE_LONG_REQUEUE_SECS") {
            cfg.long_requeue = secs;
        }
        if let Some(secs) = parse_secs(&lookup, "FLEET_UPGRADE_BACKUP_TIMEOUT_SECS") {
            cfg.backup_timeout = secs;
        }
        if let Some(secs) = parse_secs(&lookup, "FLEET_UPGRADE_PRECACHE_TIMEOUT_SECS") {
            cfg.precache_timeout = secs;
        }
        if let Some(val) = lookup("FLEET_UPGRADE_WORKER_LIMIT") {
            match val.parse::<u16>() {
                Ok(parsed) if parsed > 0 => cfg.worker_limit = parsed,
                _ => warn!(
                    key = "FLEET_UPGRADE_WORKER_LIMIT",
                    value = %val,
                    "Ignoring invalid setting"
                ),
            }
        }
        if let Some(image) = lookup("FLEET_UPGRADE_BACKUP_IMAGE").filter(|v| !v.is_empty()) {
            cfg.backup_image = image;
        }
        if let Some(image) = lookup("FLEET_UPGRADE_PRECACHE_IMAGE").filter(|v| !v.is_empty()) {
            cfg.precache_image = image;
        }
        if let Some(ns) = lookup("FLEET_UPGRADE_WATCH_NAMESPACE").filter(|v| !v.is_empty()) {
            cfg.watch_namespace = Some(ns);
        }
        if let Some(name) = lookup("FLEET_UPGRADE_LEASE_NAME").filter(|v| !v.is_empty()) {
            cfg.lease_name = name;
        }
        if let Some(secs) = parse_secs(&lookup, "FLEET_UPGRADE_LEASE_TTL_SECS") {
            cfg.lease_ttl = secs;
        }
        if let Some(secs) = parse_secs(&lookup, "FLEET_UPGRADE_LEASE_RENEW_SECS") {
            cfg.lease_renew_interval = secs;
        }
        if cfg.lease_renew_interval >= cfg.lease_ttl {
            warn!(
                ttl_secs = cfg.lease_ttl.as_secs(),
                renew_secs = cfg.lease_renew_interval.as_secs(),
                "Lease renewal must be shorter than its TTL, using a third of the TTL"
            );
            cfg.lease_renew_interval = (cfg.lease_ttl / 3).max(Duration::from_secs(1));
        }

        cfg
    }

    /// Concrete duration for a requeue bucket.
    pub fn requeue_interval(&self, requeue: Requeue) -> Duration {
        match requeue {
            Requeue::Short => self.short_requeue,
            Requeue::Medium => self.medium_requeue,
            Requeue::Long => self.long_requeue,
        }
    }
}

fn parse_secs<F>(lookup: &F, key: &str) -> Option<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let val = lookup(key)?;
    match val.parse::<u64>() {
        Ok(parsed) if parsed > 0 => Some(Duration::from_secs(parsed)),
        _ => {
            warn!(key = %key, value = %val, "Ignoring invalid setting");
            None
        }
    }
}
