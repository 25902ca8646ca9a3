//! fleet-upgrade-operator - staged, policy-driven upgrades of managed cluster fleets.
//!
//! The binary logs as JSON and reads `FLEET_UPGRADE_*` settings. It serves probes
//! and metrics right away, but only drives FleetUpgrades while it holds the leader
//! lease.

use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tracing::{error, info, warn};

use fleet_upgrade_operator::controller::config::OperatorConfig;
use fleet_upgrade_operator::health::{HealthState, run_health_server};
use fleet_upgrade_operator::run_controller_scoped;

/// Time given to in-flight passes before the process exits on a signal.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing()?;
    info!("Starting fleet-upgrade-operator");

    let config = OperatorConfig::from_env();
    info!(
        short_requeue_secs = config.short_requeue.as_secs(),
        medium_requeue_secs = config.medium_requeue.as_secs(),
        long_requeue_secs = config.long_requeue.as_secs(),
        backup_timeout_secs = config.backup_timeout.as_secs(),
        precache_timeout_secs = config.precache_timeout.as_secs(),
        worker_limit = config.worker_limit,
        watch_namespace = config.watch_namespace.as_deref().unwrap_or("*"),
        "Loaded configuration"
    );

    let client = Client::try_default().await?;
    let (holder_id, lease_namespace) = pod_identity();

    // Probes answer before leadership so a standby replica stays alive
    let health_state = Arc::new(HealthState::new());
    let health_handle = {
        let health_state = health_state.clone();
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state).await {
                error!(error = %e, "Health server failed");
            }
        })
    };

    let lease = lease_lock(&client, &lease_namespace, &holder_id, &config);
    info!(
        holder_id = %holder_id,
        namespace = %lease_namespace,
        lease_name = %config.lease_name,
        "Waiting for leadership"
    );
    acquire_leadership(&lease, config.lease_renew_interval).await;
    let renewal_handle = tokio::spawn(hold_leadership(lease, config.lease_renew_interval));

    let controller_handle = {
        let health_state = health_state.clone();
        let client = client.clone();
        tokio::spawn(async move {
            let namespace = config.watch_namespace.clone();
            run_controller_scoped(client, config, Some(health_state), namespace.as_deref()).await;
        })
    };

    tokio::select! {
        result = controller_handle => {
            if let Err(e) = result {
                error!(error = %e, "Controller task panicked");
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!(error = %e, "Health server task panicked");
            }
        }
        result = renewal_handle => {
            // Exiting non-zero lets the pod restart and rejoin the election
            let reason = match result {
                Ok(reason) => reason,
                Err(e) => format!("lease renewal task panicked: {e}"),
            };
            health_state.set_ready(false).await;
            error!(reason = %reason, "Leadership lost, stopping");
            return Err(reason.into());
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
            health_state.set_ready(false).await;
            info!(
                grace_secs = SHUTDOWN_GRACE_PERIOD.as_secs(),
                "Waiting for in-flight reconciliations"
            );
            tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;
        }
    }

    info!("Operator stopped");
    Ok(())
}

fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fleet_upgrade_operator=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .json()
        .init();
    Ok(())
}

/// Lease holder id and namespace, taken from the downward API when present.
fn pod_identity() -> (String, String) {
    let holder_id = std::env::var("POD_NAME").unwrap_or_else(|_| {
        warn!("POD_NAME not set, using hostname");
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    });
    let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| {
        warn!("POD_NAMESPACE not set, using 'default'");
        "default".to_string()
    });
    (holder_id, namespace)
}

fn lease_lock(
    client: &Client,
    namespace: &str,
    holder_id: &str,
    config: &OperatorConfig,
) -> LeaseLock {
    LeaseLock::new(
        client.clone(),
        namespace,
        LeaseLockParams {
            holder_id: holder_id.to_string(),
            lease_name: config.lease_name.clone(),
            lease_ttl: config.lease_ttl,
        },
    )
}

/// Block until this replica holds the lease.
async fn acquire_leadership(lease: &LeaseLock, retry: Duration) {
    loop {
        match lease.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {
                info!("Acquired leadership");
                return;
            }
            Ok(_) => info!("Another replica is leader, waiting"),
            Err(e) => warn!(error = %e, "Failed to acquire lease, retrying"),
        }
        tokio::time::sleep(retry).await;
    }
}

/// Renew the lease until a renewal fails; returns why.
async fn hold_leadership(lease: LeaseLock, interval: Duration) -> String {
    loop {
        tokio::time::sleep(interval).await;
        match lease.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {}
            Ok(_) => return "lease taken by another replica".to_string(),
            Err(e) => return format!("lease renewal failed: {e}"),
        }
    }
}

/// Wait for SIGTERM or SIGINT.
///
/// Failing to install a signal handler is fatal.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
