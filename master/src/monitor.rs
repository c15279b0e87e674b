use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::registry::now_ms;
use crate::state::Coordinator;

/// Failover loop:
/// - marks workers without a recent heartbeat as dead
/// - fails their running attempts so the tasks can be scheduled elsewhere
pub async fn monitor_workers(
    coordinator: Arc<Coordinator>,
    sweep_interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(sweep_interval) => {}
        }
        sweep_once(&coordinator, now_ms());
    }
}

/// One check over the registry. Returns the workers newly marked dead.
pub fn sweep_once(coordinator: &Coordinator, now_ms: i64) -> Vec<String> {
    let timeout = coordinator.registry().heartbeat_timeout();
    let mut newly_dead = Vec::new();

    for worker in coordinator.registry().snapshot() {
        if worker.is_dead() || worker.is_active(now_ms, timeout) {
            continue;
        }
        if !worker.mark_dead() {
            continue;
        }

        let silent_for = Duration::from_millis((now_ms - worker.last_contact_ms()).max(0) as u64);
        warn!(
            "marking worker {} ({}) as DEAD (no heartbeat for {:?})",
            worker.id, worker.host, silent_for
        );
        let failed = coordinator.fail_worker(&worker.id, "worker heartbeat timeout");
        if failed > 0 {
            info!(
                "returned {} attempts of dead worker {} to the pool",
                failed, worker.id
            );
        }
        newly_dead.push(worker.id.clone());
    }

    newly_dead
}
