use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Pool;

/// Spawn the idle reaper for one pool: wakes every `idle_timeout / 2` and
/// destroys connections that have sat idle longer than `idle_timeout`
/// (spec §4.1). Stops when `shutdown` is cancelled.
pub fn spawn_reaper(pool: Pool, idle_timeout: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
    let tick = (idle_timeout / 2).max(Duration::from_millis(500));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    pool.idle_timeout_sweep(idle_timeout);
                    debug!(provider = %pool.provider().name, "idle reaper swept pool");
                }
                _ = shutdown.cancelled() => break,
            }
        }
    })
}
