//! C10 — health-check scheduler (spec §4.10).
//!
//! Periodically re-probes a bounded sample of each due item's segments via
//! `STAT`, never a full `BODY` fetch. An explicit "no such article" response
//! from any reachable provider retires the item; a provider that cannot be
//! reached at all is inconclusive and only demotes the item to an urgent
//! recheck rather than deleting it outright.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::fetch::FetchEngine;
use crate::pool::Pool;
use crate::provider::{OperationContext, UsageType};
use crate::vfs::{HealthResult, Item, ItemBacking, MetadataStore};

/// Interval between health-check sweeps (spec §4.10: default 15 minutes).
const SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);
/// Normal re-check cadence once an item is confirmed healthy, jittered to
/// avoid every item re-checking in lockstep (spec §4.10: default 24h).
const HEALTHY_RECHECK_SECS: i64 = 24 * 60 * 60;
const RECHECK_JITTER_SECS: i64 = 30 * 60;
/// Segments sampled per sweep rather than re-reading a whole release
/// (spec §4.10 step 2).
const SAMPLE_SEGMENTS: usize = 3;

enum ProbeOutcome {
    Found,
    Missing,
    Inconclusive,
}

/// Drives the periodic re-verification of items already in the tree. Does
/// not itself own a runtime handle; callers `tokio::spawn(scheduler.run(...))`.
pub struct HealthScheduler<M: MetadataStore> {
    metadata: Arc<M>,
    pools: Vec<Pool>,
    events: EventBus,
}

impl<M: MetadataStore> HealthScheduler<M> {
    pub fn new(metadata: Arc<M>, engine: Arc<FetchEngine>, pools: Vec<Pool>, events: EventBus) -> Self {
        // `engine` isn't used directly — health checks go through `Pool::stat`
        // rather than `FetchEngine::fetch` since they never need a decode —
        // kept as a constructor parameter so callers wire the scheduler up
        // the same way they wire up the rest of the ingest/stream stack.
        let _ = engine;
        HealthScheduler { metadata, pools, events }
    }

    /// Run the sweep loop until `shutdown` is cancelled (spec §4.10's
    /// always-on background task). `now_fn` is injected so tests and the
    /// CLI share one clock source.
    pub async fn run(&self, shutdown: CancellationToken, now_fn: impl Fn() -> i64) {
        let mut ticker = interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = now_fn();
                    if let Err(e) = self.sweep(now).await {
                        warn!(error = %e, "health sweep failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("health scheduler shutting down");
                    return;
                }
            }
        }
    }

    /// Run a single sweep immediately and return how many items were
    /// checked, for CLI one-shot use (`serve` instead drives this via
    /// [`HealthScheduler::run`] on a timer).
    pub async fn run_once(&self, now: i64) -> Result<usize> {
        self.sweep(now).await
    }

    async fn sweep(&self, now: i64) -> Result<usize> {
        let due = self.metadata.due_for_health_check(now).await?;
        let checked = due.len();
        for item in due {
            let result = self.check_item(&item, now).await;
            self.metadata.record_health_result(item.id, result, now).await?;
            self.events.publish(Event::HealthItemStatus {
                item_id: item.id.to_string(),
                status: format!("{result:?}"),
            });

            if matches!(result, HealthResult::Deleted) {
                self.metadata.delete_items(&[item.id]).await?;
            } else {
                self.reschedule(&item, result, now).await?;
            }
        }
        Ok(checked)
    }

    async fn check_item(&self, item: &Item, now: i64) -> HealthResult {
        let segment_ids: Vec<String> = match &item.backing {
            ItemBacking::NzbFile(b) => b.segment_ids.clone(),
            ItemBacking::Multipart(b) => b.parts.iter().flat_map(|p| p.nzb_segment_ids.clone()).collect(),
            ItemBacking::Directory | ItemBacking::Symlink { .. } => return HealthResult::Healthy,
        };
        if segment_ids.is_empty() {
            return HealthResult::Healthy;
        }

        let sample = sample_indices(segment_ids.len(), SAMPLE_SEGMENTS, item.id.as_u128() as u64 ^ now as u64);
        let ctx = OperationContext::new(UsageType::HealthCheck).with_item_id(item.id.to_string());

        let mut inconclusive = false;
        for idx in sample {
            match self.stat_segment(&segment_ids[idx], &ctx).await {
                ProbeOutcome::Found => {}
                ProbeOutcome::Missing => return HealthResult::Deleted,
                ProbeOutcome::Inconclusive => inconclusive = true,
            }
        }
        if inconclusive {
            HealthResult::Unhealthy
        } else {
            HealthResult::Healthy
        }
    }

    async fn stat_segment(&self, message_id: &str, ctx: &OperationContext) -> ProbeOutcome {
        let mut saw_a_response = false;
        for pool in &self.pools {
            let mut lease = match pool.acquire(ctx, Duration::from_secs(30)).await {
                Ok(l) => l,
                Err(_) => continue,
            };
            match lease.stat(message_id).await {
                Ok(true) => return ProbeOutcome::Found,
                Ok(false) => saw_a_response = true,
                Err(_) => continue,
            }
        }
        if saw_a_response {
            ProbeOutcome::Missing
        } else {
            ProbeOutcome::Inconclusive
        }
    }

    async fn reschedule(&self, item: &Item, result: HealthResult, now: i64) -> Result<()> {
        let mut updated = item.clone();
        match result {
            HealthResult::Healthy => {
                let jitter = rand::thread_rng().gen_range(0..RECHECK_JITTER_SECS);
                updated.next_health_check = Some(now + HEALTHY_RECHECK_SECS + jitter);
            }
            HealthResult::Unhealthy => updated.mark_corrupted_urgent(),
            HealthResult::Deleted => unreachable!("Deleted is handled by deletion in sweep()"),
        }
        self.metadata.insert_items(vec![updated]).await
    }
}

/// Deterministic pseudo-random sample of up to `k` distinct indices in
/// `[0, n)`, seeded so repeated sweeps of the same item vary which segments
/// are probed without needing a shared RNG.
fn sample_indices(n: usize, k: usize, seed: u64) -> Vec<usize> {
    if n <= k {
        return (0..n).collect();
    }
    let mut state = seed.max(1);
    let mut chosen = BTreeSet::new();
    while chosen.len() < k {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        chosen.insert((state >> 33) as usize % n);
    }
    chosen.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_indices_returns_all_when_n_small() {
        assert_eq!(sample_indices(2, 3, 42), vec![0, 1]);
    }

    #[test]
    fn sample_indices_bounded_and_distinct() {
        let sample = sample_indices(100, 3, 7);
        assert_eq!(sample.len(), 3);
        let unique: BTreeSet<_> = sample.iter().collect();
        assert_eq!(unique.len(), 3);
        assert!(sample.iter().all(|&i| i < 100));
    }

    #[test]
    fn sample_indices_deterministic_for_same_seed() {
        assert_eq!(sample_indices(50, 3, 99), sample_indices(50, 3, 99));
    }
}
