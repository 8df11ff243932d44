//! C3 — segment fetcher (spec §4.3).
//!
//! Fetches one article across a provider preference order, decodes it via
//! [`crate::yenc`], classifies failures, and retries transient ones on the
//! next candidate. Per-(job, provider) speed stats feed back into the next
//! call's preference order (spec §9 "affinity key").

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{CoreError, Result};
use crate::pool::Pool;
use crate::provider::OperationContext;
use crate::yenc::{self, YencDecoded};

const MAX_TRANSIENT_RETRIES: u32 = 3;
const EWMA_ALPHA: f64 = 0.3;
/// Samples more than this factor away from the running average are
/// discarded as outliers rather than folded in (spec §4.3 step 7).
const OUTLIER_FACTOR: f64 = 3.0;

/// Result of a successful fetch.
#[derive(Debug, Clone)]
pub struct FetchedSegment {
    pub decoded: YencDecoded,
    pub provider: Arc<str>,
    /// Set when the segment was substituted with zeroes under graceful
    /// degradation (spec §4.3 step 6 / §4.5).
    pub degraded: bool,
}

#[derive(Default)]
struct ProviderStats {
    successes: std::sync::atomic::AtomicU64,
    failures: std::sync::atomic::AtomicU64,
    bytes_total: std::sync::atomic::AtomicU64,
    elapsed_ms_total: std::sync::atomic::AtomicU64,
    ewma_bps: Mutex<Option<f64>>,
}

impl ProviderStats {
    fn record_success(&self, bytes: u64, elapsed: Duration) {
        use std::sync::atomic::Ordering::SeqCst;
        self.successes.fetch_add(1, SeqCst);
        self.bytes_total.fetch_add(bytes, SeqCst);
        self.elapsed_ms_total
            .fetch_add(elapsed.as_millis() as u64, SeqCst);

        let sample = bytes as f64 / elapsed.as_secs_f64().max(0.001);
        let mut ewma = self.ewma_bps.lock();
        *ewma = Some(match *ewma {
            None => sample,
            Some(prev) if sample > prev * OUTLIER_FACTOR || sample < prev / OUTLIER_FACTOR => prev,
            Some(prev) => EWMA_ALPHA * sample + (1.0 - EWMA_ALPHA) * prev,
        });
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    fn speed(&self) -> f64 {
        (*self.ewma_bps.lock()).unwrap_or(0.0)
    }
}

/// Drives segment fetches over a set of provider pools.
pub struct FetchEngine {
    primaries: Vec<Pool>,
    backups: Vec<Pool>,
    stats: DashMap<(Arc<str>, Arc<str>), Arc<ProviderStats>>,
    attempt_deadline: Duration,
}

impl FetchEngine {
    pub fn new(primaries: Vec<Pool>, backups: Vec<Pool>, attempt_deadline: Duration) -> Self {
        FetchEngine {
            primaries,
            backups,
            stats: DashMap::new(),
            attempt_deadline,
        }
    }

    /// Fetch and yEnc-decode one article, trying providers in preference
    /// order until success, exhaustion, or a terminal error.
    ///
    /// `declared_size` is used only to synthesize a zero-filled
    /// substitute under `graceful_degradation`.
    pub async fn fetch(
        &self,
        message_id: &str,
        ctx: &OperationContext,
        graceful_degradation: bool,
        declared_size: u64,
    ) -> Result<FetchedSegment> {
        let candidates = self.candidate_order(ctx);
        let mut retries_used = 0u32;
        let mut all_missing = true;
        let mut last_error: Option<CoreError> = None;

        for pool in &candidates {
            if ctx.cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }

            let provider_name = pool.provider().name.clone();
            let mut lease = match pool.acquire(ctx, self.attempt_deadline).await {
                Ok(lease) => lease,
                Err(e) => {
                    all_missing = false;
                    last_error = Some(e);
                    continue;
                }
            };

            let started = Instant::now();
            let fetch_result = tokio::time::timeout(self.attempt_deadline, lease.body(message_id))
                .await
                .map_err(|_| CoreError::Timeout(self.attempt_deadline))
                .and_then(|inner| inner);

            match fetch_result {
                Ok(body) => match yenc::decode_article(&body, message_id) {
                    Ok(decoded) => {
                        self.stat_for(ctx, &provider_name)
                            .record_success(decoded.data.len() as u64, started.elapsed());
                        return Ok(FetchedSegment {
                            decoded,
                            provider: provider_name,
                            degraded: false,
                        });
                    }
                    Err(e @ (CoreError::ArticleMalformed(_) | CoreError::CrcMismatch { .. })) => {
                        all_missing = false;
                        self.stat_for(ctx, &provider_name).record_failure();
                        lease.poison();
                        retries_used += 1;
                        last_error = Some(e);
                        if retries_used <= MAX_TRANSIENT_RETRIES {
                            let backoff = Duration::from_millis(100) * 2u32.pow(retries_used)
                                + jitter();
                            warn!(message_id, attempt = retries_used, "transient yEnc failure, retrying");
                            sleep(backoff).await;
                        }
                        continue;
                    }
                    Err(e) => {
                        all_missing = false;
                        last_error = Some(e);
                        continue;
                    }
                },
                Err(CoreError::ArticleNotFound { .. }) => {
                    self.stat_for(ctx, &provider_name).record_failure();
                    debug!(message_id, provider = %provider_name, "article missing on provider");
                    continue;
                }
                Err(e) => {
                    all_missing = false;
                    self.stat_for(ctx, &provider_name).record_failure();
                    lease.poison();
                    last_error = Some(e);
                    continue;
                }
            }
        }

        if graceful_degradation {
            warn!(message_id, "segment unavailable, substituting zero-filled block");
            let decoded = YencDecoded {
                header: yenc::YencHeader {
                    filename: String::new(),
                    filesize: declared_size,
                    part_number: None,
                    total_parts: None,
                    part_size: Some(declared_size),
                    part_offset: Some(0),
                },
                data: vec![0u8; declared_size as usize],
                crc32_declared: None,
                crc32_computed: 0,
            };
            return Ok(FetchedSegment {
                decoded,
                provider: Arc::from("degraded"),
                degraded: true,
            });
        }

        if all_missing {
            Err(CoreError::ArticleNotFound {
                message_id: message_id.to_string(),
            })
        } else {
            Err(last_error.unwrap_or(CoreError::ArticleNotFound {
                message_id: message_id.to_string(),
            }))
        }
    }

    /// Primaries first (shuffled, then stable-sorted by descending EWMA
    /// speed for the job's affinity key — SPEC_FULL.md Open Question 1),
    /// backups last.
    fn candidate_order(&self, ctx: &OperationContext) -> Vec<Pool> {
        let mut primaries = self.primaries.clone();
        let mut rng = rand::thread_rng();
        primaries.shuffle(&mut rng);

        if let Some(key) = &ctx.affinity_key {
            primaries.sort_by(|a, b| {
                let speed_a = self.speed_for(key, &a.provider().name);
                let speed_b = self.speed_for(key, &b.provider().name);
                speed_b
                    .partial_cmp(&speed_a)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        primaries.into_iter().chain(self.backups.clone()).collect()
    }

    fn stat_for(&self, ctx: &OperationContext, provider: &Arc<str>) -> Arc<ProviderStats> {
        let key = (
            ctx.affinity_key.clone().unwrap_or_else(|| Arc::from("")),
            provider.clone(),
        );
        self.stats
            .entry(key)
            .or_insert_with(|| Arc::new(ProviderStats::default()))
            .clone()
    }

    fn speed_for(&self, affinity_key: &Arc<str>, provider: &Arc<str>) -> f64 {
        self.stats
            .get(&(affinity_key.clone(), provider.clone()))
            .map(|s| s.speed())
            .unwrap_or(0.0)
    }
}

fn jitter() -> Duration {
    use rand::Rng;
    Duration::from_millis(rand::thread_rng().gen_range(0..50))
}
