//! C5 — buffered segmented stream (spec §4.5).
//!
//! Random-access reads over an ordered segment list. A sliding window of
//! prefetch slots is kept one step ahead of the reader; `seek` retargets the
//! window instead of discarding and restarting it when the jump lands
//! nearby. Grounded on the teacher's `storage/global_writer.rs`
//! dedicated-task-owns-mutable-state idiom, adapted from a single writer to
//! a prefetch-worker pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{CoreError, Result};
use crate::fetch::FetchEngine;
use crate::provider::OperationContext;
use crate::size_oracle::{cumulative_offsets, segment_for_offset};

use super::{SeekFrom, SeekableRead};

#[derive(Clone)]
enum SlotState {
    Pending,
    Fetching,
    Ready(Bytes),
    Failed,
    Consumed,
}

struct Slot {
    state: SlotState,
    cancel: Option<CancellationToken>,
}

impl Slot {
    fn pending() -> Self {
        Slot {
            state: SlotState::Pending,
            cancel: None,
        }
    }
}

struct Shared {
    message_ids: Arc<[String]>,
    cumulative: Arc<[u64]>,
    engine: Arc<FetchEngine>,
    ctx: OperationContext,
    graceful_degradation: bool,
    slots: Mutex<Vec<Slot>>,
    notify: Notify,
    workers: Arc<Semaphore>,
    is_corrupted: AtomicBool,
}

/// A seekable stream over one `NzbFile`'s segments (spec §4.5).
pub struct SegmentedStream {
    shared: Arc<Shared>,
    position: u64,
    total_length: u64,
    buffer_size: usize,
}

impl SegmentedStream {
    /// `message_ids`/`segment_sizes` must be the same length, in article
    /// order. `worker_count` bounds concurrent in-flight fetches for this
    /// stream; `buffer_size` bounds the prefetch window, in segments.
    pub fn new(
        message_ids: Vec<String>,
        segment_sizes: Vec<u64>,
        engine: Arc<FetchEngine>,
        ctx: OperationContext,
        graceful_degradation: bool,
        worker_count: usize,
        buffer_size: usize,
    ) -> Self {
        let cumulative = cumulative_offsets(&segment_sizes);
        let total_length = *cumulative.last().unwrap_or(&0);
        let n = message_ids.len();
        let slots = (0..n).map(|_| Slot::pending()).collect();

        SegmentedStream {
            shared: Arc::new(Shared {
                message_ids: Arc::from(message_ids),
                cumulative: Arc::from(cumulative),
                engine,
                ctx,
                graceful_degradation,
                slots: Mutex::new(slots),
                notify: Notify::new(),
                workers: Arc::new(Semaphore::new(worker_count.max(1))),
                is_corrupted: AtomicBool::new(false),
            }),
            position: 0,
            total_length,
            buffer_size: buffer_size.max(1),
        }
    }

    pub fn is_corrupted(&self) -> bool {
        self.shared.is_corrupted.load(Ordering::SeqCst)
    }

    fn current_segment(&self) -> Option<usize> {
        segment_for_offset(&self.shared.cumulative, self.position)
    }

    /// Launch fetches for every Pending slot in `[center, center+window)`,
    /// up to the stream's worker-count permit budget (spec §4.5 "selects
    /// the next Pending slot with the lowest ordinal within the look-ahead
    /// window").
    async fn ensure_window(&self, center: usize) {
        let n = self.shared.message_ids.len();
        let end = (center + self.buffer_size).min(n);
        for idx in center..end {
            let needs_launch = {
                let slots = self.shared.slots.lock().await;
                matches!(slots[idx].state, SlotState::Pending)
            };
            if needs_launch {
                self.launch_fetch(idx);
            }
        }
    }

    fn launch_fetch(&self, idx: usize) {
        let shared = Arc::clone(&self.shared);
        let message_id = shared.message_ids[idx].clone();
        let declared_size = shared.cumulative[idx + 1] - shared.cumulative[idx];
        let child_ctx = shared.ctx.child();
        let cancel = child_ctx.cancel.clone();

        // Flip the slot to Fetching inside the spawned task, after
        // acquiring a worker permit, to avoid a duplicate-launch race
        // against `ensure_window` observing stale Pending state.
        tokio::spawn(async move {
            let permit = tokio::select! {
                p = shared.workers.clone().acquire_owned() => p,
                _ = cancel.cancelled() => return,
            };
            let Ok(_permit) = permit else { return };

            {
                let mut slots = shared.slots.lock().await;
                if !matches!(slots[idx].state, SlotState::Pending) {
                    return;
                }
                slots[idx].state = SlotState::Fetching;
                slots[idx].cancel = Some(cancel.clone());
            }

            let fetch_ctx = child_ctx;
            let result = tokio::select! {
                r = shared.engine.fetch(&message_id, &fetch_ctx, shared.graceful_degradation, declared_size) => r,
                _ = cancel.cancelled() => Err(CoreError::Cancelled),
            };

            let mut slots = shared.slots.lock().await;
            match result {
                Ok(fetched) => {
                    if fetched.degraded {
                        shared.is_corrupted.store(true, Ordering::SeqCst);
                    }
                    slots[idx].state = SlotState::Ready(Bytes::from(fetched.decoded.data));
                }
                Err(CoreError::Cancelled) => {
                    slots[idx].state = SlotState::Pending;
                }
                Err(e) => {
                    warn!(message_id = %message_id, error = %e, "segment fetch failed permanently");
                    slots[idx].state = SlotState::Failed;
                }
            }
            drop(slots);
            shared.notify.notify_waiters();
        });
    }

    /// Wait until `idx`'s slot leaves {Pending, Fetching}.
    async fn await_ready(&self, idx: usize) -> Result<()> {
        loop {
            {
                let slots = self.shared.slots.lock().await;
                match &slots[idx].state {
                    SlotState::Ready(_) => return Ok(()),
                    SlotState::Failed => {
                        return Err(CoreError::ArticleNotFound {
                            message_id: self.shared.message_ids[idx].clone(),
                        })
                    }
                    SlotState::Consumed => return Ok(()),
                    SlotState::Pending | SlotState::Fetching => {}
                }
            }
            self.shared.notify.notified().await;
        }
    }

    /// Cancel every in-flight fetch outside `[keep_from, keep_to)` and
    /// reset those slots to Pending so they are re-fetched if re-entered
    /// later (spec §4.5 seek: "cancels only those in-flight fetches
    /// outside the new window").
    async fn retarget_window(&self, keep_from: usize, keep_to: usize) {
        let mut slots = self.shared.slots.lock().await;
        for (idx, slot) in slots.iter_mut().enumerate() {
            if idx < keep_from || idx >= keep_to {
                if let Some(cancel) = slot.cancel.take() {
                    cancel.cancel();
                }
                if !matches!(slot.state, SlotState::Consumed) {
                    slot.state = SlotState::Pending;
                }
            }
        }
    }
}

#[async_trait]
impl SeekableRead for SegmentedStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.position >= self.total_length || buf.is_empty() {
            return Ok(0);
        }

        let idx = match self.current_segment() {
            Some(i) => i,
            None => return Ok(0),
        };

        self.ensure_window(idx).await;
        self.await_ready(idx).await?;

        let mut slots = self.shared.slots.lock().await;
        let seg_start = self.shared.cumulative[idx];
        let within = (self.position - seg_start) as usize;

        let (copied, fully_consumed) = match &slots[idx].state {
            SlotState::Ready(data) => {
                let remaining = &data[within..];
                let n = remaining.len().min(buf.len());
                buf[..n].copy_from_slice(&remaining[..n]);
                (n, within + n >= data.len())
            }
            SlotState::Consumed => (0, true),
            _ => unreachable!("await_ready guarantees Ready/Consumed/error"),
        };

        if fully_consumed {
            slots[idx].state = SlotState::Consumed;
        }
        drop(slots);

        self.position += copied as u64;
        if fully_consumed {
            // Advance the prefetch window now that a slot retired
            // (spec §4.5 "retirement ... a new Pending slot enters the
            // window").
            let next_center = idx + 1;
            self.ensure_window(next_center).await;
        }

        Ok(copied)
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let target = match pos {
            SeekFrom::Start(off) => off,
            SeekFrom::End(delta) => {
                (self.total_length as i64 + delta).max(0) as u64
            }
            SeekFrom::Current(delta) => (self.position as i64 + delta).max(0) as u64,
        };
        if target > self.total_length {
            return Err(CoreError::SeekPositionNotFound {
                offset: target,
                length: self.total_length,
            });
        }

        let new_idx = segment_for_offset(&self.shared.cumulative, target)
            .unwrap_or(self.shared.message_ids.len());
        let keep_to = (new_idx + self.buffer_size).min(self.shared.message_ids.len());
        self.retarget_window(new_idx, keep_to).await;

        self.position = target;
        Ok(self.position)
    }

    fn length(&self) -> Option<u64> {
        Some(self.total_length)
    }

    async fn close(&mut self) {
        let mut slots = self.shared.slots.lock().await;
        for slot in slots.iter_mut() {
            if let Some(cancel) = slot.cancel.take() {
                cancel.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_lookup_matches_oracle() {
        let sizes = vec![10u64, 20, 30];
        let cum = cumulative_offsets(&sizes);
        assert_eq!(segment_for_offset(&cum, 0), Some(0));
        assert_eq!(segment_for_offset(&cum, 15), Some(1));
        assert_eq!(segment_for_offset(&cum, 59), Some(2));
        assert_eq!(segment_for_offset(&cum, 60), None);
    }
}
