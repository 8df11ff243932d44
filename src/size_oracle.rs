//! C4 — segment-size oracle (spec §4.4).
//!
//! NZBs rarely declare accurate per-segment sizes. This module derives them
//! by actually reading article headers, and hands the result back to the
//! caller to persist through [`crate::vfs::MetadataStore::update_segment_sizes`]
//! (spec §8 property 7: once persisted, an array is never overwritten with a
//! different one).

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::debug;

use crate::error::Result;
use crate::fetch::FetchEngine;
use crate::pool::Pool;
use crate::provider::OperationContext;
use crate::yenc;

/// Only the yEnc header portion of a body is needed to learn a segment's
/// decoded size — no need to pull the whole article across the wire.
const HEADER_PROBE_BYTES: usize = 256;

/// **Fast analyse**: `STAT`/partial-`BODY` every segment in parallel
/// (bounded by `concurrency`), reading only the yEnc header to learn each
/// segment's `part-size`. Returns sizes in the same order as `message_ids`.
///
/// A segment whose header cannot be read (missing on every provider, or no
/// yEnc markers in the probed prefix) yields `None` at that position; the
/// caller decides whether that's fatal.
pub async fn fast_analyse(
    pools: &[Pool],
    message_ids: &[String],
    ctx: &OperationContext,
    concurrency: usize,
) -> Vec<Option<u64>> {
    let mut results = vec![None; message_ids.len()];
    let mut futures = FuturesUnordered::new();
    let mut next = 0usize;

    let launch = |idx: usize| {
        let pools = pools.to_vec();
        let message_id = message_ids[idx].clone();
        let ctx = ctx.child();
        async move { (idx, probe_one(&pools, &message_id, &ctx).await) }
    };

    while next < message_ids.len() && futures.len() < concurrency {
        futures.push(launch(next));
        next += 1;
    }

    while let Some((idx, size)) = futures.next().await {
        results[idx] = size;
        if next < message_ids.len() {
            futures.push(launch(next));
            next += 1;
        }
    }

    results
}

async fn probe_one(pools: &[Pool], message_id: &str, ctx: &OperationContext) -> Option<u64> {
    for pool in pools {
        let mut lease = match pool.acquire(ctx, std::time::Duration::from_secs(30)).await {
            Ok(l) => l,
            Err(_) => continue,
        };
        match lease.body_prefix(message_id, HEADER_PROBE_BYTES).await {
            Ok(prefix) => {
                if let Some(header) = yenc::parse_header_only(&prefix) {
                    if let Some(size) = header.part_size {
                        return Some(size);
                    }
                }
            }
            Err(_) => continue,
        }
    }
    None
}

/// **Smart analyse**: for long segment lists, sample only the head and a
/// handful of tail segments, infer a uniform interior size from the head
/// sample, and confirm against the tail (spec §4.4).
///
/// `total_declared` is the NZB's advisory total byte count, used only to
/// sanity-check the inferred tail size, never to override a directly
/// observed one.
pub async fn smart_analyse(
    pools: &[Pool],
    message_ids: &[String],
    ctx: &OperationContext,
    total_declared: u64,
) -> Vec<Option<u64>> {
    let n = message_ids.len();
    if n == 0 {
        return Vec::new();
    }
    if n <= 8 {
        // Too short to benefit from sampling; fall back to probing every
        // segment (fast_analyse is cheap enough at this scale).
        return fast_analyse(pools, message_ids, ctx, 8).await;
    }

    const SAMPLE_HEAD: usize = 3;
    const SAMPLE_TAIL: usize = 2;

    let head_ids = &message_ids[..SAMPLE_HEAD];
    let head_sizes = fast_analyse(pools, head_ids, ctx, SAMPLE_HEAD).await;
    let uniform_size = head_sizes.iter().flatten().next().copied();

    let tail_start = n - SAMPLE_TAIL;
    let tail_ids = &message_ids[tail_start..];
    let tail_sizes = fast_analyse(pools, tail_ids, ctx, SAMPLE_TAIL).await;

    let mut results = vec![None; n];
    if let Some(uniform) = uniform_size {
        for slot in results.iter_mut().take(n - SAMPLE_TAIL) {
            *slot = Some(uniform);
        }
    }
    for (offset, size) in tail_sizes.into_iter().enumerate() {
        results[tail_start + offset] = size;
    }

    // Reconcile against the NZB's advisory total: if the inferred sum is
    // off by more than one segment's worth, the last known segment absorbs
    // the remainder rather than silently drifting (spec §4.5 numeric rules:
    // "the stream must tolerate imprecision of at most one segment").
    if total_declared > 0 {
        let known_sum: u64 = results.iter().flatten().sum();
        let known_count = results.iter().filter(|s| s.is_some()).count();
        if known_count == n && known_sum != total_declared {
            if let Some(last) = results.last_mut() {
                if let Some(last_size) = last {
                    let diff = total_declared as i64 - known_sum as i64;
                    *last_size = (*last_size as i64 + diff).max(0) as u64;
                    debug!(diff, "smart_analyse reconciled tail segment against declared total");
                }
            }
        }
    }

    results
}

/// Convenience: run fast analysis and fetch real-world throughput speed
/// isn't needed here — this just threads `FetchEngine`'s pools through for
/// callers that already hold a [`FetchEngine`] rather than a raw pool list.
pub async fn fast_analyse_via_engine(
    engine: &FetchEngine,
    pools: &[Pool],
    message_ids: &[String],
    ctx: &OperationContext,
) -> Vec<Option<u64>> {
    let _ = engine; // retained for call-site symmetry with fetch::FetchEngine::fetch
    fast_analyse(pools, message_ids, ctx, 16).await
}

/// Pack a `Vec<u64>` of segment sizes into the 64-bit-per-entry blob
/// described in spec §3 "NzbFile backing". Little-endian, fixed width —
/// trivially `O(1)`-indexable without parsing.
pub fn pack_sizes(sizes: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(sizes.len() * 8);
    for &size in sizes {
        out.extend_from_slice(&size.to_le_bytes());
    }
    out
}

pub fn unpack_sizes(blob: &[u8]) -> Result<Vec<u64>> {
    if blob.len() % 8 != 0 {
        return Err(crate::error::CoreError::Store(
            "segment-size blob length not a multiple of 8".into(),
        ));
    }
    Ok(blob
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

/// Cumulative byte-offset table for an ordered list of segment sizes
/// (spec §4.5 numeric rules): `cumulative[i]` is the start offset of
/// segment `i`; `cumulative[n]` is the total length.
pub fn cumulative_offsets(sizes: &[u64]) -> Vec<u64> {
    let mut out = Vec::with_capacity(sizes.len() + 1);
    let mut acc = 0u64;
    out.push(0);
    for &s in sizes {
        acc += s;
        out.push(acc);
    }
    out
}

/// Binary search the segment ordinal covering byte offset `pos`, given the
/// cumulative offsets table from [`cumulative_offsets`].
pub fn segment_for_offset(cumulative: &[u64], pos: u64) -> Option<usize> {
    if cumulative.len() < 2 || pos >= *cumulative.last().unwrap() {
        return None;
    }
    // cumulative[i] <= pos < cumulative[i+1]
    match cumulative.binary_search(&pos) {
        Ok(i) => Some(i.min(cumulative.len() - 2)),
        Err(i) => Some(i - 1),
    }
}

pub type SharedMessageIds = Arc<[String]>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trip() {
        let sizes = vec![716800, 716800, 612000];
        let blob = pack_sizes(&sizes);
        assert_eq!(blob.len(), 24);
        assert_eq!(unpack_sizes(&blob).unwrap(), sizes);
    }

    #[test]
    fn cumulative_offsets_and_segment_lookup() {
        let sizes = vec![100u64, 200, 50];
        let cum = cumulative_offsets(&sizes);
        assert_eq!(cum, vec![0, 100, 300, 350]);
        assert_eq!(segment_for_offset(&cum, 0), Some(0));
        assert_eq!(segment_for_offset(&cum, 99), Some(0));
        assert_eq!(segment_for_offset(&cum, 100), Some(1));
        assert_eq!(segment_for_offset(&cum, 349), Some(2));
        assert_eq!(segment_for_offset(&cum, 350), None);
    }

    #[test]
    fn unpack_rejects_misaligned_blob() {
        let bad = vec![1, 2, 3];
        assert!(unpack_sizes(&bad).is_err());
    }
}
