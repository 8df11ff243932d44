//! C9 "open" contract (spec §4.9): turns a stored [`Item`] into a live
//! [`SeekableRead`] by composing C5/C6/C7 over the item's backing metadata.
//! This is the read-time control flow spec §2 describes as C9 → C6/C5 → C3
//! → C1 → C2, collected in one place instead of scattered across callers.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::LimitsConfig;
use crate::error::{CoreError, Result};
use crate::fetch::FetchEngine;
use crate::pool::Pool;
use crate::provider::OperationContext;
use crate::size_oracle;
use crate::stream::composite::{CompositeStream, PartFactory};
use crate::stream::segmented::SegmentedStream;
use crate::stream::{AesCtrStream, LengthLimitStream, RarXorStream, SeekFrom, SeekableRead};

use super::item::{FilePart, Item, ItemBacking};
use super::store::MetadataStore;

/// Build the byte stream backing `item`. `ctx` should already carry the
/// caller's [`crate::provider::UsageType`]; its `affinity_key` is
/// overwritten with the item's parent directory id so every stream opened
/// under the same directory shares one EWMA speed history (spec §4.9).
pub async fn open_item<M: MetadataStore>(
    store: &M,
    engine: Arc<FetchEngine>,
    pools: &[Pool],
    limits: &LimitsConfig,
    item: &Item,
    ctx: OperationContext,
) -> Result<Box<dyn SeekableRead>> {
    let ctx = match item.parent_id {
        Some(parent) => ctx.with_affinity_key(parent.to_string()),
        None => ctx,
    };

    match &item.backing {
        ItemBacking::Directory | ItemBacking::Symlink { .. } => {
            Err(CoreError::NotAFile(item.name.clone()))
        }
        ItemBacking::NzbFile(backing) => {
            let sizes = match &backing.segment_sizes {
                Some(sizes) => sizes.clone(),
                None => {
                    // Sizes aren't known yet: probe headers now rather than
                    // guessing, then persist so future opens skip this step
                    // (spec §4.4's oracle is meant to run once per file).
                    let probed = size_oracle::fast_analyse(pools, &backing.segment_ids, &ctx, 16).await;
                    let sizes: Vec<u64> = probed.into_iter().map(|s| s.unwrap_or(0)).collect();
                    store.update_segment_sizes(item.id, sizes.clone()).await?;
                    sizes
                }
            };
            let total: u64 = sizes.iter().sum();
            let segmented = SegmentedStream::new(
                backing.segment_ids.clone(),
                sizes,
                engine,
                ctx,
                limits.graceful_degradation,
                limits.connections_per_stream,
                limits.stream_buffer_size,
            );
            Ok(Box::new(LengthLimitStream::new(Box::new(segmented), total)))
        }
        ItemBacking::Multipart(backing) => {
            let parts: Vec<(Box<dyn PartFactory>, Option<u64>)> = backing
                .parts
                .iter()
                .map(|part| {
                    let factory: Box<dyn PartFactory> = Box::new(SegmentPartFactory {
                        part: part.clone(),
                        engine: engine.clone(),
                        ctx: ctx.child(),
                        graceful_degradation: limits.graceful_degradation,
                        worker_count: limits.connections_per_stream,
                        buffer_size: limits.stream_buffer_size,
                    });
                    (factory, Some(part.part_size))
                })
                .collect();

            let total = backing.total_size();
            let composite =
                CompositeStream::new(parts, limits.composite_cache_size, limits.composite_cache_ttl);
            let mut stream: Box<dyn SeekableRead> =
                Box::new(LengthLimitStream::new(Box::new(composite), total));

            // Stream → Limit → Aes → RarXor (spec §4.7).
            if let Some(aes) = &backing.aes_params {
                stream = Box::new(AesCtrStream::new(stream, &aes.key, &aes.iv)?);
            }
            if let Some(key) = backing.obfuscation_key {
                stream = Box::new(RarXorStream::new(stream, key, 0));
            }
            Ok(stream)
        }
    }
}

/// Opens one [`FilePart`] into a [`SegmentedStream`] windowed down to its
/// `byte_range_within_part` (spec §3 "FilePart"). Cheap to construct — the
/// real fetch pipeline only spins up once [`CompositeStream`] touches it.
struct SegmentPartFactory {
    part: FilePart,
    engine: Arc<FetchEngine>,
    ctx: OperationContext,
    graceful_degradation: bool,
    worker_count: usize,
    buffer_size: usize,
}

#[async_trait]
impl PartFactory for SegmentPartFactory {
    async fn open(&self) -> Result<Box<dyn SeekableRead>> {
        let segmented = SegmentedStream::new(
            self.part.nzb_segment_ids.clone(),
            self.part.nzb_segment_sizes.clone(),
            self.engine.clone(),
            self.ctx.child(),
            self.graceful_degradation,
            self.worker_count,
            self.buffer_size,
        );
        let base = self.part.byte_range_within_part.start;
        let len = self.part.byte_range_within_part.end - base;
        Ok(Box::new(RangeWindowStream::new(Box::new(segmented), base, len)))
    }
}

/// Shifts an inner stream's origin so offset `0` for callers is `base` in
/// the inner stream's own coordinates, clamped to `len` bytes. Grounded on
/// the same offset-translation idiom as [`LengthLimitStream`], just with a
/// non-zero starting point.
struct RangeWindowStream {
    inner: Box<dyn SeekableRead>,
    base: u64,
    len: u64,
    position: u64,
}

impl RangeWindowStream {
    fn new(inner: Box<dyn SeekableRead>, base: u64, len: u64) -> Self {
        RangeWindowStream {
            inner,
            base,
            len,
            position: 0,
        }
    }
}

#[async_trait]
impl SeekableRead for RangeWindowStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.position >= self.len {
            return Ok(0);
        }
        let remaining = (self.len - self.position) as usize;
        let want = buf.len().min(remaining);
        let n = self.inner.read(&mut buf[..want]).await?;
        self.position += n as u64;
        Ok(n)
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let target = match pos {
            SeekFrom::Start(off) => off,
            SeekFrom::End(delta) => (self.len as i64 + delta).max(0) as u64,
            SeekFrom::Current(delta) => (self.position as i64 + delta).max(0) as u64,
        };
        if target > self.len {
            return Err(CoreError::SeekPositionNotFound {
                offset: target,
                length: self.len,
            });
        }
        self.inner.seek(SeekFrom::Start(self.base + target)).await?;
        self.position = target;
        Ok(self.position)
    }

    fn length(&self) -> Option<u64> {
        Some(self.len)
    }

    async fn close(&mut self) {
        self.inner.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MemStream {
        data: Vec<u8>,
        position: usize,
    }

    #[async_trait]
    impl SeekableRead for MemStream {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            let remaining = &self.data[self.position..];
            let n = remaining.len().min(buf.len());
            buf[..n].copy_from_slice(&remaining[..n]);
            self.position += n;
            Ok(n)
        }
        async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
            let target = match pos {
                SeekFrom::Start(o) => o,
                SeekFrom::End(d) => (self.data.len() as i64 + d) as u64,
                SeekFrom::Current(d) => (self.position as i64 + d) as u64,
            };
            self.position = target as usize;
            Ok(target)
        }
        fn length(&self) -> Option<u64> {
            Some(self.data.len() as u64)
        }
        async fn close(&mut self) {}
    }

    #[tokio::test]
    async fn range_window_clamps_and_shifts_origin() {
        let inner = Box::new(MemStream {
            data: (0u8..20).collect(),
            position: 0,
        });
        let mut windowed = RangeWindowStream::new(inner, 5, 8);

        let mut buf = [0u8; 20];
        let n = windowed.read(&mut buf).await.unwrap();
        assert_eq!(n, 8);
        assert_eq!(&buf[..8], &(5u8..13).collect::<Vec<_>>()[..]);
        assert_eq!(windowed.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn range_window_seek_rejects_past_len() {
        let inner = Box::new(MemStream {
            data: vec![0u8; 20],
            position: 0,
        });
        let mut windowed = RangeWindowStream::new(inner, 5, 8);
        let err = windowed.seek(SeekFrom::Start(9)).await.unwrap_err();
        assert!(matches!(err, CoreError::SeekPositionNotFound { .. }));
    }
}
