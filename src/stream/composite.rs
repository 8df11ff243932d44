//! C6 — composite stream (spec §4.6).
//!
//! Concatenates a sequence of `(factory → sub-stream, length)` parts into a
//! single seekable stream. Sub-streams are opened lazily on first access and
//! kept in a bounded LRU so workloads that hop between parts (e.g. a
//! container-chunk reader crossing RAR volumes) don't repeatedly re-open
//! fetch pipelines.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::{CoreError, Result};

use super::{SeekFrom, SeekableRead};

/// Produces a fresh sub-stream for one part. Kept as a trait rather than a
/// boxed closure so callers can hold cheap, cloneable state (segment ids,
/// AES params, etc.) and build the real stream only when the part is
/// actually touched.
#[async_trait]
pub trait PartFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn SeekableRead>>;
}

struct Part {
    factory: Box<dyn PartFactory>,
    /// `None` means this part's length is unknown up front; the composite
    /// stream as a whole then becomes non-seekable (spec §4.6).
    length: Option<u64>,
}

struct CachedStream {
    part_idx: usize,
    stream: Box<dyn SeekableRead>,
    last_touched: Instant,
}

/// Bounded LRU of live sub-streams, most-recently-used at the back, each
/// entry additionally aged out by `ttl` (spec §9 Open Question 3: cap *and*
/// TTL together). A TTL-expired entry is evicted lazily the next time
/// `take`/`put` looks at the cache, even if the LRU still has free capacity
/// — so a long-idle stream doesn't pin an open socket just because nothing
/// else has pushed it out.
struct StreamCache {
    capacity: usize,
    ttl: Duration,
    entries: VecDeque<CachedStream>,
}

impl StreamCache {
    fn new(capacity: usize, ttl: Duration) -> Self {
        StreamCache {
            capacity,
            ttl,
            entries: VecDeque::new(),
        }
    }

    /// Close and drop every entry whose age exceeds `ttl`.
    async fn evict_expired(&mut self) {
        let now = Instant::now();
        let mut i = 0;
        while i < self.entries.len() {
            if now.duration_since(self.entries[i].last_touched) >= self.ttl {
                let mut expired = self.entries.remove(i).unwrap();
                expired.stream.close().await;
            } else {
                i += 1;
            }
        }
    }

    async fn take(&mut self, part_idx: usize) -> Option<Box<dyn SeekableRead>> {
        self.evict_expired().await;
        if let Some(pos) = self.entries.iter().position(|e| e.part_idx == part_idx) {
            let entry = self.entries.remove(pos).unwrap();
            Some(entry.stream)
        } else {
            None
        }
    }

    /// Park a sub-stream back in the cache. If full (capacity 0 means pure
    /// passthrough — SPEC_FULL.md Open Question 3), the oldest entry is
    /// evicted and closed.
    async fn put(&mut self, part_idx: usize, stream: Box<dyn SeekableRead>) {
        self.evict_expired().await;
        if self.capacity == 0 {
            let mut stream = stream;
            stream.close().await;
            return;
        }
        while self.entries.len() >= self.capacity {
            if let Some(mut evicted) = self.entries.pop_front() {
                evicted.stream.close().await;
            } else {
                break;
            }
        }
        self.entries.push_back(CachedStream {
            part_idx,
            stream,
            last_touched: Instant::now(),
        });
    }

    async fn close_all(&mut self) {
        while let Some(mut entry) = self.entries.pop_front() {
            entry.stream.close().await;
        }
    }
}

/// Concatenation of multiple parts into one seekable stream (spec §4.6).
pub struct CompositeStream {
    parts: Vec<Part>,
    /// `cumulative[i]` is the start offset of part `i`; `None` once any
    /// part's length is unknown, at which point seeking beyond the loaded
    /// prefix is unsupported.
    cumulative: Option<Vec<u64>>,
    total_length: Option<u64>,
    cache: StreamCache,
    position: u64,
    current: Option<Box<dyn SeekableRead>>,
    current_idx: Option<usize>,
    /// In-part offset pending application once the target part is loaded
    /// (spec §4.6: "lazily load the target with a pending in-part offset").
    pending_inner_offset: Option<u64>,
}

impl CompositeStream {
    pub fn new(
        parts: Vec<(Box<dyn PartFactory>, Option<u64>)>,
        cache_capacity: usize,
        cache_ttl: Duration,
    ) -> Self {
        let parts: Vec<Part> = parts
            .into_iter()
            .map(|(factory, length)| Part { factory, length })
            .collect();

        let all_known = parts.iter().all(|p| p.length.is_some());
        let (cumulative, total_length) = if all_known {
            let mut cum = Vec::with_capacity(parts.len() + 1);
            let mut acc = 0u64;
            cum.push(0);
            for p in &parts {
                acc += p.length.unwrap();
                cum.push(acc);
            }
            (Some(cum), Some(acc))
        } else {
            (None, None)
        };

        CompositeStream {
            parts,
            cumulative,
            total_length,
            cache: StreamCache::new(cache_capacity, cache_ttl),
            position: 0,
            current: None,
            current_idx: None,
            pending_inner_offset: None,
        }
    }

    fn part_for_offset(&self, pos: u64) -> Option<usize> {
        let cum = self.cumulative.as_ref()?;
        if pos >= *cum.last().unwrap() {
            return None;
        }
        match cum.binary_search(&pos) {
            Ok(i) => Some(i.min(cum.len() - 2)),
            Err(i) => Some(i - 1),
        }
    }

    async fn ensure_current(&mut self, idx: usize) -> Result<()> {
        if self.current_idx == Some(idx) {
            return Ok(());
        }
        if let Some(mut prev) = self.current.take() {
            let prev_idx = self.current_idx.take().unwrap();
            // Don't close streams that are still seekable random-access —
            // park them in the LRU instead so hopping back is cheap.
            if prev.length().is_some() {
                self.cache.put(prev_idx, prev).await;
            } else {
                prev.close().await;
            }
        }

        let mut stream = match self.cache.take(idx).await {
            Some(s) => s,
            None => self.parts[idx].factory.open().await?,
        };

        if let Some(offset) = self.pending_inner_offset.take() {
            stream.seek(SeekFrom::Start(offset)).await?;
        }

        self.current = Some(stream);
        self.current_idx = Some(idx);
        Ok(())
    }
}

#[async_trait]
impl SeekableRead for CompositeStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let idx = match self.part_for_offset(self.position) {
            Some(i) => i,
            None => return Ok(0),
        };

        let part_start = self.cumulative.as_ref().unwrap()[idx];
        let inner_offset = self.position - part_start;

        let first_touch = self.current_idx != Some(idx);
        if first_touch {
            self.pending_inner_offset = Some(inner_offset);
        }
        self.ensure_current(idx).await?;

        let stream = self.current.as_mut().unwrap();
        let n = stream.read(buf).await?;
        self.position += n as u64;

        if n == 0 && self.part_for_offset(self.position) == Some(idx) {
            // Sub-stream reported EOF before its declared length — treat
            // as end of this part and advance to the next on the caller's
            // following call rather than looping here.
            return Ok(0);
        }

        Ok(n)
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let target = match pos {
            SeekFrom::Start(off) => off,
            SeekFrom::End(delta) => {
                let len = self
                    .total_length
                    .ok_or_else(|| CoreError::SeekPositionNotFound { offset: 0, length: 0 })?;
                (len as i64 + delta).max(0) as u64
            }
            SeekFrom::Current(delta) => (self.position as i64 + delta).max(0) as u64,
        };

        if let Some(total) = self.total_length {
            if target > total {
                return Err(CoreError::SeekPositionNotFound {
                    offset: target,
                    length: total,
                });
            }
        }

        let idx = self.part_for_offset(target);
        self.position = target;

        if let Some(idx) = idx {
            let part_start = self.cumulative.as_ref().unwrap()[idx];
            let inner_offset = target - part_start;
            if self.current_idx == Some(idx) {
                if let Some(stream) = self.current.as_mut() {
                    if stream.length().is_some() {
                        stream.seek(SeekFrom::Start(inner_offset)).await?;
                        return Ok(self.position);
                    }
                }
            }
            self.pending_inner_offset = Some(inner_offset);
            self.ensure_current(idx).await?;
        }

        Ok(self.position)
    }

    fn length(&self) -> Option<u64> {
        self.total_length
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.current.take() {
            stream.close().await;
        }
        self.cache.close_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct MemStream {
        data: Vec<u8>,
        position: usize,
        closed: Arc<AtomicUsize>,
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
                _ => unreachable!(),
            };
            self.position = target as usize;
            Ok(target)
        }
        fn length(&self) -> Option<u64> {
            Some(self.data.len() as u64)
        }
        async fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn mem(closed: &Arc<AtomicUsize>) -> Box<dyn SeekableRead> {
        Box::new(MemStream {
            data: vec![0; 4],
            position: 0,
            closed: closed.clone(),
        })
    }

    #[tokio::test]
    async fn evicts_oldest_on_capacity_when_not_expired() {
        let closed = Arc::new(AtomicUsize::new(0));
        let mut cache = StreamCache::new(1, Duration::from_secs(60));
        cache.put(0, mem(&closed)).await;
        cache.put(1, mem(&closed)).await; // evicts part 0's entry, still fresh
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(cache.take(0).await.is_none());
        assert!(cache.take(1).await.is_some());
    }

    #[tokio::test]
    async fn evicts_lazily_once_ttl_elapses_even_with_free_capacity() {
        let closed = Arc::new(AtomicUsize::new(0));
        let mut cache = StreamCache::new(4, Duration::from_millis(10));
        cache.put(0, mem(&closed)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Capacity (4) has plenty of room, but the aged entry must still be
        // evicted lazily on the next lookup rather than lingering.
        assert!(cache.take(0).await.is_none());
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }
}
