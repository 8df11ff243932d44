//! Stream composition (spec §4.5–§4.7, §9 "Stream composition").
//!
//! Every layer — the segmented stream over raw articles, the composite
//! stream concatenating logical files, and the AES/RAR-XOR/length-limit
//! decoding wrappers — implements the same [`SeekableRead`] capability.
//! Wrapping replaces the class hierarchies the source used.

pub mod composite;
pub mod segmented;
pub mod wrappers;

pub use composite::CompositeStream;
pub use segmented::SegmentedStream;
pub use wrappers::{AesCtrStream, LengthLimitStream, RarXorStream};

use async_trait::async_trait;

use crate::error::Result;

/// Origin for [`SeekableRead::seek`], mirroring `io::SeekFrom` without
/// pulling in the synchronous `Read`/`Seek` traits this capability replaces.
#[derive(Debug, Clone, Copy)]
pub enum SeekFrom {
    Start(u64),
    End(i64),
    Current(i64),
}

/// The single capability every stream layer implements: read, seek,
/// length, close (spec §9). Wrappers compose by holding an inner
/// `Box<dyn SeekableRead>` and transforming offsets/bytes around it.
#[async_trait]
pub trait SeekableRead: Send {
    /// Copy up to `buf.len()` bytes starting at the current position into
    /// `buf`. Returns the number of bytes written; `0` means EOF.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Reposition the stream; returns the new absolute position.
    async fn seek(&mut self, pos: SeekFrom) -> Result<u64>;

    /// Total stream length, if known up front. `None` means the length is
    /// discovered lazily (e.g. segment sizes not yet analysed) — such a
    /// stream is not randomly seekable past what has been read so far.
    fn length(&self) -> Option<u64>;

    /// Release any held resources (in-flight fetches, connection leases)
    /// before the stream is dropped. Dropping without calling `close` must
    /// still release resources — this is for callers that want that to
    /// happen deterministically rather than on drop.
    async fn close(&mut self);
}
