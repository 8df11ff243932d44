// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

use thiserror::Error;

/// Top-level error taxonomy, one variant per category in the error-handling
/// design: low-level I/O is recovered inside the fetcher, logical invariants
/// surface here.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("article not found: {message_id} (denied by all providers)")]
    ArticleNotFound { message_id: String },

    #[error("article malformed: {0}")]
    ArticleMalformed(String),

    #[error("yEnc CRC mismatch for {message_id}: expected {expected:08x}, got {actual:08x}")]
    CrcMismatch {
        message_id: String,
        expected: u32,
        actual: u32,
    },

    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("connection fault: {0}")]
    ConnectionFault(String),

    #[error("critical ingest failure: {reason} ({detail})")]
    CriticalIngestFailure { reason: String, detail: String },

    #[error("seek position {offset} beyond logical length {length}")]
    SeekPositionNotFound { offset: u64, length: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("item not found: {0}")]
    ItemNotFound(String),

    #[error("path already exists: {0}")]
    PathConflict(String),

    #[error("NZB parse error: {0}")]
    NzbMalformed(String),

    #[error("PAR2 parse error: {0}")]
    Par2Malformed(String),

    #[error("archive header error: {0}")]
    ArchiveMalformed(String),

    #[error("pool exhausted for provider '{provider}'")]
    PoolExhausted { provider: String },

    #[error("store error: {0}")]
    Store(String),

    #[error("item is not a readable file: {0}")]
    NotAFile(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Whether this error should be treated as transient (worth retrying on
    /// the next provider/attempt) versus terminal.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::Timeout(_)
                | CoreError::ConnectionFault(_)
                | CoreError::CrcMismatch { .. }
                | CoreError::ArticleMalformed(_)
        )
    }
}
