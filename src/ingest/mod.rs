//! C8 — NZB ingestion (spec §4.8).

pub mod pipeline;
pub mod processors;

pub use pipeline::{FileInfo, IngestionPipeline};
pub use processors::{DetectedMagic, Processor, ProcessedFile};
