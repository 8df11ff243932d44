//! Per-file-type processors (spec §4.8 step 5, §9 "tagged variant +
//! polymorphic `process`").
//!
//! `Processor` is a tagged variant dispatched statically rather than via an
//! inheritance hierarchy, per the spec's explicit redesign flag: the
//! source's interface-via-inheritance processor classes become one enum
//! and one `process` function per variant.

use std::ops::Range;

use crate::archive::{self, rar, sevenzip, CompressionMethod, RarFormat};
use crate::error::{CoreError, Result};
use crate::vfs::{AesParams, FilePart};

use super::pipeline::FileInfo;

/// Which family of logical-file reconstruction this NZB file needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processor {
    Video,
    Rar,
    SevenZip,
    Par2,
}

impl Processor {
    /// Classify a file from its recovered/declared name and detected magic
    /// offset (spec §4.8 step 4/5).
    pub fn classify(name: &str, magic: Option<DetectedMagic>) -> Processor {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".par2") {
            return Processor::Par2;
        }
        match magic {
            Some(DetectedMagic::Rar4) | Some(DetectedMagic::Rar5) => Processor::Rar,
            Some(DetectedMagic::SevenZip) => Processor::SevenZip,
            None => {
                if is_multipart_numeric_extension(&lower) {
                    Processor::SevenZip // spec §4.8 step 5: "7z / multipart .NNN ... analogous"
                } else {
                    Processor::Video
                }
            }
        }
    }

    /// Dispatch to the per-type reconstruction (spec §9 "polymorphic
    /// `process(context) → Result`, dispatch statically").
    pub fn process(self, ctx: &ProcessContext) -> Result<ProcessedFile> {
        match self {
            Processor::Video => process_video(ctx),
            Processor::Rar => process_rar(ctx),
            Processor::SevenZip => process_sevenzip(ctx),
            Processor::Par2 => Ok(ProcessedFile::Skip),
        }
    }
}

fn is_multipart_numeric_extension(lower_name: &str) -> bool {
    lower_name
        .rsplit('.')
        .next()
        .map(|ext| ext.len() == 3 && ext.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectedMagic {
    Rar4,
    Rar5,
    SevenZip,
}

/// Detect a known container magic at the start of a file's decoded first
/// bytes. `None` means "treat as raw video/audio" (spec §4.8 step 4).
pub fn detect_magic(first_bytes: &[u8]) -> Option<DetectedMagic> {
    if first_bytes.len() >= rar::RAR5_MAGIC.len() && first_bytes[..rar::RAR5_MAGIC.len()] == *rar::RAR5_MAGIC {
        Some(DetectedMagic::Rar5)
    } else if first_bytes.len() >= rar::RAR4_MAGIC.len() && first_bytes[..rar::RAR4_MAGIC.len()] == *rar::RAR4_MAGIC
    {
        Some(DetectedMagic::Rar4)
    } else if first_bytes.len() >= sevenzip::SEVENZIP_MAGIC.len()
        && first_bytes[..sevenzip::SEVENZIP_MAGIC.len()] == *sevenzip::SEVENZIP_MAGIC
    {
        Some(DetectedMagic::SevenZip)
    } else {
        None
    }
}

/// Everything a processor needs about one logical NZB file, plus the
/// decoded bytes of its header region (already fetched during step 2/3 of
/// the pipeline — processors never issue their own network fetches for
/// header bytes they can get from what was already pulled).
pub struct ProcessContext<'a> {
    pub file: &'a FileInfo,
    /// Decoded header bytes of the first segment (enough to cover any
    /// archive's fixed-size header region; RAR/7z headers are small).
    pub first_segment_prefix: &'a [u8],
}

/// One reconstructed logical file, ready for the aggregator to turn into
/// a `vfs::Item`.
pub enum ProcessedFile {
    /// A single-stream file whose bytes are exactly its NzbFile's segments.
    Whole {
        name: String,
        segment_ids: Vec<String>,
        segment_sizes: Vec<u64>,
    },
    /// One or more stored files recovered from a multi-volume archive,
    /// each spanning one or more `FileParts`.
    Multipart(Vec<MultipartOutput>),
    /// PAR2 recovery volumes carry no logical files.
    Skip,
}

pub struct MultipartOutput {
    pub name: String,
    pub parts: Vec<FilePart>,
    pub aes_params: Option<AesParams>,
    pub obfuscation_key: Option<[u8; 4]>,
}

fn process_video(ctx: &ProcessContext) -> Result<ProcessedFile> {
    Ok(ProcessedFile::Whole {
        name: ctx.file.recovered_name().to_string(),
        segment_ids: ctx.file.segment_ids.clone(),
        segment_sizes: ctx.file.segment_sizes.clone(),
    })
}

fn process_rar(ctx: &ProcessContext) -> Result<ProcessedFile> {
    let header = archive::parse_rar_headers(ctx.first_segment_prefix)?;
    let mut outputs = Vec::new();

    for entry in &header.entries {
        if !matches!(entry.method, CompressionMethod::Store) {
            // Compressed stored-data cannot be served byte-range-accurate
            // without decompression; spec non-goal. Skip, log at the
            // aggregator level.
            continue;
        }

        let obfuscation_key = detect_entry_obfuscation(ctx.first_segment_prefix, &entry.byte_range);

        let part = FilePart {
            nzb_segment_ids: ctx.file.segment_ids.clone(),
            nzb_segment_sizes: ctx.file.segment_sizes.clone(),
            byte_range_within_part: entry.byte_range.clone(),
            part_size: entry.byte_range.end - entry.byte_range.start,
        };

        outputs.push(MultipartOutput {
            name: entry.name.clone(),
            parts: vec![part],
            aes_params: None,
            obfuscation_key,
        });
    }

    if outputs.is_empty() {
        return Err(CoreError::ArchiveMalformed(format!(
            "RAR volume {} ({:?}) yielded no stored-method entries",
            ctx.file.recovered_name(),
            header.format
        )));
    }

    Ok(ProcessedFile::Multipart(outputs))
}

fn detect_entry_obfuscation(prefix: &[u8], byte_range: &Range<u64>) -> Option<[u8; 4]> {
    let start = byte_range.start as usize;
    if start + 4 > prefix.len() {
        return None;
    }
    rar::detect_obfuscation(&prefix[start..start + 4])
}

fn process_sevenzip(ctx: &ProcessContext) -> Result<ProcessedFile> {
    match sevenzip::parse_sevenzip_header(ctx.first_segment_prefix) {
        Ok(header) if !header.entries.is_empty() => {
            let outputs = header
                .entries
                .iter()
                .map(|entry| MultipartOutput {
                    name: entry.name.clone(),
                    parts: vec![FilePart {
                        nzb_segment_ids: ctx.file.segment_ids.clone(),
                        nzb_segment_sizes: ctx.file.segment_sizes.clone(),
                        byte_range_within_part: 0..ctx.file.total_size(),
                        part_size: ctx.file.total_size(),
                    }],
                    aes_params: None,
                    obfuscation_key: None,
                })
                .collect();
            Ok(ProcessedFile::Multipart(outputs))
        }
        _ => {
            // Either the header is LZMA-encoded, or this is really a
            // `.NNN` multipart file rather than a true 7z archive — both
            // fall back to treating the whole NzbFile as one opaque span
            // named after its recovered filename (spec §4.8 step 5c).
            Ok(ProcessedFile::Whole {
                name: ctx.file.recovered_name().to_string(),
                segment_ids: ctx.file.segment_ids.clone(),
                segment_sizes: ctx.file.segment_sizes.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_par2_by_extension() {
        assert_eq!(Processor::classify("file.PAR2", None), Processor::Par2);
    }

    #[test]
    fn classifies_numeric_extension_as_multipart() {
        assert_eq!(Processor::classify("movie.part1.001", None), Processor::SevenZip);
    }

    #[test]
    fn classifies_unknown_as_video() {
        assert_eq!(Processor::classify("movie.mkv", None), Processor::Video);
    }

    #[test]
    fn detect_magic_recognises_rar5() {
        let mut bytes = rar::RAR5_MAGIC.to_vec();
        bytes.extend_from_slice(&[0u8; 16]);
        assert_eq!(detect_magic(&bytes), Some(DetectedMagic::Rar5));
    }
}
