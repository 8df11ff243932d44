//! 7z (`7z\xBC\xAF\x27\x1C`) signature-header parsing (spec §4.8 step 5).
//!
//! 7z's "next header" is frequently itself LZMA-compressed
//! (`kEncodedHeader`), which would require a full decompressor to read —
//! out of scope here. When the header is stored raw (`kHeader`), file names
//! and sizes are recovered directly. When it is encoded, callers fall back
//! to the multipart `.NNN` naming convention instead (spec §4.8 step 5c).

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{CoreError, Result};

pub const SEVENZIP_MAGIC: &[u8; 6] = b"7z\xBC\xAF\x27\x1C";

const PROPERTY_HEADER: u8 = 0x01;
const PROPERTY_ENCODED_HEADER: u8 = 0x17;
const PROPERTY_FILES_INFO: u8 = 0x05;
const PROPERTY_NAME: u8 = 0x11;
const PROPERTY_END: u8 = 0x00;

#[derive(Debug, Clone)]
pub struct SevenZipEntry {
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct SevenZipHeaderInfo {
    pub entries: Vec<SevenZipEntry>,
}

/// Parse a 7z file's 32-byte signature header plus, if stored raw, its
/// `kHeader` structure. `data` must contain at least the signature header
/// and (for the raw case) the full next-header region.
pub fn parse_sevenzip_header(data: &[u8]) -> Result<SevenZipHeaderInfo> {
    if data.len() < 32 || &data[0..6] != SEVENZIP_MAGIC {
        return Err(CoreError::ArchiveMalformed("not a 7z signature".into()));
    }

    let next_header_offset = LittleEndian::read_u64(&data[12..20]);
    let next_header_size = LittleEndian::read_u64(&data[20..28]);

    let start = 32 + next_header_offset as usize;
    let end = start + next_header_size as usize;
    if end > data.len() {
        return Err(CoreError::ArchiveMalformed(
            "next header extends beyond available data".into(),
        ));
    }
    let header = &data[start..end];
    if header.is_empty() {
        return Ok(SevenZipHeaderInfo { entries: Vec::new() });
    }

    match header[0] {
        PROPERTY_ENCODED_HEADER => Err(CoreError::ArchiveMalformed(
            "7z header is LZMA-encoded; falling back to multipart .NNN naming".into(),
        )),
        PROPERTY_HEADER => parse_raw_header(&header[1..]),
        other => Err(CoreError::ArchiveMalformed(format!(
            "unexpected 7z header property id 0x{other:02x}"
        ))),
    }
}

fn parse_raw_header(mut body: &[u8]) -> Result<SevenZipHeaderInfo> {
    // Walk top-level properties until kFilesInfo or kEnd; every other
    // property (kMainStreamsInfo, kAdditionalStreamsInfo, ...) is skipped
    // structurally since only file names are needed here.
    while let Some((&id, rest)) = body.split_first() {
        body = rest;
        match id {
            PROPERTY_END => break,
            PROPERTY_FILES_INFO => return parse_files_info(body),
            _ => {
                // Without fully modelling every property's shape we cannot
                // know its length; bail out rather than mis-skip bytes.
                return Err(CoreError::ArchiveMalformed(format!(
                    "unsupported 7z top-level property 0x{id:02x} before kFilesInfo"
                )));
            }
        }
    }
    Ok(SevenZipHeaderInfo { entries: Vec::new() })
}

fn parse_files_info(body: &[u8]) -> Result<SevenZipHeaderInfo> {
    let (num_files, mut pos) = read_number(body)?;
    let num_files = num_files as usize;
    let mut entries = vec![
        SevenZipEntry {
            name: String::new()
        };
        num_files
    ];

    loop {
        if pos >= body.len() {
            break;
        }
        let prop_type = body[pos];
        pos += 1;
        if prop_type == PROPERTY_END {
            break;
        }
        let (size, n) = read_number(&body[pos..])?;
        pos += n;
        let size = size as usize;
        if pos + size > body.len() {
            return Err(CoreError::ArchiveMalformed("7z property overruns header".into()));
        }
        let prop_data = &body[pos..pos + size];

        if prop_type == PROPERTY_NAME {
            parse_names(prop_data, &mut entries)?;
        }
        pos += size;
    }

    Ok(SevenZipHeaderInfo { entries })
}

fn parse_names(data: &[u8], entries: &mut [SevenZipEntry]) -> Result<()> {
    // First byte is the "external" flag (names stored inline vs. in a
    // separate stream); only inline is handled.
    if data.is_empty() || data[0] != 0 {
        return Err(CoreError::ArchiveMalformed(
            "externally-stored 7z names are unsupported".into(),
        ));
    }
    let utf16_bytes = &data[1..];
    let mut idx = 0;
    let mut current = Vec::new();
    let mut entry_idx = 0;
    while idx + 1 < utf16_bytes.len() && entry_idx < entries.len() {
        let unit = LittleEndian::read_u16(&utf16_bytes[idx..idx + 2]);
        idx += 2;
        if unit == 0 {
            entries[entry_idx].name = String::from_utf16_lossy(&current);
            current.clear();
            entry_idx += 1;
        } else {
            current.push(unit);
        }
    }
    Ok(())
}

/// 7z's variable-length integer: the first byte's leading-zero-bit count
/// says how many extra bytes follow, big-endian-ish per the 7z spec.
fn read_number(data: &[u8]) -> Result<(u64, usize)> {
    if data.is_empty() {
        return Err(CoreError::ArchiveMalformed("truncated 7z number".into()));
    }
    let first = data[0];
    let mut mask = 0x80u8;
    let mut value: u64 = 0;
    for i in 0..8 {
        if first & mask == 0 {
            let high = (first & (mask.wrapping_sub(1))) as u64;
            if 1 + i > data.len() {
                return Err(CoreError::ArchiveMalformed("truncated 7z number".into()));
            }
            for (j, &b) in data[1..1 + i].iter().enumerate() {
                value |= (b as u64) << (8 * j);
            }
            value |= high << (8 * i);
            return Ok((value, 1 + i));
        }
        mask >>= 1;
    }
    if data.len() < 9 {
        return Err(CoreError::ArchiveMalformed("truncated 7z number".into()));
    }
    let value = LittleEndian::read_u64(&data[1..9]);
    Ok((value, 9))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_7z_data() {
        let data = vec![0u8; 64];
        assert!(parse_sevenzip_header(&data).is_err());
    }

    #[test]
    fn small_number_round_trip() {
        let (value, n) = read_number(&[0x05]).unwrap();
        assert_eq!(value, 5);
        assert_eq!(n, 1);
    }
}
