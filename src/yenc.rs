//! C2 — yEnc article decoder (spec §4.2, §6).
//!
//! Parses the `=ybegin`/`=ypart`/`=yend` header lines surrounding a yEnc
//! payload, de-escapes and unshifts the encoded bytes, and verifies the
//! declared CRC-32 when present. Operates on an already dot-unstuffed NNTP
//! article body (dot-unstuffing is the transport's job, see `nntp::client`).

use crate::error::CoreError;

const ESCAPE: u8 = b'=';
const SHIFT: u8 = 42;
const ESCAPE_SHIFT: u8 = 64;

/// Parsed `=ybegin`/`=ypart`/`=yend` header fields for one article.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YencHeader {
    pub filename: String,
    pub filesize: u64,
    pub part_number: Option<u32>,
    pub total_parts: Option<u32>,
    /// Size of this part's decoded payload, from `=ypart`/`=yend` `size=`.
    pub part_size: Option<u64>,
    /// Zero-based byte offset of this part within the logical file
    /// (`begin - 1`; yEnc part bounds are 1-indexed).
    pub part_offset: Option<u64>,
}

/// The result of a full article decode.
#[derive(Debug, Clone)]
pub struct YencDecoded {
    pub header: YencHeader,
    pub data: Vec<u8>,
    pub crc32_declared: Option<u32>,
    pub crc32_computed: u32,
}

/// Decode one complete article body (everything between the dot-terminated
/// NNTP `BODY` response lines) into raw bytes.
///
/// Fails with [`CoreError::ArticleMalformed`] if the `=ybegin`/`=yend`
/// markers are missing, and [`CoreError::CrcMismatch`] if a declared CRC-32
/// does not match the decoded bytes.
pub fn decode_article(body: &[u8], message_id: &str) -> Result<YencDecoded, CoreError> {
    let text_lines = split_lines(body);

    let begin_idx = text_lines
        .iter()
        .position(|l| l.starts_with(b"=ybegin"))
        .ok_or_else(|| CoreError::ArticleMalformed("missing =ybegin marker".into()))?;

    let mut header = parse_tag_line(&text_lines[begin_idx], "filename")
        .ok_or_else(|| CoreError::ArticleMalformed("malformed =ybegin line".into()))?;

    let mut data_start = begin_idx + 1;
    if let Some(part_line) = text_lines.get(begin_idx + 1) {
        if part_line.starts_with(b"=ypart") {
            apply_ypart(&mut header, part_line);
            data_start += 1;
        }
    }

    let end_idx = text_lines[data_start..]
        .iter()
        .position(|l| l.starts_with(b"=yend"))
        .map(|i| i + data_start)
        .ok_or_else(|| CoreError::ArticleMalformed("missing =yend marker".into()))?;

    let mut data = Vec::with_capacity(header.part_size.unwrap_or(header.filesize) as usize);
    for line in &text_lines[data_start..end_idx] {
        decode_line(line, &mut data);
    }

    apply_yend(&mut header, &text_lines[end_idx]);

    let crc32_declared = extract_crc(&text_lines[end_idx]);
    let crc32_computed = crc32fast::hash(&data);

    if let Some(declared) = crc32_declared {
        if declared != crc32_computed {
            return Err(CoreError::CrcMismatch {
                message_id: message_id.to_string(),
                expected: declared,
                actual: crc32_computed,
            });
        }
    }

    Ok(YencDecoded {
        header,
        data,
        crc32_declared,
        crc32_computed,
    })
}

/// Decode as many full data lines as are present in a truncated body,
/// without requiring the `=yend` trailer (spec §4.8 step 2: "fetch up to
/// the first 16 KiB of segment 0"). No CRC check is possible since the
/// trailer with the declared checksum was likely never reached.
pub fn decode_prefix(partial: &[u8]) -> Option<(YencHeader, Vec<u8>)> {
    let lines = split_lines(partial);
    let begin_idx = lines.iter().position(|l| l.starts_with(b"=ybegin"))?;
    let mut header = parse_tag_line(&lines[begin_idx], "filename")?;

    let mut data_start = begin_idx + 1;
    if let Some(part_line) = lines.get(begin_idx + 1) {
        if part_line.starts_with(b"=ypart") {
            apply_ypart(&mut header, part_line);
            data_start += 1;
        }
    }

    let end_idx = lines[data_start..]
        .iter()
        .position(|l| l.starts_with(b"=yend"))
        .map(|i| i + data_start)
        .unwrap_or(lines.len());

    let mut data = Vec::new();
    for line in &lines[data_start..end_idx] {
        decode_line(line, &mut data);
    }
    Some((header, data))
}

/// Decode just the header portion of a partial body (spec §4.4 "fast
/// analyse" reads only the first ~256 bytes of each article). Returns
/// `None` if no `=ybegin`/`=ypart` line is present yet in `partial`.
pub fn parse_header_only(partial: &[u8]) -> Option<YencHeader> {
    let lines = split_lines(partial);
    let begin_idx = lines.iter().position(|l| l.starts_with(b"=ybegin"))?;
    let mut header = parse_tag_line(&lines[begin_idx], "filename")?;
    if let Some(part_line) = lines.get(begin_idx + 1) {
        if part_line.starts_with(b"=ypart") {
            apply_ypart(&mut header, part_line);
        }
    }
    Some(header)
}

fn split_lines(body: &[u8]) -> Vec<&[u8]> {
    body.split(|&b| b == b'\n')
        .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
        .collect()
}

/// Decode one data line in place, appending decoded bytes to `out`.
fn decode_line(line: &[u8], out: &mut Vec<u8>) {
    let mut iter = line.iter().copied();
    while let Some(b) = iter.next() {
        if b == ESCAPE {
            if let Some(next) = iter.next() {
                out.push(next.wrapping_sub(ESCAPE_SHIFT).wrapping_sub(SHIFT));
            }
        } else {
            out.push(b.wrapping_sub(SHIFT));
        }
    }
}

fn parse_tag_line(line: &[u8], name_key: &str) -> Option<YencHeader> {
    let text = std::str::from_utf8(line).ok()?;
    let filesize = parse_u64_field(text, "size=")?;
    let part_number = parse_u32_field(text, "part=");
    let total_parts = parse_u32_field(text, "total=");
    let filename = parse_string_field(text, name_key)?;
    Some(YencHeader {
        filename,
        filesize,
        part_number,
        total_parts,
        part_size: None,
        part_offset: None,
    })
}

fn apply_ypart(header: &mut YencHeader, line: &[u8]) {
    let Ok(text) = std::str::from_utf8(line) else {
        return;
    };
    let begin = parse_u64_field(text, "begin=");
    let end = parse_u64_field(text, "end=");
    if let (Some(begin), Some(end)) = (begin, end) {
        header.part_offset = Some(begin.saturating_sub(1));
        header.part_size = Some(end - begin + 1);
    }
}

fn apply_yend(header: &mut YencHeader, line: &[u8]) {
    let Ok(text) = std::str::from_utf8(line) else {
        return;
    };
    if let Some(size) = parse_u64_field(text, "size=") {
        header.part_size.get_or_insert(size);
    }
}

fn extract_crc(yend_line: &[u8]) -> Option<u32> {
    let text = std::str::from_utf8(yend_line).ok()?;
    parse_hex_field(text, "pcrc32=").or_else(|| parse_hex_field(text, "crc32="))
}

fn field_value<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    let idx = text.find(key)?;
    let rest = &text[idx + key.len()..];
    Some(rest.split(' ').next().unwrap_or(rest))
}

fn parse_u64_field(text: &str, key: &str) -> Option<u64> {
    field_value(text, key)?.trim().parse().ok()
}

fn parse_u32_field(text: &str, key: &str) -> Option<u32> {
    field_value(text, key)?.trim().parse().ok()
}

fn parse_hex_field(text: &str, key: &str) -> Option<u32> {
    u32::from_str_radix(field_value(text, key)?.trim(), 16).ok()
}

fn parse_string_field(text: &str, key: &str) -> Option<String> {
    // `name=` must be matched last on the line (filenames can contain `=`).
    let idx = text.find(key)?;
    Some(text[idx + key.len()..].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(raw: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for &b in raw {
            let enc = b.wrapping_add(SHIFT);
            match enc {
                0x00 | 0x0A | 0x0D | ESCAPE => {
                    out.push(ESCAPE);
                    out.push(enc.wrapping_add(ESCAPE_SHIFT));
                }
                _ => out.push(enc),
            }
        }
        out
    }

    #[test]
    fn decodes_single_part_article() {
        let raw = b"hello yenc world".to_vec();
        let encoded_line = encode(&raw);
        let crc = crc32fast::hash(&raw);

        let mut body = Vec::new();
        body.extend_from_slice(b"=ybegin line=128 size=17 name=test.bin\r\n");
        body.extend_from_slice(&encoded_line);
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(format!("=yend size=17 crc32={crc:08x}\r\n").as_bytes());

        let decoded = decode_article(&body, "<msg1>").unwrap();
        assert_eq!(decoded.data, raw);
        assert_eq!(decoded.header.filename, "test.bin");
        assert_eq!(decoded.header.filesize, 17);
        assert_eq!(decoded.crc32_declared, Some(crc));
    }

    #[test]
    fn multipart_header_offsets() {
        let raw = b"partbytes".to_vec();
        let encoded_line = encode(&raw);
        let mut body = Vec::new();
        body.extend_from_slice(b"=ybegin part=2 total=3 line=128 size=3000 name=big.bin\r\n");
        body.extend_from_slice(b"=ypart begin=1001 end=1009\r\n");
        body.extend_from_slice(&encoded_line);
        body.extend_from_slice(b"\r\n=yend size=9\r\n");

        let decoded = decode_article(&body, "<msg2>").unwrap();
        assert_eq!(decoded.header.part_offset, Some(1000));
        assert_eq!(decoded.header.part_size, Some(9));
        assert_eq!(decoded.header.part_number, Some(2));
        assert_eq!(decoded.header.total_parts, Some(3));
        assert_eq!(decoded.data, raw);
    }

    #[test]
    fn crc_mismatch_is_rejected() {
        let raw = b"data".to_vec();
        let encoded_line = encode(&raw);
        let mut body = Vec::new();
        body.extend_from_slice(b"=ybegin line=128 size=4 name=x.bin\r\n");
        body.extend_from_slice(&encoded_line);
        body.extend_from_slice(b"\r\n=yend size=4 crc32=deadbeef\r\n");

        let err = decode_article(&body, "<msg3>").unwrap_err();
        assert!(matches!(err, CoreError::CrcMismatch { .. }));
    }

    #[test]
    fn missing_markers_is_malformed() {
        let body = b"not yenc at all".to_vec();
        let err = decode_article(&body, "<msg4>").unwrap_err();
        assert!(matches!(err, CoreError::ArticleMalformed(_)));
    }

    #[test]
    fn escaped_bytes_round_trip() {
        let raw: Vec<u8> = (0..=255u8).collect();
        let encoded_line = encode(&raw);
        let crc = crc32fast::hash(&raw);
        let mut body = Vec::new();
        body.extend_from_slice(b"=ybegin line=128 size=256 name=all.bin\r\n");
        body.extend_from_slice(&encoded_line);
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(format!("=yend size=256 crc32={crc:08x}\r\n").as_bytes());

        let decoded = decode_article(&body, "<msg5>").unwrap();
        assert_eq!(decoded.data, raw);
    }

    #[test]
    fn decode_prefix_decodes_available_lines_without_yend() {
        let raw = b"truncated but decodable".to_vec();
        let encoded_line = encode(&raw);
        let mut body = Vec::new();
        body.extend_from_slice(b"=ybegin line=128 size=9999999 name=movie.mkv\r\n");
        body.extend_from_slice(&encoded_line);
        // No =yend: the fetch was deliberately cut short.

        let (header, data) = decode_prefix(&body).unwrap();
        assert_eq!(header.filename, "movie.mkv");
        assert_eq!(data, raw);
    }

    #[test]
    fn parse_header_only_reads_partial_body() {
        let mut body = Vec::new();
        body.extend_from_slice(b"=ybegin part=1 total=5 line=128 size=5000000 name=movie.mkv\r\n");
        body.extend_from_slice(b"=ypart begin=1 end=700000\r\n");
        body.extend_from_slice(b"garbage-not-decoded-in-this-path");

        let header = parse_header_only(&body).unwrap();
        assert_eq!(header.filename, "movie.mkv");
        assert_eq!(header.filesize, 5_000_000);
        assert_eq!(header.part_offset, Some(0));
        assert_eq!(header.part_size, Some(700_000));
    }
}
