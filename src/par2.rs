//! PAR2 descriptor scanning (spec §4.8 step 3).
//!
//! Reads only packet headers from a PAR2 volume's segmented stream — never
//! the recovery-slice bodies — and stops as soon as the expected number of
//! `FileDesc` packets has been seen (spec "S5" early-termination scenario).
//! Full PAR2 repair is out of scope; this module exists purely to recover
//! true filenames behind obfuscated NZB subjects.

use std::collections::HashSet;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{CoreError, Result};
use crate::stream::SeekableRead;

/// 8-byte magic at the start of every PAR2 packet.
const PACKET_MAGIC: &[u8; 8] = b"PAR2\0PKT";
/// 16-byte packet-type tag identifying a `FileDesc` packet.
const FILE_DESC_TYPE: &[u8; 16] = b"PAR 2.0\0FileDesc";

/// One recovered `FileDesc` packet: the true filename and the MD5 of the
/// file's first 16 KiB (used to match against obfuscated NZB segments via
/// hash, spec §4.8 step 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDesc {
    /// 16-byte per-file identifier, also the packet's recovery-set member id.
    pub file_id: [u8; 16],
    pub md5_full: [u8; 16],
    pub md5_16k: [u8; 16],
    pub file_length: u64,
    pub filename: String,
}

/// Scan `stream` for PAR2 packet headers, returning up to `expected_count`
/// distinct `FileDesc` packets (by `file_id`), stopping as soon as that
/// many have been found (spec §4.8 step 3 / scenario S5).
///
/// Malformed packet headers are skipped rather than treated as fatal — a
/// corrupted recovery-slice body must not abort filename recovery.
pub async fn scan_file_descs(
    stream: &mut dyn SeekableRead,
    expected_count: usize,
) -> Result<Vec<FileDesc>> {
    let mut found = Vec::new();
    let mut seen_ids: HashSet<[u8; 16]> = HashSet::new();

    if expected_count == 0 {
        return Ok(found);
    }

    let mut cursor: u64 = 0;
    let mut header_buf = [0u8; 64];

    loop {
        if found.len() >= expected_count {
            break;
        }

        let n = read_at_least(stream, &mut header_buf).await?;
        if n < 64 {
            break; // EOF before another full packet header.
        }

        if &header_buf[0..8] != PACKET_MAGIC {
            // Not aligned on a packet boundary (or end of packet series);
            // PAR2 packets are padded to 4-byte multiples and self-describe
            // their length, so a well-formed stream never lands here once
            // correctly advanced — treat as end of scan.
            break;
        }

        let packet_length = LittleEndian::read_u64(&header_buf[8..16]);
        let packet_type = &header_buf[48..64];

        if packet_length < 64 {
            return Err(CoreError::Par2Malformed(format!(
                "packet length {packet_length} smaller than header"
            )));
        }

        if packet_type == FILE_DESC_TYPE {
            let body_len = (packet_length - 64) as usize;
            let mut body = vec![0u8; body_len.min(16 + 16 + 16 + 8)];
            read_exact(stream, &mut body).await?;

            // Body layout: File ID[0..16], MD5-full[16..32], MD5-16k[32..48],
            // length[48..56], name[56..]. The header's bytes [32..48] are the
            // recovery-set id, shared by every packet in the set — not a
            // per-file identifier, so dedup must key off the body's File ID.
            if body.len() >= 56 {
                let file_id: [u8; 16] = body[0..16].try_into().unwrap();
                let md5_full: [u8; 16] = body[16..32].try_into().unwrap();
                let md5_16k: [u8; 16] = body[32..48].try_into().unwrap();
                let file_length = LittleEndian::read_u64(&body[48..56]);
                let name_bytes = &body[56..];
                let filename = decode_par2_string(name_bytes);

                if seen_ids.insert(file_id) {
                    found.push(FileDesc {
                        file_id,
                        md5_full,
                        md5_16k,
                        file_length,
                        filename,
                    });
                }
            }

            let consumed = 64 + body.len() as u64;
            let skip = packet_length.saturating_sub(consumed);
            if skip > 0 {
                skip_bytes(stream, skip).await?;
            }
        } else {
            skip_bytes(stream, packet_length - 64).await?;
        }

        cursor += packet_length;
        let _ = cursor;
    }

    Ok(found)
}

/// PAR2 filenames are stored as raw bytes, usually UTF-8 or Latin-1,
/// null-padded to the packet's 4-byte alignment.
fn decode_par2_string(bytes: &[u8]) -> String {
    let trimmed = bytes
        .iter()
        .position(|&b| b == 0)
        .map(|i| &bytes[..i])
        .unwrap_or(bytes);
    String::from_utf8(trimmed.to_vec())
        .unwrap_or_else(|_| String::from_utf8_lossy(trimmed).into_owned())
}

async fn read_exact(stream: &mut dyn SeekableRead, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(CoreError::Par2Malformed("unexpected EOF reading packet".into()));
        }
        filled += n;
    }
    Ok(())
}

async fn read_at_least(stream: &mut dyn SeekableRead, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn skip_bytes(stream: &mut dyn SeekableRead, mut count: u64) -> Result<()> {
    let mut scratch = [0u8; 4096];
    while count > 0 {
        let want = (count as usize).min(scratch.len());
        let n = stream.read(&mut scratch[..want]).await?;
        if n == 0 {
            break;
        }
        count -= n as u64;
    }
    Ok(())
}

/// Identify which NZB file in `candidates` is most likely the PAR2 volume:
/// the smallest whose declared name ends in `.par2` (case-insensitive), or
/// failing that, the smallest file overall among those ending in `par2`.
/// Real selection also verifies the magic on the first segment; this
/// narrows the search before spending a fetch (spec §4.8 step 3).
pub fn likely_par2_index(names_and_sizes: &[(String, u64)]) -> Option<usize> {
    names_and_sizes
        .iter()
        .enumerate()
        .filter(|(_, (name, _))| name.to_lowercase().ends_with(".par2"))
        .min_by_key(|(_, (_, size))| *size)
        .map(|(idx, _)| idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::SeekFrom;
    use async_trait::async_trait;

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
                _ => unreachable!(),
            };
            self.position = target as usize;
            Ok(target)
        }
        fn length(&self) -> Option<u64> {
            Some(self.data.len() as u64)
        }
        async fn close(&mut self) {}
    }

    fn build_file_desc_packet(
        recovery_set_id: [u8; 16],
        file_id: [u8; 16],
        md5_full: [u8; 16],
        md5_16k: [u8; 16],
        filename: &str,
        file_length: u64,
    ) -> Vec<u8> {
        let mut name_bytes = filename.as_bytes().to_vec();
        while name_bytes.len() % 4 != 0 {
            name_bytes.push(0);
        }

        let body_len = 16 + 16 + 16 + 8 + name_bytes.len();
        let packet_length = 64 + body_len as u64;

        let mut packet = Vec::new();
        packet.extend_from_slice(PACKET_MAGIC);
        let mut len_bytes = [0u8; 8];
        LittleEndian::write_u64(&mut len_bytes, packet_length);
        packet.extend_from_slice(&len_bytes);
        packet.extend_from_slice(&[0u8; 16]); // packet MD5 (unchecked here)
        packet.extend_from_slice(&recovery_set_id); // shared by every packet in the set
        packet.extend_from_slice(FILE_DESC_TYPE);

        packet.extend_from_slice(&file_id);
        packet.extend_from_slice(&md5_full);
        packet.extend_from_slice(&md5_16k);
        let mut len_field = [0u8; 8];
        LittleEndian::write_u64(&mut len_field, file_length);
        packet.extend_from_slice(&len_field);
        packet.extend_from_slice(&name_bytes);

        packet
    }

    #[tokio::test]
    async fn scans_file_desc_packets_and_stops_early() {
        // All three packets share one recovery-set id (as real PAR2 sets
        // do) but carry distinct per-file File IDs and MD5s.
        let recovery_set_id = [0x99; 16];
        let mut data = Vec::new();
        data.extend(build_file_desc_packet(
            recovery_set_id,
            [1; 16],
            [0xAB; 16],
            [0xCD; 16],
            "movie.mkv",
            1_000_000,
        ));
        data.extend(build_file_desc_packet(
            recovery_set_id,
            [2; 16],
            [0xEF; 16],
            [0x12; 16],
            "sample.mkv",
            5_000,
        ));
        data.extend(build_file_desc_packet(
            recovery_set_id,
            [3; 16],
            [0x34; 16],
            [0x56; 16],
            "recovery.r00",
            999,
        ));

        let mut stream = MemStream { data, position: 0 };
        let descs = scan_file_descs(&mut stream, 2).await.unwrap();
        assert_eq!(descs.len(), 2);
        assert_eq!(descs[0].filename, "movie.mkv");
        assert_eq!(descs[0].file_id, [1; 16]);
        assert_eq!(descs[0].md5_16k, [0xCD; 16]);
        assert_eq!(descs[1].filename, "sample.mkv");
        assert_eq!(descs[1].file_id, [2; 16]);
    }

    #[tokio::test]
    async fn dedups_on_file_id_not_recovery_set_id() {
        // Two distinct files sharing one recovery-set id must both survive;
        // only a true duplicate File ID should collapse.
        let recovery_set_id = [0x11; 16];
        let mut data = Vec::new();
        data.extend(build_file_desc_packet(
            recovery_set_id,
            [7; 16],
            [1; 16],
            [2; 16],
            "a.mkv",
            111,
        ));
        data.extend(build_file_desc_packet(
            recovery_set_id,
            [7; 16],
            [1; 16],
            [2; 16],
            "a.mkv",
            111,
        ));
        data.extend(build_file_desc_packet(
            recovery_set_id,
            [8; 16],
            [3; 16],
            [4; 16],
            "b.mkv",
            222,
        ));

        let mut stream = MemStream { data, position: 0 };
        let descs = scan_file_descs(&mut stream, 2).await.unwrap();
        assert_eq!(descs.len(), 2);
        assert_eq!(descs[0].filename, "a.mkv");
        assert_eq!(descs[1].filename, "b.mkv");
    }

    #[test]
    fn picks_smallest_par2_candidate() {
        let candidates = vec![
            ("big.par2".to_string(), 5_000_000_000u64),
            ("index.par2".to_string(), 20_000),
            ("video.mkv".to_string(), 800_000_000),
        ];
        assert_eq!(likely_par2_index(&candidates), Some(1));
    }
}
