//! C8 — NZB ingestion pipeline (spec §4.8).
//!
//! Orchestrates the full submit-to-browsable-tree path: parse the NZB,
//! probe every file's first segment, recover true filenames from PAR2
//! `FileDesc` packets when present, classify and reconstruct each logical
//! file via [`super::processors::Processor`], then persist the result as a
//! batch of [`crate::vfs::Item`]s under `content/{category}/{job}/`.

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::events::{Event, EventBus};
use crate::fetch::FetchEngine;
use crate::nzb::{self, NzbFile};
use crate::par2::{self, FileDesc};
use crate::pool::Pool;
use crate::provider::{OperationContext, UsageType};
use crate::queue::{HistoryRecord, HistoryStatus};
use crate::vfs::item::{root_item, ROOT_ITEM_ID};
use crate::vfs::{BlobStore, FilePart, Item, ItemBacking, ItemId, ItemType, MetadataStore, MultipartBacking, NzbFileBacking};

use super::processors::{detect_magic, DetectedMagic, MultipartOutput, ProcessContext, ProcessedFile, Processor};

/// How many leading bytes of a file's decoded content are probed during
/// step 2, enough to cover RAR/7z fixed header regions and an MD5-16k match
/// against a PAR2 `FileDesc` (spec §4.8 steps 2 and 4).
const FIRST_SEGMENT_PROBE_BYTES: usize = 16 * 1024;
/// Bound on concurrent first-segment probes per ingest (spec §4.8 step 2).
const FIRST_SEGMENT_CONCURRENCY: usize = 8;

/// Known-good extensions used to recognise a file as a release's main
/// content even when PAR2 recovery never runs (spec §4.8 step 5 / SPEC_FULL
/// Open Question: "critical file" determination).
const CRITICAL_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "avi", "mov", "ts", "m2ts", "wmv", "mp3", "flac", "aac", "wav", "rar", "7z", "par2",
];

/// Per-file probe result from step 2: a decoded prefix and whatever the
/// yEnc header itself reveals about the real filename.
struct FirstSegmentProbe {
    header_filename: Option<String>,
    prefix: Vec<u8>,
}

/// Everything downstream processors need about one logical NZB file (spec
/// §4.8 step 4's "FileInfo" working record).
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub nzb_file_index: usize,
    pub declared_name: String,
    pub recovered_name: Option<String>,
    pub segment_ids: Vec<String>,
    pub segment_sizes: Vec<u64>,
    pub magic: Option<DetectedMagic>,
    pub is_critical: bool,
}

impl FileInfo {
    /// The best available name: PAR2-recovered, else whatever the yEnc
    /// header or NZB subject declared.
    pub fn recovered_name(&self) -> &str {
        self.recovered_name.as_deref().unwrap_or(&self.declared_name)
    }

    pub fn total_size(&self) -> u64 {
        self.segment_sizes.iter().sum()
    }
}

/// Drives one NZB submission from raw XML to inserted `vfs::Item`s.
pub struct IngestionPipeline<M: MetadataStore, B: BlobStore> {
    engine: Arc<FetchEngine>,
    pools: Vec<Pool>,
    metadata: Arc<M>,
    blobs: Arc<B>,
    events: EventBus,
    config: Arc<Config>,
}

impl<M: MetadataStore, B: BlobStore> IngestionPipeline<M, B> {
    pub fn new(
        engine: Arc<FetchEngine>,
        pools: Vec<Pool>,
        metadata: Arc<M>,
        blobs: Arc<B>,
        events: EventBus,
        config: Arc<Config>,
    ) -> Self {
        IngestionPipeline {
            engine,
            pools,
            metadata,
            blobs,
            events,
            config,
        }
    }

    /// Run the full pipeline for one NZB submission (spec §4.8 steps 1-6).
    /// Returns the ids of every top-level item created under the job's
    /// directory. A critical-file failure is recorded to history as
    /// `Failed` and returned as `Err(CoreError::CriticalIngestFailure)`
    /// rather than leaving a partially-built tree behind.
    pub async fn ingest(&self, nzb_xml: &[u8], job_name: &str, category: &str, now: i64) -> Result<Vec<ItemId>> {
        let (nzb_files, _meta) = nzb::parse_nzb(nzb_xml)?;
        if nzb_files.is_empty() {
            return Err(CoreError::NzbMalformed("NZB contains no <file> entries".into()));
        }

        let root_cancel = CancellationToken::new();
        let ctx = OperationContext::new(UsageType::Queue)
            .with_job_name(job_name.to_string())
            .with_affinity_key(job_name.to_string());
        let ctx = OperationContext { cancel: root_cancel.clone(), ..ctx };

        self.events.publish(Event::QueueItemStatus {
            job_name: job_name.to_string(),
            status: "probing".into(),
        });

        match self.run(&nzb_files, job_name, category, &ctx, now).await {
            Ok(ids) => {
                self.metadata
                    .insert_history_item(HistoryRecord {
                        id: Uuid::new_v4(),
                        job_name: job_name.to_string(),
                        category: category.to_string(),
                        status: HistoryStatus::Completed,
                        finished_at: now,
                    })
                    .await?;
                self.events.publish(Event::HistoryItemAdded { job_name: job_name.to_string() });
                Ok(ids)
            }
            Err(e) => {
                root_cancel.cancel();
                let (reason, detail) = describe_failure(&e);
                self.metadata
                    .insert_history_item(HistoryRecord {
                        id: Uuid::new_v4(),
                        job_name: job_name.to_string(),
                        category: category.to_string(),
                        status: HistoryStatus::Failed { reason, detail },
                        finished_at: now,
                    })
                    .await?;
                self.events.publish(Event::HistoryItemAdded { job_name: job_name.to_string() });
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        nzb_files: &[NzbFile],
        job_name: &str,
        category: &str,
        ctx: &OperationContext,
        now: i64,
    ) -> Result<Vec<ItemId>> {
        let probes = self.probe_first_segments(nzb_files, ctx).await?;

        let par2_descs = self.scan_par2_descriptors(nzb_files, ctx).await?;

        let file_infos = self.build_file_infos(nzb_files, &probes, &par2_descs);

        let processed = self.process_files(&file_infos, &probes)?;

        self.aggregate(job_name, category, processed, now).await
    }

    /// Step 2: fetch and yEnc-decode up to [`FIRST_SEGMENT_PROBE_BYTES`] of
    /// each file's first segment, bounded by [`FIRST_SEGMENT_CONCURRENCY`].
    /// A file considered critical (spec §4.8 step 2 edge case) that cannot
    /// be probed on any provider aborts the whole job.
    async fn probe_first_segments(
        &self,
        nzb_files: &[NzbFile],
        ctx: &OperationContext,
    ) -> Result<Vec<Option<FirstSegmentProbe>>> {
        let critical = nzb_files
            .iter()
            .map(|f| is_critical_name(&f.subject))
            .collect::<Vec<_>>();
        let largest_idx = nzb_files
            .iter()
            .enumerate()
            .max_by_key(|(_, f)| f.total_declared_bytes())
            .map(|(i, _)| i);

        let mut results: Vec<Option<FirstSegmentProbe>> = (0..nzb_files.len()).map(|_| None).collect();
        let mut futures = FuturesUnordered::new();
        let mut next = 0usize;

        let launch = |idx: usize| {
            let segments = nzb_files[idx].segments_in_order();
            let first = segments.first().map(|s| s.message_id.clone());
            let child_ctx = ctx.child();
            async move {
                let probe = match first {
                    Some(message_id) => self.probe_one(&message_id, &child_ctx).await,
                    None => None,
                };
                (idx, probe)
            }
        };

        while next < nzb_files.len() && futures.len() < FIRST_SEGMENT_CONCURRENCY {
            futures.push(launch(next));
            next += 1;
        }

        while let Some((idx, probe)) = futures.next().await {
            if probe.is_none() {
                let is_critical = critical[idx] || largest_idx == Some(idx);
                if is_critical {
                    return Err(CoreError::CriticalIngestFailure {
                        reason: "first-segment probe failed".into(),
                        detail: format!("file {idx} ({}) unreachable on every provider", nzb_files[idx].subject),
                    });
                }
                warn!(file_index = idx, "first-segment probe failed on a non-critical file, skipping");
            }
            results[idx] = probe;
            if next < nzb_files.len() {
                futures.push(launch(next));
                next += 1;
            }
        }

        Ok(results)
    }

    async fn probe_one(&self, message_id: &str, ctx: &OperationContext) -> Option<FirstSegmentProbe> {
        for pool in &self.pools {
            let mut lease = match pool.acquire(ctx, self.config.timeouts.segment_fetch).await {
                Ok(l) => l,
                Err(_) => continue,
            };
            let body = match lease.body_prefix(message_id, FIRST_SEGMENT_PROBE_BYTES).await {
                Ok(b) => b,
                Err(_) => continue,
            };
            if let Some((header, data)) = crate::yenc::decode_prefix(&body) {
                return Some(FirstSegmentProbe {
                    header_filename: if header.filename.is_empty() { None } else { Some(header.filename) },
                    prefix: data,
                });
            }
        }
        None
    }

    /// Step 3: locate the PAR2 volume (if any) and scan its `FileDesc`
    /// packets, expecting one per other file in the release.
    async fn scan_par2_descriptors(
        &self,
        nzb_files: &[NzbFile],
        ctx: &OperationContext,
    ) -> Result<Vec<FileDesc>> {
        let candidates: Vec<(String, u64)> = nzb_files
            .iter()
            .map(|f| (f.subject.clone(), f.total_declared_bytes()))
            .collect();
        let Some(par2_idx) = par2::likely_par2_index(&candidates) else {
            return Ok(Vec::new());
        };

        let segments = nzb_files[par2_idx].segments_in_order();
        let message_ids: Vec<String> = segments.iter().map(|s| s.message_id.clone()).collect();
        let segment_sizes: Vec<u64> = segments.iter().map(|s| s.declared_bytes).collect();
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut stream = crate::stream::segmented::SegmentedStream::new(
            message_ids,
            segment_sizes,
            Arc::clone(&self.engine),
            OperationContext { usage: UsageType::Analysis, ..ctx.child() },
            false,
            self.config.limits.connections_per_stream,
            self.config.limits.stream_buffer_size,
        );

        let expected_count = nzb_files.len().saturating_sub(1);
        let scan = tokio::time::timeout(
            self.config.timeouts.par2_scan,
            par2::scan_file_descs(&mut stream, expected_count),
        )
        .await;

        match scan {
            Ok(Ok(descs)) => Ok(descs),
            Ok(Err(e)) => {
                warn!(error = %e, "PAR2 descriptor scan failed, proceeding without filename recovery");
                Ok(Vec::new())
            }
            Err(_) => {
                Err(CoreError::CriticalIngestFailure {
                    reason: "PAR2 scan timed out".into(),
                    detail: format!("no FileDesc packets recovered within {:?}", self.config.timeouts.par2_scan),
                })
            }
        }
    }

    /// Step 4: combine probes, PAR2 descriptors, and NZB metadata into one
    /// `FileInfo` per non-PAR2 file.
    fn build_file_infos(
        &self,
        nzb_files: &[NzbFile],
        probes: &[Option<FirstSegmentProbe>],
        par2_descs: &[FileDesc],
    ) -> Vec<FileInfo> {
        let candidates: Vec<(String, u64)> = nzb_files
            .iter()
            .map(|f| (f.subject.clone(), f.total_declared_bytes()))
            .collect();
        let par2_idx = par2::likely_par2_index(&candidates);

        let mut infos = Vec::with_capacity(nzb_files.len());
        for (idx, file) in nzb_files.iter().enumerate() {
            if Some(idx) == par2_idx {
                continue;
            }

            let segments = file.segments_in_order();
            let segment_ids: Vec<String> = segments.iter().map(|s| s.message_id.clone()).collect();
            let segment_sizes: Vec<u64> = segments.iter().map(|s| s.declared_bytes).collect();

            let probe = probes.get(idx).and_then(|p| p.as_ref());
            let declared_name = probe
                .and_then(|p| p.header_filename.clone())
                .unwrap_or_else(|| guess_name_from_subject(&file.subject));

            let recovered_name = probe.and_then(|p| match_par2_filename(&p.prefix, par2_descs));
            let magic = probe.map(|p| p.prefix.as_slice()).and_then(detect_magic);
            let is_critical = is_critical_name(&declared_name) || recovered_name.is_some();

            infos.push(FileInfo {
                nzb_file_index: idx,
                declared_name,
                recovered_name,
                segment_ids,
                segment_sizes,
                magic,
                is_critical,
            });
        }
        infos
    }

    /// Step 5: classify and reconstruct every file, skipping any whose
    /// processor step raises an error unless it's critical (spec §4.8 step
    /// 5 edge case: a failed reconstruction of a non-critical file degrades
    /// gracefully rather than failing the whole job).
    fn process_files(
        &self,
        file_infos: &[FileInfo],
        probes: &[Option<FirstSegmentProbe>],
    ) -> Result<Vec<(FileInfo, ProcessedFile)>> {
        let mut out = Vec::with_capacity(file_infos.len());
        for info in file_infos {
            let prefix: &[u8] = probes
                .get(info.nzb_file_index)
                .and_then(|p| p.as_ref())
                .map(|p| p.prefix.as_slice())
                .unwrap_or(&[]);

            let processor = Processor::classify(info.recovered_name(), info.magic);
            let ctx = ProcessContext {
                file: info,
                first_segment_prefix: prefix,
            };

            match processor.process(&ctx) {
                Ok(processed) => out.push((info.clone(), processed)),
                Err(e) if info.is_critical => return Err(e),
                Err(e) => {
                    warn!(file = info.recovered_name(), error = %e, "reconstruction failed for non-critical file, skipping");
                }
            }
        }
        Ok(out)
    }

    /// Step 6: turn processed files into a `vfs::Item` batch rooted at
    /// `content/{category}/{job_name}/` and insert them transactionally.
    async fn aggregate(
        &self,
        job_name: &str,
        category: &str,
        processed: Vec<(FileInfo, ProcessedFile)>,
        now: i64,
    ) -> Result<Vec<ItemId>> {
        self.ensure_root(now).await?;
        let content_id = self.ensure_directory(ROOT_ITEM_ID, "content", now).await?;
        let category_id = self.ensure_directory(content_id, category, now).await?;
        let job_id = self.ensure_directory(category_id, job_name, now).await?;

        let mut items = Vec::new();
        let mut top_level_ids = Vec::new();

        for (_info, result) in processed {
            match result {
                ProcessedFile::Skip => {}
                ProcessedFile::Whole { name, segment_ids, segment_sizes } => {
                    let id = Uuid::new_v4();
                    items.push(Item {
                        id,
                        parent_id: Some(job_id),
                        item_type: ItemType::NzbFile,
                        name,
                        size: Some(segment_sizes.iter().sum()),
                        created_at: now,
                        release_date: Some(now),
                        is_corrupted: false,
                        last_health_check: None,
                        next_health_check: None,
                        backing: ItemBacking::NzbFile(NzbFileBacking {
                            segment_ids,
                            segment_sizes: Some(segment_sizes.clone()),
                        }),
                    });
                    top_level_ids.push(id);
                }
                ProcessedFile::Multipart(outputs) => {
                    for output in outputs {
                        let id = self.build_multipart_item(job_id, output, now);
                        top_level_ids.push(id.id);
                        items.push(id);
                    }
                }
            }
        }

        if items.is_empty() {
            return Err(CoreError::CriticalIngestFailure {
                reason: "no logical files recovered".into(),
                detail: format!("job '{job_name}' produced zero browsable items"),
            });
        }

        self.metadata.insert_items(items).await?;
        self.events.publish(Event::QueueItemStatus {
            job_name: job_name.to_string(),
            status: "completed".into(),
        });
        info!(job_name, category, count = top_level_ids.len(), "ingestion completed");
        Ok(top_level_ids)
    }

    fn build_multipart_item(&self, parent_id: ItemId, output: MultipartOutput, now: i64) -> Item {
        let MultipartOutput { name, parts, aes_params, obfuscation_key } = output;
        let item_type = if parts.len() > 1 || aes_params.is_some() {
            ItemType::MultipartFile
        } else {
            ItemType::RarFile
        };
        let size = parts
            .iter()
            .map(|p: &FilePart| p.byte_range_within_part.end - p.byte_range_within_part.start)
            .sum();
        Item {
            id: Uuid::new_v4(),
            parent_id: Some(parent_id),
            item_type,
            name,
            size: Some(size),
            created_at: now,
            release_date: Some(now),
            is_corrupted: false,
            last_health_check: None,
            next_health_check: None,
            backing: ItemBacking::Multipart(MultipartBacking { parts, aes_params, obfuscation_key }),
        }
    }

    async fn ensure_root(&self, now: i64) -> Result<()> {
        if self.metadata.get_item(ROOT_ITEM_ID).await?.is_none() {
            self.metadata.insert_items(vec![root_item(now)]).await?;
        }
        Ok(())
    }

    async fn ensure_directory(&self, parent_id: ItemId, name: &str, now: i64) -> Result<ItemId> {
        let existing = self
            .metadata
            .list_children(parent_id)
            .await?
            .into_iter()
            .find(|item| item.name == name && item.item_type == ItemType::Directory);
        if let Some(item) = existing {
            return Ok(item.id);
        }

        let id = Uuid::new_v4();
        self.metadata
            .insert_items(vec![Item {
                id,
                parent_id: Some(parent_id),
                item_type: ItemType::Directory,
                name: name.to_string(),
                size: None,
                created_at: now,
                release_date: None,
                is_corrupted: false,
                last_health_check: None,
                next_health_check: None,
                backing: ItemBacking::Directory,
            }])
            .await?;
        Ok(id)
    }

    /// Persist the raw NZB XML to the blob store, returning its blob id —
    /// used by the queue layer before a submission is dispatched here.
    pub async fn store_nzb_blob(&self, nzb_xml: Vec<u8>) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.blobs.write_blob(id, nzb_xml).await?;
        Ok(id)
    }
}

/// Whether a (possibly obfuscated) declared name's extension marks this as
/// release content worth aborting the job over if unrecoverable.
fn is_critical_name(name: &str) -> bool {
    name.rsplit('.')
        .next()
        .map(|ext| CRITICAL_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// NZB subjects frequently wrap the real filename in quotes alongside
/// poster boilerplate (e.g. `"movie.mkv" yEnc (1/50)`); fall back to the
/// raw subject when no quoted segment is found.
fn guess_name_from_subject(subject: &str) -> String {
    if let Some(start) = subject.find('"') {
        if let Some(end) = subject[start + 1..].find('"') {
            return subject[start + 1..start + 1 + end].to_string();
        }
    }
    subject.to_string()
}

/// Step 4's MD5-16k match (spec §4.8 step 4): hash the first 16 KiB of the
/// decoded file and compare against every `FileDesc`'s declared `md5_16k`.
fn match_par2_filename(prefix: &[u8], descs: &[FileDesc]) -> Option<String> {
    if descs.is_empty() {
        return None;
    }
    let probe_len = prefix.len().min(16 * 1024);
    let digest: [u8; 16] = md5::compute(&prefix[..probe_len]).into();

    descs
        .iter()
        .find(|d| d.md5_16k == digest)
        .map(|d| d.filename.clone())
}

fn describe_failure(e: &CoreError) -> (String, String) {
    match e {
        CoreError::CriticalIngestFailure { reason, detail } => (reason.clone(), detail.clone()),
        other => ("ingestion failed".to_string(), other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_extensions_recognised() {
        assert!(is_critical_name("movie.MKV"));
        assert!(is_critical_name("archive.rar"));
        assert!(!is_critical_name("readme.nfo"));
    }

    #[test]
    fn guesses_quoted_name_from_subject() {
        let subject = r#"[001/150] "a1b2c3.mkv" yEnc (1/50)"#;
        assert_eq!(guess_name_from_subject(subject), "a1b2c3.mkv");
    }

    #[test]
    fn falls_back_to_raw_subject_without_quotes() {
        let subject = "movie.mkv (1/50)";
        assert_eq!(guess_name_from_subject(subject), subject);
    }

    #[test]
    fn matches_par2_filename_by_md5_16k() {
        let prefix = b"hello world".to_vec();
        let digest: [u8; 16] = md5::compute(&prefix).into();
        let descs = vec![FileDesc {
            file_id: [0; 16],
            md5_full: [0; 16],
            md5_16k: digest,
            file_length: prefix.len() as u64,
            filename: "real-name.mkv".to_string(),
        }];
        assert_eq!(match_par2_filename(&prefix, &descs), Some("real-name.mkv".to_string()));
    }

    #[test]
    fn no_match_returns_none() {
        let descs = vec![FileDesc {
            file_id: [0; 16],
            md5_full: [0; 16],
            md5_16k: [0xAB; 16],
            file_length: 10,
            filename: "x".to_string(),
        }];
        assert_eq!(match_par2_filename(b"unrelated data", &descs), None);
    }
}
