//! Queue item / History model (spec §3 "Queue item"; SPEC_FULL.md "Queue
//! item / History" expansion).
//!
//! Minimal by design — just enough state to drive C8 end to end. Full
//! REST/admin surfaces over this queue are out of scope (spec §1).

use std::collections::BinaryHeap;
use std::cmp::Ordering;

use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
    Force,
}

/// One NZB submission awaiting ingestion.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: Uuid,
    pub job_name: String,
    pub filename: String,
    pub category: String,
    pub priority: Priority,
    pub created_at: i64,
    pub pause_until: Option<i64>,
    /// The NZB XML itself lives in the blob store; this is its key.
    pub nzb_blob_id: Uuid,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for QueueItem {}

impl Ord for QueueItem {
    /// Highest priority first, then oldest first — matches
    /// `BinaryHeap<QueuedDownload>`'s ordering in the pack's `usenet-dl`
    /// downloader.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
    }
}
impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryStatus {
    Completed,
    Failed { reason: String, detail: String },
}

#[derive(Debug, Clone)]
pub struct HistoryRecord {
    pub id: Uuid,
    pub job_name: String,
    pub category: String,
    pub status: HistoryStatus,
    pub finished_at: i64,
}

/// In-process priority queue selecting "highest-priority, oldest,
/// not-paused" (spec §3 Queue item lifecycle).
#[derive(Default)]
pub struct QueueManager {
    heap: BinaryHeap<QueueItem>,
}

impl QueueManager {
    pub fn new() -> Self {
        QueueManager::default()
    }

    pub fn push(&mut self, item: QueueItem) {
        self.heap.push(item);
    }

    /// Pop the next eligible item, skipping any still paused.
    pub fn pop_next(&mut self, now: i64) -> Option<QueueItem> {
        let mut deferred = Vec::new();
        let mut picked = None;
        while let Some(item) = self.heap.pop() {
            match item.pause_until {
                Some(until) if until > now => deferred.push(item),
                _ => {
                    picked = Some(item);
                    break;
                }
            }
        }
        for item in deferred {
            self.heap.push(item);
        }
        picked
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: u8, priority: Priority, created_at: i64) -> QueueItem {
        QueueItem {
            id: Uuid::from_bytes([id; 16]),
            job_name: format!("job-{id}"),
            filename: "x.nzb".into(),
            category: "movies".into(),
            priority,
            created_at,
            pause_until: None,
            nzb_blob_id: Uuid::from_bytes([id; 16]),
        }
    }

    #[test]
    fn highest_priority_wins_over_age() {
        let mut q = QueueManager::new();
        q.push(item(1, Priority::Low, 100));
        q.push(item(2, Priority::High, 200));
        let next = q.pop_next(1000).unwrap();
        assert_eq!(next.job_name, "job-2");
    }

    #[test]
    fn ties_broken_by_oldest_first() {
        let mut q = QueueManager::new();
        q.push(item(1, Priority::Normal, 200));
        q.push(item(2, Priority::Normal, 100));
        let next = q.pop_next(1000).unwrap();
        assert_eq!(next.job_name, "job-2");
    }

    #[test]
    fn paused_items_are_skipped() {
        let mut q = QueueManager::new();
        let mut paused = item(1, Priority::High, 100);
        paused.pause_until = Some(5000);
        q.push(paused);
        q.push(item(2, Priority::Low, 100));
        let next = q.pop_next(1000).unwrap();
        assert_eq!(next.job_name, "job-2");
        assert_eq!(q.len(), 1);
    }
}
