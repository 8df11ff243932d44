//! Producer-only event bus (spec §6 "Event bus"; SPEC_FULL.md expansion).
//!
//! Thin wrapper over `tokio::sync::broadcast`, the same shape as
//! `UsenetDownloader::event_tx`/`subscribe()` in the pack's `usenet-dl`
//! downloader. The core only ever publishes; subscribers are external.

use tokio::sync::broadcast;

/// One of the delimited-string topics spec §6 lists.
#[derive(Debug, Clone)]
pub enum Event {
    QueueItemAdded { job_name: String },
    QueueItemRemoved { job_name: String },
    QueueItemStatus { job_name: String, status: String },
    QueueItemPercentage { job_name: String, percent: f32 },
    HistoryItemAdded { job_name: String },
    HistoryItemRemoved { job_name: String },
    HealthItemStatus { item_id: String, status: String },
    HealthItemProgress { item_id: String, percent: f32 },
    AnalysisProgress { item_id: String, percent: f32 },
}

/// Producer handle for the event bus. Clone freely; every clone publishes
/// to the same underlying channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        EventBus { tx }
    }

    pub fn publish(&self, event: Event) {
        // No subscribers is a normal, expected state (e.g. running the CLI
        // without a WebDAV adapter attached); dropped sends are not errors.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(256)
    }
}
