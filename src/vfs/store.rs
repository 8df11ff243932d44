//! `MetadataStore` / `BlobStore` external boundaries (spec §6) and their
//! in-memory reference implementations.
//!
//! The blob store plays the role the teacher's `ChunkPool` pool files play
//! (append-only payload storage); the metadata store plays the role of the
//! teacher's `SegmentIndex` (a queryable secondary structure, here keyed by
//! item id / parent id / id-prefix / next-health-check instead of
//! `(camera_id, start_ts)`).

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::queue::{HistoryRecord, QueueItem};

use super::item::{IdPrefix, Item, ItemId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthResult {
    Healthy,
    Unhealthy,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct MissingArticleEvent {
    pub item_id: ItemId,
    pub message_id: String,
    pub provider: String,
    pub recorded_at: i64,
}

/// Transactional access to the Virtual Item tree and the queue/history
/// tables that drive ingestion (spec §6).
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_item(&self, id: ItemId) -> Result<Option<Item>>;
    async fn get_item_by_path(&self, path: &str) -> Result<Option<Item>>;
    async fn list_children(&self, parent_id: ItemId) -> Result<Vec<Item>>;
    async fn list_by_prefix(&self, prefix: IdPrefix) -> Result<Vec<Item>>;

    /// Insert a batch of items transactionally (spec §4.8 step 6
    /// "insert all items transactionally").
    async fn insert_items(&self, items: Vec<Item>) -> Result<()>;

    /// Delete items, children-first for directories (spec §3 lifecycle).
    async fn delete_items(&self, ids: &[ItemId]) -> Result<()>;

    /// Persist segment sizes for an `NzbFile` item. Rejects a second write
    /// whose array differs from the one already stored (spec §8 property 7
    /// / SPEC_FULL.md C4 expansion).
    async fn update_segment_sizes(&self, item_id: ItemId, sizes: Vec<u64>) -> Result<()>;

    async fn get_top_queue_item(&self, now: i64) -> Result<Option<QueueItem>>;
    async fn delete_queue_item(&self, id: Uuid) -> Result<()>;
    async fn insert_history_item(&self, record: HistoryRecord) -> Result<()>;

    async fn record_health_result(&self, item_id: ItemId, result: HealthResult, at: i64) -> Result<()>;
    async fn read_health_result(&self, item_id: ItemId) -> Result<Option<HealthResult>>;

    /// Items due for a health check, i.e. `next_health_check <= now` or
    /// `None` (urgent — spec §4.10).
    async fn due_for_health_check(&self, now: i64) -> Result<Vec<Item>>;

    async fn record_missing_article(&self, event: MissingArticleEvent) -> Result<()>;
    async fn read_missing_articles(&self, item_id: ItemId) -> Result<Vec<MissingArticleEvent>>;
}

/// Read/write access to content-addressed blobs, used to offload NZB XML
/// out of the row store (spec §6).
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn read_blob(&self, id: Uuid) -> Result<Vec<u8>>;
    async fn write_blob(&self, id: Uuid, bytes: Vec<u8>) -> Result<()>;
}

/// In-memory `MetadataStore`, sufficient for the CLI and tests
/// (SPEC_FULL.md C9 expansion — database-schema evolution for a
/// production-grade store remains the spec's explicit non-goal).
#[derive(Default)]
pub struct InMemoryMetadataStore {
    items: RwLock<BTreeMap<ItemId, Item>>,
    path_index: RwLock<BTreeMap<String, ItemId>>,
    queue: RwLock<Vec<QueueItem>>,
    history: RwLock<Vec<HistoryRecord>>,
    health: RwLock<BTreeMap<ItemId, HealthResult>>,
    missing_articles: RwLock<Vec<MissingArticleEvent>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn full_path(items: &BTreeMap<ItemId, Item>, id: ItemId) -> String {
        let mut segments = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(item) = items.get(&current) else {
                break;
            };
            segments.push(item.name.clone());
            cursor = item.parent_id;
        }
        segments.reverse();
        segments.join("/")
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn get_item(&self, id: ItemId) -> Result<Option<Item>> {
        Ok(self.items.read().get(&id).cloned())
    }

    async fn get_item_by_path(&self, path: &str) -> Result<Option<Item>> {
        let id = self.path_index.read().get(path).copied();
        match id {
            Some(id) => self.get_item(id).await,
            None => Ok(None),
        }
    }

    async fn list_children(&self, parent_id: ItemId) -> Result<Vec<Item>> {
        Ok(self
            .items
            .read()
            .values()
            .filter(|item| item.parent_id == Some(parent_id))
            .cloned()
            .collect())
    }

    async fn list_by_prefix(&self, prefix: IdPrefix) -> Result<Vec<Item>> {
        Ok(self
            .items
            .read()
            .values()
            .filter(|item| item.id_prefix() == prefix)
            .cloned()
            .collect())
    }

    async fn insert_items(&self, new_items: Vec<Item>) -> Result<()> {
        let mut items = self.items.write();
        let mut paths = self.path_index.write();
        for item in new_items {
            let path = Self::full_path(&items, item.parent_id.unwrap_or(item.id));
            let full = if path.is_empty() {
                item.name.clone()
            } else {
                format!("{path}/{}", item.name)
            };
            if let Some(existing) = paths.get(&full) {
                if *existing != item.id {
                    // last-writer-wins within the batch (spec §4.8 step 6)
                    items.remove(existing);
                }
            }
            paths.insert(full, item.id);
            items.insert(item.id, item);
        }
        Ok(())
    }

    async fn delete_items(&self, ids: &[ItemId]) -> Result<()> {
        let mut items = self.items.write();
        let mut paths = self.path_index.write();
        for id in ids {
            if let Some(item) = items.remove(id) {
                let path = Self::full_path(&items, item.parent_id.unwrap_or(item.id));
                let full = if path.is_empty() {
                    item.name.clone()
                } else {
                    format!("{path}/{}", item.name)
                };
                paths.remove(&full);
            }
        }
        Ok(())
    }

    async fn update_segment_sizes(&self, item_id: ItemId, sizes: Vec<u64>) -> Result<()> {
        use super::item::ItemBacking;
        let mut items = self.items.write();
        let item = items
            .get_mut(&item_id)
            .ok_or_else(|| CoreError::ItemNotFound(item_id.to_string()))?;
        let ItemBacking::NzbFile(backing) = &mut item.backing else {
            return Err(CoreError::Store("update_segment_sizes on non-NzbFile item".into()));
        };
        if let Some(existing) = &backing.segment_sizes {
            if existing != &sizes {
                return Err(CoreError::Store(
                    "segment sizes already recorded and differ from this write".into(),
                ));
            }
            return Ok(());
        }
        item.size = Some(sizes.iter().sum());
        let ItemBacking::NzbFile(backing) = &mut item.backing else {
            unreachable!()
        };
        backing.segment_sizes = Some(sizes);
        Ok(())
    }

    async fn get_top_queue_item(&self, now: i64) -> Result<Option<QueueItem>> {
        let queue = self.queue.read();
        Ok(queue
            .iter()
            .filter(|q| q.pause_until.map(|p| p <= now).unwrap_or(true))
            .max_by(|a, b| a.cmp(b))
            .cloned())
    }

    async fn delete_queue_item(&self, id: Uuid) -> Result<()> {
        self.queue.write().retain(|q| q.id != id);
        Ok(())
    }

    async fn insert_history_item(&self, record: HistoryRecord) -> Result<()> {
        self.history.write().push(record);
        Ok(())
    }

    async fn record_health_result(&self, item_id: ItemId, result: HealthResult, at: i64) -> Result<()> {
        self.health.write().insert(item_id, result);
        if let Some(item) = self.items.write().get_mut(&item_id) {
            item.last_health_check = Some(at);
        }
        Ok(())
    }

    async fn read_health_result(&self, item_id: ItemId) -> Result<Option<HealthResult>> {
        Ok(self.health.read().get(&item_id).copied())
    }

    async fn due_for_health_check(&self, now: i64) -> Result<Vec<Item>> {
        Ok(self
            .items
            .read()
            .values()
            .filter(|item| item.next_health_check.map(|t| t <= now).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn record_missing_article(&self, event: MissingArticleEvent) -> Result<()> {
        self.missing_articles.write().push(event);
        Ok(())
    }

    async fn read_missing_articles(&self, item_id: ItemId) -> Result<Vec<MissingArticleEvent>> {
        Ok(self
            .missing_articles
            .read()
            .iter()
            .filter(|e| e.item_id == item_id)
            .cloned()
            .collect())
    }
}

/// Filesystem-backed `BlobStore`: one file per blob id under `root`.
/// Mirrors the teacher's append-only pool-file idea scaled down to
/// one-file-per-blob since NZB XML blobs are small and never mutated.
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileBlobStore { root: root.into() }
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.root.join(format!("{id}.blob"))
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn read_blob(&self, id: Uuid) -> Result<Vec<u8>> {
        tokio::fs::read(self.path_for(id))
            .await
            .map_err(CoreError::from)
    }

    async fn write_blob(&self, id: Uuid, bytes: Vec<u8>) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(self.path_for(id), bytes).await?;
        Ok(())
    }
}

/// Path helper shared by CLI/tests: splits `a/b/c` into segments.
pub fn split_path(path: &str) -> Vec<&str> {
    path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::item::{ItemBacking, ItemType, NzbFileBacking};

    fn dir(id: ItemId, parent: Option<ItemId>, name: &str) -> Item {
        Item {
            id,
            parent_id: parent,
            item_type: ItemType::Directory,
            name: name.to_string(),
            size: None,
            created_at: 0,
            release_date: None,
            is_corrupted: false,
            last_health_check: None,
            next_health_check: None,
            backing: ItemBacking::Directory,
        }
    }

    fn nzb_file(id: ItemId, parent: ItemId, name: &str) -> Item {
        Item {
            id,
            parent_id: Some(parent),
            item_type: ItemType::NzbFile,
            name: name.to_string(),
            size: None,
            created_at: 0,
            release_date: None,
            is_corrupted: false,
            last_health_check: None,
            next_health_check: None,
            backing: ItemBacking::NzbFile(NzbFileBacking {
                segment_ids: vec!["msg1".into()],
                segment_sizes: None,
            }),
        }
    }

    #[tokio::test]
    async fn insert_and_list_children() {
        let store = InMemoryMetadataStore::new();
        let root = Uuid::new_v4();
        let child = Uuid::new_v4();
        store.insert_items(vec![dir(root, None, "root")]).await.unwrap();
        store
            .insert_items(vec![nzb_file(child, root, "movie.mkv")])
            .await
            .unwrap();

        let children = store.list_children(root).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name, "movie.mkv");
    }

    #[tokio::test]
    async fn segment_sizes_monotonic() {
        let store = InMemoryMetadataStore::new();
        let root = Uuid::new_v4();
        let file = Uuid::new_v4();
        store.insert_items(vec![dir(root, None, "root")]).await.unwrap();
        store.insert_items(vec![nzb_file(file, root, "f")]).await.unwrap();

        store.update_segment_sizes(file, vec![100, 200]).await.unwrap();
        store.update_segment_sizes(file, vec![100, 200]).await.unwrap();
        let err = store.update_segment_sizes(file, vec![999]).await.unwrap_err();
        assert!(matches!(err, CoreError::Store(_)));
    }

    #[tokio::test]
    async fn delete_removes_item_and_path_entry() {
        let store = InMemoryMetadataStore::new();
        let root = Uuid::new_v4();
        store.insert_items(vec![dir(root, None, "root")]).await.unwrap();
        store.delete_items(&[root]).await.unwrap();
        assert!(store.get_item(root).await.unwrap().is_none());
    }
}
