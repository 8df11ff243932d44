//! Virtual Item tree entities (spec §3 "Virtual Item", §4.9).

use std::ops::Range;

use uuid::Uuid;

/// 128-bit item identifier. The first byte doubles as the `IdPrefix` used
/// to spread directory enumeration over backing storage (spec §4.9).
pub type ItemId = Uuid;

/// The synthetic root every Virtual Item tree is rooted at (spec §3).
/// Physically stored as an ordinary `Item` with `parent_id: None` so
/// `MetadataStore::list_children` needs no special case for the top level.
pub const ROOT_ITEM_ID: ItemId = Uuid::nil();

/// Build the synthetic root item. Callers insert this once, before any
/// other item, when bootstrapping a fresh store.
pub fn root_item(created_at: i64) -> Item {
    Item {
        id: ROOT_ITEM_ID,
        parent_id: None,
        item_type: ItemType::Directory,
        name: String::new(),
        size: None,
        created_at,
        release_date: None,
        is_corrupted: false,
        last_health_check: None,
        next_health_check: None,
        backing: ItemBacking::Directory,
    }
}

/// First two hex digits of an [`ItemId`], used for shard/prefix indexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IdPrefix(pub u8);

impl IdPrefix {
    pub fn of(id: ItemId) -> Self {
        IdPrefix(id.as_bytes()[0])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    Directory,
    NzbFile,
    RarFile,
    MultipartFile,
    Symlink,
}

/// A node in the virtual filesystem tree (spec §3 invariants: exactly one
/// parent per non-root item, path-unique per parent, no cycles).
#[derive(Debug, Clone)]
pub struct Item {
    pub id: ItemId,
    pub parent_id: Option<ItemId>,
    pub item_type: ItemType,
    pub name: String,
    pub size: Option<u64>,
    pub created_at: i64,
    pub release_date: Option<i64>,
    pub is_corrupted: bool,
    pub last_health_check: Option<i64>,
    /// `None` means "urgent / ASAP" (spec §4.10).
    pub next_health_check: Option<i64>,
    pub backing: ItemBacking,
}

impl Item {
    pub fn id_prefix(&self) -> IdPrefix {
        IdPrefix::of(self.id)
    }

    /// Flags the item corrupted and schedules an immediate re-check
    /// (spec §4.10 "urgent promotion").
    pub fn mark_corrupted_urgent(&mut self) {
        self.is_corrupted = true;
        self.next_health_check = None;
    }
}

/// Type-specific backing data, keyed implicitly by [`Item::item_type`].
#[derive(Debug, Clone)]
pub enum ItemBacking {
    Directory,
    /// For `ItemType::NzbFile`: an ordered list of article message-ids and
    /// their (possibly not-yet-known) decoded sizes.
    NzbFile(NzbFileBacking),
    /// For `ItemType::RarFile`/`ItemType::MultipartFile`: an ordered list of
    /// byte-range spans across one or more underlying `NzbFile`s.
    Multipart(MultipartBacking),
    Symlink { target: String },
}

#[derive(Debug, Clone)]
pub struct NzbFileBacking {
    pub segment_ids: Vec<String>,
    /// Absent until [`crate::size_oracle`] has run at least once.
    pub segment_sizes: Option<Vec<u64>>,
}

impl NzbFileBacking {
    /// Total logical size, if sizes are known.
    pub fn total_size(&self) -> Option<u64> {
        self.segment_sizes.as_ref().map(|sizes| sizes.iter().sum())
    }
}

/// One contiguous byte span within a logical file, backed by a range
/// inside a specific NzbFile's bytes (spec §3 "FilePart").
#[derive(Debug, Clone)]
pub struct FilePart {
    pub nzb_segment_ids: Vec<String>,
    pub nzb_segment_sizes: Vec<u64>,
    pub byte_range_within_part: Range<u64>,
    pub part_size: u64,
}

#[derive(Debug, Clone)]
pub struct AesParams {
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
    pub block_size: usize,
}

#[derive(Debug, Clone)]
pub struct MultipartBacking {
    pub parts: Vec<FilePart>,
    pub aes_params: Option<AesParams>,
    /// 4-byte repeating RAR-obfuscation XOR key, if detected (spec §4.8 step 5).
    pub obfuscation_key: Option<[u8; 4]>,
}

impl MultipartBacking {
    pub fn total_size(&self) -> u64 {
        self.parts
            .iter()
            .map(|p| p.byte_range_within_part.end - p.byte_range_within_part.start)
            .sum()
    }
}
