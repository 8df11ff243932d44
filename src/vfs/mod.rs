//! C9 — Virtual filesystem store (spec §4.9).

pub mod item;
pub mod open;
pub mod store;

pub use item::{
    root_item, AesParams, FilePart, IdPrefix, Item, ItemBacking, ItemId, ItemType, MultipartBacking, NzbFileBacking,
    ROOT_ITEM_ID,
};
pub use open::open_item;
pub use store::{BlobStore, FileBlobStore, HealthResult, InMemoryMetadataStore, MetadataStore, MissingArticleEvent};
