//! Fragment storage: metadata, columnar tile files, and the storage manager.

/// Fragment identity and metadata.
pub mod fragment;

/// Array-level storage management and the shared file-handle cache.
pub mod manager;

/// Columnar tile file read/write.
pub mod tile;

pub use fragment::{ColumnMeta, FragmentMetadata};
pub use manager::{EngineConfig, FileHandleCache, StorageManager};
pub use tile::TileStore;
