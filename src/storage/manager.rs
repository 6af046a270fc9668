#![forbid(unsafe_code)]

//! Array-level storage management.
//!
//! The [`StorageManager`] owns the array directory, the engine configuration,
//! and the shared file-handle cache. It is the factory for queries: readers
//! receive the committed fragment list, writers a handle to the tile store.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::array::{ArraySchema, SCHEMA_FILE};
use crate::error::{ArrayError, Result};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::query::Query;
use crate::storage::fragment::{self, FragmentMetadata};
use crate::storage::tile::TileStore;

/// Engine configuration supplied when opening an array.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Whether column writes are synced to disk as they happen. The fragment
    /// metadata footer is always synced; it is the commit point.
    pub sync_writes: bool,
    /// Capacity of the shared file-handle cache.
    pub file_cache_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync_writes: true,
            file_cache_capacity: 64,
        }
    }
}

impl EngineConfig {
    /// Profile trading write durability for throughput.
    pub fn fast() -> Self {
        Self {
            sync_writes: false,
            file_cache_capacity: 256,
        }
    }
}

/// Shared cache of open file handles, keyed by path.
///
/// Explicitly constructed and injected into whichever component needs shared
/// handles; one lock guards the whole mapping.
pub struct FileHandleCache {
    inner: Mutex<LruCache<PathBuf, StdFileIo>>,
}

impl FileHandleCache {
    /// Creates a cache holding up to `capacity` handles.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns a handle for `path`, opening (and creating) the file if it is
    /// not cached.
    pub fn open(&self, path: &Path) -> Result<StdFileIo> {
        let mut cache = self.inner.lock();
        if let Some(io) = cache.get(path) {
            return Ok(io.clone());
        }
        let io = StdFileIo::open(path)?;
        cache.put(path.to_path_buf(), io.clone());
        Ok(io)
    }

    /// Returns a handle for `path` without ever creating the file; a missing
    /// file surfaces the `NotFound` I/O error and caches nothing.
    pub fn open_existing(&self, path: &Path) -> Result<StdFileIo> {
        let mut cache = self.inner.lock();
        if let Some(io) = cache.get(path) {
            return Ok(io.clone());
        }
        let io = StdFileIo::open_existing(path)?;
        cache.put(path.to_path_buf(), io.clone());
        Ok(io)
    }
}

/// Opens arrays and constructs queries over them.
pub struct StorageManager {
    array_dir: PathBuf,
    schema: Arc<ArraySchema>,
    tiles: Arc<TileStore>,
}

impl std::fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageManager")
            .field("array_dir", &self.array_dir)
            .finish_non_exhaustive()
    }
}

impl StorageManager {
    /// Creates a new array at `dir` and persists its schema.
    pub fn create_array(
        dir: impl Into<PathBuf>,
        schema: ArraySchema,
        config: EngineConfig,
    ) -> Result<Self> {
        let array_dir: PathBuf = dir.into();
        std::fs::create_dir_all(&array_dir)?;
        let schema_path = array_dir.join(SCHEMA_FILE);
        if std::fs::metadata(&schema_path).is_ok() {
            return Err(ArrayError::Schema(format!(
                "array already exists at '{}'",
                array_dir.display()
            )));
        }
        let bytes = schema.to_json()?;
        let io = StdFileIo::open(&schema_path)?;
        io.write_at(0, &bytes)?;
        io.sync_all()?;
        debug!(dir = %array_dir.display(), "storage.create_array");
        Self::with_schema(array_dir, schema, config)
    }

    /// Opens an existing array, loading its schema.
    pub fn open(dir: impl Into<PathBuf>, config: EngineConfig) -> Result<Self> {
        let array_dir: PathBuf = dir.into();
        let bytes = std::fs::read(array_dir.join(SCHEMA_FILE)).map_err(|e| {
            ArrayError::Schema(format!(
                "no array at '{}': {e}",
                array_dir.display()
            ))
        })?;
        let schema = ArraySchema::from_json(&bytes)?;
        Self::with_schema(array_dir, schema, config)
    }

    fn with_schema(
        array_dir: PathBuf,
        schema: ArraySchema,
        config: EngineConfig,
    ) -> Result<Self> {
        let cache = Arc::new(FileHandleCache::new(config.file_cache_capacity));
        let tiles = Arc::new(TileStore::new(
            array_dir.clone(),
            cache,
            config.sync_writes,
        ));
        Ok(Self {
            array_dir,
            schema: Arc::new(schema),
            tiles,
        })
    }

    /// The array's schema.
    pub fn schema(&self) -> &Arc<ArraySchema> {
        &self.schema
    }

    /// Lists committed fragments, oldest first.
    ///
    /// Fragment directories without a readable metadata footer are skipped;
    /// they belong to write sessions that never finalized.
    pub fn list_fragments(&self) -> Result<Vec<FragmentMetadata>> {
        let mut fragments = Vec::new();
        for entry in std::fs::read_dir(&self.array_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if fragment::parse_timestamp(&name).is_none() {
                continue;
            }
            match self.tiles.read_fragment_metadata(&name)? {
                Some(meta) => fragments.push(meta),
                None => {
                    debug!(fragment = %name, "storage.list_fragments.uncommitted_skipped");
                }
            }
        }
        fragments.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(fragments)
    }

    /// Constructs a read query over the current committed fragments.
    pub fn query_read(&self) -> Result<Query> {
        let fragments = self.list_fragments()?;
        Ok(Query::new_read(
            self.schema.clone(),
            fragments,
            self.tiles.clone(),
        ))
    }

    /// Constructs a write query producing one new fragment.
    pub fn query_write(&self) -> Result<Query> {
        Ok(Query::new_write(self.schema.clone(), self.tiles.clone()))
    }
}
