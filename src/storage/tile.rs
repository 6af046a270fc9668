#![forbid(unsafe_code)]

//! Columnar tile files within a fragment.
//!
//! One file per column stem. Payloads are optionally Snappy-compressed and
//! carry a CRC32 over the uncompressed bytes in the fragment metadata; a
//! mismatch on read is reported as corruption.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::trace;

use crate::array::Compressor;
use crate::error::{ArrayError, Result};
use crate::primitives::io::FileIo;
use crate::storage::fragment::{ColumnMeta, FragmentMetadata, METADATA_FILE};
use crate::storage::manager::FileHandleCache;
use crate::types::checksum::{Checksum, Crc32Fast};

/// Extension of column files.
const COLUMN_EXT: &str = "col";

/// Reads and writes column files for the fragments of one array.
pub struct TileStore {
    array_dir: PathBuf,
    cache: Arc<FileHandleCache>,
    checksum: Box<dyn Checksum>,
    sync_writes: bool,
}

impl TileStore {
    /// Creates a store rooted at the array directory, checksumming columns
    /// with CRC32.
    pub fn new(array_dir: PathBuf, cache: Arc<FileHandleCache>, sync_writes: bool) -> Self {
        Self {
            array_dir,
            cache,
            checksum: Box::new(Crc32Fast),
            sync_writes,
        }
    }

    /// Replaces the column checksum implementation.
    pub fn with_checksum(mut self, checksum: Box<dyn Checksum>) -> Self {
        self.checksum = checksum;
        self
    }

    /// Directory of the array this store serves.
    pub fn array_dir(&self) -> &Path {
        &self.array_dir
    }

    fn fragment_dir(&self, fragment: &str) -> PathBuf {
        self.array_dir.join(fragment)
    }

    /// Creates the directory for a new fragment.
    pub fn create_fragment_dir(&self, fragment: &str) -> Result<PathBuf> {
        let dir = self.fragment_dir(fragment);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Persists one column payload and returns its metadata entry.
    pub fn write_column(
        &self,
        fragment: &str,
        stem: &str,
        compressor: Compressor,
        raw: &[u8],
    ) -> Result<ColumnMeta> {
        let crc32 = self.checksum.checksum(raw);
        let encoded;
        let on_disk: &[u8] = match compressor {
            Compressor::None => raw,
            Compressor::Snappy => {
                encoded = snap::raw::Encoder::new()
                    .compress_vec(raw)
                    .map_err(|e| ArrayError::Serialization(format!("snappy encode: {e}")))?;
                &encoded
            }
        };
        let file = format!("{stem}.{COLUMN_EXT}");
        let io = self.cache.open(&self.fragment_dir(fragment).join(&file))?;
        io.truncate(0)?;
        io.write_at(0, on_disk)?;
        if self.sync_writes {
            io.sync_all()?;
        }
        trace!(
            fragment,
            stem,
            raw_len = raw.len(),
            disk_len = on_disk.len(),
            "tile.write_column"
        );
        Ok(ColumnMeta {
            file,
            raw_len: raw.len() as u64,
            disk_len: on_disk.len() as u64,
            compressor,
            crc32,
        })
    }

    /// Loads and verifies one column payload.
    pub fn read_column(&self, fragment: &str, meta: &ColumnMeta) -> Result<Vec<u8>> {
        let path = self.fragment_dir(fragment).join(&meta.file);
        let io = self.cache.open(&path)?;
        let mut on_disk = vec![0u8; meta.disk_len as usize];
        io.read_at(0, &mut on_disk)?;
        let raw = match meta.compressor {
            Compressor::None => on_disk,
            Compressor::Snappy => snap::raw::Decoder::new()
                .decompress_vec(&on_disk)
                .map_err(|e| {
                    ArrayError::Corruption(format!(
                        "snappy decode of '{}/{}': {e}",
                        fragment, meta.file
                    ))
                })?,
        };
        if raw.len() as u64 != meta.raw_len {
            return Err(ArrayError::Corruption(format!(
                "column '{}/{}' decoded to {} bytes, expected {}",
                fragment,
                meta.file,
                raw.len(),
                meta.raw_len
            )));
        }
        let crc32 = self.checksum.checksum(&raw);
        if crc32 != meta.crc32 {
            return Err(ArrayError::Corruption(format!(
                "column '{}/{}' checksum mismatch",
                fragment, meta.file
            )));
        }
        trace!(fragment, file = %meta.file, raw_len = raw.len(), "tile.read_column");
        Ok(raw)
    }

    /// Writes and syncs the metadata footer, committing the fragment.
    pub fn commit_fragment(&self, meta: &FragmentMetadata) -> Result<()> {
        let bytes = meta.to_json()?;
        let io = self
            .cache
            .open(&self.fragment_dir(&meta.name).join(METADATA_FILE))?;
        io.truncate(0)?;
        io.write_at(0, &bytes)?;
        io.sync_all()?;
        trace!(fragment = %meta.name, cell_num = meta.cell_num, "tile.commit_fragment");
        Ok(())
    }

    /// Loads the metadata footer of a fragment directory, if committed.
    ///
    /// An uncommitted fragment must stay uncommitted: the footer is opened
    /// without creating it, and a missing or empty footer reads as `None`.
    pub fn read_fragment_metadata(&self, fragment: &str) -> Result<Option<FragmentMetadata>> {
        let path = self.fragment_dir(fragment).join(METADATA_FILE);
        let io = match self.cache.open_existing(&path) {
            Ok(io) => io,
            Err(ArrayError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None)
            }
            Err(e) => return Err(e),
        };
        let len = io.len()?;
        if len == 0 {
            return Ok(None);
        }
        let mut bytes = vec![0u8; len as usize];
        io.read_at(0, &mut bytes)?;
        Ok(Some(FragmentMetadata::from_json(&bytes)?))
    }
}

/// Packs offsets into a little-endian byte column.
pub fn encode_u64s(values: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 8);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Unpacks a little-endian offset column.
pub fn decode_u64s(bytes: &[u8]) -> Result<Vec<u64>> {
    if bytes.len() % 8 != 0 {
        return Err(ArrayError::Corruption(format!(
            "offset column of {} bytes is not a multiple of 8",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().expect("chunk is 8 bytes")))
        .collect())
}
