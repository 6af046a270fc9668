#![forbid(unsafe_code)]

//! Fragment identity and metadata.
//!
//! A fragment is an immutable, timestamped unit of persisted array data
//! produced by one write session. Its directory name carries the creation
//! timestamp; its metadata footer is written last and acts as the commit
//! point. A fragment directory without a readable footer is invisible.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::array::Compressor;
use crate::error::{ArrayError, Result};
use crate::types::ScalarValue;

/// Footer file that commits a fragment.
pub const METADATA_FILE: &str = "__fragment_metadata.json";

/// Describes one persisted column file within a fragment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMeta {
    /// File name within the fragment directory.
    pub file: String,
    /// Uncompressed payload length in bytes.
    pub raw_len: u64,
    /// On-disk (possibly compressed) length in bytes.
    pub disk_len: u64,
    /// Codec applied to the payload.
    pub compressor: Compressor,
    /// CRC32 of the uncompressed payload.
    pub crc32: u32,
}

/// Per-fragment metadata, read-only to queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentMetadata {
    /// Fragment directory name.
    pub name: String,
    /// Creation timestamp in milliseconds, parsed from the name.
    pub timestamp: u64,
    /// Number of cells in the fragment.
    pub cell_num: u64,
    /// Per-dimension inclusive bounds actually covered by the cells.
    pub non_empty_domain: Vec<(ScalarValue, ScalarValue)>,
    /// Column files keyed by column stem (attribute name, `a2_off`,
    /// `a2_var`, or `__coords`).
    pub columns: BTreeMap<String, ColumnMeta>,
}

impl FragmentMetadata {
    /// Looks up a column by stem.
    pub fn column(&self, stem: &str) -> Result<&ColumnMeta> {
        self.columns.get(stem).ok_or_else(|| {
            ArrayError::Corruption(format!(
                "fragment '{}' has no column '{}'",
                self.name, stem
            ))
        })
    }

    /// Serializes the metadata footer.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| ArrayError::Serialization(format!("fragment metadata encode: {e}")))
    }

    /// Deserializes a metadata footer.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| ArrayError::Serialization(format!("fragment metadata decode: {e}")))
    }
}

/// Generates a fresh fragment name:
/// `__<timestamp_millis>_<sequence>_<random hex>`.
///
/// Fragments are ordered by timestamp with the name as tie-breaker; the
/// zero-padded in-process sequence keeps fragments created within the same
/// millisecond in creation order.
pub fn generate_name() -> String {
    static SEQUENCE: AtomicU64 = AtomicU64::new(0);
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let entropy: u32 = rand::random();
    format!("__{millis:013}_{seq:06x}_{entropy:08x}")
}

/// Parses the creation timestamp out of a fragment name.
pub fn parse_timestamp(name: &str) -> Option<u64> {
    let rest = name.strip_prefix("__")?;
    let (millis, entropy) = rest.split_once('_')?;
    if entropy.is_empty() {
        return None;
    }
    millis.parse().ok()
}
