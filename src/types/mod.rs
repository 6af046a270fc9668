#![forbid(unsafe_code)]

//! Scalar datatypes, cell layouts, and the typed dispatch over raw buffers.
//!
//! Callers hand the engine type-erased byte buffers; the schema's datatype
//! tag selects the typed decode/compare path. The tag set is closed: the ten
//! numeric widths plus `Char` for variable-length attribute values. String
//! tags are never valid as a domain type.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{ArrayError, Result};

/// Checksum trait and CRC32 implementation for persisted column files.
pub mod checksum;

/// One decoded cell coordinate tuple, in dimension order.
pub type CellCoords = SmallVec<[ScalarValue; 4]>;

/// Scalar datatype tag for dimensions and attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Datatype {
    /// 8-bit signed integer.
    Int8,
    /// 8-bit unsigned integer.
    UInt8,
    /// 16-bit signed integer.
    Int16,
    /// 16-bit unsigned integer.
    UInt16,
    /// 32-bit signed integer.
    Int32,
    /// 32-bit unsigned integer.
    UInt32,
    /// 64-bit signed integer.
    Int64,
    /// 64-bit unsigned integer.
    UInt64,
    /// 32-bit IEEE float.
    Float32,
    /// 64-bit IEEE float.
    Float64,
    /// Single byte, for variable-length attribute values only.
    Char,
}

impl Datatype {
    /// Size of one scalar of this type in bytes.
    pub fn size(self) -> usize {
        match self {
            Datatype::Int8 | Datatype::UInt8 | Datatype::Char => 1,
            Datatype::Int16 | Datatype::UInt16 => 2,
            Datatype::Int32 | Datatype::UInt32 | Datatype::Float32 => 4,
            Datatype::Int64 | Datatype::UInt64 | Datatype::Float64 => 8,
        }
    }

    /// Whether this tag may type an array domain.
    ///
    /// `Char` (and by extension any string-like payload) is value-only;
    /// using it as a domain type is a caller contract violation reported as
    /// a schema error, never a panic.
    pub fn is_valid_domain_type(self) -> bool {
        !matches!(self, Datatype::Char)
    }

    /// Short lowercase name used in error messages and logs.
    pub fn name(self) -> &'static str {
        match self {
            Datatype::Int8 => "int8",
            Datatype::UInt8 => "uint8",
            Datatype::Int16 => "int16",
            Datatype::UInt16 => "uint16",
            Datatype::Int32 => "int32",
            Datatype::UInt32 => "uint32",
            Datatype::Int64 => "int64",
            Datatype::UInt64 => "uint64",
            Datatype::Float32 => "float32",
            Datatype::Float64 => "float64",
            Datatype::Char => "char",
        }
    }

    /// Decodes one little-endian scalar of this type.
    pub fn decode_scalar(self, bytes: &[u8]) -> Result<ScalarValue> {
        if bytes.len() != self.size() {
            return Err(ArrayError::Corruption(format!(
                "scalar slice is {} bytes, {} needs {}",
                bytes.len(),
                self.name(),
                self.size()
            )));
        }
        let value = match self {
            Datatype::Int8 => ScalarValue::Int(i8::from_le_bytes([bytes[0]]) as i64),
            Datatype::UInt8 | Datatype::Char => ScalarValue::UInt(bytes[0] as u64),
            Datatype::Int16 => {
                ScalarValue::Int(i16::from_le_bytes([bytes[0], bytes[1]]) as i64)
            }
            Datatype::UInt16 => {
                ScalarValue::UInt(u16::from_le_bytes([bytes[0], bytes[1]]) as u64)
            }
            Datatype::Int32 => ScalarValue::Int(i32::from_le_bytes(
                bytes.try_into().expect("length checked above"),
            ) as i64),
            Datatype::UInt32 => ScalarValue::UInt(u32::from_le_bytes(
                bytes.try_into().expect("length checked above"),
            ) as u64),
            Datatype::Int64 => ScalarValue::Int(i64::from_le_bytes(
                bytes.try_into().expect("length checked above"),
            )),
            Datatype::UInt64 => ScalarValue::UInt(u64::from_le_bytes(
                bytes.try_into().expect("length checked above"),
            )),
            Datatype::Float32 => ScalarValue::Float(f32::from_le_bytes(
                bytes.try_into().expect("length checked above"),
            ) as f64),
            Datatype::Float64 => ScalarValue::Float(f64::from_le_bytes(
                bytes.try_into().expect("length checked above"),
            )),
        };
        Ok(value)
    }

    /// Decodes a packed run of little-endian scalars of this type.
    pub fn decode_scalars(self, bytes: &[u8]) -> Result<Vec<ScalarValue>> {
        let size = self.size();
        if bytes.len() % size != 0 {
            return Err(ArrayError::Corruption(format!(
                "scalar run of {} bytes is not a multiple of {} ({})",
                bytes.len(),
                size,
                self.name()
            )));
        }
        bytes.chunks_exact(size).map(|c| self.decode_scalar(c)).collect()
    }
}

/// One decoded scalar, tagged by family.
///
/// Domains are homogeneous, so two values compared by the engine always
/// carry the same tag; the cross-tag ordering exists only to keep `Ord`
/// total. Floats order by `total_cmp`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum ScalarValue {
    /// Signed integer family.
    Int(i64),
    /// Unsigned integer family.
    UInt(u64),
    /// Floating-point family.
    Float(f64),
}

impl ScalarValue {
    fn tag_rank(&self) -> u8 {
        match self {
            ScalarValue::Int(_) => 0,
            ScalarValue::UInt(_) => 1,
            ScalarValue::Float(_) => 2,
        }
    }
}

impl PartialEq for ScalarValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScalarValue {}

impl PartialOrd for ScalarValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScalarValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ScalarValue::Int(a), ScalarValue::Int(b)) => a.cmp(b),
            (ScalarValue::UInt(a), ScalarValue::UInt(b)) => a.cmp(b),
            (ScalarValue::Float(a), ScalarValue::Float(b)) => a.total_cmp(b),
            _ => self.tag_rank().cmp(&other.tag_rank()),
        }
    }
}

impl std::fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScalarValue::Int(v) => write!(f, "{v}"),
            ScalarValue::UInt(v) => write!(f, "{v}"),
            ScalarValue::Float(v) => write!(f, "{v}"),
        }
    }
}

/// Cell ordering policy for query results and write buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Layout {
    /// Cells sorted by coordinates, first dimension varying slowest.
    RowMajor,
    /// Cells sorted by coordinates, last dimension varying slowest.
    ColMajor,
    /// Physical on-disk order of the fragments' global cell layout.
    GlobalOrder,
    /// No ordering guarantee.
    Unordered,
}

impl Layout {
    /// Short lowercase name used in error messages and logs.
    pub fn name(self) -> &'static str {
        match self {
            Layout::RowMajor => "row-major",
            Layout::ColMajor => "col-major",
            Layout::GlobalOrder => "global-order",
            Layout::Unordered => "unordered",
        }
    }
}

/// Compares two coordinate tuples in the given major order.
///
/// Row-major compares dimensions first-to-last, col-major last-to-first.
/// `GlobalOrder` and `Unordered` have no coordinate comparator; callers must
/// not ask for one.
pub fn coords_cmp(layout: Layout, a: &[ScalarValue], b: &[ScalarValue]) -> Ordering {
    debug_assert_eq!(a.len(), b.len());
    match layout {
        Layout::RowMajor => a.cmp(b),
        Layout::ColMajor => {
            for (x, y) in a.iter().rev().zip(b.iter().rev()) {
                let ord = x.cmp(y);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        }
        Layout::GlobalOrder | Layout::Unordered => Ordering::Equal,
    }
}
