#![forbid(unsafe_code)]

//! Subarray bounds and their validation.
//!
//! A subarray arrives as a type-erased buffer of `2 × dim_num` scalars of
//! the domain's datatype, `[lo0, hi0, lo1, hi1, …]`. Validation happens
//! before the query stores it, so an invalid subarray is never observable in
//! query state.

use crate::array::ArraySchema;
use crate::error::{ArrayError, Result};
use crate::types::ScalarValue;

/// A validated hyper-rectangular region of the array's domain.
#[derive(Debug, Clone)]
pub struct Subarray {
    ranges: Vec<(ScalarValue, ScalarValue)>,
}

impl Subarray {
    /// Decodes and validates a raw subarray buffer against the schema.
    ///
    /// The domain datatype selects the typed decode path; the first
    /// dimension violating `lo ≤ hi` or the domain bounds fails the whole
    /// call, and nothing is produced.
    pub fn validate(schema: &ArraySchema, raw: &[u8]) -> Result<Self> {
        let dtype = schema.domain_type();
        if !dtype.is_valid_domain_type() {
            return Err(ArrayError::Schema(format!(
                "domain type '{}' does not support subarrays",
                dtype.name()
            )));
        }
        let scalar = dtype.size();
        let expected = 2 * schema.dim_num() * scalar;
        if raw.len() != expected {
            return Err(ArrayError::Subarray(format!(
                "subarray buffer is {} bytes, expected {}",
                raw.len(),
                expected
            )));
        }
        let mut ranges = Vec::with_capacity(schema.dim_num());
        for (i, dim) in schema.dimensions().iter().enumerate() {
            let base = 2 * i * scalar;
            let lo = dtype.decode_scalar(&raw[base..base + scalar])?;
            let hi = dtype.decode_scalar(&raw[base + scalar..base + 2 * scalar])?;
            if lo > hi {
                return Err(ArrayError::Subarray(format!(
                    "dimension {i} ('{}'): lower bound {lo} exceeds upper bound {hi}",
                    dim.name
                )));
            }
            if lo < dim.domain_lo || hi > dim.domain_hi {
                return Err(ArrayError::Subarray(format!(
                    "dimension {i} ('{}'): range [{lo}, {hi}] outside domain [{}, {}]",
                    dim.name, dim.domain_lo, dim.domain_hi
                )));
            }
            ranges.push((lo, hi));
        }
        Ok(Self { ranges })
    }

    /// The whole-domain subarray, used when the caller sets none.
    pub fn whole_domain(schema: &ArraySchema) -> Self {
        Self {
            ranges: schema
                .dimensions()
                .iter()
                .map(|d| (d.domain_lo, d.domain_hi))
                .collect(),
        }
    }

    /// Per-dimension inclusive bounds.
    pub fn ranges(&self) -> &[(ScalarValue, ScalarValue)] {
        &self.ranges
    }

    /// Whether the coordinate tuple lies inside the region.
    pub fn contains(&self, coords: &[ScalarValue]) -> bool {
        debug_assert_eq!(coords.len(), self.ranges.len());
        coords
            .iter()
            .zip(&self.ranges)
            .all(|(c, (lo, hi))| c >= lo && c <= hi)
    }

    /// Whether the region overlaps the given per-dimension bounds.
    pub fn intersects(&self, other: &[(ScalarValue, ScalarValue)]) -> bool {
        self.ranges
            .iter()
            .zip(other)
            .all(|((lo, hi), (olo, ohi))| lo <= ohi && olo <= hi)
    }
}
