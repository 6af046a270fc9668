#![forbid(unsafe_code)]

//! Array schema: dimensions, attributes, and cell layout defaults.
//!
//! A schema is immutable once the array is created; queries borrow it
//! read-only. The domain type is homogeneous across all dimensions.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{ArrayError, Result};
use crate::types::{Datatype, Layout, ScalarValue};

/// Reserved buffer name addressing the coordinates column.
pub const COORDS_NAME: &str = "__coords";

/// File holding the persisted schema document inside the array directory.
pub const SCHEMA_FILE: &str = "__array_schema.json";

/// Compression codec applied to a persisted attribute column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compressor {
    /// Bytes stored as-is.
    None,
    /// Snappy block compression.
    Snappy,
}

/// Number of values one cell holds for an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellValNum {
    /// Exactly this many values per cell.
    Fixed(u32),
    /// Variable number of values per cell, addressed through an offsets buffer.
    Var,
}

/// One array dimension with its inclusive domain bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dimension {
    /// Dimension name, unique within the schema.
    pub name: String,
    /// Inclusive lower bound.
    pub domain_lo: ScalarValue,
    /// Inclusive upper bound.
    pub domain_hi: ScalarValue,
}

/// One array attribute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attribute {
    /// Attribute name, unique within the schema.
    pub name: String,
    /// Value datatype.
    pub datatype: Datatype,
    /// Fixed or variable cell value count.
    pub cell_val_num: CellValNum,
    /// Codec for the persisted column.
    pub compressor: Compressor,
}

impl Attribute {
    /// Fixed-size attribute holding one value per cell.
    pub fn fixed(name: impl Into<String>, datatype: Datatype) -> Self {
        Self {
            name: name.into(),
            datatype,
            cell_val_num: CellValNum::Fixed(1),
            compressor: Compressor::None,
        }
    }

    /// Variable-length attribute.
    pub fn var(name: impl Into<String>, datatype: Datatype) -> Self {
        Self {
            name: name.into(),
            datatype,
            cell_val_num: CellValNum::Var,
            compressor: Compressor::None,
        }
    }

    /// Sets the column compressor.
    pub fn with_compressor(mut self, compressor: Compressor) -> Self {
        self.compressor = compressor;
        self
    }

    /// Whether the attribute is variable-length.
    pub fn is_var(&self) -> bool {
        matches!(self.cell_val_num, CellValNum::Var)
    }

    /// Bytes one cell occupies in a fixed-size column.
    ///
    /// Returns `None` for variable-length attributes.
    pub fn cell_size(&self) -> Option<usize> {
        match self.cell_val_num {
            CellValNum::Fixed(n) => Some(n as usize * self.datatype.size()),
            CellValNum::Var => None,
        }
    }
}

/// Immutable description of an array: domain, dimensions, attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArraySchema {
    domain_type: Datatype,
    cell_order: Layout,
    dimensions: Vec<Dimension>,
    attributes: Vec<Attribute>,
}

impl ArraySchema {
    /// Starts building a schema over the given domain datatype.
    pub fn build(domain_type: Datatype) -> ArraySchemaBuilder {
        ArraySchemaBuilder {
            domain_type,
            cell_order: Layout::RowMajor,
            dimensions: Vec::new(),
            attributes: Vec::new(),
        }
    }

    /// The homogeneous datatype of every dimension.
    pub fn domain_type(&self) -> Datatype {
        self.domain_type
    }

    /// Default physical cell order for fragments of this array.
    pub fn cell_order(&self) -> Layout {
        self.cell_order
    }

    /// Dimensions in declaration order.
    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    /// Attributes in declaration order.
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Number of dimensions.
    pub fn dim_num(&self) -> usize {
        self.dimensions.len()
    }

    /// Looks up an attribute by name.
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Bytes one coordinate tuple occupies.
    pub fn coords_size(&self) -> usize {
        self.dim_num() * self.domain_type.size()
    }

    /// Serializes the schema document.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| ArrayError::Serialization(format!("schema encode: {e}")))
    }

    /// Deserializes a schema document.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let schema: ArraySchema = serde_json::from_slice(bytes)
            .map_err(|e| ArrayError::Serialization(format!("schema decode: {e}")))?;
        schema.check()?;
        Ok(schema)
    }

    fn check(&self) -> Result<()> {
        if !self.domain_type.is_valid_domain_type() {
            return Err(ArrayError::Schema(format!(
                "datatype '{}' cannot type an array domain",
                self.domain_type.name()
            )));
        }
        if self.dimensions.is_empty() {
            return Err(ArrayError::Schema(
                "schema needs at least one dimension".into(),
            ));
        }
        let mut names = HashSet::new();
        for dim in &self.dimensions {
            if dim.name.is_empty() || dim.name.starts_with("__") {
                return Err(ArrayError::Schema(format!(
                    "invalid dimension name '{}'",
                    dim.name
                )));
            }
            if !names.insert(dim.name.as_str()) {
                return Err(ArrayError::Schema(format!(
                    "duplicate name '{}'",
                    dim.name
                )));
            }
            if dim.domain_lo > dim.domain_hi {
                return Err(ArrayError::Schema(format!(
                    "dimension '{}': domain lower bound {} exceeds upper bound {}",
                    dim.name, dim.domain_lo, dim.domain_hi
                )));
            }
        }
        for attr in &self.attributes {
            if attr.name.is_empty() || attr.name.starts_with("__") {
                return Err(ArrayError::Schema(format!(
                    "invalid attribute name '{}'",
                    attr.name
                )));
            }
            if !names.insert(attr.name.as_str()) {
                return Err(ArrayError::Schema(format!(
                    "duplicate name '{}'",
                    attr.name
                )));
            }
            if let CellValNum::Fixed(0) = attr.cell_val_num {
                return Err(ArrayError::Schema(format!(
                    "attribute '{}': fixed cell value count must be at least 1",
                    attr.name
                )));
            }
        }
        Ok(())
    }
}

/// Builder for [`ArraySchema`].
pub struct ArraySchemaBuilder {
    domain_type: Datatype,
    cell_order: Layout,
    dimensions: Vec<Dimension>,
    attributes: Vec<Attribute>,
}

impl ArraySchemaBuilder {
    /// Adds a dimension with inclusive bounds.
    pub fn dimension(
        mut self,
        name: impl Into<String>,
        lo: ScalarValue,
        hi: ScalarValue,
    ) -> Self {
        self.dimensions.push(Dimension {
            name: name.into(),
            domain_lo: lo,
            domain_hi: hi,
        });
        self
    }

    /// Adds an attribute.
    pub fn attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Sets the physical cell order for fragments.
    pub fn cell_order(mut self, layout: Layout) -> Self {
        self.cell_order = layout;
        self
    }

    /// Validates and finishes the schema.
    pub fn finish(self) -> Result<ArraySchema> {
        let schema = ArraySchema {
            domain_type: self.domain_type,
            cell_order: self.cell_order,
            dimensions: self.dimensions,
            attributes: self.attributes,
        };
        schema.check()?;
        Ok(schema)
    }
}
