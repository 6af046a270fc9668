#![forbid(unsafe_code)]

//! Write-side query execution.
//!
//! A write session validates the caller's cell buffers, stages cells for one
//! new fragment, and commits the fragment at finalize. Each `write` call is
//! all-or-nothing: no validation failure leaves a partial stage, and no
//! bytes reach storage before finalize writes the columns and the metadata
//! footer (the commit point) last.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::array::{ArraySchema, Attribute, CellValNum, Compressor, COORDS_NAME};
use crate::error::{ArrayError, Result};
use crate::query::buffer::{validate_var_offsets, BufferRegistry, QueryBuffer};
use crate::query::subarray::Subarray;
use crate::storage::fragment::{self, FragmentMetadata};
use crate::storage::tile::{encode_u64s, TileStore};
use crate::types::{coords_cmp, CellCoords, Layout, ScalarValue};

enum CellValue {
    Fixed(Vec<u8>),
    Var(Vec<u8>),
}

struct WriteCell {
    coords: CellCoords,
    coords_raw: Vec<u8>,
    /// One entry per schema attribute, in declaration order.
    values: Vec<CellValue>,
}

/// Write-side delegate of a query.
pub struct Writer {
    tiles: Arc<TileStore>,
    cancel: Arc<AtomicBool>,
    fragment_name: Option<String>,
    cells: Vec<WriteCell>,
    initialized: bool,
    finalized: bool,
}

impl Writer {
    pub(crate) fn new(tiles: Arc<TileStore>, cancel: Arc<AtomicBool>) -> Self {
        Self {
            tiles,
            cancel,
            fragment_name: None,
            cells: Vec::new(),
            initialized: false,
            finalized: false,
        }
    }

    /// Establishes the destination fragment name.
    pub fn init(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        if self.fragment_name.is_none() {
            self.fragment_name = Some(fragment::generate_name());
        }
        self.initialized = true;
        Ok(())
    }

    /// Drops layout-dependent preparation; staged cells survive.
    pub fn invalidate(&mut self) {
        self.initialized = false;
    }

    /// Overrides the generated fragment name.
    pub fn set_fragment_uri(&mut self, name: String) {
        self.fragment_name = Some(name);
    }

    /// Destination fragment name, once established.
    pub fn fragment_uri(&self) -> Option<&str> {
        self.fragment_name.as_deref()
    }

    /// Validates the registered buffers and stages their cells.
    pub fn write(
        &mut self,
        schema: &ArraySchema,
        region: &Subarray,
        buffers: &BufferRegistry,
    ) -> Result<()> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(ArrayError::Cancelled);
        }
        let coords_size = schema.coords_size();
        let coords = match buffers.get(COORDS_NAME) {
            Some(QueryBuffer::Fixed { data, .. }) => data,
            Some(QueryBuffer::Var { .. }) => {
                return Err(ArrayError::Buffer(
                    "coordinates take a fixed-size buffer".into(),
                ))
            }
            None => {
                return Err(ArrayError::Buffer(format!(
                    "writes need a '{COORDS_NAME}' buffer"
                )))
            }
        };
        if coords.len() % coords_size != 0 {
            return Err(ArrayError::Buffer(format!(
                "coordinate buffer of {} bytes holds a partial tuple (tuple is {coords_size} bytes)",
                coords.len()
            )));
        }
        let cell_num = coords.len() / coords_size;

        for (name, _) in buffers.iter() {
            if name != COORDS_NAME && schema.attribute(name).is_none() {
                return Err(ArrayError::Buffer(format!("unknown attribute '{name}'")));
            }
        }

        // Validate every attribute column before staging a single cell.
        for attr in schema.attributes() {
            let buffer = buffers.get(&attr.name).ok_or_else(|| {
                ArrayError::Buffer(format!("no buffer set for attribute '{}'", attr.name))
            })?;
            match (attr.cell_val_num, buffer) {
                (CellValNum::Fixed(_), QueryBuffer::Fixed { data, .. }) => {
                    let cell_size = attr.cell_size().unwrap_or(0);
                    if data.len() % cell_size != 0 || data.len() / cell_size != cell_num {
                        return Err(ArrayError::Buffer(format!(
                            "attribute '{}': buffer of {} bytes does not hold {cell_num} cells of {cell_size} bytes",
                            attr.name,
                            data.len()
                        )));
                    }
                }
                (CellValNum::Var, QueryBuffer::Var { offsets, data, .. }) => {
                    let offsets_size = (offsets.len() * 8) as u64;
                    validate_var_offsets(offsets, offsets_size, data.len() as u64)?;
                    if offsets.len() != cell_num {
                        return Err(ArrayError::Buffer(format!(
                            "attribute '{}': {} offsets for {cell_num} cells",
                            attr.name,
                            offsets.len()
                        )));
                    }
                }
                (CellValNum::Fixed(_), QueryBuffer::Var { .. }) => {
                    return Err(ArrayError::Buffer(format!(
                        "attribute '{}' is fixed-size; a var buffer is bound",
                        attr.name
                    )))
                }
                (CellValNum::Var, QueryBuffer::Fixed { .. }) => {
                    return Err(ArrayError::Buffer(format!(
                        "attribute '{}' is variable-size; a fixed buffer is bound",
                        attr.name
                    )))
                }
            }
        }

        let dtype = schema.domain_type();
        let mut staged = Vec::with_capacity(cell_num);
        for ci in 0..cell_num {
            if self.cancel.load(Ordering::Relaxed) {
                return Err(ArrayError::Cancelled);
            }
            let raw = &coords[ci * coords_size..(ci + 1) * coords_size];
            let tuple: CellCoords = dtype.decode_scalars(raw)?.into_iter().collect();
            if !region.contains(&tuple) {
                return Err(ArrayError::Subarray(format!(
                    "cell {ci}: coordinates outside the write region"
                )));
            }
            let mut values = Vec::with_capacity(schema.attributes().len());
            for attr in schema.attributes() {
                let value = match buffers.get(&attr.name) {
                    Some(QueryBuffer::Fixed { data, .. }) => {
                        let cs = attr.cell_size().unwrap_or(0);
                        CellValue::Fixed(data[ci * cs..(ci + 1) * cs].to_vec())
                    }
                    Some(QueryBuffer::Var { offsets, data, .. }) => {
                        let lo = offsets[ci] as usize;
                        let hi = offsets
                            .get(ci + 1)
                            .map(|&o| o as usize)
                            .unwrap_or(data.len());
                        CellValue::Var(data[lo..hi].to_vec())
                    }
                    None => {
                        return Err(ArrayError::Buffer(format!(
                            "buffer for '{}' disappeared mid-write",
                            attr.name
                        )))
                    }
                };
                values.push(value);
            }
            staged.push(WriteCell {
                coords: tuple,
                coords_raw: raw.to_vec(),
                values,
            });
        }

        self.cells.extend(staged);
        debug!(
            cells = cell_num,
            staged = self.cells.len(),
            "writer.write"
        );
        Ok(())
    }

    /// Flushes staged cells and the metadata footer, committing the fragment.
    ///
    /// Idempotent once committed; a session that staged no cells commits
    /// nothing.
    pub fn finalize(&mut self, schema: &ArraySchema, layout: Layout) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        if self.cells.is_empty() {
            self.finalized = true;
            return Ok(());
        }
        let name = match self.fragment_name.take() {
            Some(name) => name,
            None => fragment::generate_name(),
        };

        // Global order trusts the caller's physical ordering; every other
        // layout is sorted into the array's cell order before flushing.
        if layout != Layout::GlobalOrder {
            let order = match schema.cell_order() {
                Layout::ColMajor => Layout::ColMajor,
                _ => Layout::RowMajor,
            };
            self.cells
                .sort_by(|a, b| coords_cmp(order, &a.coords, &b.coords));
        }

        let non_empty_domain = self.non_empty_domain(schema);
        let mut columns = BTreeMap::new();

        let mut coords_raw = Vec::with_capacity(self.cells.len() * schema.coords_size());
        for cell in &self.cells {
            coords_raw.extend_from_slice(&cell.coords_raw);
        }
        self.tiles.create_fragment_dir(&name)?;
        columns.insert(
            COORDS_NAME.to_string(),
            self.tiles
                .write_column(&name, COORDS_NAME, Compressor::None, &coords_raw)?,
        );

        for (ai, attr) in schema.attributes().iter().enumerate() {
            self.flush_attribute(&name, ai, attr, &mut columns)?;
        }

        let meta = FragmentMetadata {
            timestamp: fragment::parse_timestamp(&name).unwrap_or_default(),
            name,
            cell_num: self.cells.len() as u64,
            non_empty_domain,
            columns,
        };
        self.tiles.commit_fragment(&meta)?;
        debug!(
            fragment = %meta.name,
            cell_num = meta.cell_num,
            "writer.finalize.commit"
        );
        self.fragment_name = Some(meta.name);
        self.cells.clear();
        self.finalized = true;
        Ok(())
    }

    fn flush_attribute(
        &self,
        fragment: &str,
        ai: usize,
        attr: &Attribute,
        columns: &mut BTreeMap<String, crate::storage::fragment::ColumnMeta>,
    ) -> Result<()> {
        match attr.cell_val_num {
            CellValNum::Fixed(_) => {
                let mut data = Vec::new();
                for cell in &self.cells {
                    match &cell.values[ai] {
                        CellValue::Fixed(bytes) => data.extend_from_slice(bytes),
                        CellValue::Var(_) => {
                            return Err(ArrayError::Corruption(
                                "staged var value under a fixed attribute".into(),
                            ))
                        }
                    }
                }
                columns.insert(
                    attr.name.clone(),
                    self.tiles
                        .write_column(fragment, &attr.name, attr.compressor, &data)?,
                );
            }
            CellValNum::Var => {
                let mut offsets = Vec::with_capacity(self.cells.len());
                let mut data = Vec::new();
                for cell in &self.cells {
                    match &cell.values[ai] {
                        CellValue::Var(bytes) => {
                            offsets.push(data.len() as u64);
                            data.extend_from_slice(bytes);
                        }
                        CellValue::Fixed(_) => {
                            return Err(ArrayError::Corruption(
                                "staged fixed value under a var attribute".into(),
                            ))
                        }
                    }
                }
                let off_stem = format!("{}_off", attr.name);
                columns.insert(
                    off_stem.clone(),
                    self.tiles.write_column(
                        fragment,
                        &off_stem,
                        attr.compressor,
                        &encode_u64s(&offsets),
                    )?,
                );
                let var_stem = format!("{}_var", attr.name);
                columns.insert(
                    var_stem.clone(),
                    self.tiles
                        .write_column(fragment, &var_stem, attr.compressor, &data)?,
                );
            }
        }
        Ok(())
    }

    fn non_empty_domain(&self, schema: &ArraySchema) -> Vec<(ScalarValue, ScalarValue)> {
        let mut bounds: Vec<(ScalarValue, ScalarValue)> = Vec::new();
        for cell in &self.cells {
            if bounds.is_empty() {
                bounds = cell.coords.iter().map(|c| (*c, *c)).collect();
                continue;
            }
            for (d, c) in cell.coords.iter().enumerate() {
                if *c < bounds[d].0 {
                    bounds[d].0 = *c;
                }
                if *c > bounds[d].1 {
                    bounds[d].1 = *c;
                }
            }
        }
        debug_assert_eq!(bounds.len(), schema.dim_num());
        bounds
    }
}
