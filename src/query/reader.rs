#![forbid(unsafe_code)]

//! Read-side query execution.
//!
//! The reader merges cells from every fragment overlapping the subarray into
//! the registered buffers, in the requested layout, without exceeding any
//! buffer's capacity. Cells at equal coordinates are surfaced from the most
//! recent fragment (last write wins). When a buffer would overflow, delivery
//! stops for all buffers at the last cell that fits everywhere and the read
//! reports incomplete; the next invocation resumes at the following cell.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::array::{ArraySchema, CellValNum, COORDS_NAME};
use crate::error::{ArrayError, Result};
use crate::query::buffer::{BufferRegistry, QueryBuffer};
use crate::query::subarray::Subarray;
use crate::storage::fragment::FragmentMetadata;
use crate::storage::tile::{decode_u64s, TileStore};
use crate::types::{CellCoords, Layout};

enum LoadedColumn {
    Fixed { data: Vec<u8>, cell_size: usize },
    Var { offsets: Vec<u64>, data: Vec<u8> },
}

struct LoadedFragment {
    coords: Vec<CellCoords>,
    coords_raw: Vec<u8>,
    columns: FxHashMap<String, LoadedColumn>,
}

#[derive(Clone, Copy)]
enum BindingKind {
    Coords { cell_size: u64 },
    Fixed { cell_size: u64 },
    Var,
}

struct BindingState {
    name: String,
    kind: BindingKind,
    cap: u64,
    cap_off: u64,
    used: u64,
    used_off: u64,
}

/// Read-side delegate of a query.
pub struct Reader {
    fragments: Vec<FragmentMetadata>,
    tiles: Arc<TileStore>,
    cancel: Arc<AtomicBool>,
    loaded: Vec<Option<LoadedFragment>>,
    /// `(fragment index, cell index)` pairs in emission order.
    plan: Vec<(usize, usize)>,
    cursor: usize,
    initialized: bool,
    incomplete: bool,
}

impl Reader {
    pub(crate) fn new(
        fragments: Vec<FragmentMetadata>,
        tiles: Arc<TileStore>,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            fragments,
            tiles,
            cancel,
            loaded: Vec::new(),
            plan: Vec::new(),
            cursor: 0,
            initialized: false,
            incomplete: false,
        }
    }

    /// Prepares iteration state from the subarray and layout.
    ///
    /// A second call without an intervening [`Reader::invalidate`] leaves
    /// the iteration state unchanged.
    pub fn init(&mut self, schema: &ArraySchema, subarray: &Subarray, layout: Layout) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        let coords_size = schema.coords_size();
        let dtype = schema.domain_type();
        self.loaded = Vec::with_capacity(self.fragments.len());

        // Newest fragment wins at equal coordinates; fragments are listed
        // oldest first, so later inserts shadow earlier ones.
        let mut winners: BTreeMap<CellCoords, (usize, usize)> = BTreeMap::new();
        for (fi, frag) in self.fragments.iter().enumerate() {
            if !subarray.intersects(&frag.non_empty_domain) {
                self.loaded.push(None);
                continue;
            }
            let coords_raw = self.tiles.read_column(&frag.name, frag.column(COORDS_NAME)?)?;
            if coords_raw.len() as u64 != frag.cell_num * coords_size as u64 {
                return Err(ArrayError::Corruption(format!(
                    "fragment '{}': coordinate column holds {} bytes for {} cells",
                    frag.name,
                    coords_raw.len(),
                    frag.cell_num
                )));
            }
            let mut coords = Vec::with_capacity(frag.cell_num as usize);
            for chunk in coords_raw.chunks_exact(coords_size) {
                let tuple: CellCoords = dtype
                    .decode_scalars(chunk)?
                    .into_iter()
                    .collect();
                coords.push(tuple);
            }
            for (ci, tuple) in coords.iter().enumerate() {
                if subarray.contains(tuple) {
                    winners.insert(tuple.clone(), (fi, ci));
                }
            }
            self.loaded.push(Some(LoadedFragment {
                coords,
                coords_raw,
                columns: FxHashMap::default(),
            }));
        }

        self.plan = match layout {
            Layout::RowMajor => winners.into_values().collect(),
            Layout::ColMajor => {
                let mut cells: Vec<(CellCoords, (usize, usize))> = winners.into_iter().collect();
                cells.sort_by(|(a, _), (b, _)| crate::types::coords_cmp(Layout::ColMajor, a, b));
                cells.into_iter().map(|(_, pos)| pos).collect()
            }
            Layout::GlobalOrder | Layout::Unordered => {
                let mut cells: Vec<(usize, usize)> = winners.into_values().collect();
                cells.sort_unstable();
                cells
            }
        };
        self.cursor = 0;
        self.incomplete = false;
        self.initialized = true;
        debug!(
            cells = self.plan.len(),
            fragments = self.fragments.len(),
            layout = layout.name(),
            "reader.init"
        );
        Ok(())
    }

    /// Drops prepared iteration state; the next [`Reader::init`] rebuilds it.
    pub fn invalidate(&mut self) {
        self.loaded.clear();
        self.plan.clear();
        self.cursor = 0;
        self.incomplete = false;
        self.initialized = false;
    }

    /// Streams the next run of matching cells into the registered buffers.
    pub fn read(&mut self, schema: &ArraySchema, buffers: &mut BufferRegistry) -> Result<()> {
        if !self.initialized {
            return Err(ArrayError::State(
                "cannot read; reader is not initialized".into(),
            ));
        }
        if buffers.is_empty() {
            return Err(ArrayError::Buffer("no buffers registered".into()));
        }
        let mut bindings = self.resolve_bindings(schema, buffers)?;

        let start = self.cursor;
        'cells: while self.cursor < self.plan.len() {
            if self.cancel.load(Ordering::Relaxed) {
                return Err(ArrayError::Cancelled);
            }
            let (fi, ci) = self.plan[self.cursor];
            for b in &bindings {
                if matches!(b.kind, BindingKind::Fixed { .. } | BindingKind::Var) {
                    self.ensure_loaded(schema, fi, &b.name)?;
                }
            }
            // Price the cell against every buffer before copying anything;
            // stopping here keeps all buffers on the same cell prefix.
            for b in &bindings {
                match b.kind {
                    BindingKind::Coords { cell_size } | BindingKind::Fixed { cell_size } => {
                        if b.used + cell_size > b.cap {
                            break 'cells;
                        }
                    }
                    BindingKind::Var => {
                        let len = self.var_cell_len(fi, ci, &b.name)? as u64;
                        if b.used_off + 8 > b.cap_off || b.used + len > b.cap {
                            break 'cells;
                        }
                    }
                }
            }
            for b in &mut bindings {
                let lf = self.loaded[fi].as_ref().ok_or_else(|| {
                    ArrayError::Corruption("planned cell references an unloaded fragment".into())
                })?;
                match b.kind {
                    BindingKind::Coords { cell_size } => {
                        let cs = cell_size as usize;
                        let src = &lf.coords_raw[ci * cs..(ci + 1) * cs];
                        copy_fixed(buffers, &b.name, b.used, src)?;
                        b.used += cell_size;
                    }
                    BindingKind::Fixed { cell_size } => {
                        let cs = cell_size as usize;
                        let column = lf.columns.get(&b.name).ok_or_else(|| {
                            ArrayError::Corruption("column vanished after load".into())
                        })?;
                        let data = match column {
                            LoadedColumn::Fixed { data, .. } => data,
                            LoadedColumn::Var { .. } => {
                                return Err(ArrayError::Corruption(
                                    "fixed binding resolved to a var column".into(),
                                ))
                            }
                        };
                        let src = &data[ci * cs..(ci + 1) * cs];
                        copy_fixed(buffers, &b.name, b.used, src)?;
                        b.used += cell_size;
                    }
                    BindingKind::Var => {
                        let column = lf.columns.get(&b.name).ok_or_else(|| {
                            ArrayError::Corruption("column vanished after load".into())
                        })?;
                        let (offsets, data) = match column {
                            LoadedColumn::Var { offsets, data } => (offsets, data),
                            LoadedColumn::Fixed { .. } => {
                                return Err(ArrayError::Corruption(
                                    "var binding resolved to a fixed column".into(),
                                ))
                            }
                        };
                        let lo = offsets[ci] as usize;
                        let hi = offsets
                            .get(ci + 1)
                            .map(|&o| o as usize)
                            .unwrap_or(data.len());
                        let src = &data[lo..hi];
                        copy_var(buffers, &b.name, b.used_off, b.used, src)?;
                        b.used_off += 8;
                        b.used += src.len() as u64;
                    }
                }
            }
            self.cursor += 1;
        }

        for b in &bindings {
            report_sizes(buffers, b)?;
        }
        self.incomplete = self.cursor < self.plan.len();
        debug!(
            produced = self.cursor - start,
            remaining = self.plan.len() - self.cursor,
            incomplete = self.incomplete,
            "reader.read"
        );
        Ok(())
    }

    /// True when nothing in the subarray matched any fragment.
    pub fn no_results(&self) -> bool {
        self.plan.is_empty()
    }

    /// True exactly when the last read stopped on buffer exhaustion.
    pub fn incomplete(&self) -> bool {
        self.incomplete
    }

    /// Number of fragments visible to this reader.
    pub fn fragment_num(&self) -> usize {
        self.fragments.len()
    }

    /// Fragment names, oldest first.
    pub fn fragment_uris(&self) -> Vec<String> {
        self.fragments.iter().map(|f| f.name.clone()).collect()
    }

    /// Most recent fragment name, if any.
    pub fn last_fragment_uri(&self) -> Option<&str> {
        self.fragments.last().map(|f| f.name.as_str())
    }

    fn resolve_bindings(
        &self,
        schema: &ArraySchema,
        buffers: &BufferRegistry,
    ) -> Result<Vec<BindingState>> {
        let mut bindings = Vec::new();
        for (name, buffer) in buffers.iter() {
            let (kind, cap, cap_off) = if name == COORDS_NAME {
                match buffer {
                    QueryBuffer::Fixed { data, .. } => (
                        BindingKind::Coords {
                            cell_size: schema.coords_size() as u64,
                        },
                        data.len() as u64,
                        0,
                    ),
                    QueryBuffer::Var { .. } => {
                        return Err(ArrayError::Buffer(
                            "coordinates take a fixed-size buffer".into(),
                        ))
                    }
                }
            } else {
                let attr = schema.attribute(name).ok_or_else(|| {
                    ArrayError::Buffer(format!("unknown attribute '{name}'"))
                })?;
                match (attr.cell_val_num, buffer) {
                    (CellValNum::Fixed(_), QueryBuffer::Fixed { data, .. }) => (
                        BindingKind::Fixed {
                            cell_size: attr.cell_size().unwrap_or(0) as u64,
                        },
                        data.len() as u64,
                        0,
                    ),
                    (CellValNum::Var, QueryBuffer::Var { offsets, data, .. }) => (
                        BindingKind::Var,
                        data.len() as u64,
                        (offsets.len() * 8) as u64,
                    ),
                    (CellValNum::Fixed(_), QueryBuffer::Var { .. }) => {
                        return Err(ArrayError::Buffer(format!(
                            "attribute '{name}' is fixed-size; a var buffer is bound"
                        )))
                    }
                    (CellValNum::Var, QueryBuffer::Fixed { .. }) => {
                        return Err(ArrayError::Buffer(format!(
                            "attribute '{name}' is variable-size; a fixed buffer is bound"
                        )))
                    }
                }
            };
            bindings.push(BindingState {
                name: name.to_string(),
                kind,
                cap,
                cap_off,
                used: 0,
                used_off: 0,
            });
        }
        Ok(bindings)
    }

    fn ensure_loaded(&mut self, schema: &ArraySchema, fi: usize, name: &str) -> Result<()> {
        let already = self.loaded[fi]
            .as_ref()
            .map(|lf| lf.columns.contains_key(name))
            .unwrap_or(false);
        if already {
            return Ok(());
        }
        let frag = &self.fragments[fi];
        let attr = schema
            .attribute(name)
            .ok_or_else(|| ArrayError::Buffer(format!("unknown attribute '{name}'")))?;
        let column = match attr.cell_val_num {
            CellValNum::Fixed(_) => {
                let cell_size = attr.cell_size().unwrap_or(0);
                let data = self.tiles.read_column(&frag.name, frag.column(name)?)?;
                if data.len() as u64 != frag.cell_num * cell_size as u64 {
                    return Err(ArrayError::Corruption(format!(
                        "fragment '{}': column '{}' holds {} bytes for {} cells",
                        frag.name,
                        name,
                        data.len(),
                        frag.cell_num
                    )));
                }
                LoadedColumn::Fixed { data, cell_size }
            }
            CellValNum::Var => {
                let off_raw = self
                    .tiles
                    .read_column(&frag.name, frag.column(&format!("{name}_off"))?)?;
                let offsets = decode_u64s(&off_raw)?;
                if offsets.len() as u64 != frag.cell_num {
                    return Err(ArrayError::Corruption(format!(
                        "fragment '{}': column '{}' holds {} offsets for {} cells",
                        frag.name,
                        name,
                        offsets.len(),
                        frag.cell_num
                    )));
                }
                let data = self
                    .tiles
                    .read_column(&frag.name, frag.column(&format!("{name}_var"))?)?;
                LoadedColumn::Var { offsets, data }
            }
        };
        let lf = self.loaded[fi].as_mut().ok_or_else(|| {
            ArrayError::Corruption("planned cell references an unloaded fragment".into())
        })?;
        lf.columns.insert(name.to_string(), column);
        Ok(())
    }

    fn var_cell_len(&self, fi: usize, ci: usize, name: &str) -> Result<usize> {
        let lf = self.loaded[fi].as_ref().ok_or_else(|| {
            ArrayError::Corruption("planned cell references an unloaded fragment".into())
        })?;
        match lf.columns.get(name) {
            Some(LoadedColumn::Var { offsets, data }) => {
                let lo = offsets[ci] as usize;
                let hi = offsets
                    .get(ci + 1)
                    .map(|&o| o as usize)
                    .unwrap_or(data.len());
                Ok(hi - lo)
            }
            _ => Err(ArrayError::Corruption(
                "var binding resolved to a missing or fixed column".into(),
            )),
        }
    }
}

fn copy_fixed(buffers: &mut BufferRegistry, name: &str, at: u64, src: &[u8]) -> Result<()> {
    match buffers.get_mut(name) {
        Some(QueryBuffer::Fixed { data, .. }) => {
            let at = at as usize;
            data[at..at + src.len()].copy_from_slice(src);
            Ok(())
        }
        _ => Err(ArrayError::Buffer(format!(
            "fixed buffer for '{name}' disappeared mid-read"
        ))),
    }
}

fn copy_var(
    buffers: &mut BufferRegistry,
    name: &str,
    at_off: u64,
    at_val: u64,
    src: &[u8],
) -> Result<()> {
    match buffers.get_mut(name) {
        Some(QueryBuffer::Var { offsets, data, .. }) => {
            offsets[(at_off / 8) as usize] = at_val;
            let at = at_val as usize;
            data[at..at + src.len()].copy_from_slice(src);
            Ok(())
        }
        _ => Err(ArrayError::Buffer(format!(
            "var buffer for '{name}' disappeared mid-read"
        ))),
    }
}

fn report_sizes(buffers: &mut BufferRegistry, b: &BindingState) -> Result<()> {
    match buffers.get_mut(&b.name) {
        Some(QueryBuffer::Fixed { size, .. }) => {
            *size = b.used;
            Ok(())
        }
        Some(QueryBuffer::Var {
            offsets_size, size, ..
        }) => {
            *offsets_size = b.used_off;
            *size = b.used;
            Ok(())
        }
        None => Err(ArrayError::Buffer(format!(
            "buffer for '{}' disappeared mid-read",
            b.name
        ))),
    }
}
