#![forbid(unsafe_code)]

//! Query orchestration.
//!
//! A [`Query`] is the single entry point callers use: a state machine
//! wrapping exactly one [`Reader`] or one [`Writer`], owning the subarray,
//! the buffer registry, the layout, and the completion callback. A query is
//! bound to one schema and (for reads) one committed fragment list at
//! construction.
//!
//! One query instance is not designed for concurrent use; calls on the same
//! instance must be externally serialized. The one sanctioned race is
//! cancellation: a [`CancelToken`] may interrupt an in-flight `process`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::array::{ArraySchema, CellValNum, COORDS_NAME};
use crate::error::{ArrayError, Result};
use crate::storage::fragment::{self, FragmentMetadata};
use crate::storage::tile::TileStore;
use crate::types::Layout;

/// Caller buffer registry and offset validation.
pub mod buffer;

/// Read-side execution.
pub mod reader;

/// Subarray bounds and validation.
pub mod subarray;

/// Write-side execution.
pub mod writer;

pub use buffer::{validate_var_offsets, BufferRegistry, QueryBuffer};
pub use reader::Reader;
pub use subarray::Subarray;
pub use writer::Writer;

/// Lifecycle status of a query.
///
/// `Incomplete` is re-enterable through `process`; `Completed` and `Failed`
/// are terminal, except that replacing the subarray returns a completed
/// query to `Uninitialized` for reuse. A failed query stays failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// Constructed or reset; `init` has not run.
    Uninitialized,
    /// `init` ran; processing may proceed.
    InProgress,
    /// All matching cells were produced or persisted.
    Completed,
    /// The last read filled the buffers before exhausting matching cells.
    Incomplete,
    /// A delegate failed or the query was cancelled.
    Failed,
}

/// Whether a query reads or writes. Immutable after construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    /// Merges fragment cells into caller buffers.
    Read,
    /// Persists caller buffers as one new fragment.
    Write,
}

enum QueryState {
    Read(Reader),
    Write(Writer),
}

/// Handle for cancelling a query from another thread.
///
/// Cancellation is observed between cells by an in-flight `process`, which
/// then fails with [`ArrayError::Cancelled`] and never fires the completion
/// callback.
#[derive(Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

type Callback = Box<dyn FnMut() + Send>;

/// One read or write session over an array.
pub struct Query {
    schema: Arc<ArraySchema>,
    state: QueryState,
    status: QueryStatus,
    layout: Layout,
    subarray: Option<Subarray>,
    buffers: BufferRegistry,
    callback: Option<Callback>,
    cancelled: Arc<AtomicBool>,
}

impl Query {
    pub(crate) fn new_read(
        schema: Arc<ArraySchema>,
        fragments: Vec<FragmentMetadata>,
        tiles: Arc<TileStore>,
    ) -> Self {
        let cancelled = Arc::new(AtomicBool::new(false));
        let layout = schema.cell_order();
        Self {
            schema,
            state: QueryState::Read(Reader::new(fragments, tiles, cancelled.clone())),
            status: QueryStatus::Uninitialized,
            layout,
            subarray: None,
            buffers: BufferRegistry::default(),
            callback: None,
            cancelled,
        }
    }

    pub(crate) fn new_write(schema: Arc<ArraySchema>, tiles: Arc<TileStore>) -> Self {
        let cancelled = Arc::new(AtomicBool::new(false));
        let layout = schema.cell_order();
        Self {
            schema,
            state: QueryState::Write(Writer::new(tiles, cancelled.clone())),
            status: QueryStatus::Uninitialized,
            layout,
            subarray: None,
            buffers: BufferRegistry::default(),
            callback: None,
            cancelled,
        }
    }

    /// Current status.
    pub fn status(&self) -> QueryStatus {
        self.status
    }

    /// Read or write, fixed at construction.
    pub fn query_type(&self) -> QueryType {
        match self.state {
            QueryState::Read(_) => QueryType::Read,
            QueryState::Write(_) => QueryType::Write,
        }
    }

    /// Current cell layout.
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Sets the cell layout.
    ///
    /// Changing the layout invalidates prepared iteration state, so the
    /// query drops back to `Uninitialized`.
    pub fn set_layout(&mut self, layout: Layout) -> Result<()> {
        self.fail_if_failed("set layout")?;
        self.layout = layout;
        self.invalidate();
        Ok(())
    }

    /// Validates and replaces the subarray.
    ///
    /// Validation runs before any state changes, so an invalid subarray is
    /// never observable. On success the query drops back to `Uninitialized`:
    /// replacing the subarray invalidates iteration state prepared by
    /// `init`. Buffers and layout remain attached.
    pub fn set_subarray(&mut self, raw: &[u8]) -> Result<()> {
        self.fail_if_failed("set subarray")?;
        let subarray = Subarray::validate(&self.schema, raw)?;
        self.subarray = Some(subarray);
        self.invalidate();
        Ok(())
    }

    /// Registers or replaces a fixed-size buffer for an attribute or for
    /// the coordinates (`__coords`).
    pub fn set_buffer(&mut self, name: &str, data: Vec<u8>) -> Result<()> {
        self.fail_if_failed("set buffer")?;
        if name != COORDS_NAME {
            let attr = self
                .schema
                .attribute(name)
                .ok_or_else(|| ArrayError::Buffer(format!("unknown attribute '{name}'")))?;
            if let CellValNum::Var = attr.cell_val_num {
                return Err(ArrayError::Buffer(format!(
                    "attribute '{name}' is variable-size; use set_buffer_var"
                )));
            }
        }
        self.buffers.set_fixed(name, data);
        Ok(())
    }

    /// Registers or replaces a variable-size buffer pair for an attribute.
    pub fn set_buffer_var(
        &mut self,
        name: &str,
        offsets: Vec<u64>,
        data: Vec<u8>,
    ) -> Result<()> {
        self.fail_if_failed("set buffer")?;
        let attr = self
            .schema
            .attribute(name)
            .ok_or_else(|| ArrayError::Buffer(format!("unknown attribute '{name}'")))?;
        if !attr.is_var() {
            return Err(ArrayError::Buffer(format!(
                "attribute '{name}' is fixed-size; use set_buffer"
            )));
        }
        self.buffers.set_var(name, offsets, data);
        Ok(())
    }

    /// Overrides the destination fragment name. Write queries only.
    ///
    /// The name must follow the `__<timestamp_millis>_<suffix>` fragment
    /// naming convention; listing orders fragments by the embedded timestamp,
    /// so a fragment committed under any other name would never be
    /// discoverable.
    pub fn set_fragment_uri(&mut self, name: impl Into<String>) -> Result<()> {
        match &mut self.state {
            QueryState::Write(w) => {
                let name = name.into();
                if fragment::parse_timestamp(&name).is_none() {
                    return Err(ArrayError::Schema(format!(
                        "fragment name '{name}' does not follow '__<timestamp_millis>_<suffix>'"
                    )));
                }
                w.set_fragment_uri(name);
                Ok(())
            }
            QueryState::Read(_) => Err(ArrayError::State(
                "cannot set a fragment URI on a read query".into(),
            )),
        }
    }

    /// Registers a callback fired once, synchronously, when the query
    /// completes.
    pub fn set_callback(&mut self, callback: impl FnMut() + Send + 'static) {
        self.callback = Some(Box::new(callback));
    }

    /// Prepares the delegate. Only has effect from `Uninitialized`; always
    /// leaves the status `InProgress`.
    pub fn init(&mut self) -> Result<()> {
        self.fail_if_failed("initialize")?;
        if self.status == QueryStatus::Uninitialized {
            let region = self.effective_subarray();
            match &mut self.state {
                QueryState::Read(r) => r.init(&self.schema, &region, self.layout)?,
                QueryState::Write(w) => w.init()?,
            }
        }
        self.status = QueryStatus::InProgress;
        Ok(())
    }

    /// Runs one read or write pass.
    ///
    /// On delegate failure the query transitions to `Failed` and the error
    /// surfaces untouched. A write pass always completes; a read pass
    /// completes only when the buffers held every matching cell, and
    /// otherwise reports `Incomplete` for the caller to drain and resume.
    pub fn process(&mut self) -> Result<()> {
        match self.status {
            QueryStatus::Uninitialized => {
                return Err(ArrayError::State(
                    "cannot process query; query is not initialized".into(),
                ))
            }
            QueryStatus::Failed => {
                return Err(ArrayError::State(
                    "cannot process query; query has failed".into(),
                ))
            }
            QueryStatus::Completed => {
                return Err(ArrayError::State(
                    "cannot process query; query already completed".into(),
                ))
            }
            QueryStatus::InProgress | QueryStatus::Incomplete => {}
        }
        self.status = QueryStatus::InProgress;

        let region = self.effective_subarray();
        let result = match &mut self.state {
            QueryState::Read(r) => r.read(&self.schema, &mut self.buffers),
            QueryState::Write(w) => w.write(&self.schema, &region, &self.buffers),
        };
        if let Err(err) = result {
            self.status = QueryStatus::Failed;
            return Err(err);
        }
        if self.cancelled.load(Ordering::Relaxed) {
            self.status = QueryStatus::Failed;
            return Err(ArrayError::Cancelled);
        }

        let completed = match &self.state {
            QueryState::Write(_) => true,
            QueryState::Read(r) => !r.incomplete(),
        };
        if completed {
            self.status = QueryStatus::Completed;
            if let Some(mut callback) = self.callback.take() {
                callback();
            }
        } else {
            self.status = QueryStatus::Incomplete;
        }
        debug!(status = ?self.status, "query.process");
        Ok(())
    }

    /// Completes the session.
    ///
    /// A no-op success on an uninitialized query; otherwise commits the
    /// writer's fragment (readers have nothing to finalize) and marks the
    /// query `Completed`.
    pub fn finalize(&mut self) -> Result<()> {
        if self.status == QueryStatus::Uninitialized {
            return Ok(());
        }
        self.fail_if_failed("finalize")?;
        if let QueryState::Write(w) = &mut self.state {
            w.finalize(&self.schema, self.layout)?;
        }
        self.status = QueryStatus::Completed;
        Ok(())
    }

    /// Forces the query into `Failed`, from any state.
    pub fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::Relaxed);
        self.status = QueryStatus::Failed;
    }

    /// Token for cancelling this query from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        CancelToken(self.cancelled.clone())
    }

    /// Whether the last processed read produced any results.
    pub fn has_results(&self) -> bool {
        match &self.state {
            QueryState::Read(r) => self.status != QueryStatus::Uninitialized && !r.no_results(),
            QueryState::Write(_) => false,
        }
    }

    /// Number of fragments visible to a read query; zero for writes.
    pub fn fragment_num(&self) -> usize {
        match &self.state {
            QueryState::Read(r) => r.fragment_num(),
            QueryState::Write(_) => 0,
        }
    }

    /// Fragment names visible to a read query, oldest first.
    pub fn fragment_uris(&self) -> Vec<String> {
        match &self.state {
            QueryState::Read(r) => r.fragment_uris(),
            QueryState::Write(_) => Vec::new(),
        }
    }

    /// Most recent fragment name visible to a read query.
    pub fn last_fragment_uri(&self) -> Option<&str> {
        match &self.state {
            QueryState::Read(r) => r.last_fragment_uri(),
            QueryState::Write(_) => None,
        }
    }

    /// Bytes produced into a fixed-size buffer by the last pass.
    pub fn buffer(&self, name: &str) -> Option<&[u8]> {
        match self.buffers.get(name) {
            Some(QueryBuffer::Fixed { data, size }) => Some(&data[..*size as usize]),
            _ => None,
        }
    }

    /// Offsets and values produced into a variable-size buffer pair by the
    /// last pass.
    pub fn buffer_var(&self, name: &str) -> Option<(&[u64], &[u8])> {
        match self.buffers.get(name) {
            Some(QueryBuffer::Var {
                offsets,
                offsets_size,
                data,
                size,
            }) => Some((
                &offsets[..(*offsets_size / 8) as usize],
                &data[..*size as usize],
            )),
            _ => None,
        }
    }

    fn effective_subarray(&self) -> Subarray {
        self.subarray
            .clone()
            .unwrap_or_else(|| Subarray::whole_domain(&self.schema))
    }

    fn invalidate(&mut self) {
        match &mut self.state {
            QueryState::Read(r) => r.invalidate(),
            QueryState::Write(w) => w.invalidate(),
        }
        self.status = QueryStatus::Uninitialized;
    }

    fn fail_if_failed(&self, what: &str) -> Result<()> {
        if self.status == QueryStatus::Failed {
            return Err(ArrayError::State(format!(
                "cannot {what}; query has failed"
            )));
        }
        Ok(())
    }
}
