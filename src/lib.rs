//! Tessera: an embedded sparse multi-dimensional array storage engine.
//!
//! Data is organized into immutable, append-only fragments written by one
//! write session each; attributes (fixed and variable length) are stored in
//! parallel columnar files addressed by multi-dimensional coordinates.
//! Reads merge cells across fragments with last-write-wins semantics and
//! resume across calls when the caller's buffers run out of capacity.

#![warn(missing_docs)]

pub mod array;
pub mod error;
pub mod primitives;
pub mod query;
pub mod storage;
pub mod types;

pub use array::{ArraySchema, Attribute, CellValNum, Compressor, Dimension, COORDS_NAME};
pub use error::{ArrayError, Result};
pub use query::{CancelToken, Query, QueryStatus, QueryType, Subarray};
pub use storage::{EngineConfig, FragmentMetadata, StorageManager};
pub use types::{Datatype, Layout, ScalarValue};
