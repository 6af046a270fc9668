//! Low-level primitives beneath the storage layer.

/// Positioned file I/O abstraction.
pub mod io;
