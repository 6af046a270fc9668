#![forbid(unsafe_code)]

//! Caller buffer registry.
//!
//! The original engine took raw `(pointer, *size)` pairs; here the registry
//! owns the byte buffers and reports produced/consumed sizes through
//! accessors. Buffer contents and capacities are still entirely the
//! caller's: the engine never grows or shrinks a registered buffer.

use crate::error::{ArrayError, Result};

/// One registered caller buffer.
#[derive(Debug)]
pub enum QueryBuffer {
    /// Fixed-size binding: the vector's length is the capacity, `size` the
    /// bytes produced (reads) or consumed (writes).
    Fixed {
        /// Payload bytes.
        data: Vec<u8>,
        /// Reported size in bytes.
        size: u64,
    },
    /// Variable-size binding: an offsets buffer plus a values buffer.
    Var {
        /// Byte offsets into `data`, one per cell, ascending.
        offsets: Vec<u64>,
        /// Reported offsets size in bytes.
        offsets_size: u64,
        /// Value bytes.
        data: Vec<u8>,
        /// Reported values size in bytes.
        size: u64,
    },
}

impl QueryBuffer {
    /// Whether this is a variable-size binding.
    pub fn is_var(&self) -> bool {
        matches!(self, QueryBuffer::Var { .. })
    }
}

/// Tracks caller buffers per attribute/dimension name.
#[derive(Debug, Default)]
pub struct BufferRegistry {
    entries: Vec<(String, QueryBuffer)>,
}

impl BufferRegistry {
    /// Registers or replaces a fixed-size buffer; last set wins.
    pub fn set_fixed(&mut self, name: &str, data: Vec<u8>) {
        let size = data.len() as u64;
        self.insert(name, QueryBuffer::Fixed { data, size });
    }

    /// Registers or replaces a variable-size buffer pair; last set wins.
    pub fn set_var(&mut self, name: &str, offsets: Vec<u64>, data: Vec<u8>) {
        let offsets_size = (offsets.len() * 8) as u64;
        let size = data.len() as u64;
        self.insert(
            name,
            QueryBuffer::Var {
                offsets,
                offsets_size,
                data,
                size,
            },
        );
    }

    fn insert(&mut self, name: &str, buffer: QueryBuffer) {
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) => *slot = buffer,
            None => self.entries.push((name.to_string(), buffer)),
        }
    }

    /// Looks up a binding by name.
    pub fn get(&self, name: &str) -> Option<&QueryBuffer> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, b)| b)
    }

    /// Mutable lookup by name.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut QueryBuffer> {
        self.entries
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, b)| b)
    }

    /// Bindings in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &QueryBuffer)> {
        self.entries.iter().map(|(n, b)| (n.as_str(), b))
    }

    /// Mutable bindings in registration order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut QueryBuffer)> {
        self.entries.iter_mut().map(|(n, b)| (n.as_str(), b))
    }

    /// Whether no buffer is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Validates a variable-length offsets buffer against its values buffer.
///
/// `offsets_size` is the live prefix of `offsets` in bytes; `val_size` the
/// live size of the values buffer. Zero offsets is trivially valid.
/// Otherwise every offset must be strictly greater than its predecessor and
/// strictly less than `val_size`. Runs before any data is touched, so a
/// violation leaves no side effects.
pub fn validate_var_offsets(offsets: &[u64], offsets_size: u64, val_size: u64) -> Result<()> {
    let num_offsets = (offsets_size / 8) as usize;
    if num_offsets == 0 {
        return Ok(());
    }
    if offsets.len() < num_offsets {
        return Err(ArrayError::Buffer(format!(
            "offsets size {offsets_size} claims {num_offsets} entries but only {} are present",
            offsets.len()
        )));
    }
    let mut prev = offsets[0];
    if prev >= val_size {
        return Err(ArrayError::Buffer(format!(
            "invalid offsets: offset {prev} specified for value buffer of size {val_size}"
        )));
    }
    for &off in &offsets[1..num_offsets] {
        if off <= prev {
            return Err(ArrayError::Buffer(format!(
                "invalid offsets: {off} after {prev}; offsets must be strictly ascending"
            )));
        }
        if off >= val_size {
            return Err(ArrayError::Buffer(format!(
                "invalid offsets: offset {off} specified for value buffer of size {val_size}"
            )));
        }
        prev = off;
    }
    Ok(())
}
