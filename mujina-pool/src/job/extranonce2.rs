//! Extranonce2 values.
//!
//! The pool assigns each connection an extranonce1 and a byte length for
//! extranonce2. We fill extranonce2 from a per-pool counter that rolls once per
//! built job, so every job hashes a different coinbase. The same text goes into
//! the coinbase and back to the pool in `mining.submit`, which is why the value
//! is defined by its hex rendering.

use std::fmt;

use thiserror::Error;

/// Longest extranonce2 a counter can fill.
pub const MAX_SIZE: usize = 8;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Extranonce2Error {
    #[error("invalid extranonce2 size: {0} (must be 1-8 bytes)")]
    InvalidSize(usize),
}

/// A counter value rendered at the pool's extranonce2 width.
///
/// Rendering is big-endian hex, zero-padded to `size * 2` digits. A counter
/// too large for the width keeps only its low bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extranonce2 {
    value: u64,
    size: usize,
}

impl Extranonce2 {
    pub fn new(value: u64, size: usize) -> Result<Self, Extranonce2Error> {
        if size == 0 || size > MAX_SIZE {
            return Err(Extranonce2Error::InvalidSize(size));
        }
        Ok(Self {
            value: value & Self::mask(size),
            size,
        })
    }

    fn mask(size: usize) -> u64 {
        if size >= MAX_SIZE {
            u64::MAX
        } else {
            (1u64 << (size * 8)) - 1
        }
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Append the coinbase bytes, most significant first.
    pub fn extend_vec(&self, vec: &mut Vec<u8>) {
        vec.extend_from_slice(&self.value.to_be_bytes()[MAX_SIZE - self.size..]);
    }
}

impl fmt::Display for Extranonce2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0width$x}", self.value, width = self.size * 2)
    }
}
