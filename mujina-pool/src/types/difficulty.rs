//! Share and network difficulty.

use std::fmt;

use bitcoin::hash_types::BlockHash;
use bitcoin::hashes::Hash;
use bitcoin::pow::{CompactTarget, Target};

/// Mining difficulty as a floating-point value.
///
/// Pools speak integer difficulties, but the difficulty a found nonce actually
/// met is fractional, and comparing the two is the whole point of share
/// filtering. Difficulty 1 corresponds to the maximum target
/// (`0x00000000ffff0000...`); higher difficulty means a smaller target.
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd)]
pub struct Difficulty(f64);

impl Difficulty {
    pub const fn new(value: f64) -> Self {
        Self(value)
    }

    /// Difficulty met by a block header hash.
    ///
    /// The hash is interpreted as a little-endian 256-bit number, the same way
    /// it is compared against the target. A zero hash meets any target.
    pub fn from_hash(hash: &BlockHash) -> Self {
        let target = Target::from_le_bytes(hash.to_byte_array());
        if target == Target::ZERO {
            return Self(f64::INFINITY);
        }
        Self(target.difficulty_float())
    }

    /// Network difficulty encoded by a header's `nBits` field.
    pub fn from_bits(bits: CompactTarget) -> Self {
        let target = Target::from_compact(bits);
        if target == Target::ZERO {
            return Self(f64::INFINITY);
        }
        Self(target.difficulty_float())
    }

    pub fn as_f64(self) -> f64 {
        self.0
    }

    /// Truncate to an integer, saturating at the u64 range.
    ///
    /// Best-difficulty values are stored and compared as integers.
    pub fn as_u64(self) -> u64 {
        if self.0 >= u64::MAX as f64 {
            u64::MAX
        } else if self.0 <= 0.0 || self.0.is_nan() {
            0
        } else {
            self.0 as u64
        }
    }
}

impl From<u64> for Difficulty {
    fn from(value: u64) -> Self {
        Self(value as f64)
    }
}

impl From<u32> for Difficulty {
    fn from(value: u32) -> Self {
        Self(f64::from(value))
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.0;
        if !value.is_finite() {
            return write!(f, "inf");
        }

        const SUFFIXES: [(f64, &str); 6] = [
            (1e18, "E"),
            (1e15, "P"),
            (1e12, "T"),
            (1e9, "G"),
            (1e6, "M"),
            (1e3, "K"),
        ];
        let (scaled, suffix) = SUFFIXES
            .iter()
            .find(|(scale, _)| value >= *scale)
            .map(|(scale, suffix)| (value / scale, *suffix))
            .unwrap_or((value, ""));

        if scaled >= 100.0 || scaled.fract() == 0.0 {
            write!(f, "{:.0}{}", scaled, suffix)
        } else if scaled >= 10.0 {
            write!(f, "{:.1}{}", scaled, suffix)
        } else {
            write!(f, "{:.2}{}", scaled, suffix)
        }
    }
}
