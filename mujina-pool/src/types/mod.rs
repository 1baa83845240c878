//! Small value types shared across the crate.

mod difficulty;

pub use difficulty::Difficulty;

use serde::{Deserialize, Serialize};

/// One of the two configured pools.
///
/// The firmware always has exactly two pool slots. Which of them receives work
/// depends on the orchestrator strategy; the slot itself never changes meaning.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
pub enum PoolId {
    #[strum(serialize = "Pri")]
    Primary,
    #[strum(serialize = "Sec")]
    Secondary,
}

impl PoolId {
    /// Both pools in slot order.
    pub const ALL: [PoolId; 2] = [PoolId::Primary, PoolId::Secondary];

    /// Slot index, for per-pool arrays.
    pub const fn index(self) -> usize {
        match self {
            PoolId::Primary => 0,
            PoolId::Secondary => 1,
        }
    }

    pub const fn other(self) -> PoolId {
        match self {
            PoolId::Primary => PoolId::Secondary,
            PoolId::Secondary => PoolId::Primary,
        }
    }
}
