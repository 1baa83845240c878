//! Status snapshots for telemetry and UI consumers.

use std::net::IpAddr;

use serde::Serialize;

use crate::config::PoolMode;
use crate::stratum::ConnectionState;
use crate::types::PoolId;

/// One pool as reported in [`ManagerInfo`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolInfo {
    pub pool: PoolId,
    pub url: String,
    pub connected: bool,
    #[serde(serialize_with = "serialize_display")]
    pub state: ConnectionState,
    pub pool_difficulty: u32,
    pub accepted: u64,
    pub rejected: u64,

    /// Best share this session.
    pub best_diff: u64,

    pub resolved_ip: Option<IpAddr>,
    pub pool_errors: u64,
}

/// Aggregate state of the pool client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerInfo {
    /// Mode in the configuration, which may not be applied yet.
    pub pool_mode: PoolMode,

    /// Mode the orchestrator is running.
    pub active_mode: PoolMode,

    pub using_fallback: bool,
    pub any_connected: bool,
    pub connected_count: usize,

    /// Best share ever, including previous runs.
    pub total_best_diff: u64,

    pub found_blocks: u64,
    pub total_found_blocks: u64,

    /// Sum over both pools.
    pub pool_errors: u64,

    pub duplicate_nonces: u64,

    /// The selected pool in failover mode, both pools in dual mode.
    pub pools: Vec<PoolInfo>,
}

fn serialize_display<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    T: std::fmt::Display,
    S: serde::Serializer,
{
    serializer.collect_str(value)
}
