//! Stratum pool client and job pipeline for Bitcoin ASIC miners.
//!
//! The crate talks Stratum v1 to a primary and a secondary pool, decides which
//! pool's work is authoritative, turns pool templates into ASIC jobs, and keeps
//! a windowed history of found shares for hashrate reporting.
//!
//! ```text
//! PoolConnection --line--> codec::decode --msg--> PoolOrchestrator
//!                                                     |
//!                            JobBuilder <-- template -+
//!                                |
//!   job ticker --tick--> AsicDriver::send_work --> AsicJobTable
//!                                                     |
//!   ASIC results --> ResultProcessor --submit--> PoolOrchestrator
//!                          |
//!                          +--> HashrateHistory
//! ```

pub mod asic;
pub mod config;
pub mod daemon;
pub mod error;
pub mod history;
pub mod job;
pub mod orchestrator;
pub mod stratum;
pub mod tracing;
pub mod types;
