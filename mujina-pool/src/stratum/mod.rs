//! Stratum v1 client.
//!
//! - [`codec`] turns requests into lines and lines into [`StratumMessage`]s.
//! - [`connection`] owns one TCP session per pool and reports what it hears to
//!   a [`ConnectionObserver`], normally the orchestrator.
//!
//! Protocol reference: <https://braiins.com/stratum-v1/docs>

pub mod codec;
pub mod connection;
mod framing;
pub mod messages;

pub use connection::{
    ConnectionHandle, ConnectionObserver, ConnectionState, ConnectionTiming, PoolConnection,
    SessionConfig,
};
pub use messages::{MiningNotify, StratumMessage, SubmitParams};
