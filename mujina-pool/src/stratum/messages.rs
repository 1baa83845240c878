//! Stratum v1 message types.
//!
//! Incoming lines decode into [`StratumMessage`]; outgoing requests are built
//! from [`JsonRpcRequest`]. Hashes keep the Rust Bitcoin types so the job
//! pipeline never has to think about Stratum's byte orders again.

use bitcoin::{BlockHash, TxMerkleNode};
use serde::Serialize;
use serde_json::Value;

/// Most merkle branches a notify may carry.
///
/// 32 levels cover a block of 2^32 transactions.
pub const MAX_MERKLE_BRANCHES: usize = 32;

/// Fixed request ids of the setup sequence.
///
/// Ids restart at 1 on every connection. Responses with an id below
/// [`FIRST_SUBMIT_ID`] answer the setup sequence; everything from there on
/// answers a `mining.submit`.
pub mod request_id {
    pub const SUBSCRIBE: u64 = 1;
    pub const CONFIGURE: u64 = 2;
    pub const AUTHORIZE: u64 = 3;
    pub const SUGGEST_DIFFICULTY: u64 = 4;
    pub const EXTRANONCE_SUBSCRIBE: u64 = 5;

    pub const FIRST_SUBMIT_ID: u64 = 5;
}

pub use request_id::FIRST_SUBMIT_ID;

/// Version bits we ask to roll in `mining.configure` (BIP320 range).
pub const VERSION_ROLLING_MASK: u32 = 0x1fffe000;

/// Work template from `mining.notify`.
///
/// Each notify fully replaces the previous template of its pool.
#[derive(Debug, Clone, PartialEq)]
pub struct MiningNotify {
    pub job_id: String,

    /// Previous block hash, already converted from Stratum's word-swapped
    /// encoding to internal byte order.
    pub prev_blockhash: BlockHash,

    /// Coinbase transaction before the extranonces.
    pub coinbase1: Vec<u8>,

    /// Coinbase transaction after the extranonces.
    pub coinbase2: Vec<u8>,

    /// Sibling hashes from the coinbase up to the merkle root, in order.
    pub merkle_branches: Vec<TxMerkleNode>,

    pub version: u32,
    pub nbits: u32,
    pub ntime: u32,

    /// Pool asks us to abandon all previous work.
    pub clean_jobs: bool,
}

/// A decoded line from the pool.
#[derive(Debug, Clone, PartialEq)]
pub enum StratumMessage {
    Notify(MiningNotify),

    SetDifficulty(u32),

    SetVersionMask(u32),

    /// New extranonce, effective from the next notify.
    SetExtranonce {
        extranonce1: String,
        extranonce2_len: usize,
    },

    ClientReconnect,

    /// Reply to `mining.subscribe`; the extranonce is effective at once.
    SubscribeResult {
        extranonce1: String,
        extranonce2_len: usize,
    },

    /// Reply to `mining.configure` carrying the granted mask.
    ConfigureResult {
        version_mask: u32,
    },

    /// Boolean reply, or any reply carrying an error.
    GenericResult {
        id: u64,
        success: bool,
    },

    Unknown,
}

impl StratumMessage {
    /// Whether this answers a `mining.submit` rather than the setup sequence.
    pub fn is_submit_result(&self) -> bool {
        matches!(self, StratumMessage::GenericResult { id, .. } if *id >= FIRST_SUBMIT_ID)
    }
}

/// A found share, ready for `mining.submit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitParams {
    pub job_id: String,

    /// Extranonce2 exactly as it went into the coinbase, in hex.
    pub extranonce2: String,

    pub ntime: u32,
    pub nonce: u32,

    /// Rolled version bits, XORed against the job's base version.
    pub version_bits: u32,
}

/// Outgoing JSON-RPC request.
#[derive(Debug, Serialize)]
pub struct JsonRpcRequest<'a> {
    pub id: u64,
    pub method: &'a str,
    pub params: Value,
}

impl<'a> JsonRpcRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: Value) -> Self {
        Self { id, method, params }
    }
}
