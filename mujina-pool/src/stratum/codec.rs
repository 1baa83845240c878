//! Stratum v1 wire codec.
//!
//! Requests are encoded as single newline-terminated JSON lines. Decoding
//! classifies one received line into a [`StratumMessage`].
//!
//! Hex fields of a notify (previous hash, merkle branches, version, nbits,
//! ntime) are parsed leniently: a malformed value decodes as zeros instead of
//! failing the message. Pools are trusted but occasionally sloppy, and a hard
//! failure here would turn into a reconnect storm. Structural problems (not
//! JSON, missing fields, wrong types) still fail with
//! [`Error::ProtocolParse`].

use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, TxMerkleNode};
use serde_json::{Value, json};

use super::messages::{
    JsonRpcRequest, MAX_MERKLE_BRANCHES, MiningNotify, StratumMessage, SubmitParams,
    VERSION_ROLLING_MASK, request_id,
};
use crate::config::DeviceIdentity;
use crate::error::{Error, Result};

fn encode(id: u64, method: &str, params: Value) -> String {
    // Serializing a Value-backed struct cannot fail
    let mut line = serde_json::to_string(&JsonRpcRequest::new(id, method, params))
        .unwrap_or_default();
    line.push('\n');
    line
}

pub fn encode_subscribe(id: u64, device: &DeviceIdentity) -> String {
    encode(
        id,
        "mining.subscribe",
        json!([format!("{}/{}", device.agent, device.asic_model)]),
    )
}

pub fn encode_configure(id: u64) -> String {
    encode(
        id,
        "mining.configure",
        json!([
            ["version-rolling"],
            { "version-rolling.mask": format!("{:08x}", VERSION_ROLLING_MASK) }
        ]),
    )
}

pub fn encode_authorize(id: u64, user: &str, password: &str) -> String {
    encode(id, "mining.authorize", json!([user, password]))
}

pub fn encode_suggest_difficulty(id: u64, difficulty: u32) -> String {
    encode(id, "mining.suggest_difficulty", json!([difficulty]))
}

pub fn encode_extranonce_subscribe(id: u64) -> String {
    encode(id, "mining.extranonce.subscribe", json!([]))
}

pub fn encode_submit(id: u64, user: &str, share: &SubmitParams) -> String {
    encode(
        id,
        "mining.submit",
        json!([
            user,
            share.job_id,
            share.extranonce2,
            format!("{:08x}", share.ntime),
            format!("{:08x}", share.nonce),
            format!("{:08x}", share.version_bits),
        ]),
    )
}

/// Classify one line received from the pool.
pub fn decode(line: &str) -> Result<StratumMessage> {
    let value: Value = serde_json::from_str(line.trim())
        .map_err(|e| Error::ProtocolParse(format!("invalid JSON: {e}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| Error::ProtocolParse("message is not an object".into()))?;

    if let Some(method) = object.get("method").and_then(Value::as_str) {
        let params = object.get("params").unwrap_or(&Value::Null);
        return decode_request(method, params);
    }

    decode_response(object.get("id"), object.get("result"), object.get("error"))
}

fn decode_request(method: &str, params: &Value) -> Result<StratumMessage> {
    match method {
        "mining.notify" => Ok(StratumMessage::Notify(decode_notify(params)?)),

        "mining.set_difficulty" => {
            let difficulty = params
                .get(0)
                .and_then(json_u32)
                .ok_or_else(|| missing("mining.set_difficulty", "difficulty"))?;
            Ok(StratumMessage::SetDifficulty(difficulty))
        }

        "mining.set_version_mask" => {
            let mask = params
                .get(0)
                .and_then(Value::as_str)
                .ok_or_else(|| missing("mining.set_version_mask", "mask"))?;
            Ok(StratumMessage::SetVersionMask(lenient_u32(mask)))
        }

        "mining.set_extranonce" => {
            let extranonce1 = params
                .get(0)
                .and_then(Value::as_str)
                .ok_or_else(|| missing("mining.set_extranonce", "extranonce1"))?;
            let extranonce2_len = params
                .get(1)
                .and_then(Value::as_u64)
                .ok_or_else(|| missing("mining.set_extranonce", "extranonce2 size"))?;
            Ok(StratumMessage::SetExtranonce {
                extranonce1: extranonce1.to_string(),
                extranonce2_len: extranonce2_len as usize,
            })
        }

        "client.reconnect" => Ok(StratumMessage::ClientReconnect),

        _ => Ok(StratumMessage::Unknown),
    }
}

fn decode_response(
    id: Option<&Value>,
    result: Option<&Value>,
    error: Option<&Value>,
) -> Result<StratumMessage> {
    let Some(result) = result else {
        return Ok(StratumMessage::Unknown);
    };
    // Replies without a usable id count as setup replies
    let id = id.and_then(Value::as_u64).unwrap_or(0);

    if error.is_some_and(|e| !e.is_null()) {
        return Ok(StratumMessage::GenericResult { id, success: false });
    }

    if let Some(success) = result.as_bool() {
        return Ok(StratumMessage::GenericResult { id, success });
    }

    match id {
        request_id::SUBSCRIBE if result.is_array() => {
            let extranonce1 = result
                .get(1)
                .and_then(Value::as_str)
                .ok_or_else(|| missing("mining.subscribe result", "extranonce1"))?;
            let extranonce2_len = result
                .get(2)
                .and_then(Value::as_u64)
                .ok_or_else(|| missing("mining.subscribe result", "extranonce2 size"))?;
            Ok(StratumMessage::SubscribeResult {
                extranonce1: extranonce1.to_string(),
                extranonce2_len: extranonce2_len as usize,
            })
        }

        request_id::CONFIGURE => Ok(result
            .get("version-rolling.mask")
            .and_then(Value::as_str)
            .map(|mask| StratumMessage::ConfigureResult {
                version_mask: lenient_u32(mask),
            })
            .unwrap_or(StratumMessage::Unknown)),

        _ => Ok(StratumMessage::Unknown),
    }
}

fn decode_notify(params: &Value) -> Result<MiningNotify> {
    const METHOD: &str = "mining.notify";

    let params = params
        .as_array()
        .ok_or_else(|| missing(METHOD, "params"))?;
    if params.len() < 8 {
        return Err(Error::ProtocolParse(format!(
            "{METHOD}: expected at least 8 params, got {}",
            params.len()
        )));
    }

    let field = |index: usize, name: &'static str| str_param(params, index, METHOD, name);

    let job_id = field(0, "job_id")?.to_string();
    let prev_blockhash = stratum_block_hash(field(1, "prev_hash")?);
    let coinbase1 = hex::decode(field(2, "coinbase1")?)
        .map_err(|e| Error::ProtocolParse(format!("{METHOD}: coinbase1: {e}")))?;
    let coinbase2 = hex::decode(field(3, "coinbase2")?)
        .map_err(|e| Error::ProtocolParse(format!("{METHOD}: coinbase2: {e}")))?;

    let branches = params[4]
        .as_array()
        .ok_or_else(|| missing(METHOD, "merkle_branches"))?;
    if branches.len() > MAX_MERKLE_BRANCHES {
        return Err(Error::TooManyMerkleBranches(branches.len()));
    }
    let merkle_branches = branches
        .iter()
        .map(|branch| {
            branch
                .as_str()
                .map(|hex| TxMerkleNode::from_byte_array(lenient_hash(hex)))
                .ok_or_else(|| missing(METHOD, "merkle branch"))
        })
        .collect::<Result<Vec<_>>>()?;

    let version = lenient_u32(field(5, "version")?);
    let nbits = lenient_u32(field(6, "nbits")?);
    let ntime = lenient_u32(field(7, "ntime")?);
    let clean_jobs = params.get(8).and_then(Value::as_bool).unwrap_or(false);

    Ok(MiningNotify {
        job_id,
        prev_blockhash,
        coinbase1,
        coinbase2,
        merkle_branches,
        version,
        nbits,
        ntime,
        clean_jobs,
    })
}

fn str_param<'a>(params: &'a [Value], index: usize, method: &str, name: &str) -> Result<&'a str> {
    params[index].as_str().ok_or_else(|| missing(method, name))
}

fn missing(method: &str, field: &str) -> Error {
    Error::ProtocolParse(format!("{method}: missing or invalid {field}"))
}

// Difficulty may arrive as an integer or a float such as 512.0
fn json_u32(value: &Value) -> Option<u32> {
    if let Some(v) = value.as_u64() {
        return Some(v.min(u64::from(u32::MAX)) as u32);
    }
    value
        .as_f64()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(|v| v.min(f64::from(u32::MAX)) as u32)
}

/// Parse a big-endian hex word, zero on malformed input.
pub(crate) fn lenient_u32(hex: &str) -> u32 {
    u32::from_str_radix(hex, 16).unwrap_or(0)
}

/// Decode 32 bytes of hex, zero-filled on malformed input.
pub(crate) fn lenient_hash(hex: &str) -> [u8; 32] {
    let mut bytes = [0u8; 32];
    if hex::decode_to_slice(hex, &mut bytes).is_err() {
        bytes = [0u8; 32];
    }
    bytes
}

/// Convert Stratum's previous-hash encoding to a block hash.
///
/// Stratum sends the hash as eight 32-bit words, each with its bytes in the
/// opposite order from the internal representation. Reversing each word
/// yields internal byte order.
fn stratum_block_hash(hex: &str) -> BlockHash {
    let mut bytes = lenient_hash(hex);
    for word in bytes.chunks_mut(4) {
        word.reverse();
    }
    BlockHash::from_byte_array(bytes)
}
