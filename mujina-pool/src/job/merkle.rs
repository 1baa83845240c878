//! Coinbase assembly and merkle root computation.

use bitcoin::TxMerkleNode;
use bitcoin::hashes::{Hash, sha256d};

use super::extranonce2::Extranonce2;

/// Serialized coinbase: `coinbase1 ++ extranonce1 ++ extranonce2 ++ coinbase2`.
pub fn coinbase(
    coinbase1: &[u8],
    extranonce1: &[u8],
    extranonce2: &Extranonce2,
    coinbase2: &[u8],
) -> Vec<u8> {
    let mut tx = Vec::with_capacity(
        coinbase1.len() + extranonce1.len() + extranonce2.size() + coinbase2.len(),
    );
    tx.extend_from_slice(coinbase1);
    tx.extend_from_slice(extranonce1);
    extranonce2.extend_vec(&mut tx);
    tx.extend_from_slice(coinbase2);
    tx
}

/// Fold the coinbase hash up through the branches.
///
/// Each level is `sha256d(current ++ branch)`, with the coinbase always on the
/// left since it is the first transaction of the block.
pub fn merkle_root(coinbase_tx: &[u8], branches: &[TxMerkleNode]) -> TxMerkleNode {
    let mut current = sha256d::Hash::hash(coinbase_tx).to_byte_array();
    let mut pair = [0u8; 64];
    for branch in branches {
        pair[..32].copy_from_slice(&current);
        pair[32..].copy_from_slice(branch.as_byte_array());
        current = sha256d::Hash::hash(&pair).to_byte_array();
    }
    TxMerkleNode::from_byte_array(current)
}
