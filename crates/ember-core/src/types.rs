//! Core protocol types: transactions, blocks, block index entries.
//!
//! Monetary values are in base units (1 EMB = 10^8 units). Timestamps are
//! 32-bit Unix seconds because they feed the fixed-width kernel hash layout.

use primitive_types::U256;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;

use crate::constants::LOCKTIME_THRESHOLD;
use crate::error::TransactionError;
use crate::script::Script;

/// A 32-byte hash value.
///
/// Used for transaction IDs (BLAKE3), block header hashes and kernel proofs
/// (double SHA-256), and merkle roots (double SHA-256).
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash. Used for null outpoints and the genesis parent.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Interpret the hash as a little-endian 256-bit integer.
    ///
    /// This is the numeric value compared against difficulty targets.
    pub fn to_u256(&self) -> U256 {
        U256::from_little_endian(&self.0)
    }

    /// Build a hash whose little-endian numeric value is `value`.
    pub fn from_u256(value: U256) -> Self {
        let mut bytes = [0u8; 32];
        value.to_little_endian(&mut bytes);
        Self(bytes)
    }

    /// Double SHA-256 of `data`.
    pub fn double_sha256(data: &[u8]) -> Self {
        let first = Sha256::digest(data);
        Self(Sha256::digest(first).into())
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// Reference to a specific output of a previous transaction.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct OutPoint {
    /// Transaction ID containing the referenced output.
    pub txid: Hash256,
    /// Index of the output within the transaction.
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: Hash256, index: u32) -> Self {
        Self { txid, index }
    }

    /// The null outpoint, used for coinbase inputs.
    pub fn null() -> Self {
        Self {
            txid: Hash256::ZERO,
            index: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.index == u32::MAX
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// A transaction input, spending a previous output.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxInput {
    /// The outpoint being spent. Null outpoint for coinbase.
    pub previous_output: OutPoint,
    /// Unlocking script.
    pub script_sig: Script,
    /// Sequence number. `u32::MAX` marks the input as final.
    pub sequence: u32,
}

impl TxInput {
    /// An input spending `previous_output` with a final sequence number.
    pub fn new(previous_output: OutPoint, script_sig: Script) -> Self {
        Self {
            previous_output,
            script_sig,
            sequence: u32::MAX,
        }
    }
}

/// A transaction output, creating a new spendable coin.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxOutput {
    pub value: u64,
    /// Locking script.
    pub script_pubkey: Script,
}

impl TxOutput {
    pub fn new(value: u64, script_pubkey: Script) -> Self {
        Self { value, script_pubkey }
    }

    /// The empty output: zero value and empty script. Marks coinstake outputs.
    pub fn empty() -> Self {
        Self {
            value: 0,
            script_pubkey: Script::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value == 0 && self.script_pubkey.is_empty()
    }
}

/// A transaction transferring value between scripts.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    pub version: u32,
    /// Creation time. Referenced by the stake kernel when this transaction's
    /// outputs are staked.
    pub time: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    /// Block height or timestamp before which this tx is not final.
    pub lock_time: u32,
}

impl Transaction {
    /// Canonical encoding used for txids and size accounting.
    fn encode(&self) -> Result<Vec<u8>, TransactionError> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| TransactionError::Serialization(e.to_string()))
    }

    /// Compute the transaction ID (BLAKE3 hash of the canonical encoding).
    pub fn txid(&self) -> Result<Hash256, TransactionError> {
        let encoded = self.encode()?;
        Ok(Hash256(blake3::hash(&encoded).into()))
    }

    /// Serialized size in bytes.
    pub fn serialized_size(&self) -> Result<usize, TransactionError> {
        Ok(self.encode()?.len())
    }

    /// A coinbase has exactly one input, spending the null outpoint.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }

    /// A coinstake spends at least one real outpoint and marks itself with an
    /// empty first output followed by at least one more output.
    pub fn is_coinstake(&self) -> bool {
        !self.inputs.is_empty()
            && !self.inputs[0].previous_output.is_null()
            && self.outputs.len() >= 2
            && self.outputs[0].is_empty()
    }

    /// The first outpoint spent by more than one input, if any.
    pub fn duplicate_input(&self) -> Option<&OutPoint> {
        let mut seen = HashSet::with_capacity(self.inputs.len());
        self.inputs
            .iter()
            .map(|input| &input.previous_output)
            .find(|prev| !seen.insert(*prev))
    }

    /// Sum of all output values. Returns None on overflow.
    pub fn total_output_value(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.value))
    }

    /// Legacy signature-operation count over every input and output script.
    pub fn legacy_sigop_count(&self) -> u32 {
        let inputs = self
            .inputs
            .iter()
            .map(|input| input.script_sig.sigop_count(false));
        let outputs = self
            .outputs
            .iter()
            .map(|output| output.script_pubkey.sigop_count(false));
        inputs.chain(outputs).fold(0u32, u32::saturating_add)
    }

    /// Whether the transaction may be included in a block at `height` with
    /// block time `block_time`.
    pub fn is_final(&self, height: u64, block_time: u32) -> bool {
        if self.lock_time == 0 {
            return true;
        }
        let limit = if self.lock_time < LOCKTIME_THRESHOLD {
            height
        } else {
            u64::from(block_time)
        };
        if u64::from(self.lock_time) < limit {
            return true;
        }
        self.inputs.iter().all(|input| input.sequence == u32::MAX)
    }
}

/// Block header.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    /// Compact difficulty target.
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    const HASH_SIZE: usize = 4 * 4 + 2 * 32;

    /// Block identity hash: double SHA-256 over version || prev_hash ||
    /// merkle_root || time || bits || nonce, integers little-endian.
    pub fn hash(&self) -> Hash256 {
        let mut data = Vec::with_capacity(Self::HASH_SIZE);
        data.extend_from_slice(&self.version.to_le_bytes());
        data.extend_from_slice(self.prev_hash.as_bytes());
        data.extend_from_slice(self.merkle_root.as_bytes());
        data.extend_from_slice(&self.time.to_le_bytes());
        data.extend_from_slice(&self.bits.to_le_bytes());
        data.extend_from_slice(&self.nonce.to_le_bytes());
        Hash256::double_sha256(&data)
    }
}

/// A complete block.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Block {
    pub header: BlockHeader,
    /// First transaction is the coinbase; in stake blocks the second is the
    /// coinstake.
    pub transactions: Vec<Transaction>,
    /// Masternode/budget payee script attached to work blocks.
    pub payee: Script,
    /// Block signature by the staker's key. Empty for work blocks.
    pub signature: Vec<u8>,
}

impl Block {
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first()
    }

    pub fn is_proof_of_stake(&self) -> bool {
        self.transactions.len() > 1 && self.transactions[1].is_coinstake()
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn serialized_size(&self) -> Result<usize, TransactionError> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map(|bytes| bytes.len())
            .map_err(|e| TransactionError::Serialization(e.to_string()))
    }
}

/// Summary of a connected block, as kept by the chain index.
///
/// Read-only from the point of view of block assembly: the stake modifier in
/// particular is inherited, never recomputed here.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BlockIndex {
    pub hash: Hash256,
    pub height: u64,
    pub time: u32,
    pub bits: u32,
    pub stake_modifier: u64,
    /// Median of the previous eleven block times, including this block.
    pub median_time_past: u32,
}
