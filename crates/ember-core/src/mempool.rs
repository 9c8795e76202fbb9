//! In-memory pool of unconfirmed transactions (mempool).
//!
//! The mempool stores validated transactions awaiting inclusion in blocks.
//! It provides:
//! - txid-ordered iteration, so block assembly sees a stable order
//! - O(1) conflict detection via spent-outpoint index
//! - per-txid priority/fee deltas set by `prioritise`
//! - a monotonically increasing update counter the miner polls for changes
//! - size-limited storage with lowest-fee-rate eviction
//!
//! Transactions must be validated by the caller before insertion. The mempool
//! only checks for duplicates, repeated or conflicting inputs, and capacity.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::debug;

use crate::error::{MempoolError, TransactionError};
use crate::types::{Block, Hash256, OutPoint, Transaction, TxOutput};

/// Default maximum number of transactions in the mempool.
pub const DEFAULT_MAX_COUNT: usize = 5_000;

/// Default maximum total serialized bytes in the mempool (5 MiB).
pub const DEFAULT_MAX_BYTES: usize = 5 * 1024 * 1024;

/// Fee per 1000 bytes, the unit eviction compares on.
fn fee_per_kb(fee: u64, size: usize) -> u64 {
    if size == 0 {
        return u64::MAX;
    }
    let rate = (fee as u128) * 1_000 / (size as u128);
    rate.min(u64::MAX as u128) as u64
}

/// A transaction stored in the mempool with precomputed metadata.
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub txid: Hash256,
    /// Fee paid, as computed by the caller at admission.
    pub fee: u64,
    /// Serialized size in bytes.
    pub size: usize,
    fee_rate: u64,
}

impl MempoolEntry {
    /// Fee rate in base units per 1000 bytes.
    pub fn fee_rate(&self) -> u64 {
        self.fee_rate
    }
}

/// Operator-assigned adjustments for one txid.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FeeDelta {
    pub priority: f64,
    pub fee: i64,
}

/// In-memory pool of unconfirmed transactions.
///
/// Not thread-safe; the chain lock serializes access.
pub struct Mempool {
    /// Primary storage: txid → entry.
    entries: BTreeMap<Hash256, MempoolEntry>,
    /// Spent outpoint → txid of the pool transaction that spends it.
    by_outpoint: HashMap<OutPoint, Hash256>,
    /// `(fee_rate, txid)`, lowest first, for eviction.
    by_fee_rate: BTreeSet<(u64, Hash256)>,
    /// Deltas survive removal of the transaction they refer to.
    deltas: HashMap<Hash256, FeeDelta>,
    transactions_updated: u64,
    max_count: usize,
    max_bytes: usize,
    total_bytes: usize,
}

impl Mempool {
    /// Create a new mempool with the given size limits.
    pub fn new(max_count: usize, max_bytes: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            by_outpoint: HashMap::new(),
            by_fee_rate: BTreeSet::new(),
            deltas: HashMap::new(),
            transactions_updated: 0,
            max_count,
            max_bytes,
            total_bytes: 0,
        }
    }

    /// Create a new mempool with default size limits.
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_MAX_COUNT, DEFAULT_MAX_BYTES)
    }

    /// Insert a validated transaction.
    ///
    /// `fee` is the fee the caller computed while validating. If the pool is
    /// full, lowest-fee-rate entries are evicted while the newcomer pays a
    /// strictly higher rate.
    pub fn insert(&mut self, tx: Transaction, fee: u64) -> Result<Hash256, MempoolError> {
        if tx.is_coinbase() || tx.is_coinstake() {
            return Err(MempoolError::NotStandalone);
        }

        if let Some(prev) = tx.duplicate_input() {
            return Err(TransactionError::DuplicateInput(prev.to_string()).into());
        }
        let txid = tx.txid()?;
        let size = tx.serialized_size()?;

        if self.entries.contains_key(&txid) {
            return Err(MempoolError::AlreadyExists(txid.to_string()));
        }

        for input in &tx.inputs {
            if let Some(conflicting) = self.by_outpoint.get(&input.previous_output) {
                return Err(MempoolError::Conflict {
                    new_txid: txid.to_string(),
                    existing_txid: conflicting.to_string(),
                    outpoint: input.previous_output.to_string(),
                });
            }
        }

        let fee_rate = fee_per_kb(fee, size);

        while (self.entries.len() >= self.max_count || self.total_bytes + size > self.max_bytes)
            && !self.entries.is_empty()
        {
            let Some(&(lowest_rate, lowest_txid)) = self.by_fee_rate.iter().next() else {
                break;
            };
            if lowest_rate >= fee_rate {
                return Err(MempoolError::PoolFull);
            }
            debug!(txid = %lowest_txid, fee_rate = lowest_rate, "evicting from mempool");
            self.remove_entry(lowest_txid);
        }

        if self.entries.len() >= self.max_count || self.total_bytes + size > self.max_bytes {
            return Err(MempoolError::PoolFull);
        }

        for input in &tx.inputs {
            self.by_outpoint.insert(input.previous_output.clone(), txid);
        }
        self.by_fee_rate.insert((fee_rate, txid));
        self.total_bytes += size;
        self.entries.insert(
            txid,
            MempoolEntry {
                tx,
                txid,
                fee,
                size,
                fee_rate,
            },
        );
        self.transactions_updated += 1;

        Ok(txid)
    }

    /// Remove a transaction by txid.
    pub fn remove(&mut self, txid: &Hash256) -> Option<MempoolEntry> {
        self.remove_entry(*txid)
    }

    fn remove_entry(&mut self, txid: Hash256) -> Option<MempoolEntry> {
        let entry = self.entries.remove(&txid)?;
        for input in &entry.tx.inputs {
            self.by_outpoint.remove(&input.previous_output);
        }
        self.by_fee_rate.remove(&(entry.fee_rate, txid));
        self.total_bytes -= entry.size;
        self.transactions_updated += 1;
        Some(entry)
    }

    /// Drop every transaction. Deltas are kept.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_outpoint.clear();
        self.by_fee_rate.clear();
        self.total_bytes = 0;
        self.transactions_updated += 1;
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    /// Output `outpoint.index` of the pool transaction `outpoint.txid`.
    pub fn output(&self, outpoint: &OutPoint) -> Option<&TxOutput> {
        self.entries
            .get(&outpoint.txid)
            .and_then(|entry| entry.tx.outputs.get(outpoint.index as usize))
    }

    /// Whether any of `tx`'s inputs is already spent by a pool transaction.
    pub fn has_conflict(&self, tx: &Transaction) -> bool {
        tx.inputs
            .iter()
            .any(|input| self.by_outpoint.contains_key(&input.previous_output))
    }

    /// Add to the priority and fee deltas recorded for `txid`.
    pub fn prioritise(&mut self, txid: Hash256, priority_delta: f64, fee_delta: i64) {
        let delta = self.deltas.entry(txid).or_default();
        delta.priority += priority_delta;
        delta.fee = delta.fee.saturating_add(fee_delta);
        debug!(%txid, priority_delta, fee_delta, "prioritised transaction");
    }

    /// The deltas recorded for `txid`, zero if none.
    pub fn apply_deltas(&self, txid: &Hash256) -> FeeDelta {
        self.deltas.get(txid).copied().unwrap_or_default()
    }

    pub fn clear_prioritisation(&mut self, txid: &Hash256) {
        self.deltas.remove(txid);
    }

    /// Counter bumped on every insertion and removal.
    pub fn transactions_updated(&self) -> u64 {
        self.transactions_updated
    }

    /// Remove transactions confirmed in `block` and any that now conflict.
    pub fn remove_confirmed_block(&mut self, block: &Block) {
        let mut spent = HashSet::new();
        for tx in &block.transactions {
            if let Ok(txid) = tx.txid() {
                self.remove_entry(txid);
                self.deltas.remove(&txid);
            }
            spent.extend(
                tx.inputs
                    .iter()
                    .map(|input| &input.previous_output)
                    .filter(|op| !op.is_null())
                    .cloned(),
            );
        }

        let conflicting: HashSet<Hash256> = spent
            .iter()
            .filter_map(|op| self.by_outpoint.get(op).copied())
            .collect();
        for txid in conflicting {
            self.remove_entry(txid);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Iterate over all entries in txid order.
    pub fn entries(&self) -> impl Iterator<Item = &MempoolEntry> {
        self.entries.values()
    }
}

impl Default for Mempool {
    fn default() -> Self {
        Self::with_defaults()
    }
}
