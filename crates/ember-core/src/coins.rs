//! Unspent-output views.
//!
//! Coins are grouped per transaction: a [`Coins`] record holds every output of
//! one transaction, with spent outputs cleared to `None`. [`CoinsView`] is the
//! read interface; [`MemoryCoinsView`] is a plain in-memory set used by tests
//! and the regtest harness; [`CoinsViewCache`] layers uncommitted changes over
//! any other view and is what block assembly mutates.

use std::collections::HashMap;

use tracing::trace;

use crate::error::TransactionError;
use crate::types::{Block, Hash256, OutPoint, Transaction, TxOutput};

/// The unspent outputs of one transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Coins {
    /// Outputs by index. Spent outputs are `None`.
    pub outputs: Vec<Option<TxOutput>>,
    /// Height of the block that contained the transaction.
    pub height: u64,
    /// The transaction's own timestamp.
    pub time: u32,
    pub is_coinbase: bool,
    pub is_coinstake: bool,
}

impl Coins {
    pub fn from_tx(tx: &Transaction, height: u64) -> Self {
        Self {
            outputs: tx.outputs.iter().cloned().map(Some).collect(),
            height,
            time: tx.time,
            is_coinbase: tx.is_coinbase(),
            is_coinstake: tx.is_coinstake(),
        }
    }

    /// The unspent output at `index`, if any.
    pub fn output(&self, index: u32) -> Option<&TxOutput> {
        self.outputs.get(index as usize).and_then(Option::as_ref)
    }

    pub fn is_available(&self, index: u32) -> bool {
        self.output(index).is_some()
    }

    /// Mark an output spent and return it.
    pub fn spend(&mut self, index: u32) -> Option<TxOutput> {
        self.outputs.get_mut(index as usize).and_then(Option::take)
    }

    /// True once every output has been spent.
    pub fn is_pruned(&self) -> bool {
        self.outputs.iter().all(Option::is_none)
    }

    /// Coinbase and coinstake outputs need `maturity` confirmations at
    /// `spend_height` before they may be spent.
    pub fn is_mature(&self, spend_height: u64, maturity: u64) -> bool {
        if !self.is_coinbase && !self.is_coinstake {
            return true;
        }
        spend_height.saturating_sub(self.height) >= maturity
    }
}

/// Read access to unspent outputs.
pub trait CoinsView: Send + Sync {
    /// Unspent outputs of `txid`. Returns `None` if unknown or fully spent.
    fn access_coins(&self, txid: &Hash256) -> Option<Coins>;

    fn have_coins(&self, txid: &Hash256) -> bool {
        self.access_coins(txid).is_some()
    }

    /// The unspent output an outpoint refers to.
    fn output(&self, outpoint: &OutPoint) -> Option<TxOutput> {
        self.access_coins(&outpoint.txid)
            .and_then(|coins| coins.output(outpoint.index).cloned())
    }

    /// Whether every input of `tx` refers to an unspent output in this view.
    /// Coinbase transactions trivially pass.
    fn have_inputs(&self, tx: &Transaction) -> bool {
        if tx.is_coinbase() {
            return true;
        }
        tx.inputs.iter().all(|input| {
            self.access_coins(&input.previous_output.txid)
                .is_some_and(|coins| coins.is_available(input.previous_output.index))
        })
    }

    /// Sum of the values `tx` spends. Fails if an input is missing.
    fn value_in(&self, tx: &Transaction) -> Result<u64, TransactionError> {
        if tx.is_coinbase() {
            return Ok(0);
        }
        tx.inputs.iter().try_fold(0u64, |acc, input| {
            let out = self
                .output(&input.previous_output)
                .ok_or_else(|| TransactionError::MissingInputs(input.previous_output.to_string()))?;
            acc.checked_add(out.value).ok_or(TransactionError::ValueOverflow)
        })
    }

    /// Sigops revealed by pay-to-script-hash redeem scripts among `tx`'s
    /// inputs. Inputs missing from the view count zero.
    fn p2sh_sigop_count(&self, tx: &Transaction) -> u32 {
        if tx.is_coinbase() {
            return 0;
        }
        tx.inputs
            .iter()
            .filter_map(|input| {
                self.output(&input.previous_output)
                    .map(|prev| prev.script_pubkey.p2sh_sigop_count(&input.script_sig))
            })
            .fold(0u32, u32::saturating_add)
    }
}

/// Counts returned by [`MemoryCoinsView::connect_block`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectResult {
    pub outputs_created: usize,
    pub outputs_spent: usize,
}

/// In-memory coin set with no persistence.
#[derive(Clone, Debug, Default)]
pub struct MemoryCoinsView {
    coins: HashMap<Hash256, Coins>,
}

impl MemoryCoinsView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the coins of one transaction.
    pub fn insert(&mut self, txid: Hash256, coins: Coins) {
        self.coins.insert(txid, coins);
    }

    /// Number of transactions with at least one unspent output.
    pub fn len(&self) -> usize {
        self.coins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coins.is_empty()
    }

    /// Apply a validated block: spend every non-coinbase input, then create
    /// each transaction's outputs at `height`.
    pub fn connect_block(
        &mut self,
        block: &Block,
        height: u64,
    ) -> Result<ConnectResult, TransactionError> {
        let mut result = ConnectResult::default();
        for tx in &block.transactions {
            result.outputs_spent += self.spend_inputs(tx)?;
            let txid = tx.txid()?;
            let coins = Coins::from_tx(tx, height);
            result.outputs_created += coins.outputs.iter().flatten().count();
            self.coins.insert(txid, coins);
        }
        trace!(
            height,
            created = result.outputs_created,
            spent = result.outputs_spent,
            "connected block coins"
        );
        Ok(result)
    }

    fn spend_inputs(&mut self, tx: &Transaction) -> Result<usize, TransactionError> {
        if tx.is_coinbase() {
            return Ok(0);
        }
        for input in &tx.inputs {
            let prev = &input.previous_output;
            let coins = self
                .coins
                .get_mut(&prev.txid)
                .ok_or_else(|| TransactionError::MissingInputs(prev.to_string()))?;
            coins
                .spend(prev.index)
                .ok_or_else(|| TransactionError::MissingInputs(prev.to_string()))?;
            if coins.is_pruned() {
                self.coins.remove(&prev.txid);
            }
        }
        Ok(tx.inputs.len())
    }
}

impl CoinsView for MemoryCoinsView {
    fn access_coins(&self, txid: &Hash256) -> Option<Coins> {
        self.coins.get(txid).cloned()
    }
}

/// A mutable overlay on another view.
///
/// Reads fall through to the base view until a transaction's coins are
/// touched; from then on the overlay's copy is authoritative. Changes are
/// never written back; the overlay is simply dropped.
pub struct CoinsViewCache<'a> {
    base: &'a dyn CoinsView,
    cache: HashMap<Hash256, Option<Coins>>,
}

impl<'a> CoinsViewCache<'a> {
    pub fn new(base: &'a dyn CoinsView) -> Self {
        Self {
            base,
            cache: HashMap::new(),
        }
    }

    fn fetch_mut(&mut self, txid: &Hash256) -> Option<&mut Coins> {
        let base = self.base;
        self.cache
            .entry(*txid)
            .or_insert_with(|| base.access_coins(txid))
            .as_mut()
    }

    /// Spend `tx`'s inputs and add its outputs at `height`.
    ///
    /// Every input is checked before anything is spent, so a failure leaves
    /// the overlay unchanged.
    pub fn apply_transaction(
        &mut self,
        tx: &Transaction,
        height: u64,
    ) -> Result<(), TransactionError> {
        let txid = tx.txid()?;
        if !tx.is_coinbase() {
            if let Some(prev) = tx.duplicate_input() {
                return Err(TransactionError::DuplicateInput(prev.to_string()));
            }
            if !self.have_inputs(tx) {
                return Err(TransactionError::MissingInputs(txid.to_string()));
            }
            for input in &tx.inputs {
                let prev = &input.previous_output;
                let coins = self
                    .fetch_mut(&prev.txid)
                    .ok_or_else(|| TransactionError::MissingInputs(prev.to_string()))?;
                coins
                    .spend(prev.index)
                    .ok_or_else(|| TransactionError::MissingInputs(prev.to_string()))?;
            }
        }
        self.cache.insert(txid, Some(Coins::from_tx(tx, height)));
        Ok(())
    }

    /// Number of transactions whose coins the overlay has touched.
    pub fn touched(&self) -> usize {
        self.cache.len()
    }
}

impl CoinsView for CoinsViewCache<'_> {
    fn access_coins(&self, txid: &Hash256) -> Option<Coins> {
        match self.cache.get(txid) {
            Some(entry) => entry.clone().filter(|coins| !coins.is_pruned()),
            None => self.base.access_coins(txid),
        }
    }
}
