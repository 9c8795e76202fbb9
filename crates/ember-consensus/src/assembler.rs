//! Block assembler: turns the mempool and chain tip into a candidate block.
//!
//! One call to [`BlockAssembler::create_new_block`] runs with the chain lock
//! held. It
//! 1. builds the coinbase, and in stake mode searches for a kernel and
//!    appends the wallet's coinstake,
//! 2. walks the prioritizer's queue, admitting each transaction that fits the
//!    size and sigop budget, passes the free-transaction gate, and still
//!    validates against the block's private coins overlay,
//! 3. resolves payees, fills in the header, and
//! 4. hands the finished candidate to the full validator.
//!
//! Per-transaction problems never abort assembly. A failed kernel search or a
//! validator rejection discards the whole candidate.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use ember_core::chain::ChainState;
use ember_core::coins::{CoinsView, CoinsViewCache};
use ember_core::constants::{
    BLOCK_SIZE_MARGIN, BLOCK_VERSION, COINBASE_RESERVED_SIGOPS, COINBASE_RESERVED_SIZE,
    DEFAULT_BLOCK_MAX_SIZE, DEFAULT_BLOCK_MIN_SIZE, DEFAULT_BLOCK_PRIORITY_SIZE,
    DEFAULT_MIN_RELAY_FEE_PER_KB,
};
use ember_core::error::{AssemblyError, TransactionError};
use ember_core::invalid::InvalidOutpoints;
use ember_core::merkle::block_merkle_root;
use ember_core::params::ChainParams;
use ember_core::script::{MANDATORY_SCRIPT_VERIFY_FLAGS, Script};
use ember_core::traits::{
    BlockValidator, Clock, DifficultyRetarget, MiningWallet, PaymentResolver, ScriptVerifier,
    system_clock,
};
use ember_core::types::{
    Block, BlockHeader, BlockIndex, Hash256, OutPoint, Transaction, TxInput, TxOutput,
};

use crate::inputs::check_inputs;
use crate::priority::{CandidateSet, FeeRate, PriorityWalk, SortOrder};
use crate::stake::{StakeSearchGate, search_kernel};

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Operator-tunable block construction limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblerPolicy {
    /// Largest block to assemble, in bytes.
    pub block_max_size: u64,
    /// Bytes filled by priority before switching to fee ordering.
    pub block_priority_size: u64,
    /// Blocks are filled with free transactions up to this size.
    pub block_min_size: u64,
    /// Fee rate below which a transaction counts as free.
    pub min_relay_fee_per_kb: u64,
    /// Log every admitted transaction's priority and fee rate.
    pub print_priority: bool,
    /// Header version to use instead of the default. Only honoured on
    /// networks that mine on demand.
    pub block_version_override: Option<u32>,
}

impl Default for AssemblerPolicy {
    fn default() -> Self {
        Self {
            block_max_size: DEFAULT_BLOCK_MAX_SIZE,
            block_priority_size: DEFAULT_BLOCK_PRIORITY_SIZE,
            block_min_size: DEFAULT_BLOCK_MIN_SIZE,
            min_relay_fee_per_kb: DEFAULT_MIN_RELAY_FEE_PER_KB,
            print_priority: false,
            block_version_override: None,
        }
    }
}

impl AssemblerPolicy {
    /// Limit the maximum size to `[1000, network max - 1000]` and the
    /// priority and minimum sizes to the maximum.
    pub fn clamped(&self, params: &ChainParams) -> Self {
        let ceiling = params.max_block_size.saturating_sub(BLOCK_SIZE_MARGIN);
        let block_max_size = self.block_max_size.min(ceiling).max(1_000);
        Self {
            block_max_size,
            block_priority_size: self.block_priority_size.min(block_max_size),
            block_min_size: self.block_min_size.min(block_max_size),
            ..self.clone()
        }
    }
}

/// Which proof the assembled block carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MiningMode {
    #[default]
    Work,
    Stake,
}

impl MiningMode {
    pub fn is_stake(&self) -> bool {
        matches!(self, Self::Stake)
    }
}

impl fmt::Display for MiningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Work => "work",
            Self::Stake => "stake",
        })
    }
}

// ---------------------------------------------------------------------------
// Template and bookkeeping
// ---------------------------------------------------------------------------

/// A sealed candidate block plus per-transaction bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTemplate {
    pub block: Block,
    /// Fee per transaction. Entry 0 is minus the total fees in work blocks.
    pub tx_fees: Vec<i64>,
    /// Legacy plus P2SH sigops per transaction.
    pub tx_sigops: Vec<u64>,
    pub height: u64,
    pub total_fees: u64,
    /// Number of mempool transactions admitted before the queue switched to
    /// fee ordering, if it did.
    pub fee_phase_start: Option<usize>,
}

impl BlockTemplate {
    pub fn prev_hash(&self) -> Hash256 {
        self.block.header.prev_hash
    }
}

/// Running size, sigop, and fee totals for one candidate.
///
/// Starts with room reserved for the header and coinbase. A transaction fits
/// only if the total stays strictly below the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockBudget {
    pub size: u64,
    pub sigops: u64,
    pub tx_count: u64,
    pub fees: u64,
}

impl Default for BlockBudget {
    fn default() -> Self {
        Self {
            size: COINBASE_RESERVED_SIZE,
            sigops: COINBASE_RESERVED_SIGOPS,
            tx_count: 0,
            fees: 0,
        }
    }
}

impl BlockBudget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fits_size(&self, size: u64, max_size: u64) -> bool {
        self.size + size < max_size
    }

    pub fn fits_sigops(&self, sigops: u64, max_sigops: u64) -> bool {
        self.sigops + sigops < max_sigops
    }

    pub fn admit(&mut self, size: u64, sigops: u64, fee: u64) {
        self.size += size;
        self.sigops += sigops;
        self.tx_count += 1;
        self.fees = self.fees.saturating_add(fee);
    }
}

/// State shared by every assembler and worker in one mining session.
#[derive(Debug, Default)]
pub struct AssemblyContext {
    last_block_tx: AtomicU64,
    last_block_size: AtomicU64,
    pub stake_gate: StakeSearchGate,
}

impl AssemblyContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mempool transactions in the last assembled block.
    pub fn last_block_tx(&self) -> u64 {
        self.last_block_tx.load(Ordering::Relaxed)
    }

    /// Budgeted size of the last assembled block.
    pub fn last_block_size(&self) -> u64 {
        self.last_block_size.load(Ordering::Relaxed)
    }

    fn record(&self, budget: &BlockBudget) {
        self.last_block_tx.store(budget.tx_count, Ordering::Relaxed);
        self.last_block_size.store(budget.size, Ordering::Relaxed);
    }
}

/// Per-worker extra nonce, reset whenever the previous block changes.
#[derive(Debug, Default)]
pub struct ExtraNonce {
    prev_hash: Hash256,
    counter: u32,
}

impl ExtraNonce {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self) -> u32 {
        self.counter
    }

    /// Bump the counter, write it into the coinbase script after the height,
    /// and recompute the merkle root.
    pub fn increment(
        &mut self,
        block: &mut Block,
        prev: &BlockIndex,
    ) -> Result<u32, TransactionError> {
        if self.prev_hash != block.header.prev_hash {
            self.counter = 0;
            self.prev_hash = block.header.prev_hash;
        }
        self.counter = self.counter.wrapping_add(1);

        let coinbase = block
            .transactions
            .first_mut()
            .ok_or_else(|| TransactionError::MissingInputs("block has no coinbase".into()))?;
        if let Some(input) = coinbase.inputs.first_mut() {
            input.script_sig = Script::coinbase(prev.height + 1, Some(self.counter));
        }
        block.header.merkle_root = block_merkle_root(&block.transactions)?;
        Ok(self.counter)
    }
}

// ---------------------------------------------------------------------------
// Assembler
// ---------------------------------------------------------------------------

/// External services the assembler consults.
#[derive(Clone)]
pub struct Collaborators {
    pub retarget: Arc<dyn DifficultyRetarget>,
    pub validator: Arc<dyn BlockValidator>,
    pub verifier: Arc<dyn ScriptVerifier>,
    pub payments: Arc<dyn PaymentResolver>,
}

/// Builds candidate blocks.
pub struct BlockAssembler {
    params: ChainParams,
    policy: AssemblerPolicy,
    collaborators: Collaborators,
    invalid: InvalidOutpoints,
    context: Arc<AssemblyContext>,
    clock: Clock,
}

impl fmt::Debug for BlockAssembler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockAssembler")
            .field("network", &self.params.network)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl BlockAssembler {
    /// Create an assembler using the system clock. `policy` is clamped to
    /// the network's limits.
    pub fn new(
        params: ChainParams,
        policy: AssemblerPolicy,
        collaborators: Collaborators,
        context: Arc<AssemblyContext>,
    ) -> Self {
        let policy = policy.clamped(&params);
        Self {
            params,
            policy,
            collaborators,
            invalid: InvalidOutpoints::new(),
            context,
            clock: system_clock(),
        }
    }

    /// Replace the clock, for deterministic tests.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_invalid_outpoints(mut self, invalid: InvalidOutpoints) -> Self {
        self.invalid = invalid;
        self
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn policy(&self) -> &AssemblerPolicy {
        &self.policy
    }

    pub fn context(&self) -> &Arc<AssemblyContext> {
        &self.context
    }

    pub fn now(&self) -> u32 {
        (self.clock)()
    }

    /// Move `header.time` to `max(median time past + 1, now)`. On networks
    /// that allow minimum-difficulty blocks the bits are recomputed, since
    /// they may depend on the time. Returns the change in seconds.
    pub fn update_time(&self, header: &mut BlockHeader, prev: &BlockIndex) -> i64 {
        let old = header.time;
        let new = prev.median_time_past.saturating_add(1).max(self.now());
        if old < new {
            header.time = new;
        }
        if self.params.allow_min_difficulty_blocks {
            header.bits = self.collaborators.retarget.next_required_bits(prev, header, false);
        }
        i64::from(new) - i64::from(old)
    }

    /// Assemble a candidate on top of `chain`'s tip, paying `reward_script`.
    ///
    /// Stake mode needs `wallet`. The caller holds the chain lock for the
    /// whole call. On [`AssemblyError::Rejected`] the mempool may hold
    /// transactions the chain no longer accepts.
    pub fn create_new_block<C: CoinsView>(
        &self,
        chain: &ChainState<C>,
        reward_script: &Script,
        mode: MiningMode,
        wallet: Option<&dyn MiningWallet>,
    ) -> Result<BlockTemplate, AssemblyError> {
        let prev = chain.tip().ok_or(AssemblyError::NoChainTip)?.clone();
        let height = prev.height + 1;
        let now = self.now();
        let is_stake = mode.is_stake();

        let version = match self.policy.block_version_override {
            Some(version) if self.params.mine_blocks_on_demand => version,
            _ => BLOCK_VERSION,
        };
        let mut header = BlockHeader {
            version,
            prev_hash: prev.hash,
            merkle_root: Hash256::ZERO,
            time: now,
            bits: 0,
            nonce: 0,
        };

        let mut coinbase = Transaction {
            version: 1,
            time: now,
            inputs: vec![TxInput::new(OutPoint::null(), Script::coinbase(height, None))],
            outputs: vec![TxOutput::new(0, reward_script.clone())],
            lock_time: 0,
        };

        let mut overlay = CoinsViewCache::new(&chain.coins);
        let mut budget = BlockBudget::new();
        let mut transactions: Vec<Transaction> = Vec::new();
        let mut tx_fees: Vec<i64> = vec![0];
        let mut tx_sigops: Vec<u64> = vec![0];

        if is_stake {
            let wallet = wallet.ok_or(AssemblyError::NoWallet)?;
            header.bits = self.collaborators.retarget.next_required_bits(&prev, &header, true);
            let coinstake = self.find_coinstake(chain, wallet, &prev, header.bits, now)?;
            header.time = coinstake.time;
            coinbase.outputs[0] = TxOutput::empty();

            overlay.apply_transaction(&coinstake, height)?;
            let size = coinstake.serialized_size()? as u64;
            let sigops = u64::from(coinstake.legacy_sigop_count());
            budget.size += size;
            budget.sigops += sigops;
            tx_fees.push(0);
            tx_sigops.push(sigops);
            transactions.push(coinstake);
        }
        let stake_txs = transactions.len();

        let fee_phase_start = self.fill_from_mempool(
            chain,
            &mut overlay,
            height,
            header.time,
            &mut budget,
            &mut transactions,
            &mut tx_fees,
            &mut tx_sigops,
        );
        drop(overlay);

        let total_fees = budget.fees;
        if !is_stake {
            self.collaborators
                .payments
                .fill_payee(&mut coinbase, total_fees, height, false);
        }
        let payee = match coinbase.outputs.get(1) {
            Some(out) if !is_stake => out.script_pubkey.clone(),
            _ => Script::default(),
        };
        self.context.record(&budget);
        if !is_stake {
            tx_fees[0] = -i64::try_from(total_fees).unwrap_or(i64::MAX);
        }
        coinbase.inputs[0].script_sig = Script::coinbase(height, None);
        tx_sigops[0] = u64::from(coinbase.legacy_sigop_count());

        if !is_stake {
            self.update_time(&mut header, &prev);
        }
        header.bits = self.collaborators.retarget.next_required_bits(&prev, &header, is_stake);
        header.nonce = 0;

        let mut all = Vec::with_capacity(transactions.len() + 1);
        all.push(coinbase);
        all.extend(transactions);
        header.merkle_root = block_merkle_root(&all)?;

        let block = Block {
            header,
            transactions: all,
            payee,
            signature: Vec::new(),
        };

        let snapshot = CoinsViewCache::new(&chain.coins);
        if let Err(err) = self
            .collaborators
            .validator
            .test_block_validity(&block, &prev, &snapshot)
        {
            warn!(height, error = %err, "assembled block failed validation");
            return Err(AssemblyError::Rejected {
                reason: err.to_string(),
            });
        }

        info!(
            height,
            mode = %mode,
            txs = block.transactions.len() - 1 - stake_txs,
            size = budget.size,
            sigops = budget.sigops,
            fees = total_fees,
            "assembled block candidate"
        );

        Ok(BlockTemplate {
            block,
            tx_fees,
            tx_sigops,
            height,
            total_fees,
            fee_phase_start,
        })
    }

    /// Search for a kernel in the window since the last search and have the
    /// wallet build the coinstake for it.
    fn find_coinstake<C: CoinsView>(
        &self,
        chain: &ChainState<C>,
        wallet: &dyn MiningWallet,
        prev: &BlockIndex,
        bits: u32,
        now: u32,
    ) -> Result<Transaction, AssemblyError> {
        let found = self
            .context
            .stake_gate
            .run(now, |interval| {
                let candidates = wallet.stake_candidates();
                search_kernel(&self.params, prev, bits, &candidates, &chain.coins, now, interval)
            })
            .ok_or(AssemblyError::StakeSearchSkipped)??;
        let Some(kernel) = found else {
            debug!(now, "no stake kernel found");
            return Err(AssemblyError::NoStakeFound);
        };
        let coinstake = wallet.create_coinstake(&kernel.candidate, kernel.time)?;
        debug!(txid = %coinstake.txid()?, time = kernel.time, "built coinstake");
        Ok(coinstake)
    }

    /// Walk the priority queue, admitting what fits. Returns how many
    /// transactions were admitted before the switch to fee ordering.
    #[allow(clippy::too_many_arguments)]
    fn fill_from_mempool<C: CoinsView>(
        &self,
        chain: &ChainState<C>,
        overlay: &mut CoinsViewCache<'_>,
        height: u64,
        block_time: u32,
        budget: &mut BlockBudget,
        transactions: &mut Vec<Transaction>,
        tx_fees: &mut Vec<i64>,
        tx_sigops: &mut Vec<u64>,
    ) -> Option<usize> {
        let policy = &self.policy;
        let max_sigops = self.params.max_block_sigops;
        let min_relay =
            FeeRate::from_per_kb(i64::try_from(policy.min_relay_fee_per_kb).unwrap_or(i64::MAX));

        let set =
            CandidateSet::collect(&chain.mempool, &*overlay, &self.invalid, height, block_time);
        let mut walk = PriorityWalk::new(set, policy.block_priority_size);

        while let Some(entry) = walk.next() {
            let tx = entry.tx;
            let size = entry.size as u64;

            if !budget.fits_size(size, policy.block_max_size) {
                continue;
            }
            let mut sigops = u64::from(tx.legacy_sigop_count());
            if !budget.fits_sigops(sigops, max_sigops) {
                continue;
            }

            let delta = chain.mempool.apply_deltas(&entry.txid);
            if walk.order() == SortOrder::FeeRate
                && delta.priority <= 0.0
                && delta.fee <= 0
                && entry.fee_rate < min_relay
                && budget.size + size >= policy.block_min_size
            {
                continue;
            }

            walk.maybe_switch(budget.size, &entry);

            if !overlay.have_inputs(tx) {
                continue;
            }
            sigops += u64::from(overlay.p2sh_sigop_count(tx));
            if !budget.fits_sigops(sigops, max_sigops) {
                continue;
            }

            let fee = match check_inputs(
                tx,
                &*overlay,
                height,
                self.params.coinbase_maturity,
                self.collaborators.verifier.as_ref(),
                MANDATORY_SCRIPT_VERIFY_FLAGS,
            ) {
                Ok(fee) => fee,
                Err(err) => {
                    debug!(txid = %entry.txid, error = %err, "skipping transaction");
                    continue;
                }
            };
            if let Err(err) = overlay.apply_transaction(tx, height) {
                debug!(txid = %entry.txid, error = %err, "skipping transaction");
                continue;
            }

            transactions.push(tx.clone());
            tx_fees.push(i64::try_from(fee).unwrap_or(i64::MAX));
            tx_sigops.push(sigops);
            budget.admit(size, sigops, fee);
            walk.admit(&entry.txid);

            if policy.print_priority {
                debug!(
                    priority = entry.priority,
                    fee_rate = %entry.fee_rate,
                    txid = %entry.txid,
                    "admitted"
                );
            }
        }

        walk.fee_phase_start()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::coins::{Coins, MemoryCoinsView};
    use ember_core::constants::COIN;
    use ember_core::error::{BlockError, WalletError};
    use ember_core::mempool::Mempool;
    use ember_core::params::{NetworkType, POW_LIMIT_BITS_REGTEST};
    use ember_core::script::OP_CHECKSIG;
    use ember_core::traits::StakeCandidate;
    use parking_lot::Mutex;

    // ======================================================================
    // Mocks
    // ======================================================================

    struct FixedRetarget;

    impl DifficultyRetarget for FixedRetarget {
        fn next_required_bits(&self, _: &BlockIndex, _: &BlockHeader, _: bool) -> u32 {
            POW_LIMIT_BITS_REGTEST
        }
    }

    struct Validator {
        reject: bool,
    }

    impl BlockValidator for Validator {
        fn test_block_validity(
            &self,
            block: &Block,
            prev: &BlockIndex,
            _: &dyn CoinsView,
        ) -> Result<(), BlockError> {
            if self.reject {
                return Err(BlockError::InvalidMerkleRoot);
            }
            if block.header.prev_hash != prev.hash {
                return Err(BlockError::InvalidPrevHash);
            }
            Ok(())
        }
    }

    struct AcceptScripts;

    impl ScriptVerifier for AcceptScripts {
        fn verify(&self, _: &Script, _: &Script, _: u32, _: &Transaction, _: usize) -> bool {
            true
        }
    }

    /// Pays 50 coins plus fees to the miner and one coin to a masternode.
    struct Payments;

    impl PaymentResolver for Payments {
        fn fill_payee(&self, coinbase: &mut Transaction, fees: u64, _: u64, _: bool) {
            coinbase.outputs[0].value = 50 * COIN + fees;
            coinbase.outputs.push(TxOutput::new(COIN, Script::from(vec![0x52])));
        }
    }

    struct StakeWallet {
        candidate: StakeCandidate,
        searched: Mutex<u32>,
    }

    impl MiningWallet for StakeWallet {
        fn is_locked(&self) -> bool {
            false
        }
        fn balance(&self) -> u64 {
            self.candidate.output.value
        }
        fn mintable_coins(&self) -> bool {
            true
        }
        fn stake_candidates(&self) -> Vec<StakeCandidate> {
            *self.searched.lock() += 1;
            vec![self.candidate.clone()]
        }
        fn create_coinstake(
            &self,
            kernel: &StakeCandidate,
            time: u32,
        ) -> Result<Transaction, WalletError> {
            Ok(Transaction {
                version: 1,
                time,
                inputs: vec![TxInput::new(kernel.outpoint.clone(), Script::from(vec![0x01]))],
                outputs: vec![
                    TxOutput::empty(),
                    TxOutput::new(kernel.output.value + COIN, kernel.output.script_pubkey.clone()),
                ],
                lock_time: 0,
            })
        }
        fn sign_block(&self, block: &mut Block) -> Result<(), WalletError> {
            block.signature = vec![1];
            Ok(())
        }
        fn reserve_script(&self) -> Result<Script, WalletError> {
            Ok(Script::from(vec![0x51]))
        }
        fn keep_script(&self, _: &Script) {}
    }

    // ======================================================================
    // Fixture
    // ======================================================================

    const NOW: u32 = 1_700_000_000;
    const TIP_HEIGHT: u64 = 100;

    fn collaborators(reject: bool) -> Collaborators {
        Collaborators {
            retarget: Arc::new(FixedRetarget),
            validator: Arc::new(Validator { reject }),
            verifier: Arc::new(AcceptScripts),
            payments: Arc::new(Payments),
        }
    }

    fn assembler(network: NetworkType, policy: AssemblerPolicy, reject: bool) -> BlockAssembler {
        BlockAssembler::new(
            ChainParams::for_network(network),
            policy,
            collaborators(reject),
            Arc::new(AssemblyContext::new()),
        )
        .with_clock(Arc::new(|| NOW))
    }

    fn tip() -> BlockIndex {
        BlockIndex {
            hash: Hash256([0xaa; 32]),
            height: TIP_HEIGHT,
            time: NOW - 60,
            bits: POW_LIMIT_BITS_REGTEST,
            stake_modifier: 42,
            median_time_past: NOW - 600,
        }
    }

    fn chain() -> ChainState<MemoryCoinsView> {
        let mut chain = ChainState::new(MemoryCoinsView::new(), Mempool::with_defaults());
        chain.set_tip(tip());
        chain
    }

    fn fund(chain: &mut ChainState<MemoryCoinsView>, seed: u8, value: u64) -> OutPoint {
        let txid = Hash256([seed; 32]);
        chain.coins.insert(
            txid,
            Coins {
                outputs: vec![Some(TxOutput::new(value, Script::from(vec![0x51])))],
                height: 10,
                time: 1_000,
                is_coinbase: false,
                is_coinstake: false,
            },
        );
        OutPoint::new(txid, 0)
    }

    fn spend(prev: OutPoint, value: u64) -> Transaction {
        Transaction {
            version: 1,
            time: NOW - 100,
            inputs: vec![TxInput::new(prev, Script::from(vec![0x01]))],
            outputs: vec![TxOutput::new(value, Script::from(vec![0x51]))],
            lock_time: 0,
        }
    }

    // ======================================================================
    // Policy
    // ======================================================================

    #[test]
    fn policy_clamps_to_network_limits() {
        let params = ChainParams::default();
        let wild = AssemblerPolicy {
            block_max_size: 10_000_000,
            block_priority_size: 20_000_000,
            block_min_size: 30_000_000,
            ..AssemblerPolicy::default()
        };
        let p = wild.clamped(&params);
        assert_eq!(p.block_max_size, params.max_block_size - 1_000);
        assert_eq!(p.block_priority_size, p.block_max_size);
        assert_eq!(p.block_min_size, p.block_max_size);

        let tiny = AssemblerPolicy { block_max_size: 10, ..AssemblerPolicy::default() };
        assert_eq!(tiny.clamped(&params).block_max_size, 1_000);
    }

    #[test]
    fn policy_deserializes_with_defaults() {
        let p: AssemblerPolicy = serde_json::from_str(r#"{"block_max_size": 500000}"#).unwrap();
        assert_eq!(p.block_max_size, 500_000);
        assert_eq!(p.block_priority_size, DEFAULT_BLOCK_PRIORITY_SIZE);
        assert!(!p.print_priority);
    }

    #[test]
    fn budget_is_strict() {
        let mut b = BlockBudget::new();
        assert_eq!(b.size, 1_000);
        assert!(b.fits_size(998_999, 1_000_000));
        assert!(!b.fits_size(999_000, 1_000_000));
        b.admit(10, 2, 5);
        assert_eq!((b.size, b.sigops, b.tx_count, b.fees), (1_010, 102, 1, 5));
    }

    // ======================================================================
    // Work blocks
    // ======================================================================

    #[test]
    fn empty_mempool_yields_coinbase_only_block() {
        let chain = chain();
        let asm = assembler(NetworkType::Regtest, AssemblerPolicy::default(), false);
        let t = asm
            .create_new_block(&chain, &Script::from(vec![0x51]), MiningMode::Work, None)
            .unwrap();

        assert_eq!(t.height, TIP_HEIGHT + 1);
        assert_eq!(t.block.transactions.len(), 1);
        assert_eq!(t.block.header.prev_hash, tip().hash);
        assert_eq!(t.block.header.nonce, 0);
        assert_eq!(t.block.header.bits, POW_LIMIT_BITS_REGTEST);
        assert_eq!(t.block.header.time, NOW);
        assert_eq!(t.block.header.version, BLOCK_VERSION);
        assert_eq!(
            t.block.header.merkle_root,
            block_merkle_root(&t.block.transactions).unwrap()
        );
        let cb = &t.block.transactions[0];
        assert!(cb.is_coinbase());
        assert_eq!(cb.inputs[0].script_sig, Script::coinbase(TIP_HEIGHT + 1, None));
        assert_eq!(cb.outputs[0].value, 50 * COIN);
        assert_eq!(t.block.payee, Script::from(vec![0x52]));
        assert_eq!(t.tx_fees, vec![0]);
    }

    #[test]
    fn admits_fees_and_reports_them() {
        let mut chain = chain();
        let a = fund(&mut chain, 1, 10 * COIN);
        let b = fund(&mut chain, 2, 10 * COIN);
        chain.mempool.insert(spend(a, 10 * COIN - 50_000), 50_000).unwrap();
        chain.mempool.insert(spend(b, 10 * COIN - 20_000), 20_000).unwrap();

        let asm = assembler(NetworkType::Regtest, AssemblerPolicy::default(), false);
        let t = asm
            .create_new_block(&chain, &Script::from(vec![0x51]), MiningMode::Work, None)
            .unwrap();
        assert_eq!(t.block.transactions.len(), 3);
        assert_eq!(t.total_fees, 70_000);
        assert_eq!(t.tx_fees[0], -70_000);
        assert_eq!(t.tx_fees[1..].iter().sum::<i64>(), 70_000);
        assert_eq!(t.block.transactions[0].outputs[0].value, 50 * COIN + 70_000);
        assert_eq!(asm.context().last_block_tx(), 2);
    }

    #[test]
    fn parent_precedes_higher_fee_child() {
        let mut chain = chain();
        let a = fund(&mut chain, 1, 10 * COIN);
        let parent = spend(a, 10 * COIN - 1_000);
        let parent_id = chain.mempool.insert(parent, 1_000).unwrap();
        let child = spend(OutPoint::new(parent_id, 0), 10 * COIN - 500_000);
        let child_id = chain.mempool.insert(child, 499_000).unwrap();

        let policy = AssemblerPolicy { block_priority_size: 0, ..AssemblerPolicy::default() };
        let asm = assembler(NetworkType::Regtest, policy, false);
        let t = asm
            .create_new_block(&chain, &Script::from(vec![0x51]), MiningMode::Work, None)
            .unwrap();
        let ids: Vec<Hash256> =
            t.block.transactions[1..].iter().map(|tx| tx.txid().unwrap()).collect();
        assert_eq!(ids, vec![parent_id, child_id]);
        assert_eq!(t.fee_phase_start, Some(0));
    }

    #[test]
    fn sigop_limit_skips_heavy_transaction() {
        let mut chain = chain();
        let a = fund(&mut chain, 1, 10 * COIN);
        let mut heavy = spend(a, 10 * COIN - 100_000);
        let params = ChainParams::for_network(NetworkType::Regtest);
        heavy.outputs[0].script_pubkey =
            Script::from(vec![OP_CHECKSIG; params.max_block_sigops as usize]);
        chain.mempool.insert(heavy, 100_000).unwrap();
        let b = fund(&mut chain, 2, 10 * COIN);
        let light_id = chain.mempool.insert(spend(b, 10 * COIN - 20_000), 20_000).unwrap();

        let asm = assembler(NetworkType::Regtest, AssemblerPolicy::default(), false);
        let t = asm
            .create_new_block(&chain, &Script::from(vec![0x51]), MiningMode::Work, None)
            .unwrap();
        assert_eq!(t.block.transactions.len(), 2);
        assert_eq!(t.block.transactions[1].txid().unwrap(), light_id);
        assert!(t.tx_sigops.iter().sum::<u64>() < params.max_block_sigops);
    }

    #[test]
    fn free_transactions_skipped_after_switch() {
        let mut chain = chain();
        let a = fund(&mut chain, 1, 10 * COIN);
        chain.mempool.insert(spend(a, 10 * COIN), 0).unwrap();

        let policy = AssemblerPolicy { block_priority_size: 0, ..AssemblerPolicy::default() };
        let asm = assembler(NetworkType::Regtest, policy, false);
        let t = asm
            .create_new_block(&chain, &Script::from(vec![0x51]), MiningMode::Work, None)
            .unwrap();
        assert_eq!(t.block.transactions.len(), 1);
    }

    #[test]
    fn fee_delta_lets_free_transaction_in() {
        let mut chain = chain();
        let a = fund(&mut chain, 1, 10 * COIN);
        let id = chain.mempool.insert(spend(a, 10 * COIN), 0).unwrap();
        chain.mempool.prioritise(id, 0.0, 1);

        let policy = AssemblerPolicy { block_priority_size: 0, ..AssemblerPolicy::default() };
        let asm = assembler(NetworkType::Regtest, policy, false);
        let t = asm
            .create_new_block(&chain, &Script::from(vec![0x51]), MiningMode::Work, None)
            .unwrap();
        assert_eq!(t.block.transactions.len(), 2);
    }

    #[test]
    fn invalid_outpoint_never_admitted() {
        let mut chain = chain();
        let a = fund(&mut chain, 1, 10 * COIN);
        chain.mempool.insert(spend(a.clone(), 10 * COIN - 50_000), 50_000).unwrap();

        let asm = assembler(NetworkType::Regtest, AssemblerPolicy::default(), false)
            .with_invalid_outpoints([a].into_iter().collect());
        let t = asm
            .create_new_block(&chain, &Script::from(vec![0x51]), MiningMode::Work, None)
            .unwrap();
        assert_eq!(t.block.transactions.len(), 1);
    }

    #[test]
    fn validator_rejection_discards_candidate() {
        let chain = chain();
        let asm = assembler(NetworkType::Regtest, AssemblerPolicy::default(), true);
        let err = asm
            .create_new_block(&chain, &Script::from(vec![0x51]), MiningMode::Work, None)
            .unwrap_err();
        assert!(matches!(err, AssemblyError::Rejected { .. }));
    }

    #[test]
    fn no_tip_is_an_error() {
        let chain = ChainState::new(MemoryCoinsView::new(), Mempool::with_defaults());
        let asm = assembler(NetworkType::Regtest, AssemblerPolicy::default(), false);
        assert_eq!(
            asm.create_new_block(&chain, &Script::default(), MiningMode::Work, None).unwrap_err(),
            AssemblyError::NoChainTip
        );
    }

    #[test]
    fn version_override_only_on_demand() {
        let chain = chain();
        let policy =
            AssemblerPolicy { block_version_override: Some(7), ..AssemblerPolicy::default() };

        let regtest = assembler(NetworkType::Regtest, policy.clone(), false);
        let t = regtest
            .create_new_block(&chain, &Script::default(), MiningMode::Work, None)
            .unwrap();
        assert_eq!(t.block.header.version, 7);

        let testnet = assembler(NetworkType::Testnet, policy, false);
        let t = testnet
            .create_new_block(&chain, &Script::default(), MiningMode::Work, None)
            .unwrap();
        assert_eq!(t.block.header.version, BLOCK_VERSION);
    }

    #[test]
    fn update_time_respects_median() {
        let asm = assembler(NetworkType::Regtest, AssemblerPolicy::default(), false);
        let mut prev = tip();
        prev.median_time_past = NOW + 10;
        let mut header = BlockHeader {
            version: 1,
            prev_hash: prev.hash,
            merkle_root: Hash256::ZERO,
            time: NOW - 5,
            bits: 0,
            nonce: 0,
        };
        assert_eq!(asm.update_time(&mut header, &prev), 16);
        assert_eq!(header.time, NOW + 11);
        // Regtest allows minimum difficulty, so bits were refreshed.
        assert_eq!(header.bits, POW_LIMIT_BITS_REGTEST);
    }

    #[test]
    fn extra_nonce_resets_on_new_parent() {
        let chain = chain();
        let asm = assembler(NetworkType::Regtest, AssemblerPolicy::default(), false);
        let mut t = asm
            .create_new_block(&chain, &Script::default(), MiningMode::Work, None)
            .unwrap();
        let mut nonce = ExtraNonce::new();

        assert_eq!(nonce.increment(&mut t.block, &tip()).unwrap(), 1);
        assert_eq!(nonce.increment(&mut t.block, &tip()).unwrap(), 2);
        assert_eq!(
            t.block.transactions[0].inputs[0].script_sig,
            Script::coinbase(TIP_HEIGHT + 1, Some(2))
        );
        assert_eq!(t.block.header.merkle_root, block_merkle_root(&t.block.transactions).unwrap());

        t.block.header.prev_hash = Hash256([0xbb; 32]);
        assert_eq!(nonce.increment(&mut t.block, &tip()).unwrap(), 1);
    }

    // ======================================================================
    // Stake blocks
    // ======================================================================

    fn stake_wallet(chain: &mut ChainState<MemoryCoinsView>) -> StakeWallet {
        let outpoint = fund(chain, 9, 500 * COIN);
        StakeWallet {
            candidate: StakeCandidate {
                outpoint,
                output: TxOutput::new(500 * COIN, Script::from(vec![0x51])),
            },
            searched: Mutex::new(0),
        }
    }

    #[test]
    fn stake_block_carries_coinstake() {
        let mut chain = chain();
        let wallet = stake_wallet(&mut chain);
        let asm = assembler(NetworkType::Regtest, AssemblerPolicy::default(), false);
        let t = asm
            .create_new_block(&chain, &Script::default(), MiningMode::Stake, Some(&wallet))
            .unwrap();

        assert!(t.block.is_proof_of_stake());
        assert!(t.block.transactions[0].outputs[0].is_empty());
        assert_eq!(t.block.header.time, t.block.transactions[1].time);
        assert_eq!(t.block.payee, Script::default());
        assert_eq!(t.tx_fees.len(), t.block.transactions.len());
        assert_eq!(asm.context().stake_gate.last_search_time(), NOW);
    }

    #[test]
    fn mempool_spend_of_kernel_input_is_excluded() {
        let mut chain = chain();
        let wallet = stake_wallet(&mut chain);
        let conflicting = spend(wallet.candidate.outpoint.clone(), 400 * COIN);
        chain.mempool.insert(conflicting, 100 * COIN).unwrap();

        let asm = assembler(NetworkType::Regtest, AssemblerPolicy::default(), false);
        let t = asm
            .create_new_block(&chain, &Script::default(), MiningMode::Stake, Some(&wallet))
            .unwrap();
        assert_eq!(t.block.transactions.len(), 2);
    }

    #[test]
    fn stake_mode_needs_wallet() {
        let chain = chain();
        let asm = assembler(NetworkType::Regtest, AssemblerPolicy::default(), false);
        assert_eq!(
            asm.create_new_block(&chain, &Script::default(), MiningMode::Stake, None).unwrap_err(),
            AssemblyError::NoWallet
        );
    }

    #[test]
    fn stake_search_skipped_when_clock_goes_back() {
        let mut chain = chain();
        let wallet = stake_wallet(&mut chain);
        let asm = assembler(NetworkType::Regtest, AssemblerPolicy::default(), false);
        asm.context().stake_gate.run(NOW + 100, |_| ());
        assert_eq!(
            asm.create_new_block(&chain, &Script::default(), MiningMode::Stake, Some(&wallet))
                .unwrap_err(),
            AssemblyError::StakeSearchSkipped
        );
    }

    #[test]
    fn same_second_is_searched_once() {
        let mut chain = chain();
        let wallet = stake_wallet(&mut chain);
        let asm = assembler(NetworkType::Regtest, AssemblerPolicy::default(), false);
        let first = asm
            .create_new_block(&chain, &Script::default(), MiningMode::Stake, Some(&wallet))
            .unwrap();
        assert!(first.block.is_proof_of_stake());
        assert_eq!(
            asm.create_new_block(&chain, &Script::default(), MiningMode::Stake, Some(&wallet))
                .unwrap_err(),
            AssemblyError::StakeSearchSkipped
        );
        assert_eq!(*wallet.searched.lock(), 1);
    }

    #[test]
    fn young_stake_finds_nothing() {
        let mut chain = chain();
        let wallet = stake_wallet(&mut chain);
        let txid = wallet.candidate.outpoint.txid;
        let mut coins = chain.coins.access_coins(&txid).unwrap();
        coins.time = NOW;
        chain.coins.insert(txid, coins);
        let asm = assembler(NetworkType::Regtest, AssemblerPolicy::default(), false);
        assert_eq!(
            asm.create_new_block(&chain, &Script::default(), MiningMode::Stake, Some(&wallet))
                .unwrap_err(),
            AssemblyError::NoStakeFound
        );
        assert_eq!(*wallet.searched.lock(), 1);
    }
}
