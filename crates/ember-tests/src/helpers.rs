//! Shared builders and collaborator doubles for the integration tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use ember_consensus::assembler::{AssemblerPolicy, AssemblyContext, BlockAssembler, Collaborators};
use ember_core::chain::{ChainState, SharedChain};
use ember_core::coins::{Coins, CoinsView, CoinsViewCache, MemoryCoinsView};
use ember_core::constants::COIN;
use ember_core::error::{BlockError, SubmitError, TransactionError, WalletError};
use ember_core::mempool::Mempool;
use ember_core::merkle::block_merkle_root;
use ember_core::params::ChainParams;
use ember_core::script::Script;
use ember_core::traits::{
    BlockSubmitter, BlockValidator, DifficultyRetarget, MiningWallet, NetworkStatus,
    PaymentResolver, ScriptVerifier, StakeCandidate,
};
use ember_core::types::{
    Block, BlockHeader, BlockIndex, Hash256, OutPoint, Transaction, TxInput, TxOutput,
};

/// Time of the genesis block and of every funding transaction.
pub const GENESIS_TIME: u32 = 1_700_000_000;

/// Block subsidy paid by [`SubsidyPayments`].
pub const SUBSIDY: u64 = 50 * COIN;

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// A distinct locking script per seed.
pub fn pay_script(seed: u8) -> Script {
    Script::pay_to_pubkey_hash(&[seed; 20])
}

/// Coins of a plain (non-coinbase) transaction with one output.
pub fn funding_coins(value: u64, height: u64, time: u32) -> Coins {
    Coins {
        outputs: vec![Some(TxOutput::new(value, pay_script(0)))],
        height,
        time,
        is_coinbase: false,
        is_coinstake: false,
    }
}

/// An unsigned spend of `prevs` paying `value_out` to one output.
pub fn spend(prevs: &[OutPoint], value_out: u64) -> Transaction {
    Transaction {
        version: 1,
        time: GENESIS_TIME,
        inputs: prevs
            .iter()
            .map(|op| TxInput::new(op.clone(), Script::from(vec![0x01])))
            .collect(),
        outputs: vec![TxOutput::new(value_out, pay_script(1))],
        lock_time: 0,
    }
}

/// A spend of `prev` whose serialized size is exactly `size` bytes, padded
/// with a zero-value data output.
pub fn padded_spend(prev: &OutPoint, value_out: u64, size: usize) -> Transaction {
    for sig_len in 1..=2usize {
        let build = |pad: usize| {
            let mut tx = spend(std::slice::from_ref(prev), value_out);
            tx.inputs[0].script_sig = Script::from(vec![0x01; sig_len]);
            tx.outputs.push(TxOutput::new(0, Script::from(vec![0u8; pad])));
            tx
        };
        let base = build(0).serialized_size().unwrap();
        let estimate = size.saturating_sub(base);
        for pad in estimate.saturating_sub(6)..=estimate + 6 {
            let tx = build(pad);
            if tx.serialized_size().unwrap() == size {
                return tx;
            }
        }
    }
    panic!("cannot pad a spend to {size} bytes");
}

/// A block holding only a coinbase that pays `SUBSIDY` to `pay_script(0)`.
pub fn coinbase_only_block(prev_hash: Hash256, height: u64, time: u32, bits: u32) -> Block {
    let coinbase = Transaction {
        version: 1,
        time,
        inputs: vec![TxInput::new(OutPoint::null(), Script::coinbase(height, None))],
        outputs: vec![TxOutput::new(SUBSIDY, pay_script(0))],
        lock_time: 0,
    };
    let transactions = vec![coinbase];
    Block {
        header: BlockHeader {
            version: 1,
            prev_hash,
            merkle_root: block_merkle_root(&transactions).unwrap(),
            time,
            bits,
            nonce: 0,
        },
        transactions,
        payee: Script::default(),
        signature: Vec::new(),
    }
}

pub fn genesis_block(bits: u32) -> Block {
    coinbase_only_block(Hash256::ZERO, 0, GENESIS_TIME, bits)
}

/// Connect a coinbase-only block on top of `chain`'s tip, `spacing` seconds
/// after it.
pub fn extend_chain(chain: &mut ChainState<MemoryCoinsView>, spacing: u32) {
    let tip = chain.tip().cloned().expect("chain has a tip");
    let block = coinbase_only_block(tip.hash, tip.height + 1, tip.time + spacing, tip.bits);
    chain.connect_block(&block).unwrap();
}

/// The genesis coinbase output as a stake candidate.
pub fn genesis_stake(params: &ChainParams) -> StakeCandidate {
    let txid = genesis_block(params.genesis_bits).transactions[0].txid().unwrap();
    StakeCandidate {
        outpoint: OutPoint::new(txid, 0),
        output: TxOutput::new(SUBSIDY, pay_script(0)),
    }
}

/// Chain state with genesis connected.
pub fn chain_with_genesis(params: &ChainParams) -> ChainState<MemoryCoinsView> {
    let mut chain = ChainState::new(MemoryCoinsView::new(), Mempool::with_defaults());
    chain.connect_block(&genesis_block(params.genesis_bits)).unwrap();
    chain
}

/// Tip index at `height` without any blocks behind it.
pub fn bare_tip(height: u64, time: u32, bits: u32) -> BlockIndex {
    BlockIndex {
        hash: Hash256([0xCD; 32]),
        height,
        time,
        bits,
        stake_modifier: 0x0bad_5eed,
        median_time_past: time.saturating_sub(600),
    }
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Retargets to a fixed compact value.
pub struct FixedRetarget(pub u32);

impl DifficultyRetarget for FixedRetarget {
    fn next_required_bits(&self, _: &BlockIndex, _: &BlockHeader, _: bool) -> u32 {
        self.0
    }
}

/// Passes every script.
pub struct AcceptScripts;

impl ScriptVerifier for AcceptScripts {
    fn verify(&self, _: &Script, _: &Script, _: u32, _: &Transaction, _: usize) -> bool {
        true
    }
}

/// Pays the subsidy plus fees to the miner's output in work blocks.
pub struct SubsidyPayments;

impl PaymentResolver for SubsidyPayments {
    fn fill_payee(&self, coinbase: &mut Transaction, fees: u64, _: u64, is_stake: bool) {
        if !is_stake {
            coinbase.outputs[0].value = SUBSIDY + fees;
        }
    }
}

/// Structural validator: coinbase first, merkle root, limits, and every
/// spend resolvable in order against a private overlay.
pub struct ReferenceValidator {
    pub max_size: u64,
    pub max_sigops: u64,
    pub checked: AtomicUsize,
}

impl ReferenceValidator {
    pub fn for_params(params: &ChainParams) -> Self {
        Self {
            max_size: params.max_block_size,
            max_sigops: params.max_block_sigops,
            checked: AtomicUsize::new(0),
        }
    }

    pub fn checked(&self) -> usize {
        self.checked.load(Ordering::Relaxed)
    }
}

impl BlockValidator for ReferenceValidator {
    fn test_block_validity(
        &self,
        block: &Block,
        prev: &BlockIndex,
        coins: &dyn CoinsView,
    ) -> Result<(), BlockError> {
        self.checked.fetch_add(1, Ordering::Relaxed);
        if block.header.prev_hash != prev.hash {
            return Err(BlockError::InvalidPrevHash);
        }
        let coinbase = block.coinbase().ok_or(BlockError::NoCoinbase)?;
        if !coinbase.is_coinbase() {
            return Err(BlockError::FirstTxNotCoinbase);
        }
        let root = block_merkle_root(&block.transactions).map_err(|e| tx_error(0, e))?;
        if root != block.header.merkle_root {
            return Err(BlockError::InvalidMerkleRoot);
        }

        let size = block.serialized_size().map_err(|e| tx_error(0, e))?;
        if size as u64 > self.max_size {
            return Err(BlockError::OversizedBlock { size, max: self.max_size as usize });
        }

        let height = prev.height + 1;
        let mut overlay = CoinsViewCache::new(coins);
        let mut sigops = 0u64;
        for (index, tx) in block.transactions.iter().enumerate() {
            sigops += u64::from(tx.legacy_sigop_count()) + u64::from(overlay.p2sh_sigop_count(tx));
            if index > 0 && !overlay.have_inputs(tx) {
                let txid = tx.txid().map_err(|e| tx_error(index, e))?;
                return Err(BlockError::DoubleSpend(txid.to_string()));
            }
            overlay
                .apply_transaction(tx, height)
                .map_err(|e| tx_error(index, e))?;
        }
        if sigops > self.max_sigops {
            return Err(BlockError::TooManySigops { count: sigops, max: self.max_sigops });
        }
        Ok(())
    }
}

/// Rejects every block.
pub struct RejectAll;

impl BlockValidator for RejectAll {
    fn test_block_validity(
        &self,
        _: &Block,
        _: &BlockIndex,
        _: &dyn CoinsView,
    ) -> Result<(), BlockError> {
        Err(BlockError::InvalidPoW)
    }
}

/// Collaborators with a fixed target and the reference validator.
pub fn collaborators(params: &ChainParams, bits: u32) -> (Collaborators, Arc<ReferenceValidator>) {
    let validator = Arc::new(ReferenceValidator::for_params(params));
    let collaborators = Collaborators {
        retarget: Arc::new(FixedRetarget(bits)),
        validator: validator.clone(),
        verifier: Arc::new(AcceptScripts),
        payments: Arc::new(SubsidyPayments),
    };
    (collaborators, validator)
}

/// Assembler whose clock reads `now`.
pub fn assembler_at(
    params: &ChainParams,
    policy: AssemblerPolicy,
    collaborators: Collaborators,
    now: u32,
) -> BlockAssembler {
    BlockAssembler::new(params.clone(), policy, collaborators, Arc::new(AssemblyContext::new()))
        .with_clock(Arc::new(move || now))
}

// ---------------------------------------------------------------------------
// Node and wallet doubles
// ---------------------------------------------------------------------------

/// Submits into a shared in-memory chain and reports scripted peer state.
pub struct LocalNode {
    pub chain: SharedChain<MemoryCoinsView>,
    pub peers: AtomicUsize,
    pub converged: AtomicBool,
    pub accepted: Mutex<Vec<Block>>,
}

impl LocalNode {
    pub fn new(chain: SharedChain<MemoryCoinsView>) -> Self {
        Self {
            chain,
            peers: AtomicUsize::new(1),
            converged: AtomicBool::new(true),
            accepted: Mutex::new(Vec::new()),
        }
    }

    pub fn height(&self) -> Option<u64> {
        self.chain.lock().tip().map(|t| t.height)
    }

    pub fn accepted_count(&self) -> usize {
        self.accepted.lock().len()
    }
}

impl BlockSubmitter for LocalNode {
    fn tip(&self) -> Option<BlockIndex> {
        self.chain.lock().tip().cloned()
    }

    fn submit(&self, block: &Block) -> Result<(), SubmitError> {
        let mut chain = self.chain.lock();
        let tip = chain.tip().map(|t| t.hash).unwrap_or_default();
        if block.header.prev_hash != tip {
            return Err(SubmitError::Stale {
                prev: block.header.prev_hash.to_string(),
                tip: tip.to_string(),
            });
        }
        chain
            .connect_block(block)
            .map_err(|e| SubmitError::Rejected(e.to_string()))?;
        drop(chain);
        self.accepted.lock().push(block.clone());
        Ok(())
    }
}

impl NetworkStatus for LocalNode {
    fn peer_count(&self) -> usize {
        self.peers.load(Ordering::Relaxed)
    }

    fn masternodes_synced(&self) -> bool {
        self.converged.load(Ordering::Relaxed)
    }

    fn enabled_masternodes(&self) -> usize {
        2
    }

    fn known_masternodes(&self) -> usize {
        2
    }
}

/// Wallet with scripted lock state and a fixed set of stake candidates.
pub struct TestWallet {
    pub locked: AtomicBool,
    pub balance: AtomicU64,
    pub mintable: AtomicBool,
    pub candidates: Mutex<Vec<StakeCandidate>>,
    next_key: AtomicU32,
    pub kept: Mutex<Vec<Script>>,
    pub signed: AtomicUsize,
}

impl Default for TestWallet {
    fn default() -> Self {
        Self {
            locked: AtomicBool::new(false),
            balance: AtomicU64::new(1_000 * COIN),
            mintable: AtomicBool::new(true),
            candidates: Mutex::new(Vec::new()),
            next_key: AtomicU32::new(1),
            kept: Mutex::new(Vec::new()),
            signed: AtomicUsize::new(0),
        }
    }
}

impl TestWallet {
    pub fn with_candidates(candidates: Vec<StakeCandidate>) -> Self {
        Self {
            candidates: Mutex::new(candidates),
            ..Self::default()
        }
    }
}

impl MiningWallet for TestWallet {
    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    fn balance(&self) -> u64 {
        self.balance.load(Ordering::Relaxed)
    }

    fn mintable_coins(&self) -> bool {
        self.mintable.load(Ordering::Relaxed)
    }

    fn stake_candidates(&self) -> Vec<StakeCandidate> {
        self.candidates.lock().clone()
    }

    fn create_coinstake(
        &self,
        kernel: &StakeCandidate,
        time: u32,
    ) -> Result<Transaction, WalletError> {
        if self.is_locked() {
            return Err(WalletError::Locked);
        }
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
        if self.is_locked() {
            return Err(WalletError::Locked);
        }
        block.signature = block.hash().as_bytes().to_vec();
        self.signed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn reserve_script(&self) -> Result<Script, WalletError> {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        debug!(key, "reserved payout key");
        Ok(Script::from(key.to_le_bytes().to_vec()))
    }

    fn keep_script(&self, script: &Script) {
        self.kept.lock().push(script.clone());
    }
}

/// Map a transaction error into the validator's error shape.
pub fn tx_error(index: usize, source: TransactionError) -> BlockError {
    BlockError::TransactionError { index, source }
}
