//! In-memory node for mining on demand.
//!
//! Holds the chain and mempool behind one lock, accepts its own blocks, and
//! stands in for the wallet, validator, and payment services a full node
//! would provide. Scripts are not interpreted.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info};

use ember_consensus::assembler::Collaborators;
use ember_core::chain::{ChainState, SharedChain};
use ember_core::coins::{CoinsView, CoinsViewCache, MemoryCoinsView};
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

/// Fixed genesis timestamp shared by every devnet.
pub const GENESIS_TIME: u32 = 1_700_000_000;

/// Coinbase value of every work block, before fees.
pub const BLOCK_SUBSIDY: u64 = 50 * COIN;

/// Genesis block paying an unspendable output.
pub fn genesis_block(params: &ChainParams) -> Result<Block, TransactionError> {
    let coinbase = Transaction {
        version: 1,
        time: GENESIS_TIME,
        inputs: vec![TxInput::new(OutPoint::null(), Script::coinbase(0, None))],
        outputs: vec![TxOutput::new(BLOCK_SUBSIDY, Script::from(vec![0x6a]))],
        lock_time: 0,
    };
    let transactions = vec![coinbase];
    Ok(Block {
        header: BlockHeader {
            version: 1,
            prev_hash: Hash256::ZERO,
            merkle_root: block_merkle_root(&transactions)?,
            time: GENESIS_TIME,
            bits: params.genesis_bits,
            nonce: 0,
        },
        transactions,
        payee: Script::default(),
        signature: Vec::new(),
    })
}

/// Chain with the genesis block connected.
pub fn bootstrap(params: &ChainParams) -> Result<SharedChain<MemoryCoinsView>, BlockError> {
    let genesis =
        genesis_block(params).map_err(|source| BlockError::TransactionError { index: 0, source })?;
    let mut chain = ChainState::new(MemoryCoinsView::new(), Mempool::with_defaults());
    chain.connect_block(&genesis)?;
    Ok(chain.into_shared())
}

/// Collaborators for a devnet: minimum difficulty, no script checks, the
/// whole coinbase to the miner.
pub fn collaborators(params: &ChainParams) -> Collaborators {
    Collaborators {
        retarget: Arc::new(MinimumDifficulty {
            pow_bits: params.pow_limit_bits,
            pos_bits: params.pos_limit_bits,
        }),
        validator: Arc::new(StructuralValidator {
            max_size: params.max_block_size,
            max_sigops: params.max_block_sigops,
        }),
        verifier: Arc::new(SkipScripts),
        payments: Arc::new(MinerTakesAll),
    }
}

// ---------------------------------------------------------------------------
// Consensus stand-ins
// ---------------------------------------------------------------------------

struct MinimumDifficulty {
    pow_bits: u32,
    pos_bits: u32,
}

impl DifficultyRetarget for MinimumDifficulty {
    fn next_required_bits(&self, _: &BlockIndex, _: &BlockHeader, is_stake: bool) -> u32 {
        if is_stake { self.pos_bits } else { self.pow_bits }
    }
}

struct SkipScripts;

impl ScriptVerifier for SkipScripts {
    fn verify(&self, _: &Script, _: &Script, _: u32, _: &Transaction, _: usize) -> bool {
        true
    }
}

struct MinerTakesAll;

impl PaymentResolver for MinerTakesAll {
    fn fill_payee(&self, coinbase: &mut Transaction, fees: u64, _: u64, is_stake: bool) {
        if !is_stake {
            coinbase.outputs[0].value = BLOCK_SUBSIDY + fees;
        }
    }
}

/// Linkage, merkle root, limits, and that every spend resolves in order.
struct StructuralValidator {
    max_size: u64,
    max_sigops: u64,
}

impl BlockValidator for StructuralValidator {
    fn test_block_validity(
        &self,
        block: &Block,
        prev: &BlockIndex,
        coins: &dyn CoinsView,
    ) -> Result<(), BlockError> {
        let tx_error = |index, source| BlockError::TransactionError { index, source };

        if block.header.prev_hash != prev.hash {
            return Err(BlockError::InvalidPrevHash);
        }
        if !block.coinbase().ok_or(BlockError::NoCoinbase)?.is_coinbase() {
            return Err(BlockError::FirstTxNotCoinbase);
        }
        let merkle_root = block_merkle_root(&block.transactions).map_err(|e| tx_error(0, e))?;
        if merkle_root != block.header.merkle_root {
            return Err(BlockError::InvalidMerkleRoot);
        }
        let size = block.serialized_size().map_err(|e| tx_error(0, e))?;
        if size as u64 > self.max_size {
            return Err(BlockError::OversizedBlock { size, max: self.max_size as usize });
        }

        let mut overlay = CoinsViewCache::new(coins);
        let mut sigops = 0u64;
        for (index, tx) in block.transactions.iter().enumerate() {
            sigops += u64::from(tx.legacy_sigop_count()) + u64::from(overlay.p2sh_sigop_count(tx));
            if index > 0 && !overlay.have_inputs(tx) {
                let txid = tx.txid().map_err(|e| tx_error(index, e))?;
                return Err(BlockError::DoubleSpend(txid.to_string()));
            }
            overlay
                .apply_transaction(tx, prev.height + 1)
                .map_err(|e| tx_error(index, e))?;
        }
        if sigops > self.max_sigops {
            return Err(BlockError::TooManySigops { count: sigops, max: self.max_sigops });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// Accepts blocks straight into the shared chain. Reports one peer and a
/// converged masternode list so every miner gate is open.
pub struct DevNode {
    chain: SharedChain<MemoryCoinsView>,
    accepted: AtomicU64,
}

impl DevNode {
    pub fn new(chain: SharedChain<MemoryCoinsView>) -> Self {
        Self {
            chain,
            accepted: AtomicU64::new(0),
        }
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }
}

impl BlockSubmitter for DevNode {
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
        self.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl NetworkStatus for DevNode {
    fn peer_count(&self) -> usize {
        1
    }

    fn masternodes_synced(&self) -> bool {
        true
    }

    fn enabled_masternodes(&self) -> usize {
        2
    }

    fn known_masternodes(&self) -> usize {
        2
    }
}

// ---------------------------------------------------------------------------
// Wallet
// ---------------------------------------------------------------------------

/// Hands out numbered pay-to-pubkey-hash scripts. Holds no keys, so it never
/// stakes.
#[derive(Default)]
pub struct PayoutWallet {
    next_key: AtomicU32,
    kept: Mutex<Vec<Script>>,
}

impl PayoutWallet {
    pub fn kept(&self) -> usize {
        self.kept.lock().len()
    }
}

impl MiningWallet for PayoutWallet {
    fn is_locked(&self) -> bool {
        false
    }

    fn balance(&self) -> u64 {
        0
    }

    fn mintable_coins(&self) -> bool {
        false
    }

    fn stake_candidates(&self) -> Vec<StakeCandidate> {
        Vec::new()
    }

    fn create_coinstake(
        &self,
        kernel: &StakeCandidate,
        _: u32,
    ) -> Result<Transaction, WalletError> {
        Err(WalletError::MissingKey(kernel.outpoint.to_string()))
    }

    fn sign_block(&self, block: &mut Block) -> Result<(), WalletError> {
        Err(WalletError::MissingKey(block.hash().to_string()))
    }

    fn reserve_script(&self) -> Result<Script, WalletError> {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let mut hash = [0u8; 20];
        hash[..4].copy_from_slice(&key.to_be_bytes());
        debug!(key, "reserved payout script");
        Ok(Script::pay_to_pubkey_hash(&hash))
    }

    fn keep_script(&self, script: &Script) {
        info!(script = %script, "payout script used");
        self.kept.lock().push(script.clone());
    }
}
