//! Collaborator interfaces for block assembly and staking.
//!
//! These traits are the seams between the assembly core and the rest of a
//! node:
//! - [`DifficultyRetarget`]: next required compact target
//! - [`BlockValidator`]: full consensus check of a finished candidate
//! - [`ScriptVerifier`]: script/signature interpreter
//! - [`PaymentResolver`]: masternode and budget payee allocation
//! - [`BlockSubmitter`]: local acceptance plus peer broadcast
//! - [`NetworkStatus`]: peer and masternode-sync liveness signals
//! - [`MiningWallet`]: reserved keys, stakeable coins, coinstake and block signing

use std::sync::Arc;

use crate::coins::CoinsView;
use crate::error::{BlockError, SubmitError, WalletError};
use crate::script::Script;
use crate::types::{Block, BlockHeader, BlockIndex, OutPoint, Transaction, TxOutput};

/// Network-adjusted wall clock in Unix seconds.
pub type Clock = Arc<dyn Fn() -> u32 + Send + Sync>;

/// The system clock, saturating at `u32::MAX`.
pub fn system_clock() -> Clock {
    Arc::new(|| {
        let secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        u32::try_from(secs).unwrap_or(u32::MAX)
    })
}

/// Difficulty adjustment.
pub trait DifficultyRetarget: Send + Sync {
    /// Compact target the block following `prev` must meet.
    ///
    /// `header` carries the candidate's time; `is_stake` selects the
    /// proof-of-stake schedule.
    fn next_required_bits(&self, prev: &BlockIndex, header: &BlockHeader, is_stake: bool) -> u32;
}

/// Full consensus validation of an assembled candidate.
pub trait BlockValidator: Send + Sync {
    /// Check `block` as the successor of `prev`, against `coins` as they stood
    /// before the block. Signature and proof-of-work checks are skipped: the
    /// candidate has no nonce or block signature yet.
    fn test_block_validity(
        &self,
        block: &Block,
        prev: &BlockIndex,
        coins: &dyn CoinsView,
    ) -> Result<(), BlockError>;
}

/// Script interpreter.
pub trait ScriptVerifier: Send + Sync {
    /// Run `script_sig` then `script_pubkey` for input `input_index` of `tx`.
    fn verify(
        &self,
        script_sig: &Script,
        script_pubkey: &Script,
        flags: u32,
        tx: &Transaction,
        input_index: usize,
    ) -> bool;
}

/// Masternode and budget payments.
pub trait PaymentResolver: Send + Sync {
    /// Add payee outputs to `coinbase` for a block at `height` collecting
    /// `fees`. Output 0 is the miner's; resolvers append after it.
    fn fill_payee(&self, coinbase: &mut Transaction, fees: u64, height: u64, is_stake: bool);
}

/// Hands finished blocks to the node.
pub trait BlockSubmitter: Send + Sync {
    /// Current best block, if any.
    fn tip(&self) -> Option<BlockIndex>;

    /// Process `block` as if received from a peer, then announce it.
    fn submit(&self, block: &Block) -> Result<(), SubmitError>;
}

/// Liveness signals used to decide whether staking is worthwhile.
pub trait NetworkStatus: Send + Sync {
    fn peer_count(&self) -> usize;

    fn masternodes_synced(&self) -> bool;

    fn enabled_masternodes(&self) -> usize;

    fn known_masternodes(&self) -> usize;

    /// Masternode list fully synced, every known node enabled, and more than
    /// one enabled node.
    fn cluster_converged(&self) -> bool {
        let enabled = self.enabled_masternodes();
        self.masternodes_synced() && enabled == self.known_masternodes() && enabled > 1
    }
}

/// An output the wallet could stake. The kernel check resolves the rest of
/// its context (creating tx time, confirming height) from the chain's coins.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StakeCandidate {
    pub outpoint: OutPoint,
    pub output: TxOutput,
}

/// Wallet operations the miner depends on.
pub trait MiningWallet: Send + Sync {
    fn is_locked(&self) -> bool;

    /// Spendable balance in base units.
    fn balance(&self) -> u64;

    /// Whether any output is old and deep enough to stake.
    fn mintable_coins(&self) -> bool;

    /// Outputs eligible as kernel inputs.
    fn stake_candidates(&self) -> Vec<StakeCandidate>;

    /// Build and sign a coinstake spending `kernel` at `time`.
    fn create_coinstake(
        &self,
        kernel: &StakeCandidate,
        time: u32,
    ) -> Result<Transaction, WalletError>;

    /// Sign a stake block with the key of its coinstake's kernel input.
    fn sign_block(&self, block: &mut Block) -> Result<(), WalletError>;

    /// Take a fresh key from the pool for a coinbase payout.
    fn reserve_script(&self) -> Result<Script, WalletError>;

    /// Mark a reserved key used so it is not handed out again.
    fn keep_script(&self, script: &Script);
}

#[cfg(test)]
mod tests {
    use super::*;

    // ------------------------------------------------------------------
    // Mock: NetworkStatus
    // ------------------------------------------------------------------

    struct MockNetwork {
        synced: bool,
        enabled: usize,
        known: usize,
    }

    impl NetworkStatus for MockNetwork {
        fn peer_count(&self) -> usize {
            1
        }
        fn masternodes_synced(&self) -> bool {
            self.synced
        }
        fn enabled_masternodes(&self) -> usize {
            self.enabled
        }
        fn known_masternodes(&self) -> usize {
            self.known
        }
    }

    #[test]
    fn converged_requires_all_conditions() {
        let net = |synced, enabled, known| MockNetwork { synced, enabled, known };
        assert!(net(true, 3, 3).cluster_converged());
        assert!(!net(false, 3, 3).cluster_converged());
        assert!(!net(true, 2, 3).cluster_converged());
        assert!(!net(true, 1, 1).cluster_converged());
    }

    #[test]
    fn system_clock_is_recent() {
        let clock = system_clock();
        assert!(clock() > 1_600_000_000);
    }
}
