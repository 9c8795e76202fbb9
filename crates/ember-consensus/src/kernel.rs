//! Proof-of-stake kernel protocol.
//!
//! A stake input proves itself with
//!
//! ```text
//! SHA256d(stake_modifier || tx_prev.time || prevout.txid || prevout.index || time)
//!     / weight <= target
//! ```
//!
//! where the modifier comes from the previous block, integers are
//! little-endian, `weight` is the staked output's value, and `target` is the
//! expanded compact bits. The field layout is consensus-critical. Every
//! function here is pure.

use std::fmt;

use primitive_types::U256;
use tracing::trace;

use ember_core::coins::{Coins, CoinsView};
use ember_core::compact::target_from_compact;
use ember_core::error::KernelError;
use ember_core::params::ChainParams;
use ember_core::script::SCRIPT_VERIFY_NONE;
use ember_core::traits::ScriptVerifier;
use ember_core::types::{BlockIndex, Hash256, OutPoint, Transaction};

/// Bytes hashed for one kernel: u64 + u32 + 32 + u32 + u32.
pub const KERNEL_DATA_SIZE: usize = 8 + 4 + 32 + 4 + 4;

/// Why a well-formed stake input failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KernelRejection {
    /// The referenced output carries no value.
    ZeroWeight,
    /// Not enough blocks between the output's block and the previous block.
    InsufficientDepth { depth: u64, required: u64 },
    /// The output's transaction is younger than the minimum stake age.
    TooYoung { tx_time: u32, min_age: u32, time: u32 },
    /// The weighted hash is above the target.
    AboveTarget { proof: Hash256 },
}

impl fmt::Display for KernelRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroWeight => write!(f, "zero weight"),
            Self::InsufficientDepth { depth, required } => {
                write!(f, "depth {depth} below {required}")
            }
            Self::TooYoung { tx_time, min_age, time } => {
                write!(f, "tx time {tx_time} + min age {min_age} > {time}")
            }
            Self::AboveTarget { proof } => write!(f, "proof {proof} above target"),
        }
    }
}

/// Verdict on a stake input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KernelOutcome {
    Accepted { proof: Hash256 },
    Rejected(KernelRejection),
}

impl KernelOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    pub fn proof(&self) -> Option<Hash256> {
        match self {
            Self::Accepted { proof } => Some(*proof),
            Self::Rejected(_) => None,
        }
    }
}

/// The kernel hash for one stake attempt.
pub fn kernel_hash(
    stake_modifier: u64,
    tx_prev_time: u32,
    prevout: &OutPoint,
    time: u32,
) -> Hash256 {
    let mut data = [0u8; KERNEL_DATA_SIZE];
    data[0..8].copy_from_slice(&stake_modifier.to_le_bytes());
    data[8..12].copy_from_slice(&tx_prev_time.to_le_bytes());
    data[12..44].copy_from_slice(prevout.txid.as_bytes());
    data[44..48].copy_from_slice(&prevout.index.to_le_bytes());
    data[48..52].copy_from_slice(&time.to_le_bytes());
    Hash256::double_sha256(&data)
}

/// `proof / weight <= target`, integer division. Zero weight never meets.
pub fn meets_target(proof: &Hash256, weight: u64, target: U256) -> bool {
    if weight == 0 {
        return false;
    }
    proof.to_u256() / U256::from(weight) <= target
}

/// Resolve the output `prevout` names inside `coins`.
fn staked_value(coins: &Coins, prevout: &OutPoint) -> Result<u64, KernelError> {
    if prevout.is_null() {
        return Err(KernelError::NullOutpoint);
    }
    let len = coins.outputs.len();
    match coins.outputs.get(prevout.index as usize) {
        None => Err(KernelError::IndexOutOfRange {
            txid: prevout.txid.to_string(),
            index: prevout.index,
            len,
        }),
        Some(None) => Err(KernelError::SpentOutput(prevout.to_string())),
        Some(Some(out)) => Ok(out.value),
    }
}

/// Hash and compare one stake input, without the depth and age preconditions.
///
/// `coins` are the outputs of the transaction `prevout` points into.
/// A null outpoint, an index past the outputs, a spent output, or bad bits
/// are protocol errors.
pub fn check_stake_kernel_hash(
    prev: &BlockIndex,
    bits: u32,
    coins: &Coins,
    prevout: &OutPoint,
    time: u32,
) -> Result<KernelOutcome, KernelError> {
    let weight = staked_value(coins, prevout)?;
    if weight == 0 {
        return Ok(KernelOutcome::Rejected(KernelRejection::ZeroWeight));
    }
    let target = target_from_compact(bits)?;

    let proof = kernel_hash(prev.stake_modifier, coins.time, prevout, time);
    trace!(
        modifier = prev.stake_modifier,
        tx_time = coins.time,
        %prevout,
        time,
        %proof,
        weight,
        bits,
        "stake kernel"
    );

    if meets_target(&proof, weight, target) {
        Ok(KernelOutcome::Accepted { proof })
    } else {
        Ok(KernelOutcome::Rejected(KernelRejection::AboveTarget { proof }))
    }
}

/// Full kernel check: confirmation depth, then minimum age, then the hash.
/// Either precondition failing rejects before hashing.
pub fn check_kernel(
    params: &ChainParams,
    prev: &BlockIndex,
    bits: u32,
    coins: &Coins,
    prevout: &OutPoint,
    time: u32,
) -> Result<KernelOutcome, KernelError> {
    let depth = prev.height.saturating_sub(coins.height);
    if prev.height < coins.height || depth < params.stake_min_confirmations {
        return Ok(KernelOutcome::Rejected(KernelRejection::InsufficientDepth {
            depth,
            required: params.stake_min_confirmations,
        }));
    }
    if u64::from(coins.time) + u64::from(params.stake_min_age) > u64::from(time) {
        return Ok(KernelOutcome::Rejected(KernelRejection::TooYoung {
            tx_time: coins.time,
            min_age: params.stake_min_age,
            time,
        }));
    }
    check_stake_kernel_hash(prev, bits, coins, prevout, time)
}

/// Verify a coinstake received in a block: shape, input 0's signature
/// against the output it spends, then [`check_kernel`] at the coinstake's
/// own time.
pub fn check_proof_of_stake(
    params: &ChainParams,
    prev: &BlockIndex,
    bits: u32,
    coinstake: &Transaction,
    coins: &dyn CoinsView,
    verifier: &dyn ScriptVerifier,
) -> Result<KernelOutcome, KernelError> {
    if !coinstake.is_coinstake() {
        return Err(KernelError::MalformedCoinstake(
            "first output not empty or too few outputs".into(),
        ));
    }
    let input = &coinstake.inputs[0];
    let prevout = &input.previous_output;
    let prev_coins = coins
        .access_coins(&prevout.txid)
        .ok_or_else(|| KernelError::MissingCoins(prevout.to_string()))?;
    staked_value(&prev_coins, prevout)?;
    let script_pubkey = prev_coins
        .output(prevout.index)
        .map(|out| &out.script_pubkey)
        .ok_or_else(|| KernelError::SpentOutput(prevout.to_string()))?;

    if !verifier.verify(&input.script_sig, script_pubkey, SCRIPT_VERIFY_NONE, coinstake, 0) {
        return Err(KernelError::SignatureFailure);
    }

    check_kernel(params, prev, bits, &prev_coins, prevout, coinstake.time)
}
