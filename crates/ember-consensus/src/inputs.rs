//! Contextual input checks for a transaction about to enter a candidate.
//!
//! The prioritizer only checks that inputs can be resolved somewhere. Right
//! before admission the assembler re-runs the full set of checks against the
//! current overlay: every input must still be unspent and spent only once,
//! coinbase and coinstake outputs must be mature, values must balance, and
//! every script must pass.

use ember_core::coins::CoinsView;
use ember_core::error::TransactionError;
use ember_core::types::Transaction;
use ember_core::traits::ScriptVerifier;

/// Validate `tx`'s inputs for inclusion at `spend_height` and return its fee.
pub fn check_inputs(
    tx: &Transaction,
    coins: &dyn CoinsView,
    spend_height: u64,
    coinbase_maturity: u64,
    verifier: &dyn ScriptVerifier,
    flags: u32,
) -> Result<u64, TransactionError> {
    if tx.is_coinbase() {
        return Ok(0);
    }
    if let Some(prev) = tx.duplicate_input() {
        return Err(TransactionError::DuplicateInput(prev.to_string()));
    }

    let mut value_in: u64 = 0;
    for (index, input) in tx.inputs.iter().enumerate() {
        let prev = &input.previous_output;
        if prev.is_null() {
            return Err(TransactionError::NullOutpointInRegularTx(index));
        }
        let prev_coins = coins
            .access_coins(&prev.txid)
            .ok_or_else(|| TransactionError::MissingInputs(prev.to_string()))?;
        if !prev_coins.is_mature(spend_height, coinbase_maturity) {
            return Err(TransactionError::ImmatureSpend { index });
        }
        let out = prev_coins
            .output(prev.index)
            .ok_or_else(|| TransactionError::MissingInputs(prev.to_string()))?;
        value_in = value_in
            .checked_add(out.value)
            .ok_or(TransactionError::ValueOverflow)?;

        if !verifier.verify(&input.script_sig, &out.script_pubkey, flags, tx, index) {
            return Err(TransactionError::ScriptFailure { index });
        }
    }

    let value_out = tx.total_output_value().ok_or(TransactionError::ValueOverflow)?;
    if !tx.is_coinstake() && value_in < value_out {
        return Err(TransactionError::InsufficientFunds {
            have: value_in,
            need: value_out,
        });
    }
    Ok(value_in.saturating_sub(value_out))
}
