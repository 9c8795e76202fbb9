//! Compact ("nBits") difficulty target encoding.
//!
//! A compact target packs a 256-bit value into 32 bits: the high byte is the
//! length in bytes, the low 23 bits are the mantissa, and bit 23 is a sign
//! bit that must never be set for a valid target.

use primitive_types::U256;

use crate::error::CompactError;
use crate::types::Hash256;

const SIGN_BIT: u32 = 0x0080_0000;
const MANTISSA_MASK: u32 = 0x007f_ffff;

/// Expand compact bits into a full-width target.
///
/// Negative, overflowing, and zero targets are rejected.
pub fn target_from_compact(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let word = bits & MANTISSA_MASK;

    if word != 0 && bits & SIGN_BIT != 0 {
        return Err(CompactError::Negative(bits));
    }
    if word != 0 && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32)) {
        return Err(CompactError::Overflow(bits));
    }

    let target = if size <= 3 {
        U256::from(word >> (8 * (3 - size)))
    } else {
        U256::from(word) << (8 * (size - 3) as usize)
    };

    if target.is_zero() {
        return Err(CompactError::Zero(bits));
    }
    Ok(target)
}

/// Encode a target in compact form. Precision below the mantissa is lost.
pub fn compact_from_target(target: U256) -> u32 {
    let mut size = target.bits().div_ceil(8) as u32;
    let mut compact = if size <= 3 {
        (target.low_u64() << (8 * (3 - size))) as u32
    } else {
        (target >> (8 * (size - 3) as usize)).low_u64() as u32
    };
    if compact & SIGN_BIT != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | (size << 24)
}

/// Whether `hash`, read as a little-endian integer, is at or below the
/// target encoded by `bits`.
pub fn hash_meets_target(hash: &Hash256, bits: u32) -> Result<bool, CompactError> {
    let target = target_from_compact(bits)?;
    Ok(hash.to_u256() <= target)
}
