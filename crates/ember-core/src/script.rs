//! Minimal script handling: opcode iteration, signature-operation counting,
//! and the standard script shapes the assembler builds.
//!
//! Script *execution* lives behind [`crate::traits::ScriptVerifier`]; this
//! module only parses enough to count sigops and construct coinbase inputs.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

/// No script verification flags.
pub const SCRIPT_VERIFY_NONE: u32 = 0;
/// Evaluate pay-to-script-hash redeem scripts.
pub const SCRIPT_VERIFY_P2SH: u32 = 1 << 0;
/// Flags every block-included transaction must satisfy.
pub const MANDATORY_SCRIPT_VERIFY_FLAGS: u32 = SCRIPT_VERIFY_P2SH;

/// Sigops charged for a multisig whose key count cannot be determined.
pub const MAX_PUBKEYS_PER_MULTISIG: u32 = 20;

/// A serialized script.
#[derive(
    Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub struct Script(pub Vec<u8>);

/// One parsed script element.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Instruction<'a> {
    Push(&'a [u8]),
    Op(u8),
}

impl Script {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the script's instructions. Iteration stops at the first
    /// malformed push.
    pub fn instructions(&self) -> Instructions<'_> {
        Instructions {
            bytes: &self.0,
            pos: 0,
        }
    }

    /// Append a raw opcode.
    pub fn push_opcode(mut self, op: u8) -> Self {
        self.0.push(op);
        self
    }

    /// Append a data push using the smallest push opcode.
    pub fn push_slice(mut self, data: &[u8]) -> Self {
        let len = data.len();
        if len < OP_PUSHDATA1 as usize {
            self.0.push(len as u8);
        } else if len <= 0xff {
            self.0.push(OP_PUSHDATA1);
            self.0.push(len as u8);
        } else if len <= 0xffff {
            self.0.push(OP_PUSHDATA2);
            self.0.extend_from_slice(&(len as u16).to_le_bytes());
        } else {
            self.0.push(OP_PUSHDATA4);
            self.0.extend_from_slice(&(len as u32).to_le_bytes());
        }
        self.0.extend_from_slice(data);
        self
    }

    /// Append an integer. Small values use the dedicated opcodes.
    pub fn push_int(self, value: i64) -> Self {
        match value {
            0 => self.push_opcode(OP_0),
            -1 => self.push_opcode(OP_1NEGATE),
            1..=16 => self.push_opcode(OP_1 + (value as u8) - 1),
            _ => self.push_slice(&script_num(value)),
        }
    }

    /// Append an integer as a number push, never as a small-int opcode.
    pub fn push_num(self, value: i64) -> Self {
        self.push_slice(&script_num(value))
    }

    /// Coinbase input script: block height followed by the extra nonce, or
    /// `OP_0` when no extra nonce has been applied yet.
    pub fn coinbase(height: u64, extra_nonce: Option<u32>) -> Self {
        let script = Script::new().push_int(height as i64);
        match extra_nonce {
            Some(n) => script.push_num(i64::from(n)),
            None => script.push_opcode(OP_0),
        }
    }

    /// Standard pay-to-pubkey-hash locking script.
    pub fn pay_to_pubkey_hash(hash: &[u8; 20]) -> Self {
        Script::new()
            .push_opcode(OP_DUP)
            .push_opcode(OP_HASH160)
            .push_slice(hash)
            .push_opcode(OP_EQUALVERIFY)
            .push_opcode(OP_CHECKSIG)
    }

    /// Pay-to-script-hash locking script.
    pub fn pay_to_script_hash(hash: &[u8; 20]) -> Self {
        Script::new()
            .push_opcode(OP_HASH160)
            .push_slice(hash)
            .push_opcode(OP_EQUAL)
    }

    /// `OP_HASH160 <20 bytes> OP_EQUAL`, byte-exact.
    pub fn is_pay_to_script_hash(&self) -> bool {
        self.0.len() == 23
            && self.0[0] == OP_HASH160
            && self.0[1] == 0x14
            && self.0[22] == OP_EQUAL
    }

    /// Whether the script consists only of data pushes.
    pub fn is_push_only(&self) -> bool {
        self.instructions().all(|ins| match ins {
            Ok(Instruction::Push(_)) => true,
            Ok(Instruction::Op(op)) => op == OP_1NEGATE || (OP_1..=OP_16).contains(&op),
            Err(_) => false,
        })
    }

    /// Count signature operations.
    ///
    /// With `accurate` set, `OP_CHECKMULTISIG` preceded by `OP_1..OP_16`
    /// counts that many keys; otherwise every multisig is charged the maximum.
    pub fn sigop_count(&self, accurate: bool) -> u32 {
        let mut count = 0u32;
        let mut last_op: Option<u8> = None;
        for ins in self.instructions() {
            let Ok(ins) = ins else { break };
            match ins {
                Instruction::Op(op @ (OP_CHECKSIG | OP_CHECKSIGVERIFY)) => {
                    count = count.saturating_add(1);
                    last_op = Some(op);
                }
                Instruction::Op(op @ (OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY)) => {
                    let keys = match last_op {
                        Some(prev) if accurate && (OP_1..=OP_16).contains(&prev) => {
                            u32::from(prev - OP_1 + 1)
                        }
                        _ => MAX_PUBKEYS_PER_MULTISIG,
                    };
                    count = count.saturating_add(keys);
                    last_op = Some(op);
                }
                Instruction::Op(op) => last_op = Some(op),
                Instruction::Push(_) => last_op = None,
            }
        }
        count
    }

    /// Sigops of the redeem script a pay-to-script-hash spend reveals.
    ///
    /// `self` is the P2SH locking script and `script_sig` the spending input's
    /// unlocking script; the redeem script is its last push.
    pub fn p2sh_sigop_count(&self, script_sig: &Script) -> u32 {
        if !self.is_pay_to_script_hash() || !script_sig.is_push_only() {
            return 0;
        }
        let mut redeem: Option<&[u8]> = None;
        for ins in script_sig.instructions() {
            match ins {
                Ok(Instruction::Push(data)) => redeem = Some(data),
                Ok(Instruction::Op(_)) => redeem = None,
                Err(_) => return 0,
            }
        }
        match redeem {
            Some(bytes) => Script(bytes.to_vec()).sigop_count(true),
            None => 0,
        }
    }
}

impl From<Vec<u8>> for Script {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Script {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

/// Error produced when a push runs past the end of the script.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TruncatedPush;

/// Iterator over a script's instructions.
pub struct Instructions<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Instructions<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], TruncatedPush> {
        let end = self.pos.checked_add(n).ok_or(TruncatedPush)?;
        let slice = self.bytes.get(self.pos..end).ok_or(TruncatedPush)?;
        self.pos = end;
        Ok(slice)
    }

    fn take_len(&mut self, width: usize) -> Result<usize, TruncatedPush> {
        let raw = self.take(width)?;
        let mut buf = [0u8; 4];
        buf[..width].copy_from_slice(raw);
        Ok(u32::from_le_bytes(buf) as usize)
    }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<Instruction<'a>, TruncatedPush>;

    fn next(&mut self) -> Option<Self::Item> {
        let op = *self.bytes.get(self.pos)?;
        self.pos += 1;
        let len = match op {
            OP_0..=0x4b => Ok(op as usize),
            OP_PUSHDATA1 => self.take_len(1),
            OP_PUSHDATA2 => self.take_len(2),
            OP_PUSHDATA4 => self.take_len(4),
            _ => return Some(Ok(Instruction::Op(op))),
        };
        let result = len.and_then(|n| self.take(n)).map(Instruction::Push);
        if result.is_err() {
            self.pos = self.bytes.len();
        }
        Some(result)
    }
}

/// Minimal little-endian sign-magnitude encoding of a script number.
fn script_num(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let negative = value < 0;
    let mut abs = value.unsigned_abs();
    let mut out = Vec::with_capacity(9);
    while abs > 0 {
        out.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    let last = out.len() - 1;
    if out[last] & 0x80 != 0 {
        out.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        out[last] |= 0x80;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_num_encoding() {
        assert_eq!(script_num(0), Vec::<u8>::new());
        assert_eq!(script_num(1), vec![0x01]);
        assert_eq!(script_num(127), vec![0x7f]);
        assert_eq!(script_num(128), vec![0x80, 0x00]);
        assert_eq!(script_num(-1), vec![0x81]);
        assert_eq!(script_num(-128), vec![0x80, 0x80]);
        assert_eq!(script_num(1000), vec![0xe8, 0x03]);
    }

    #[test]
    fn push_int_uses_small_opcodes() {
        assert_eq!(Script::new().push_int(0).0, vec![OP_0]);
        assert_eq!(Script::new().push_int(16).0, vec![OP_16]);
        assert_eq!(Script::new().push_int(17).0, vec![0x01, 17]);
    }

    #[test]
    fn coinbase_script_layout() {
        let s = Script::coinbase(1000, None);
        assert_eq!(s.0, vec![0x02, 0xe8, 0x03, OP_0]);
        let s = Script::coinbase(1000, Some(1));
        assert_eq!(s.0, vec![0x02, 0xe8, 0x03, 0x01, 0x01]);
    }

    #[test]
    fn legacy_sigops() {
        let p2pkh = Script::pay_to_pubkey_hash(&[7u8; 20]);
        assert_eq!(p2pkh.sigop_count(false), 1);

        let multisig = Script::new()
            .push_int(2)
            .push_slice(&[2u8; 33])
            .push_slice(&[3u8; 33])
            .push_int(2)
            .push_opcode(OP_CHECKMULTISIG);
        assert_eq!(multisig.sigop_count(false), MAX_PUBKEYS_PER_MULTISIG);
        assert_eq!(multisig.sigop_count(true), 2);
    }

    #[test]
    fn p2sh_sigops_count_redeem_script() {
        let redeem = Script::new()
            .push_int(1)
            .push_slice(&[2u8; 33])
            .push_slice(&[3u8; 33])
            .push_slice(&[4u8; 33])
            .push_int(3)
            .push_opcode(OP_CHECKMULTISIG);
        let p2sh = Script::pay_to_script_hash(&[9u8; 20]);
        assert!(p2sh.is_pay_to_script_hash());
        let sig = Script::new().push_slice(&[0u8; 71]).push_slice(&redeem.0);
        assert_eq!(p2sh.p2sh_sigop_count(&sig), 3);

        let p2pkh = Script::pay_to_pubkey_hash(&[7u8; 20]);
        assert_eq!(p2pkh.p2sh_sigop_count(&sig), 0);
    }

    #[test]
    fn truncated_push_stops_iteration() {
        let s = Script(vec![0x05, 0x01, 0x02]);
        let items: Vec<_> = s.instructions().collect();
        assert_eq!(items, vec![Err(TruncatedPush)]);
        assert_eq!(s.sigop_count(false), 0);
    }

    #[test]
    fn pushdata_variants() {
        let big = vec![0u8; 300];
        let s = Script::new().push_slice(&big);
        assert_eq!(s.0[0], OP_PUSHDATA2);
        let ins: Vec<_> = s.instructions().collect();
        assert_eq!(ins, vec![Ok(Instruction::Push(&big[..]))]);
    }
}
