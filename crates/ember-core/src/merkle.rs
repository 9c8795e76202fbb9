//! Transaction merkle root.
//!
//! Pairs are hashed as `SHA256d(left || right)`. An odd layer duplicates its
//! last entry, which means two different transaction lists can share a root;
//! [`merkle_root_checked`] reports when that duplication pattern is present.

use crate::error::TransactionError;
use crate::types::{Hash256, Transaction};

fn parent(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(left.as_bytes());
    data[32..].copy_from_slice(right.as_bytes());
    Hash256::double_sha256(&data)
}

/// Merkle root over `leaves`, plus whether any layer contained two identical
/// adjacent hashes (a mutated tree). Empty input yields the zero hash.
pub fn merkle_root_checked(leaves: &[Hash256]) -> (Hash256, bool) {
    if leaves.is_empty() {
        return (Hash256::ZERO, false);
    }
    let mut mutated = false;
    let mut layer = leaves.to_vec();
    while layer.len() > 1 {
        let mut next = Vec::with_capacity(layer.len().div_ceil(2));
        for pair in layer.chunks(2) {
            let left = &pair[0];
            let right = match pair.get(1) {
                Some(right) => {
                    if right == left {
                        mutated = true;
                    }
                    right
                }
                None => left,
            };
            next.push(parent(left, right));
        }
        layer = next;
    }
    (layer[0], mutated)
}

pub fn merkle_root(leaves: &[Hash256]) -> Hash256 {
    merkle_root_checked(leaves).0
}

/// Merkle root over the txids of `txs`.
pub fn block_merkle_root(txs: &[Transaction]) -> Result<Hash256, TransactionError> {
    let ids = txs
        .iter()
        .map(Transaction::txid)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(merkle_root(&ids))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(b: u8) -> Hash256 {
        Hash256([b; 32])
    }

    #[test]
    fn empty_and_single() {
        assert_eq!(merkle_root(&[]), Hash256::ZERO);
        assert_eq!(merkle_root(&[h(1)]), h(1));
    }

    #[test]
    fn pair_is_double_sha() {
        let mut data = [1u8; 64];
        data[32..].fill(2);
        assert_eq!(merkle_root(&[h(1), h(2)]), Hash256::double_sha256(&data));
    }

    #[test]
    fn odd_layer_duplicates_last() {
        assert_eq!(
            merkle_root(&[h(1), h(2), h(3)]),
            merkle_root(&[h(1), h(2), h(3), h(3)])
        );
    }

    #[test]
    fn mutation_detected() {
        let (_, mutated) = merkle_root_checked(&[h(1), h(2), h(3), h(3)]);
        assert!(mutated);
        let (_, mutated) = merkle_root_checked(&[h(1), h(2), h(3)]);
        assert!(!mutated);
    }

    #[test]
    fn order_matters() {
        assert_ne!(merkle_root(&[h(1), h(2)]), merkle_root(&[h(2), h(1)]));
    }
}
