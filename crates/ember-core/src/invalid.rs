//! Registry of outpoints known to be fraudulent.
//!
//! Such outputs should never reach the mempool, but block assembly checks
//! anyway and drops any transaction that spends one.

use std::collections::HashSet;

use serde::Deserialize;

use crate::error::EmberError;
use crate::types::{Hash256, OutPoint};

#[derive(Deserialize)]
struct Record {
    txid: String,
    n: u32,
}

/// A set of blacklisted outpoints.
#[derive(Debug, Clone, Default)]
pub struct InvalidOutpoints {
    outpoints: HashSet<OutPoint>,
}

impl InvalidOutpoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON array of `{"txid": "<64 hex>", "n": <index>}`.
    pub fn from_json(json: &str) -> Result<Self, EmberError> {
        let records: Vec<Record> = serde_json::from_str(json)
            .map_err(|e| EmberError::Config(format!("invalid outpoint list: {e}")))?;
        let mut set = Self::new();
        for record in records {
            let bytes = hex::decode(&record.txid)
                .map_err(|e| EmberError::Config(format!("bad txid {}: {e}", record.txid)))?;
            let txid: [u8; 32] = bytes
                .try_into()
                .map_err(|_| EmberError::Config(format!("txid {} is not 32 bytes", record.txid)))?;
            set.insert(OutPoint::new(Hash256(txid), record.n));
        }
        Ok(set)
    }

    pub fn insert(&mut self, outpoint: OutPoint) -> bool {
        self.outpoints.insert(outpoint)
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.outpoints.contains(outpoint)
    }

    pub fn len(&self) -> usize {
        self.outpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outpoints.is_empty()
    }
}

impl FromIterator<OutPoint> for InvalidOutpoints {
    fn from_iter<I: IntoIterator<Item = OutPoint>>(iter: I) -> Self {
        Self {
            outpoints: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_json_list() {
        let txid = "ab".repeat(32);
        let json = format!(r#"[{{"txid":"{txid}","n":3}}]"#);
        let set = InvalidOutpoints::from_json(&json).unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.contains(&OutPoint::new(Hash256([0xab; 32]), 3)));
        assert!(!set.contains(&OutPoint::new(Hash256([0xab; 32]), 2)));
    }

    #[test]
    fn rejects_short_txid() {
        let json = r#"[{"txid":"abcd","n":0}]"#;
        assert!(InvalidOutpoints::from_json(json).is_err());
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(InvalidOutpoints::from_json("{not json").is_err());
    }
}
