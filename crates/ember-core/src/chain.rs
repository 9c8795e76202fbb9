//! Shared chain state: tip index, coin view, and mempool behind one lock.
//!
//! Assembly holds the lock for a whole candidate build so that the tip, the
//! coins, and the mempool it reads are mutually consistent. Nonce search runs
//! on a sealed template after the lock is released.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::coins::{ConnectResult, CoinsView, MemoryCoinsView};
use crate::error::{BlockError, TransactionError};
use crate::mempool::Mempool;
use crate::types::{Block, BlockIndex, Hash256};

/// Number of block times the median-time-past spans.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Chain tip, coins, and mempool as one unit.
pub struct ChainState<C> {
    tip: Option<BlockIndex>,
    /// Newest last, at most [`MEDIAN_TIME_SPAN`] entries.
    recent_times: VecDeque<u32>,
    pub coins: C,
    pub mempool: Mempool,
}

/// A chain state shared across worker tasks.
pub type SharedChain<C> = Arc<Mutex<ChainState<C>>>;

impl<C: CoinsView> ChainState<C> {
    pub fn new(coins: C, mempool: Mempool) -> Self {
        Self {
            tip: None,
            recent_times: VecDeque::with_capacity(MEDIAN_TIME_SPAN),
            coins,
            mempool,
        }
    }

    /// Wrap in the shared lock.
    pub fn into_shared(self) -> SharedChain<C> {
        Arc::new(Mutex::new(self))
    }

    pub fn tip(&self) -> Option<&BlockIndex> {
        self.tip.as_ref()
    }

    /// Replace the tip. Used when the index is maintained elsewhere.
    pub fn set_tip(&mut self, tip: BlockIndex) {
        self.push_time(tip.time);
        self.tip = Some(tip);
    }

    fn push_time(&mut self, time: u32) {
        if self.recent_times.len() == MEDIAN_TIME_SPAN {
            self.recent_times.pop_front();
        }
        self.recent_times.push_back(time);
    }

    fn median_time(&self) -> u32 {
        let mut times: Vec<u32> = self.recent_times.iter().copied().collect();
        times.sort_unstable();
        times.get(times.len() / 2).copied().unwrap_or(0)
    }

    /// Index entry the chain would record for `block` on top of the tip.
    fn next_index(&self, block: &Block) -> BlockIndex {
        let (height, stake_modifier) = match &self.tip {
            Some(tip) => (tip.height + 1, tip.stake_modifier),
            None => (0, 0),
        };
        BlockIndex {
            hash: block.hash(),
            height,
            time: block.header.time,
            bits: block.header.bits,
            stake_modifier,
            median_time_past: 0,
        }
    }
}

impl ChainState<MemoryCoinsView> {
    /// Connect a block that extends the tip. Checks linkage only; the block
    /// must already be valid.
    ///
    /// The stake modifier is carried forward from the previous tip.
    pub fn connect_block(&mut self, block: &Block) -> Result<ConnectResult, BlockError> {
        let expected_prev = self.tip.as_ref().map_or(Hash256::ZERO, |tip| tip.hash);
        if block.header.prev_hash != expected_prev {
            return Err(BlockError::InvalidPrevHash);
        }

        let mut index = self.next_index(block);
        let result = self
            .coins
            .connect_block(block, index.height)
            .map_err(|source: TransactionError| BlockError::TransactionError { index: 0, source })?;
        self.mempool.remove_confirmed_block(block);

        self.push_time(index.time);
        index.median_time_past = self.median_time();
        info!(
            height = index.height,
            hash = %index.hash,
            txs = block.transactions.len(),
            "connected block"
        );
        self.tip = Some(index);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::Script;
    use crate::types::{BlockHeader, OutPoint, Transaction, TxInput, TxOutput};

    fn coinbase(height: u64) -> Transaction {
        Transaction {
            version: 1,
            time: 1_000 + height as u32,
            inputs: vec![TxInput::new(OutPoint::null(), Script::coinbase(height, None))],
            outputs: vec![TxOutput::new(50, Script::from(vec![0x51]))],
            lock_time: 0,
        }
    }

    fn block_on(prev: Hash256, height: u64, time: u32) -> Block {
        Block {
            header: BlockHeader {
                version: 1,
                prev_hash: prev,
                merkle_root: Hash256::ZERO,
                time,
                bits: 0x207f_ffff,
                nonce: 0,
            },
            transactions: vec![coinbase(height)],
            payee: Script::default(),
            signature: vec![],
        }
    }

    #[test]
    fn connect_extends_tip_and_tracks_median() {
        let mut chain = ChainState::new(MemoryCoinsView::new(), Mempool::with_defaults());
        assert!(chain.tip().is_none());

        let mut prev = Hash256::ZERO;
        for h in 0..5u64 {
            let block = block_on(prev, h, 100 + h as u32 * 10);
            chain.connect_block(&block).unwrap();
            prev = block.hash();
        }
        let tip = chain.tip().unwrap();
        assert_eq!(tip.height, 4);
        assert_eq!(tip.hash, prev);
        assert_eq!(tip.median_time_past, 120);
        assert_eq!(chain.coins.len(), 5);
    }

    #[test]
    fn connect_rejects_wrong_parent() {
        let mut chain = ChainState::new(MemoryCoinsView::new(), Mempool::with_defaults());
        let block = block_on(Hash256([1; 32]), 0, 100);
        assert_eq!(chain.connect_block(&block), Err(BlockError::InvalidPrevHash));
    }

    #[test]
    fn median_window_is_bounded() {
        let mut chain = ChainState::new(MemoryCoinsView::new(), Mempool::with_defaults());
        let mut prev = Hash256::ZERO;
        for h in 0..20u64 {
            let block = block_on(prev, h, 1_000 + h as u32);
            chain.connect_block(&block).unwrap();
            prev = block.hash();
        }
        // times 1009..=1019 remain; median is the sixth.
        assert_eq!(chain.tip().unwrap().median_time_past, 1_014);
    }
}
