//! Criterion benchmarks for ember-consensus hot paths.
//!
//! Covers: kernel hashing, the full kernel check, one nonce batch, and block
//! assembly over a populated mempool.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use primitive_types::U256;

use ember_core::chain::ChainState;
use ember_core::coins::{Coins, CoinsView, MemoryCoinsView};
use ember_core::constants::COIN;
use ember_core::error::BlockError;
use ember_core::mempool::Mempool;
use ember_core::params::{ChainParams, NetworkType, POW_LIMIT_BITS_REGTEST};
use ember_core::script::Script;
use ember_core::traits::{BlockValidator, DifficultyRetarget, PaymentResolver, ScriptVerifier};
use ember_core::types::{
    Block, BlockHeader, BlockIndex, Hash256, OutPoint, Transaction, TxInput, TxOutput,
};

use ember_consensus::assembler::{
    AssemblerPolicy, AssemblyContext, BlockAssembler, Collaborators, MiningMode,
};
use ember_consensus::kernel::{check_kernel, kernel_hash};
use ember_consensus::miner::sweep_nonce_batch;

// --- Mock collaborators ---

struct FixedBits;

impl DifficultyRetarget for FixedBits {
    fn next_required_bits(&self, _: &BlockIndex, _: &BlockHeader, _: bool) -> u32 {
        POW_LIMIT_BITS_REGTEST
    }
}

struct AcceptBlocks;

impl BlockValidator for AcceptBlocks {
    fn test_block_validity(
        &self,
        _: &Block,
        _: &BlockIndex,
        _: &dyn CoinsView,
    ) -> Result<(), BlockError> {
        Ok(())
    }
}

struct AcceptScripts;

impl ScriptVerifier for AcceptScripts {
    fn verify(&self, _: &Script, _: &Script, _: u32, _: &Transaction, _: usize) -> bool {
        true
    }
}

struct NoPayees;

impl PaymentResolver for NoPayees {
    fn fill_payee(&self, coinbase: &mut Transaction, fees: u64, _: u64, _: bool) {
        coinbase.outputs[0].value = 50 * COIN + fees;
    }
}

fn prev_index(height: u64) -> BlockIndex {
    BlockIndex {
        hash: Hash256([0xAB; 32]),
        height,
        time: 1_700_010_000,
        bits: POW_LIMIT_BITS_REGTEST,
        stake_modifier: 0x5eed,
        median_time_past: 1_700_009_000,
    }
}

/// A chain at height 1000 with `count` independent mempool spends of varying
/// age and fee.
fn populated_chain(count: u8) -> ChainState<MemoryCoinsView> {
    let mut coins = MemoryCoinsView::new();
    let mut mempool = Mempool::with_defaults();
    for i in 0..count {
        let funding = Hash256([i; 32]);
        coins.insert(
            funding,
            Coins {
                outputs: vec![Some(TxOutput::new(10 * COIN, Script::from(vec![0x51])))],
                height: u64::from(i) * 3,
                time: 1_700_000_000,
                is_coinbase: false,
                is_coinstake: false,
            },
        );
        let fee = 1_000 * u64::from(i) + 500;
        let tx = Transaction {
            version: 1,
            time: 1_700_000_000,
            inputs: vec![TxInput::new(OutPoint::new(funding, 0), Script::from(vec![0x01]))],
            outputs: vec![TxOutput::new(10 * COIN - fee, Script::from(vec![0x51]))],
            lock_time: 0,
        };
        mempool.insert(tx, fee).unwrap();
    }
    let mut chain = ChainState::new(coins, mempool);
    chain.set_tip(prev_index(1_000));
    chain
}

fn assembler() -> BlockAssembler {
    let collaborators = Collaborators {
        retarget: Arc::new(FixedBits),
        validator: Arc::new(AcceptBlocks),
        verifier: Arc::new(AcceptScripts),
        payments: Arc::new(NoPayees),
    };
    BlockAssembler::new(
        ChainParams::for_network(NetworkType::Regtest),
        AssemblerPolicy::default(),
        collaborators,
        Arc::new(AssemblyContext::new()),
    )
    .with_clock(Arc::new(|| 1_700_010_060))
}

// --- Benchmarks ---

fn bench_kernel_hash(c: &mut Criterion) {
    let prevout = OutPoint::new(Hash256([0x42; 32]), 1);
    c.bench_function("kernel_hash", |b| {
        b.iter(|| {
            kernel_hash(
                black_box(0x0123_4567_89ab_cdef),
                black_box(1_700_000_000),
                black_box(&prevout),
                black_box(1_700_100_000),
            )
        })
    });
}

fn bench_check_kernel(c: &mut Criterion) {
    let params = ChainParams::for_network(NetworkType::Main);
    let prev = prev_index(500);
    let coins = Coins {
        outputs: vec![Some(TxOutput::new(1_000 * COIN, Script::from(vec![0x51])))],
        height: 100,
        time: 1_700_000_000,
        is_coinbase: false,
        is_coinstake: false,
    };
    let prevout = OutPoint::new(Hash256([0x42; 32]), 0);
    c.bench_function("check_kernel", |b| {
        b.iter(|| {
            check_kernel(
                black_box(&params),
                black_box(&prev),
                black_box(0x1d00_ffff),
                black_box(&coins),
                black_box(&prevout),
                black_box(1_700_100_000),
            )
        })
    });
}

fn bench_nonce_batch(c: &mut Criterion) {
    let template = BlockHeader {
        version: 1,
        prev_hash: Hash256([3; 32]),
        merkle_root: Hash256([4; 32]),
        time: 1_700_000_000,
        bits: 0x1d00_ffff,
        nonce: 0,
    };
    c.bench_function("sweep_nonce_batch_256", |b| {
        b.iter(|| {
            let mut header = template.clone();
            sweep_nonce_batch(black_box(&mut header), black_box(U256::zero()))
        })
    });
}

fn bench_create_new_block(c: &mut Criterion) {
    let chain = populated_chain(200);
    let assembler = assembler();
    let reward = Script::from(vec![0x51]);
    c.bench_function("create_new_block_200_txs", |b| {
        b.iter(|| {
            assembler
                .create_new_block(black_box(&chain), &reward, MiningMode::Work, None)
                .unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_kernel_hash,
    bench_check_kernel,
    bench_nonce_batch,
    bench_create_new_block,
);
criterion_main!(benches);
