//! Mining and staking workers.
//!
//! Each worker repeatedly assembles a candidate under the chain lock, then
//! either sweeps the header nonce (work) or signs the block (stake), and hands
//! anything it finds to the [`BlockSubmitter`]. Workers are tokio tasks
//! sharing one [`CancellationToken`]; every sleep and every nonce batch is a
//! cancellation checkpoint.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ember_core::chain::SharedChain;
use ember_core::coins::CoinsView;
use ember_core::compact::target_from_compact;
use ember_core::constants::{
    HASH_METER_LOG_SECS, HASH_METER_WINDOW_MS, MEMPOOL_REFRESH_SECS, NONCE_BATCH_MASK,
    NONCE_SWEEP_LIMIT,
};
use ember_core::error::{AssemblyError, SubmitError};
use ember_core::params::ChainParams;
use ember_core::script::Script;
use ember_core::traits::{BlockSubmitter, MiningWallet, NetworkStatus};
use ember_core::types::{Block, BlockHeader, BlockIndex};

use crate::assembler::{BlockAssembler, BlockTemplate, ExtraNonce, MiningMode};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Worker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinerConfig {
    pub mode: MiningMode,
    /// Worker count. Negative selects the network default, or one per core.
    pub threads: i32,
    /// Seconds to wait before searching for a stake again at the same height.
    pub hash_interval_secs: u64,
    /// Balance kept out of staking.
    pub reserve_balance: u64,
    /// Sleep while staking is gated off or throttled.
    pub gate_sleep_ms: u64,
    /// Sleep after a failed attempt or while there is no chain tip.
    pub retry_sleep_ms: u64,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            mode: MiningMode::Work,
            threads: -1,
            hash_interval_secs: 22,
            reserve_balance: 0,
            gate_sleep_ms: 5_000,
            retry_sleep_ms: 500,
        }
    }
}

impl MinerConfig {
    /// Config with millisecond sleeps, for driving workers in tests.
    #[cfg(any(test, feature = "testing"))]
    pub fn fast(mode: MiningMode) -> Self {
        Self {
            mode,
            threads: 1,
            hash_interval_secs: 1,
            gate_sleep_ms: 5,
            retry_sleep_ms: 1,
            ..Self::default()
        }
    }

    fn gate_sleep(&self) -> Duration {
        Duration::from_millis(self.gate_sleep_ms)
    }

    fn retry_sleep(&self) -> Duration {
        Duration::from_millis(self.retry_sleep_ms)
    }
}

/// Number of workers to start for a requested count.
pub fn resolve_threads(requested: i32, params: &ChainParams) -> usize {
    if requested >= 0 {
        return requested as usize;
    }
    if params.default_miner_threads > 0 {
        return params.default_miner_threads;
    }
    std::thread::available_parallelism().map_or(1, usize::from)
}

// ---------------------------------------------------------------------------
// Shared bookkeeping
// ---------------------------------------------------------------------------

/// Counters across all workers.
#[derive(Debug, Default)]
pub struct MinerStats {
    blocks_found: AtomicU64,
    hashes: AtomicU64,
}

impl MinerStats {
    pub fn blocks_found(&self) -> u64 {
        self.blocks_found.load(Ordering::Relaxed)
    }

    pub fn hashes(&self) -> u64 {
        self.hashes.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct MeterState {
    window_start: Option<Instant>,
    counter: u64,
    hashes_per_sec: f64,
    last_log: Option<Instant>,
}

/// Hash rate over windows of at least [`HASH_METER_WINDOW_MS`].
#[derive(Debug, Default)]
pub struct HashMeter {
    state: Mutex<MeterState>,
}

impl HashMeter {
    /// Count `hashes` done since the last call. The first call only starts
    /// the window.
    pub fn record(&self, hashes: u64) {
        let now = Instant::now();
        let mut s = self.state.lock();
        let Some(start) = s.window_start else {
            s.window_start = Some(now);
            s.counter = 0;
            return;
        };
        s.counter += hashes;

        let elapsed = now.duration_since(start);
        if elapsed <= Duration::from_millis(HASH_METER_WINDOW_MS) {
            return;
        }
        s.hashes_per_sec = s.counter as f64 / elapsed.as_secs_f64();
        s.window_start = Some(now);
        s.counter = 0;

        let due = s
            .last_log
            .is_none_or(|t| now.duration_since(t) > Duration::from_secs(HASH_METER_LOG_SECS));
        if due {
            s.last_log = Some(now);
            info!(khash_per_sec = s.hashes_per_sec / 1_000.0, "hashmeter");
        }
    }

    pub fn hashes_per_sec(&self) -> f64 {
        self.state.lock().hashes_per_sec
    }
}

#[derive(Debug, Default)]
struct MintableState {
    last_check: Option<Instant>,
    mintable: bool,
}

/// The wallet's mintable-coins answer, refreshed at most once per interval.
#[derive(Debug, Default)]
pub struct MintableCache {
    state: Mutex<MintableState>,
}

impl MintableCache {
    /// Cached answer, re-asking `wallet` if more than `interval` has passed.
    pub fn check(&self, wallet: &dyn MiningWallet, interval: Duration) -> bool {
        let mut s = self.state.lock();
        let stale = s.last_check.is_none_or(|t| t.elapsed() > interval);
        if stale {
            s.last_check = Some(Instant::now());
            s.mintable = wallet.mintable_coins();
        }
        s.mintable
    }
}

/// The tip height of the most recent stake search. Only the current tip
/// matters, so older heights are forgotten.
#[derive(Debug, Default)]
pub struct HeightThrottle {
    last: Mutex<Option<(u64, Instant)>>,
}

impl HeightThrottle {
    /// Whether `height` was searched less than `min` ago.
    pub fn recently_hashed(&self, height: u64, min: Duration) -> bool {
        self.last
            .lock()
            .is_some_and(|(hashed, at)| hashed == height && at.elapsed() < min)
    }

    pub fn mark(&self, height: u64) {
        *self.last.lock() = Some((height, Instant::now()));
    }

    pub fn last_height(&self) -> Option<u64> {
        self.last.lock().map(|(height, _)| height)
    }
}

/// Liveness conditions for staking. None of them is a consensus rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StakeGates {
    pub has_peers: bool,
    pub unlocked: bool,
    pub mintable: bool,
    pub above_reserve: bool,
    pub converged: bool,
}

impl StakeGates {
    pub fn open(&self) -> bool {
        self.has_peers && self.unlocked && self.mintable && self.above_reserve && self.converged
    }
}

// ---------------------------------------------------------------------------
// Nonce sweep
// ---------------------------------------------------------------------------

/// Hash `header` at increasing nonces until the hash is at or below
/// `target` or the nonce reaches a multiple of 256. Returns whether a
/// solution was found and how many nonces were stepped over.
pub fn sweep_nonce_batch(header: &mut BlockHeader, target: U256) -> (bool, u64) {
    let mut done = 0u64;
    loop {
        if header.hash().to_u256() <= target {
            return (true, done);
        }
        header.nonce = header.nonce.wrapping_add(1);
        done += 1;
        if header.nonce & NONCE_BATCH_MASK == 0 {
            return (false, done);
        }
    }
}

// ---------------------------------------------------------------------------
// Miner
// ---------------------------------------------------------------------------

/// Node services the workers talk to.
#[derive(Clone)]
pub struct MinerServices {
    pub submitter: Arc<dyn BlockSubmitter>,
    pub network: Arc<dyn NetworkStatus>,
    pub wallet: Arc<dyn MiningWallet>,
}

/// A pool of mining or staking workers.
pub struct Miner<C> {
    config: MinerConfig,
    assembler: Arc<BlockAssembler>,
    chain: SharedChain<C>,
    services: MinerServices,
    shutdown: CancellationToken,
    stats: MinerStats,
    meter: HashMeter,
    mintable: MintableCache,
    throttle: HeightThrottle,
}

impl<C> fmt::Debug for Miner<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Miner")
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

/// Why a worker stopped sweeping one template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepEnd {
    Found,
    Cancelled,
    NoPeers,
    NonceExhausted,
    MempoolChanged,
    TipChanged,
}

impl<C: CoinsView + 'static> Miner<C> {
    pub fn new(
        config: MinerConfig,
        assembler: Arc<BlockAssembler>,
        chain: SharedChain<C>,
        services: MinerServices,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            assembler,
            chain,
            services,
            shutdown,
            stats: MinerStats::default(),
            meter: HashMeter::default(),
            mintable: MintableCache::default(),
            throttle: HeightThrottle::default(),
        }
    }

    pub fn stats(&self) -> &MinerStats {
        &self.stats
    }

    pub fn meter(&self) -> &HashMeter {
        &self.meter
    }

    /// Run the configured number of workers until cancelled, or until one
    /// block is found on networks that mine on demand.
    pub async fn run(self: Arc<Self>) {
        let threads = resolve_threads(self.config.threads, self.assembler.params());
        if threads == 0 {
            info!("mining disabled: zero threads");
            return;
        }
        info!(threads, mode = %self.config.mode, "miner started");

        let mut handles = Vec::with_capacity(threads);
        for id in 0..threads {
            let miner = Arc::clone(&self);
            handles.push(tokio::spawn(async move { miner.worker(id).await }));
        }
        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = %err, "miner worker panicked");
            }
        }
        info!(blocks = self.stats.blocks_found(), "miner stopped");
    }

    /// Sleep for `duration` unless cancelled first. Returns `false` on
    /// cancellation.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    fn stake_gates(&self, interval: Duration) -> StakeGates {
        let params = self.assembler.params();
        let network = &self.services.network;
        let wallet = self.services.wallet.as_ref();
        let balance = wallet.balance();
        StakeGates {
            has_peers: params.mine_blocks_on_demand || network.peer_count() > 0,
            unlocked: !wallet.is_locked(),
            mintable: self.mintable.check(wallet, interval),
            above_reserve: !(balance > 0 && self.config.reserve_balance >= balance),
            converged: network.cluster_converged(),
        }
    }

    /// Block until every stake gate is open. Returns `false` on cancellation.
    async fn wait_for_stake_gates(&self) -> bool {
        let params = self.assembler.params();
        let routine = Duration::from_secs(params.client_mintable_coins_interval);
        let urgent = Duration::from_secs(params.ensure_mintable_coins_interval);

        let mut gates = self.stake_gates(routine);
        while !gates.open() {
            debug!(?gates, "waiting to stake");
            self.assembler.context().stake_gate.reset_interval();
            if !self.pause(self.config.gate_sleep()).await {
                return false;
            }
            let interval = if gates.mintable { routine } else { urgent };
            gates = self.stake_gates(interval);
        }
        true
    }

    /// Whether a stake search already ran on `height` within the hash interval.
    fn recently_hashed(&self, height: u64) -> bool {
        let min = Duration::from_secs(self.config.hash_interval_secs.max(1));
        self.throttle.recently_hashed(height, min)
    }

    fn snapshot(&self) -> (u64, Option<BlockIndex>) {
        let chain = self.chain.lock();
        (chain.mempool.transactions_updated(), chain.tip().cloned())
    }

    /// Assemble under the chain lock. A validator rejection clears the
    /// mempool, since it may hold transactions the chain no longer accepts.
    fn assemble(&self, reward: &Script) -> Result<BlockTemplate, AssemblyError> {
        let mut chain = self.chain.lock();
        let result = self.assembler.create_new_block(
            &chain,
            reward,
            self.config.mode,
            Some(self.services.wallet.as_ref()),
        );
        if let Err(AssemblyError::Rejected { reason }) = &result {
            warn!(
                %reason,
                cleared = chain.mempool.len(),
                "clearing mempool after rejected candidate"
            );
            chain.mempool.clear();
        }
        result
    }

    /// Stale check, submit, then keep the reserved key.
    pub fn process_block_found(&self, block: &Block, reward: &Script) -> Result<(), SubmitError> {
        let hash = block.hash();
        let value = block.coinbase().and_then(|cb| cb.outputs.first()).map_or(0, |o| o.value);
        info!(%hash, value, proof_of_stake = block.is_proof_of_stake(), "generated block");

        let tip = self.services.submitter.tip();
        let tip_hash = tip.map(|t| t.hash).unwrap_or_default();
        if block.header.prev_hash != tip_hash {
            return Err(SubmitError::Stale {
                prev: block.header.prev_hash.to_string(),
                tip: tip_hash.to_string(),
            });
        }

        self.services.submitter.submit(block)?;
        self.services.wallet.keep_script(reward);
        self.stats.blocks_found.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Submit and report whether the worker should stop.
    fn finish(&self, block: &Block, reserved: &mut Option<Script>) -> bool {
        let Some(reward) = reserved.take() else {
            return false;
        };
        match self.process_block_found(block, &reward) {
            Ok(()) => {
                if self.assembler.params().mine_blocks_on_demand {
                    info!("block mined on demand, stopping");
                    self.shutdown.cancel();
                    return true;
                }
            }
            Err(err) => {
                warn!(error = %err, "found block not accepted");
                *reserved = Some(reward);
            }
        }
        false
    }

    async fn worker(&self, id: usize) {
        debug!(worker = id, "worker started");
        let mut extra_nonce = ExtraNonce::new();
        let mut reserved: Option<Script> = None;
        let stake = self.config.mode.is_stake();

        while !self.shutdown.is_cancelled() {
            if stake {
                if !self.wait_for_stake_gates().await {
                    break;
                }
                let tip_height = self.chain.lock().tip().map(|t| t.height);
                if tip_height.is_some_and(|h| self.recently_hashed(h)) {
                    if !self.pause(self.config.gate_sleep()).await {
                        break;
                    }
                    continue;
                }
            }

            let (updated_last, tip) = self.snapshot();
            let Some(prev) = tip else {
                if !self.pause(self.config.retry_sleep()).await {
                    break;
                }
                continue;
            };

            let reward = match reserved.take() {
                Some(script) => script,
                None => match self.services.wallet.reserve_script() {
                    Ok(script) => script,
                    Err(err) => {
                        warn!(worker = id, error = %err, "cannot reserve payout key");
                        if !self.pause(self.config.retry_sleep()).await {
                            break;
                        }
                        continue;
                    }
                },
            };
            reserved = Some(reward.clone());

            let result = self.assemble(&reward);
            if stake {
                self.throttle.mark(prev.height);
            }
            let mut template = match result {
                Ok(template) => template,
                Err(AssemblyError::NoStakeFound | AssemblyError::StakeSearchSkipped) => continue,
                Err(err) => {
                    debug!(worker = id, error = %err, "no block template");
                    if !self.pause(self.config.retry_sleep()).await {
                        break;
                    }
                    continue;
                }
            };
            if let Err(err) = extra_nonce.increment(&mut template.block, &prev) {
                warn!(worker = id, error = %err, "extra nonce update failed");
                continue;
            }

            if stake {
                if let Err(err) = self.services.wallet.sign_block(&mut template.block) {
                    warn!(worker = id, error = %err, "signing stake block failed");
                    if !self.pause(self.config.retry_sleep()).await {
                        break;
                    }
                    continue;
                }
                if self.finish(&template.block, &mut reserved) {
                    break;
                }
                if !self.pause(self.config.retry_sleep()).await {
                    break;
                }
                continue;
            }

            debug!(
                worker = id,
                txs = template.block.transactions.len(),
                height = template.height,
                "sweeping nonces"
            );
            match self.sweep(&mut template.block, &prev, updated_last).await {
                SweepEnd::Found => {
                    if self.finish(&template.block, &mut reserved) {
                        break;
                    }
                }
                SweepEnd::Cancelled => break,
                end => debug!(worker = id, ?end, "rebuilding template"),
            }
        }
        debug!(worker = id, "worker stopped");
    }

    /// Sweep nonces on `block` until a solution is found or the template
    /// should be rebuilt.
    async fn sweep(&self, block: &mut Block, prev: &BlockIndex, updated_last: u64) -> SweepEnd {
        let params = self.assembler.params();
        let start = Instant::now();
        let mut target = match target_from_compact(block.header.bits) {
            Ok(target) => target,
            Err(err) => {
                warn!(error = %err, "template has invalid bits");
                return SweepEnd::NonceExhausted;
            }
        };

        loop {
            let (found, hashes) = sweep_nonce_batch(&mut block.header, target);
            self.stats.hashes.fetch_add(hashes, Ordering::Relaxed);
            self.meter.record(hashes);
            if found {
                info!(hash = %block.hash(), nonce = block.header.nonce, "proof of work found");
                return SweepEnd::Found;
            }

            if self.shutdown.is_cancelled() {
                return SweepEnd::Cancelled;
            }
            if params.mining_requires_peers && self.services.network.peer_count() == 0 {
                return SweepEnd::NoPeers;
            }
            if block.header.nonce >= NONCE_SWEEP_LIMIT {
                return SweepEnd::NonceExhausted;
            }
            let (updated, tip) = self.snapshot();
            if updated != updated_last
                && start.elapsed() > Duration::from_secs(MEMPOOL_REFRESH_SECS)
            {
                return SweepEnd::MempoolChanged;
            }
            if tip.is_none_or(|t| t.hash != prev.hash) {
                return SweepEnd::TipChanged;
            }

            self.assembler.update_time(&mut block.header, prev);
            if params.allow_min_difficulty_blocks {
                if let Ok(t) = target_from_compact(block.header.bits) {
                    target = t;
                }
            }
            tokio::task::yield_now().await;
        }
    }
}
