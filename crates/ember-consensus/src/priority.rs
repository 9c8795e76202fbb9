//! Mempool prioritizer: dependency-aware, priority- then fee-ordered
//! candidate selection for block assembly.
//!
//! Each mempool transaction gets
//! - a *priority*, `sum(input value * confirmations) / size`, accumulated
//!   with saturating floating-point addition, and
//! - a *fee rate*, `(value in - value out) * 1000 / size`, per kilobyte.
//!
//! Transactions whose inputs are all confirmed are ready immediately; those
//! spending another mempool transaction wait as orphans until every parent
//! has been admitted. Ordering starts priority-first and switches, once, to
//! fee-rate-first. The switch rebuilds the queue instead of re-keying it in
//! place.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fmt;

use ordered_float::OrderedFloat;
use tracing::{debug, error};

use ember_core::coins::CoinsView;
use ember_core::constants::FREE_PRIORITY_THRESHOLD;
use ember_core::invalid::InvalidOutpoints;
use ember_core::mempool::Mempool;
use ember_core::types::{Hash256, Transaction};

/// Fee rate in base units per 1000 bytes. Negative when deltas push the
/// effective fee below zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FeeRate(i64);

impl FeeRate {
    pub const ZERO: Self = Self(0);

    /// Rate for `fee` paid over `size` bytes.
    pub fn new(fee: i64, size: usize) -> Self {
        if size == 0 {
            return Self::ZERO;
        }
        let rate = i128::from(fee) * 1_000 / size as i128;
        Self(rate.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64)
    }

    pub const fn from_per_kb(per_kb: i64) -> Self {
        Self(per_kb)
    }

    pub fn per_kb(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for FeeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/kB", self.0)
    }
}

/// Addition that saturates at `f64::MAX` instead of reaching infinity.
pub fn saturating_priority_add(a: f64, b: f64) -> f64 {
    let sum = a + b;
    if sum.is_finite() { sum } else { f64::MAX }
}

/// Whether a transaction's priority is high enough to be mined without fee.
pub fn allow_free(priority: f64) -> bool {
    priority > FREE_PRIORITY_THRESHOLD
}

/// One schedulable transaction.
#[derive(Clone, Debug)]
pub struct PriorityEntry<'a> {
    pub priority: f64,
    pub fee_rate: FeeRate,
    pub txid: Hash256,
    pub size: usize,
    pub tx: &'a Transaction,
}

/// A transaction waiting on unadmitted mempool parents.
#[derive(Debug)]
pub struct Orphan<'a> {
    pub entry: PriorityEntry<'a>,
    pub depends_on: HashSet<Hash256>,
}

/// Orphans and the reverse index from parent txid to waiting orphans.
#[derive(Debug, Default)]
pub struct DependencyGraph<'a> {
    orphans: Vec<Orphan<'a>>,
    dependers: HashMap<Hash256, Vec<usize>>,
}

impl<'a> DependencyGraph<'a> {
    fn add(&mut self, orphan: Orphan<'a>) {
        let idx = self.orphans.len();
        for parent in &orphan.depends_on {
            self.dependers.entry(*parent).or_default().push(idx);
        }
        self.orphans.push(orphan);
    }

    /// Record that `txid` was admitted; return orphans that became ready.
    pub fn release(&mut self, txid: &Hash256) -> Vec<PriorityEntry<'a>> {
        let Some(waiting) = self.dependers.remove(txid) else {
            return Vec::new();
        };
        let mut ready = Vec::new();
        for idx in waiting {
            let orphan = &mut self.orphans[idx];
            if orphan.depends_on.is_empty() {
                continue;
            }
            orphan.depends_on.remove(txid);
            if orphan.depends_on.is_empty() {
                ready.push(orphan.entry.clone());
            }
        }
        ready
    }

    /// Orphans still waiting on at least one parent.
    pub fn pending(&self) -> usize {
        self.orphans.iter().filter(|o| !o.depends_on.is_empty()).count()
    }
}

/// Ready entries plus the orphan graph, built from one mempool snapshot.
#[derive(Debug)]
pub struct CandidateSet<'a> {
    pub ready: Vec<PriorityEntry<'a>>,
    pub graph: DependencyGraph<'a>,
}

impl<'a> CandidateSet<'a> {
    /// Score every eligible mempool transaction for a block at `height` with
    /// time `block_time`.
    ///
    /// Skips coinbase, coinstake, and non-final transactions, anything
    /// spending a blacklisted outpoint, and anything with an input found in
    /// neither `coins` nor the mempool. Never fails.
    pub fn collect(
        mempool: &'a Mempool,
        coins: &dyn CoinsView,
        invalid: &InvalidOutpoints,
        height: u64,
        block_time: u32,
    ) -> Self {
        let mut ready = Vec::with_capacity(mempool.len());
        let mut graph = DependencyGraph::default();

        'entries: for entry in mempool.entries() {
            let tx = &entry.tx;
            if tx.is_coinbase() || tx.is_coinstake() || !tx.is_final(height, block_time) {
                continue;
            }

            let mut priority = 0.0f64;
            let mut total_in: u64 = 0;
            let mut depends_on = HashSet::new();

            for input in &tx.inputs {
                let prev = &input.previous_output;
                let Some(prev_coins) = coins.access_coins(&prev.txid) else {
                    let Some(parent_out) = mempool.output(prev) else {
                        error!(
                            txid = %entry.txid,
                            input = %prev,
                            "mempool transaction missing input"
                        );
                        continue 'entries;
                    };
                    depends_on.insert(prev.txid);
                    total_in = total_in.saturating_add(parent_out.value);
                    continue;
                };

                if invalid.contains(prev) {
                    debug!(txid = %entry.txid, input = %prev, "found invalid input");
                    continue 'entries;
                }

                let Some(out) = prev_coins.output(prev.index) else {
                    error!(
                        txid = %entry.txid,
                        input = %prev,
                        "mempool transaction spends unavailable output"
                    );
                    continue 'entries;
                };
                total_in = total_in.saturating_add(out.value);
                let confirmations = height.saturating_sub(prev_coins.height);
                priority =
                    saturating_priority_add(priority, out.value as f64 * confirmations as f64);
            }

            if entry.size > 0 {
                priority /= entry.size as f64;
            }

            let delta = mempool.apply_deltas(&entry.txid);
            priority += delta.priority;
            let value_out = tx.total_output_value().unwrap_or(u64::MAX);
            let fee = i128::from(total_in) + i128::from(delta.fee) - i128::from(value_out);
            let fee = fee.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64;

            let scored = PriorityEntry {
                priority,
                fee_rate: FeeRate::new(fee, entry.size),
                txid: entry.txid,
                size: entry.size,
                tx,
            };
            if depends_on.is_empty() {
                ready.push(scored);
            } else {
                graph.add(Orphan { entry: scored, depends_on });
            }
        }

        Self { ready, graph }
    }
}

/// Which key the queue currently ranks by.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortOrder {
    Priority,
    FeeRate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum RankKey {
    ByPriority(OrderedFloat<f64>, FeeRate),
    ByFee(FeeRate, OrderedFloat<f64>),
}

struct Ranked<'a> {
    key: RankKey,
    entry: PriorityEntry<'a>,
}

impl Ranked<'_> {
    fn new(order: SortOrder, entry: PriorityEntry<'_>) -> Ranked<'_> {
        let priority = OrderedFloat(entry.priority);
        let key = match order {
            SortOrder::Priority => RankKey::ByPriority(priority, entry.fee_rate),
            SortOrder::FeeRate => RankKey::ByFee(entry.fee_rate, priority),
        };
        Ranked { key, entry }
    }
}

impl PartialEq for Ranked<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked<'_> {}

impl PartialOrd for Ranked<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked<'_> {
    // Max-heap: higher key first; equal keys pop the lower txid first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| other.entry.txid.cmp(&self.entry.txid))
    }
}

/// Max-heap of ready entries with a one-way priority→fee switch.
pub struct TxQueue<'a> {
    heap: BinaryHeap<Ranked<'a>>,
    order: SortOrder,
}

impl<'a> TxQueue<'a> {
    pub fn new(entries: Vec<PriorityEntry<'a>>, order: SortOrder) -> Self {
        let heap = entries.into_iter().map(|e| Ranked::new(order, e)).collect();
        Self { heap, order }
    }

    pub fn order(&self) -> SortOrder {
        self.order
    }

    pub fn push(&mut self, entry: PriorityEntry<'a>) {
        self.heap.push(Ranked::new(self.order, entry));
    }

    pub fn pop(&mut self) -> Option<PriorityEntry<'a>> {
        self.heap.pop().map(|ranked| ranked.entry)
    }

    /// Rebuild the queue ranked by fee rate. Returns `false` if it already
    /// was; the order never goes back.
    pub fn switch_to_fee_rate(&mut self) -> bool {
        if self.order == SortOrder::FeeRate {
            return false;
        }
        self.order = SortOrder::FeeRate;
        let entries: Vec<_> = std::mem::take(&mut self.heap)
            .into_vec()
            .into_iter()
            .map(|ranked| ranked.entry)
            .collect();
        self.heap = entries
            .into_iter()
            .map(|e| Ranked::new(SortOrder::FeeRate, e))
            .collect();
        true
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Whether the walk should move to fee ordering before handling an entry of
/// `size` bytes with `priority`, given `block_size` bytes already used.
pub fn should_switch_to_fee(
    block_size: u64,
    size: usize,
    priority: f64,
    priority_size: u64,
) -> bool {
    block_size + size as u64 >= priority_size || !allow_free(priority)
}

/// One pass over a [`CandidateSet`].
///
/// Yields the best ready entry each step. The caller decides whether to
/// admit it; only admitted entries release their orphans, so a child never
/// comes out ahead of a parent that made it into the block. The switch to fee
/// ordering happens at most once.
pub struct PriorityWalk<'a> {
    queue: TxQueue<'a>,
    graph: DependencyGraph<'a>,
    priority_size: u64,
    admitted: usize,
    fee_phase_start: Option<usize>,
}

impl<'a> PriorityWalk<'a> {
    /// Start a walk. A zero `priority_size` ranks by fee rate from the start.
    pub fn new(set: CandidateSet<'a>, priority_size: u64) -> Self {
        let initial = if priority_size == 0 {
            SortOrder::FeeRate
        } else {
            SortOrder::Priority
        };
        Self {
            queue: TxQueue::new(set.ready, initial),
            graph: set.graph,
            priority_size,
            admitted: 0,
            fee_phase_start: (initial == SortOrder::FeeRate).then_some(0),
        }
    }

    pub fn order(&self) -> SortOrder {
        self.queue.order()
    }

    /// Move to fee ordering if `entry` would end the priority area of a block
    /// already `block_size` bytes long. Returns whether this call switched.
    pub fn maybe_switch(&mut self, block_size: u64, entry: &PriorityEntry<'_>) -> bool {
        if self.queue.order() != SortOrder::Priority
            || !should_switch_to_fee(block_size, entry.size, entry.priority, self.priority_size)
        {
            return false;
        }
        self.queue.switch_to_fee_rate();
        self.fee_phase_start = Some(self.admitted);
        debug!(admitted = self.admitted, block_size, "switching to fee-rate ordering");
        true
    }

    /// Record that `txid` went into the block and queue any orphans it
    /// completes.
    pub fn admit(&mut self, txid: &Hash256) {
        self.admitted += 1;
        for released in self.graph.release(txid) {
            self.queue.push(released);
        }
    }

    pub fn admitted(&self) -> usize {
        self.admitted
    }

    /// How many entries were admitted before the fee phase began, or `None`
    /// if the walk never left priority order.
    pub fn fee_phase_start(&self) -> Option<usize> {
        self.fee_phase_start
    }

    /// Orphans whose parents were never admitted.
    pub fn pending(&self) -> usize {
        self.graph.pending()
    }
}

impl<'a> Iterator for PriorityWalk<'a> {
    type Item = PriorityEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.queue.pop()
    }
}
