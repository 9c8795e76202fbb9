//! Proof-of-stake kernel search.
//!
//! A search tries every wallet candidate at each second of the window that
//! elapsed since the previous search. The [`StakeSearchGate`] is shared by
//! every worker: it serializes searches and remembers where the last window
//! ended so that no second is searched twice.

use parking_lot::Mutex;
use tracing::{debug, info};

use ember_core::coins::CoinsView;
use ember_core::error::KernelError;
use ember_core::params::ChainParams;
use ember_core::traits::StakeCandidate;
use ember_core::types::{BlockIndex, Hash256};

use crate::kernel::{KernelOutcome, KernelRejection, check_kernel};

/// Largest number of seconds one search looks back from its start time.
pub const STAKE_HASH_DRIFT: u32 = 45;

#[derive(Debug, Default)]
struct SearchWindow {
    last_search_time: u32,
    last_search_interval: u32,
}

/// Process-wide stake search state. One search runs at a time.
#[derive(Debug, Default)]
pub struct StakeSearchGate {
    window: Mutex<SearchWindow>,
}

impl StakeSearchGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `search` over the window ending at `now`, holding the gate for the
    /// duration.
    ///
    /// `search` receives the window length in seconds, always at least one.
    /// Returns `None` without calling it when `now` is not past the end of
    /// the previous window.
    pub fn run<T>(&self, now: u32, search: impl FnOnce(u32) -> T) -> Option<T> {
        let mut window = self.window.lock();
        if now <= window.last_search_time {
            return None;
        }
        let interval = now - window.last_search_time;
        let result = search(interval);
        window.last_search_interval = interval;
        window.last_search_time = now;
        Some(result)
    }

    pub fn last_search_time(&self) -> u32 {
        self.window.lock().last_search_time
    }

    pub fn last_search_interval(&self) -> u32 {
        self.window.lock().last_search_interval
    }

    /// Report no search activity. Called while staking is gated off.
    pub fn reset_interval(&self) {
        self.window.lock().last_search_interval = 0;
    }
}

/// A kernel that met the target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FoundKernel {
    pub candidate: StakeCandidate,
    pub time: u32,
    pub proof: Hash256,
}

/// Search `candidates` for a kernel valid at some time in
/// `(now - interval, now]`, newest time first, limited to
/// [`STAKE_HASH_DRIFT`] seconds and to times after the median time past.
///
/// An `interval` of zero searches nothing. Candidates whose coins are missing
/// from `coins` are skipped. Malformed kernel inputs are errors.
pub fn search_kernel(
    params: &ChainParams,
    prev: &BlockIndex,
    bits: u32,
    candidates: &[StakeCandidate],
    coins: &dyn CoinsView,
    now: u32,
    interval: u32,
) -> Result<Option<FoundKernel>, KernelError> {
    if interval == 0 {
        return Ok(None);
    }
    let span = interval.min(STAKE_HASH_DRIFT);
    let earliest = now
        .saturating_sub(span - 1)
        .max(prev.median_time_past.saturating_add(1));
    if earliest > now {
        return Ok(None);
    }

    for candidate in candidates {
        let Some(prev_coins) = coins.access_coins(&candidate.outpoint.txid) else {
            debug!(outpoint = %candidate.outpoint, "stake candidate has no coins");
            continue;
        };
        for time in (earliest..=now).rev() {
            match check_kernel(params, prev, bits, &prev_coins, &candidate.outpoint, time)? {
                KernelOutcome::Accepted { proof } => {
                    info!(outpoint = %candidate.outpoint, time, %proof, "found stake kernel");
                    return Ok(Some(FoundKernel {
                        candidate: candidate.clone(),
                        time,
                        proof,
                    }));
                }
                KernelOutcome::Rejected(KernelRejection::AboveTarget { .. }) => {}
                // Depth and age do not improve at earlier times.
                KernelOutcome::Rejected(rejection) => {
                    debug!(
                        outpoint = %candidate.outpoint,
                        %rejection,
                        "stake candidate not eligible"
                    );
                    break;
                }
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::coins::{Coins, MemoryCoinsView};
    use ember_core::constants::COIN;
    use ember_core::params::{NetworkType, POW_LIMIT_BITS_REGTEST};
    use ember_core::script::Script;
    use ember_core::types::{OutPoint, TxOutput};

    fn prev_index() -> BlockIndex {
        BlockIndex {
            hash: Hash256([1; 32]),
            height: 100,
            time: 50_000,
            bits: POW_LIMIT_BITS_REGTEST,
            stake_modifier: 7,
            median_time_past: 49_000,
        }
    }

    fn candidate_in(
        view: &mut MemoryCoinsView,
        seed: u8,
        height: u64,
        time: u32,
    ) -> StakeCandidate {
        let output = TxOutput::new(100 * COIN, Script::from(vec![0x51]));
        view.insert(
            Hash256([seed; 32]),
            Coins {
                outputs: vec![Some(output.clone())],
                height,
                time,
                is_coinbase: false,
                is_coinstake: false,
            },
        );
        StakeCandidate {
            outpoint: OutPoint::new(Hash256([seed; 32]), 0),
            output,
        }
    }

    // ------------------------------------------------------------------
    // StakeSearchGate
    // ------------------------------------------------------------------

    #[test]
    fn gate_tracks_window() {
        let gate = StakeSearchGate::new();
        assert_eq!(gate.run(100, |interval| interval), Some(100));
        assert_eq!(gate.last_search_time(), 100);
        assert_eq!(gate.run(130, |interval| interval), Some(30));
        assert_eq!(gate.last_search_interval(), 30);
        gate.reset_interval();
        assert_eq!(gate.last_search_interval(), 0);
    }

    #[test]
    fn gate_skips_time_going_backwards() {
        let gate = StakeSearchGate::new();
        gate.run(100, |_| ());
        assert_eq!(gate.run(99, |_| ()), None);
        assert_eq!(gate.last_search_time(), 100);
    }

    #[test]
    fn gate_refuses_second_already_searched() {
        let gate = StakeSearchGate::new();
        gate.run(100, |_| ());
        let mut called = false;
        assert_eq!(gate.run(100, |_| called = true), None);
        assert!(!called);
        assert_eq!(gate.last_search_interval(), 100);
        assert_eq!(gate.run(101, |interval| interval), Some(1));
    }

    // ------------------------------------------------------------------
    // search_kernel
    // ------------------------------------------------------------------

    #[test]
    fn easy_target_finds_newest_time() {
        let params = ChainParams::for_network(NetworkType::Regtest);
        let mut view = MemoryCoinsView::new();
        let c = candidate_in(&mut view, 3, 10, 1_000);
        let found = search_kernel(
            &params,
            &prev_index(),
            POW_LIMIT_BITS_REGTEST,
            &[c.clone()],
            &view,
            50_010,
            10,
        )
        .unwrap()
        .expect("regtest limit accepts any kernel");
        assert_eq!(found.candidate, c);
        assert_eq!(found.time, 50_010);
    }

    #[test]
    fn zero_interval_searches_nothing() {
        let params = ChainParams::for_network(NetworkType::Regtest);
        let mut view = MemoryCoinsView::new();
        let c = candidate_in(&mut view, 3, 10, 1_000);
        let found =
            search_kernel(&params, &prev_index(), POW_LIMIT_BITS_REGTEST, &[c], &view, 50_010, 0)
                .unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn windows_do_not_overlap() {
        let params = ChainParams::for_network(NetworkType::Regtest);
        let mut view = MemoryCoinsView::new();
        let c = candidate_in(&mut view, 3, 10, 1_000);
        let gate = StakeSearchGate::new();
        let search = |now| {
            gate.run(now, |interval| {
                search_kernel(
                    &params,
                    &prev_index(),
                    POW_LIMIT_BITS_REGTEST,
                    &[c.clone()],
                    &view,
                    now,
                    interval,
                )
                .unwrap()
            })
        };
        let first = search(50_010).flatten().expect("regtest limit accepts any kernel");
        assert_eq!(first.time, 50_010);
        assert!(search(50_010).is_none());
        let next = search(50_011).flatten().expect("one new second to search");
        assert_eq!(next.time, 50_011);
    }

    #[test]
    fn immature_candidates_yield_nothing() {
        let params = ChainParams::for_network(NetworkType::Regtest);
        let mut view = MemoryCoinsView::new();
        let young = candidate_in(&mut view, 3, 10, 50_000);
        let found = search_kernel(
            &params,
            &prev_index(),
            POW_LIMIT_BITS_REGTEST,
            &[young],
            &view,
            50_010,
            10,
        )
        .unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn unknown_candidate_skipped() {
        let params = ChainParams::for_network(NetworkType::Regtest);
        let view = MemoryCoinsView::new();
        let ghost = StakeCandidate {
            outpoint: OutPoint::new(Hash256([8; 32]), 0),
            output: TxOutput::new(COIN, Script::default()),
        };
        let found = search_kernel(
            &params,
            &prev_index(),
            POW_LIMIT_BITS_REGTEST,
            &[ghost],
            &view,
            50_010,
            10,
        )
        .unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn out_of_range_index_is_fatal() {
        let params = ChainParams::for_network(NetworkType::Regtest);
        let mut view = MemoryCoinsView::new();
        let mut c = candidate_in(&mut view, 3, 10, 1_000);
        c.outpoint.index = 5;
        let err = search_kernel(
            &params,
            &prev_index(),
            POW_LIMIT_BITS_REGTEST,
            &[c],
            &view,
            50_010,
            10,
        )
        .unwrap_err();
        assert!(matches!(err, KernelError::IndexOutOfRange { index: 5, .. }));
    }

    #[test]
    fn window_stops_at_median_time_past() {
        let params = ChainParams::for_network(NetworkType::Regtest);
        let view = MemoryCoinsView::new();
        let found = search_kernel(
            &params,
            &prev_index(),
            POW_LIMIT_BITS_REGTEST,
            &[],
            &view,
            49_000,
            10,
        )
        .unwrap();
        assert!(found.is_none());
    }
}
