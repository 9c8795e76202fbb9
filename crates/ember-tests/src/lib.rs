//! Cross-crate test suite for Ember block assembly and staking.
//!
//! The integration tests under `tests/` drive the assembler, the stake
//! kernel, and the miner against an in-memory node built from
//! [`helpers`]. Properties are checked with proptest; the async miner is
//! driven with paused tokio time.

pub mod helpers;
