//! # ember-consensus: Stake kernels, block assembly, and the mining loop.
//!
//! - [`kernel`]: the stake kernel hash and its acceptance rule
//! - [`priority`]: mempool scoring and the priority/fee queue
//! - [`inputs`]: contextual input checks run right before admission
//! - [`stake`]: the shared stake search gate and kernel search
//! - [`assembler`]: candidate block construction
//! - [`miner`]: proof-of-work and proof-of-stake workers

pub mod assembler;
pub mod inputs;
pub mod kernel;
pub mod miner;
pub mod priority;
pub mod stake;

pub use assembler::{
    AssemblerPolicy, AssemblyContext, BlockAssembler, BlockTemplate, Collaborators, MiningMode,
};
pub use kernel::{KernelOutcome, KernelRejection, check_kernel, check_proof_of_stake};
pub use miner::{Miner, MinerConfig, MinerServices};
