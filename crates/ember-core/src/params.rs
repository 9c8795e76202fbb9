//! Per-network chain parameters.
//!
//! Every network shares one [`ChainParams`] shape; the presets differ only in
//! data and flags.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::constants::{MAX_BLOCK_SIGOPS, MAX_BLOCK_SIZE};

/// Named network presets.
///
/// # Examples
///
/// ```
/// use ember_core::params::NetworkType;
/// let net: NetworkType = "regtest".parse().unwrap();
/// assert_eq!(net, NetworkType::Regtest);
/// assert_eq!(net.to_string(), "regtest");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// Production network.
    #[default]
    Main,
    /// Public test network with faster maturity and minimum-difficulty blocks.
    Testnet,
    /// Local regression-test network; blocks are mined on demand.
    Regtest,
    /// Main rules with peers and proof-of-work checks relaxed for unit tests.
    UnitTest,
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Main => "main",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
            Self::UnitTest => "unittest",
        })
    }
}

impl FromStr for NetworkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "main" | "mainnet" => Ok(Self::Main),
            "test" | "testnet" => Ok(Self::Testnet),
            "regtest" => Ok(Self::Regtest),
            "unittest" => Ok(Self::UnitTest),
            other => Err(format!("unknown network: {other}")),
        }
    }
}

/// `~0 >> 1` in compact form.
pub const POW_LIMIT_BITS_REGTEST: u32 = 0x207f_ffff;
/// `~0 >> 3` in compact form.
pub const POW_LIMIT_BITS: u32 = 0x201f_ffff;
/// `~0 >> 4` in compact form.
pub const POS_LIMIT_BITS_TESTNET: u32 = 0x200f_ffff;
/// `~0 >> 16` in compact form.
pub const POS_LIMIT_BITS: u32 = 0x1f00_ffff;

/// Consensus and miner-facing parameters for one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainParams {
    pub network: NetworkType,
    /// Seconds a coin must exist before it may stake.
    pub stake_min_age: u32,
    /// Blocks between a staked output's block and the previous block.
    pub stake_min_confirmations: u64,
    /// Confirmations before coinbase/coinstake outputs are spendable.
    pub coinbase_maturity: u64,
    /// Target seconds between blocks.
    pub target_spacing: u32,
    /// Last height at which proof-of-work blocks are accepted.
    pub last_pow_block: u64,
    pub pow_limit_bits: u32,
    pub pos_limit_bits: u32,
    pub genesis_bits: u32,
    /// Miner threads when none are configured. Zero means one per core.
    pub default_miner_threads: usize,
    pub mining_requires_peers: bool,
    pub allow_min_difficulty_blocks: bool,
    pub mine_blocks_on_demand: bool,
    pub skip_pow_check: bool,
    /// Seconds between routine wallet mintable-coin checks.
    pub client_mintable_coins_interval: u64,
    /// Seconds between checks while the wallet reports no mintable coins.
    pub ensure_mintable_coins_interval: u64,
    pub max_block_size: u64,
    pub max_block_sigops: u64,
}

impl ChainParams {
    pub fn for_network(network: NetworkType) -> Self {
        match network {
            NetworkType::Main => Self::main(),
            NetworkType::Testnet => Self::testnet(),
            NetworkType::Regtest => Self::regtest(),
            NetworkType::UnitTest => Self::unit_test(),
        }
    }

    fn main() -> Self {
        Self {
            network: NetworkType::Main,
            stake_min_age: 60 * 60,
            stake_min_confirmations: 25,
            coinbase_maturity: 25,
            target_spacing: 60,
            last_pow_block: 1000,
            pow_limit_bits: POW_LIMIT_BITS,
            pos_limit_bits: POS_LIMIT_BITS,
            genesis_bits: POW_LIMIT_BITS,
            default_miner_threads: 0,
            mining_requires_peers: true,
            allow_min_difficulty_blocks: false,
            mine_blocks_on_demand: false,
            skip_pow_check: false,
            client_mintable_coins_interval: 5 * 60,
            ensure_mintable_coins_interval: 60,
            max_block_size: MAX_BLOCK_SIZE,
            max_block_sigops: MAX_BLOCK_SIGOPS,
        }
    }

    fn testnet() -> Self {
        Self {
            network: NetworkType::Testnet,
            stake_min_age: 30 * 60,
            stake_min_confirmations: 1,
            coinbase_maturity: 1,
            target_spacing: 30,
            pos_limit_bits: POS_LIMIT_BITS_TESTNET,
            allow_min_difficulty_blocks: true,
            client_mintable_coins_interval: 10,
            ensure_mintable_coins_interval: 2,
            ..Self::main()
        }
    }

    fn regtest() -> Self {
        Self {
            network: NetworkType::Regtest,
            target_spacing: 60,
            pow_limit_bits: POW_LIMIT_BITS_REGTEST,
            genesis_bits: POW_LIMIT_BITS_REGTEST,
            default_miner_threads: 1,
            mine_blocks_on_demand: true,
            ..Self::testnet()
        }
    }

    fn unit_test() -> Self {
        Self {
            network: NetworkType::UnitTest,
            mining_requires_peers: false,
            mine_blocks_on_demand: true,
            skip_pow_check: true,
            ..Self::main()
        }
    }

    /// Whether a block at `height` may still be proof-of-work.
    pub fn is_pow_height(&self, height: u64) -> bool {
        height <= self.last_pow_block
    }
}

impl Default for ChainParams {
    fn default() -> Self {
        Self::for_network(NetworkType::default())
    }
}
