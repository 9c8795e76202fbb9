//! Protocol and policy constants.

/// Base units per coin.
pub const COIN: u64 = 100_000_000;

/// Base units per cent.
pub const CENT: u64 = 1_000_000;

/// Network hard limit on serialized block size in bytes.
pub const MAX_BLOCK_SIZE: u64 = 2_000_000;

/// Network hard limit on legacy + P2SH signature operations per block.
pub const MAX_BLOCK_SIGOPS: u64 = MAX_BLOCK_SIZE / 50;

/// Default largest block this node will assemble.
pub const DEFAULT_BLOCK_MAX_SIZE: u64 = 750_000;

/// Default bytes reserved for high-priority transactions regardless of fee.
pub const DEFAULT_BLOCK_PRIORITY_SIZE: u64 = 50_000;

/// Default minimum block size filled with free transactions.
pub const DEFAULT_BLOCK_MIN_SIZE: u64 = 0;

/// Default minimum relay fee, in base units per 1000 bytes.
pub const DEFAULT_MIN_RELAY_FEE_PER_KB: u64 = 10_000;

/// Bytes kept free at the top of the network limit when clamping the
/// configured maximum block size.
pub const BLOCK_SIZE_MARGIN: u64 = 1_000;

/// Space reserved for the block header and coinbase when budgeting.
pub const COINBASE_RESERVED_SIZE: u64 = 1_000;

/// Sigops reserved for the coinbase when budgeting.
pub const COINBASE_RESERVED_SIGOPS: u64 = 100;

/// Priority above which a transaction may be relayed and mined for free:
/// one coin, one day old (144 blocks), in a 250-byte transaction.
pub const FREE_PRIORITY_THRESHOLD: f64 = (COIN * 144) as f64 / 250.0;

/// Lock times below this are block heights, at or above are Unix times.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Version stamped on assembled blocks.
pub const BLOCK_VERSION: u32 = 0x8000_0001;

/// Nonce attempts between checkpoint checks (interrupt, staleness, time).
pub const NONCE_BATCH_MASK: u32 = 0xff;

/// Nonce at which the sweep gives up and reassembles with a fresh extra nonce.
pub const NONCE_SWEEP_LIMIT: u32 = 0xffff_0000;

/// Seconds a changed mempool may be ignored before the sweep restarts.
pub const MEMPOOL_REFRESH_SECS: u64 = 60;

/// Hash meter measurement window in milliseconds.
pub const HASH_METER_WINDOW_MS: u64 = 4_000;

/// Seconds between hash meter log lines.
pub const HASH_METER_LOG_SECS: u64 = 30 * 60;
