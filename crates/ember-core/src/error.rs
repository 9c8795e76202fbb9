//! Error types for the Ember node core.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("missing inputs: {0}")] MissingInputs(String),
    #[error("insufficient funds: have {have}, need {need}")]
    InsufficientFunds { have: u64, need: u64 },
    #[error("script verification failed on input {index}")] ScriptFailure { index: usize },
    #[error("value overflow")] ValueOverflow,
    #[error("serialization: {0}")] Serialization(String),
    #[error("immature coinbase or coinstake spend at input {index}")]
    ImmatureSpend { index: usize },
    #[error("null outpoint in non-coinbase input {0}")] NullOutpointInRegularTx(usize),
    #[error("outpoint {0} spent twice by one transaction")] DuplicateInput(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("invalid PoW")] InvalidPoW,
    #[error("invalid prev hash")] InvalidPrevHash,
    #[error("invalid merkle root")] InvalidMerkleRoot,
    #[error("time too old: {time} <= median {median}")] TimeTooOld { time: u32, median: u32 },
    #[error("oversized: {size} > {max}")] OversizedBlock { size: usize, max: usize },
    #[error("too many sigops: {count} > {max}")] TooManySigops { count: u64, max: u64 },
    #[error("no coinbase")] NoCoinbase,
    #[error("first transaction is not coinbase")] FirstTxNotCoinbase,
    #[error("double spend: {0}")] DoubleSpend(String),
    #[error("invalid difficulty: got {got:#010x}, expected {expected:#010x}")]
    InvalidDifficulty { got: u32, expected: u32 },
    #[error("invalid proof of stake: {0}")] InvalidProofOfStake(String),
    #[error("tx error in {index}: {source}")]
    TransactionError { index: usize, source: TransactionError },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompactError {
    #[error("negative compact target: {0:#010x}")] Negative(u32),
    #[error("compact target overflows 256 bits: {0:#010x}")] Overflow(u32),
    #[error("zero compact target: {0:#010x}")] Zero(u32),
}

/// Protocol-fatal kernel failures. Ordinary rejections (too young, above
/// target, ...) are not errors; see `ember_consensus::kernel::KernelRejection`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("null outpoint in kernel input")] NullOutpoint,
    #[error("kernel input index {index} out of range for tx {txid} with {len} outputs")]
    IndexOutOfRange { txid: String, index: u32, len: usize },
    #[error("kernel input {0} has no coins")] MissingCoins(String),
    #[error("kernel input {0} is already spent")] SpentOutput(String),
    #[error("coinstake is malformed: {0}")] MalformedCoinstake(String),
    #[error("coinstake signature check failed on input 0")] SignatureFailure,
    #[error("bad target bits: {0}")] Target(#[from] CompactError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    #[error("transaction already in pool: {0}")] AlreadyExists(String),
    #[error("conflicts with pool tx {existing_txid} on outpoint {outpoint}")]
    Conflict { new_txid: String, existing_txid: String, outpoint: String },
    #[error("coinbase or coinstake not accepted into pool")] NotStandalone,
    #[error("pool full")] PoolFull,
    #[error("tx error: {0}")] Transaction(#[from] TransactionError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssemblyError {
    #[error("no chain tip")] NoChainTip,
    #[error("no stake kernel found in window")] NoStakeFound,
    #[error("stake search already ran for this time slot")] StakeSearchSkipped,
    #[error("block rejected by validator: {reason}")] Rejected { reason: String },
    #[error("no wallet available for stake mode")] NoWallet,
    #[error("template tx error: {0}")] Transaction(#[from] TransactionError),
    #[error("bad target: {0}")] Target(#[from] CompactError),
    #[error("kernel: {0}")] Kernel(#[from] KernelError),
    #[error("wallet: {0}")] Wallet(#[from] WalletError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("stale block: prev {prev} is not the tip {tip}")] Stale { prev: String, tip: String },
    #[error("block rejected: {0}")] Rejected(String),
    #[error("block signing failed: {0}")] Signing(#[from] WalletError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    #[error("wallet is locked")] Locked,
    #[error("key pool exhausted")] KeyPoolExhausted,
    #[error("no key for output {0}")] MissingKey(String),
    #[error("signing failed: {0}")] Signing(String),
}

#[derive(Error, Debug)]
pub enum EmberError {
    #[error(transparent)] Transaction(#[from] TransactionError),
    #[error(transparent)] Block(#[from] BlockError),
    #[error(transparent)] Compact(#[from] CompactError),
    #[error(transparent)] Kernel(#[from] KernelError),
    #[error(transparent)] Mempool(#[from] MempoolError),
    #[error(transparent)] Assembly(#[from] AssemblyError),
    #[error(transparent)] Submit(#[from] SubmitError),
    #[error(transparent)] Wallet(#[from] WalletError),
    #[error("config: {0}")] Config(String),
}
