//! Ember miner: mines blocks on demand against an in-memory devnet.
//!
//! Builds a chain from the network's genesis, then runs the proof-of-work
//! miner once per requested block. Only networks that mine on demand are
//! supported; each run stops after its first accepted block.

mod devnet;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, ensure};
use chrono::DateTime;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ember_consensus::assembler::{AssemblerPolicy, AssemblyContext, BlockAssembler, MiningMode};
use ember_consensus::miner::{Miner, MinerConfig, MinerServices};
use ember_core::invalid::InvalidOutpoints;
use ember_core::params::{ChainParams, NetworkType};

use devnet::{DevNode, PayoutWallet};

/// CLI arguments for the miner.
#[derive(Debug, Parser)]
#[command(name = "ember-miner")]
#[command(about = "Ember on-demand block miner", long_about = None)]
struct Args {
    /// Network preset (regtest, unittest).
    #[arg(long, default_value = "regtest")]
    network: NetworkType,

    /// Blocks to mine before exiting.
    #[arg(long, default_value = "1")]
    blocks: u64,

    /// Worker count. Negative selects the network default.
    #[arg(long, default_value = "-1", allow_hyphen_values = true)]
    threads: i32,

    /// JSON file with `policy` and `miner` sections.
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON array of outpoints never to include in a block.
    #[arg(long)]
    invalid_outpoints: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Optional settings file.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct MinerFile {
    policy: AssemblerPolicy,
    miner: MinerConfig,
}

fn load_config(path: Option<&PathBuf>) -> Result<MinerFile> {
    let Some(path) = path else {
        return Ok(MinerFile::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

fn load_invalid(path: Option<&PathBuf>) -> Result<InvalidOutpoints> {
    let Some(path) = path else {
        return Ok(InvalidOutpoints::new());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    InvalidOutpoints::from_json(&text).context("invalid outpoint list")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    info!("ember-miner v{}", env!("CARGO_PKG_VERSION"));

    let params = ChainParams::for_network(args.network);
    ensure!(
        params.mine_blocks_on_demand,
        "network {} does not mine on demand",
        params.network
    );

    let file = load_config(args.config.as_ref())?;
    let invalid = load_invalid(args.invalid_outpoints.as_ref())?;
    let config = MinerConfig {
        mode: MiningMode::Work,
        threads: args.threads,
        ..file.miner
    };
    info!(
        network = %params.network,
        blocks = args.blocks,
        threads = config.threads,
        "starting devnet"
    );

    let chain = devnet::bootstrap(&params).context("failed to connect genesis")?;
    let node = Arc::new(DevNode::new(chain.clone()));
    let wallet = Arc::new(PayoutWallet::default());
    let assembler = Arc::new(
        BlockAssembler::new(
            params.clone(),
            file.policy,
            devnet::collaborators(&params),
            Arc::new(AssemblyContext::new()),
        )
        .with_invalid_outpoints(invalid),
    );
    let services = MinerServices {
        submitter: node.clone(),
        network: node.clone(),
        wallet: wallet.clone(),
    };

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        warn!("received SIGINT, shutting down...");
        signal.cancel();
    });

    for _ in 0..args.blocks {
        let miner = Arc::new(Miner::new(
            config.clone(),
            Arc::clone(&assembler),
            chain.clone(),
            services.clone(),
            shutdown.child_token(),
        ));
        Arc::clone(&miner).run().await;
        if shutdown.is_cancelled() {
            break;
        }

        let Some(tip) = chain.lock().tip().cloned() else {
            continue;
        };
        let time = DateTime::from_timestamp(i64::from(tip.time), 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        info!(
            height = tip.height,
            hash = %tip.hash,
            %time,
            hashes = miner.stats().hashes(),
            "block mined"
        );
    }

    let context = assembler.context();
    info!(
        accepted = node.accepted(),
        keys_used = wallet.kept(),
        last_block_size = context.last_block_size(),
        last_block_tx = context.last_block_tx(),
        "miner shutdown complete"
    );
    Ok(())
}
