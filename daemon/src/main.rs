//! Strata daemon: runs validators and manages their config files.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use rand::seq::SliceRandom;
use rand::Rng;
use strata_crypto::keypair_from_seed;
use strata_network::{LocalHub, PeerId};
use strata_node::{init_logging, NodeConfig, ShutdownController, ValidatorWorker};
use strata_nullables::{NullEngine, SystemClock};

#[derive(Parser)]
#[command(name = "strata-daemon", about = "Strata validator daemon")]
struct Cli {
    /// Path to a TOML configuration file. Its settings are the base; CLI
    /// flags and env vars override them.
    #[arg(long, env = "STRATA_CONFIG")]
    config: Option<PathBuf>,

    /// Log level: "trace", "debug", "info", "warn", "error".
    #[arg(long, env = "STRATA_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format: "human" or "json".
    #[arg(long, env = "STRATA_LOG_FORMAT")]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Run a validator set in this process over an in-memory transport.
    Devnet {
        /// Number of validators.
        #[arg(long, default_value_t = 4, env = "STRATA_DEVNET_NODES")]
        nodes: usize,

        /// Interval between synthetic transactions, in milliseconds.
        #[arg(long, default_value_t = 250)]
        tx_interval_ms: u64,

        /// Build an empty block after this long without transactions.
        #[arg(long, default_value_t = 2_000)]
        max_block_time_ms: u64,
    },
    /// Write a config file for one member of a devnet.
    Config {
        /// Destination path.
        #[arg(long)]
        write: PathBuf,

        /// Size of the devnet signer set.
        #[arg(long, default_value_t = 4)]
        nodes: usize,

        /// Index of the node the file is for.
        #[arg(long, default_value_t = 0)]
        index: usize,
    },
}

/// Devnet keys are derived from the node index. Never use them for anything real.
fn devnet_seed(index: usize) -> [u8; 32] {
    let mut seed = [0x5d; 32];
    seed[..8].copy_from_slice(&(index as u64).to_le_bytes());
    seed
}

fn devnet_config(base: &NodeConfig, nodes: usize, index: usize) -> NodeConfig {
    NodeConfig {
        node_index: index,
        signers: (0..nodes)
            .map(|i| hex::encode(keypair_from_seed(&devnet_seed(i)).public.as_bytes()))
            .collect(),
        private_key_hex: hex::encode(devnet_seed(index)),
        ..base.clone()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut base = match &cli.config {
        Some(path) => NodeConfig::from_toml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => NodeConfig::default(),
    };
    if let Some(level) = cli.log_level {
        base.log_level = level;
    }
    if let Some(format) = cli.log_format {
        base.log_format = format;
    }
    init_logging(base.log_format()?, &base.log_level)?;

    match cli.command {
        Command::Config {
            write,
            nodes,
            index,
        } => {
            anyhow::ensure!(index < nodes, "index {index} out of range for {nodes} nodes");
            let config = devnet_config(&base, nodes, index);
            config.validate()?;
            std::fs::write(&write, config.to_toml_string()?)
                .with_context(|| format!("writing {}", write.display()))?;
            tracing::info!(path = %write.display(), index, nodes, "wrote config");
        }
        Command::Devnet {
            nodes,
            tx_interval_ms,
            max_block_time_ms,
        } => {
            anyhow::ensure!(nodes > 0, "a devnet needs at least one node");
            anyhow::ensure!(tx_interval_ms > 0, "tx_interval_ms must be positive");
            run_devnet(&base, nodes, tx_interval_ms, max_block_time_ms).await?;
        }
    }

    Ok(())
}

async fn run_devnet(
    base: &NodeConfig,
    nodes: usize,
    tx_interval_ms: u64,
    max_block_time_ms: u64,
) -> anyhow::Result<()> {
    let hub = LocalHub::new(strata_network::local_hub::DEFAULT_INBOX_CAPACITY, base.max_message_size);
    let configs: Vec<NodeConfig> = (0..nodes).map(|i| devnet_config(base, nodes, i)).collect();
    let peers: Vec<PeerId> = (0..nodes)
        .map(|i| PeerId::from(&keypair_from_seed(&devnet_seed(i)).public))
        .collect();

    let mut workers = Vec::with_capacity(nodes);
    for (i, config) in configs.into_iter().enumerate() {
        let comm = Arc::new(hub.connect(peers[i].clone(), peers.clone())?);
        let engine = Arc::new(NullEngine::new(Arc::new(SystemClock), Some(max_block_time_ms)));
        let worker = ValidatorWorker::start(
            config,
            engine,
            comm,
            Box::new(move || tracing::warn!(node = i, "restart requested; devnet engines never restart")),
        )?;
        workers.push(worker);
    }
    tracing::info!(nodes, "devnet running, Ctrl-C to stop");

    let shutdown = Arc::new(ShutdownController::new());
    let mut shutdown_rx = shutdown.subscribe();
    let signals = Arc::clone(&shutdown);
    tokio::spawn(async move {
        if let Err(e) = signals.wait_for_signal().await {
            tracing::error!(error = %e, "failed to listen for signals");
            signals.shutdown();
        }
    });

    let mut tx_timer = tokio::time::interval(Duration::from_millis(tx_interval_ms));
    let mut report_timer = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = tx_timer.tick() => {
                let (target, data) = {
                    let mut rng = rand::thread_rng();
                    let mut data = vec![b'd'; 17];
                    rng.fill(&mut data[1..]);
                    (workers.choose(&mut rng), data)
                };
                if let Some(worker) = target {
                    if let Err(e) = worker.submit_transaction(&data) {
                        tracing::warn!(error = %e, "synthetic transaction rejected");
                    }
                }
            }
            _ = report_timer.tick() => {
                let heights: Vec<i64> = workers.iter().map(|w| w.status().height).collect();
                let committed: u64 = workers.iter().map(|w| w.metrics().blocks_committed.get()).sum();
                tracing::info!(?heights, committed, "devnet progress");
            }
        }
    }

    for worker in workers {
        let node = worker.config().node_index;
        if let Err(e) = worker.shutdown().await {
            tracing::warn!(node, error = %e, "unclean shutdown");
        }
    }
    tracing::info!("devnet stopped");
    Ok(())
}
