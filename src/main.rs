//! shardsync command line driver
//!
//! Runs the synchronization engine against a synthetic quadratic workload,
//! which exercises every layer (sharding, versioned storage, compression,
//! overlap, checkpointing) without a real model attached.
//!
//! ## Commands
//! - `init-config` - Write a default configuration file
//! - `run` - Run a synthetic training session from a configuration file

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shardsync::checkpoint::CheckpointManager;
use shardsync::config::SyncConfig;
use shardsync::local::LocalSyncCoordinator;
use shardsync::logging::{init_production_logging, init_simple_logging};
use shardsync::optimizer::{factory, Sgd};
use shardsync::shard::ShardMap;
use shardsync::store::VersionedShardStore;
use shardsync::worker::{BatchResult, IntervalHooks, LocalWorker, NoopHooks, OverlapWorker};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "shardsync")]
#[command(about = "Distributed parameter synchronization engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default configuration file
    InitConfig {
        /// Where to write the configuration
        #[arg(short, long, default_value = "shardsync.toml")]
        path: PathBuf,
    },

    /// Run a synthetic training session
    Run {
        /// Configuration file
        #[arg(short, long, default_value = "shardsync.toml")]
        config: PathBuf,

        /// Number of parameters in the synthetic model
        #[arg(short, long, default_value = "4096")]
        parameters: usize,

        /// Training steps per worker
        #[arg(short, long, default_value = "500")]
        steps: usize,

        /// Checkpoint directory (omit to disable checkpointing)
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,

        /// Save a checkpoint every N steps
        #[arg(long, default_value = "100")]
        save_every: u64,

        /// Log level (trace, debug, info, warn, error)
        #[arg(short, long, default_value = "info")]
        log_level: String,

        /// Log to a rolling file as well as stdout
        #[arg(long)]
        log_to_file: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::InitConfig { path } => {
            init_simple_logging("info")?;
            let config = SyncConfig::default();
            config
                .save(&path)
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!(path = %path.display(), "Default configuration written");
            Ok(())
        }
        Commands::Run {
            config,
            parameters,
            steps,
            checkpoint_dir,
            save_every,
            log_level,
            log_to_file,
        } => {
            if log_to_file {
                init_production_logging(&log_level, None)?;
            } else {
                init_simple_logging(&log_level)?;
            }
            let config = SyncConfig::load(&config)
                .with_context(|| format!("failed to load {}", config.display()))?;
            run_session(config, parameters, steps, checkpoint_dir, save_every).await
        }
    }
}

async fn run_session(
    config: SyncConfig,
    parameters: usize,
    steps: usize,
    checkpoint_dir: Option<PathBuf>,
    save_every: u64,
) -> Result<()> {
    info!(
        devices = config.devices_per_node,
        parameters,
        steps,
        drop_rate = config.drop_rate,
        overlap = config.overlap,
        "Starting synthetic training session"
    );
    if config.nodes > 1 {
        tracing::warn!(
            nodes = config.nodes,
            "synthetic session runs node-local; multi-node topology ignored"
        );
    }

    let map = ShardMap::build(parameters, 1, config.devices_per_node)?;
    let mut initial = vec![0.0f32; parameters];
    if let Some(dir) = &checkpoint_dir {
        let manager = CheckpointManager::new(dir, 3)?;
        match manager.load_latest()? {
            Some(ckpt) if ckpt.params.len() == parameters => {
                info!(step = ckpt.metadata.step, "Resuming from checkpoint");
                initial = ckpt.params;
            }
            Some(ckpt) => {
                tracing::warn!(
                    elements = ckpt.metadata.elements,
                    parameters,
                    "checkpoint does not match model size, starting fresh"
                );
            }
            None => {}
        }
    }
    let store = Arc::new(VersionedShardStore::new(
        &map.flat_ranges(),
        &initial,
        config.effective_history_size(),
        &factory(|| Sgd::new(0.5)),
    )?);
    let coordinator = Arc::new(LocalSyncCoordinator::new(store, &config, &initial)?);

    // Synthetic objective: drive every parameter toward 1.0
    let target = 1.0f32;
    let batch = move |params: &[f32]| {
        let grad: Vec<f32> = params.iter().map(|p| p - target).collect();
        let cost: f32 = params
            .iter()
            .map(|p| 0.5 * (p - target) * (p - target))
            .sum::<f32>()
            / params.len() as f32;
        BatchResult {
            grad,
            cost,
            weight: 1.0,
        }
    };

    let mut final_cost = 0.0f32;
    if config.overlap {
        let mut workers = Vec::new();
        for device in 0..config.devices_per_node {
            workers.push(OverlapWorker::new(
                coordinator.clone(),
                &config,
                device,
                device,
                Box::new(Sgd::new(0.5)),
                Box::new(NoopHooks),
            )?);
        }
        for _ in 0..steps {
            for worker in workers.iter_mut() {
                final_cost = worker.step(batch).await?;
            }
            tokio::task::yield_now().await;
        }
        for worker in workers {
            worker.shutdown().await?;
        }
    } else {
        let mut workers = Vec::new();
        for device in 0..config.devices_per_node {
            // Only the first worker carries the checkpoint manager
            let manager = if device == 0 {
                checkpoint_dir
                    .as_ref()
                    .map(|dir| CheckpointManager::new(dir, 3))
                    .transpose()?
            } else {
                None
            };
            workers.push(LocalWorker::new(
                coordinator.clone(),
                &config,
                device,
                device,
                Box::new(IntervalHooks::new(save_every, 0)),
                manager,
            )?);
        }
        for _ in 0..steps {
            for worker in workers.iter_mut() {
                final_cost = worker.step(batch)?;
            }
        }
    }

    info!(final_cost, "Training session finished");
    Ok(())
}
