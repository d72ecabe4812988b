// SPDX-FileCopyrightText: 2025 Russ Fellows <russ.fellows@gmail.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use genoload_core::config::yaml_to_json;
use genoload_core::runner::RunReport;
use genoload_core::{parse_configs_and_run, write_sampled_h5, LoaderBench, RunConfig, RunOverrides, SamplerMode};
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// genoload – sampler and HDF5 data loading for genomic sequence models
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the ops of a config on a single process
    Train {
        /// Path to a YAML run config
        config: PathBuf,

        /// Learning rate (overrides `lr` in the config)
        #[arg(long)]
        lr: Option<f64>,
    },
    /// Run the ops of a config as one rank of a distributed job
    TrainDistributed {
        /// Path to a YAML run config
        config: PathBuf,

        /// Learning rate (overrides `lr` in the config)
        #[arg(long)]
        lr: Option<f64>,

        /// This process's rank
        #[arg(long)]
        rank: Option<usize>,

        /// Total number of ranks
        #[arg(long)]
        world_size: Option<usize>,

        /// Accelerator index for this rank
        #[arg(long)]
        gpu: Option<usize>,
    },
    /// Sample batches and store them in an HDF5 file
    WriteH5 {
        /// Path to a YAML run config with a `sampler` section
        config: PathBuf,

        /// train, validate or test
        mode: String,

        /// Number of batches to write
        n_steps: usize,

        /// Sampler seed
        rseed: u64,

        /// Bit-pack sequences and targets (true/false)
        #[arg(action = ArgAction::Set, value_parser = parse_flag)]
        packbits: bool,
    },
    /// Validate a run config without running it
    Validate {
        /// Path to a YAML run config
        config: PathBuf,

        /// Convert YAML to JSON and print it
        #[arg(long)]
        to_json: bool,
    },
}

fn parse_flag(s: &str) -> Result<bool, String> {
    match s.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(format!("expected true or false, got '{}'", other)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "genoload={0},genoload_core={0},genoload_formats={0}",
            log_level
        ))
        .init();

    info!("genoload v{} starting", env!("CARGO_PKG_VERSION"));

    let result = match args.command {
        Commands::Train { config, lr } => {
            let overrides = RunOverrides {
                lr,
                ..Default::default()
            };
            run(config, overrides).await
        }
        Commands::TrainDistributed {
            config,
            lr,
            rank,
            world_size,
            gpu,
        } => {
            let overrides = RunOverrides {
                lr,
                rank,
                world_size,
                gpu,
            };
            run(config, overrides).await
        }
        Commands::WriteH5 {
            config,
            mode,
            n_steps,
            rseed,
            packbits,
        } => write_h5(config, &mode, n_steps, rseed, packbits).await,
        Commands::Validate { config, to_json } => validate_config(&config, to_json),
    };

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

async fn run(config_path: PathBuf, overrides: RunOverrides) -> Result<()> {
    info!("Loading run config from: {:?}", config_path);
    let config = RunConfig::from_yaml_file(&config_path)?;

    // Loader workers are plain threads; keep them off the async runtime.
    let report: RunReport = tokio::task::spawn_blocking(move || {
        let mut bench = LoaderBench::new();
        parse_configs_and_run(config, &overrides, &mut bench)
    })
    .await
    .context("run task panicked")??;

    for op in &report.ops {
        op.metrics.print_summary(&format!("{:?}", op.op));
        for (step, loss) in &op.validations {
            println!("  step {:>6}: validation loss {:.6}", step, loss);
        }
    }
    Ok(())
}

async fn write_h5(config_path: PathBuf, mode: &str, n_steps: usize, seed: u64, packbits: bool) -> Result<()> {
    let mode: SamplerMode = mode.parse()?;
    let config = RunConfig::from_yaml_file(&config_path)?;

    let path = tokio::task::spawn_blocking(move || write_sampled_h5(&config, mode, n_steps, seed, packbits))
        .await
        .context("write-h5 task panicked")??;

    println!("Wrote {}", path.display());
    Ok(())
}

fn validate_config(config_path: &Path, to_json: bool) -> Result<()> {
    info!("Validating run config: {:?}", config_path);

    let yaml_content = std::fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read config file {:?}", config_path))?;

    if to_json {
        let json_content = yaml_to_json(&yaml_content)?;
        println!("{}", json_content);
        return Ok(());
    }

    let config = RunConfig::from_yaml(&yaml_content)?;
    config.validate()?;

    println!("✅ YAML parsing: SUCCESS");
    println!("✅ Ops: {:?}", config.ops);
    println!("✅ Output dir: {}", config.output_dir.display());
    match &config.data {
        Some(data) => {
            for (name, source) in [("train", &data.train), ("validate", &data.validate), ("test", &data.test)] {
                if let Some(source) = source {
                    println!("✅ {} source: {}", name, source.path.display());
                }
            }
        }
        None => println!("✅ Sampler source: {:?}", config.sampler),
    }
    let loader = config.loader_options();
    println!("✅ Loader options:");
    println!("  - Batch size: {}", loader.batch_size);
    println!("  - Num workers: {}", loader.num_workers);
    println!("  - Prefetch factor: {}", loader.prefetch_factor);
    println!("  - Seed: {}", loader.seed);
    println!(
        "✅ Rank {} of {}",
        config.distributed.rank, config.distributed.world_size
    );
    Ok(())
}
