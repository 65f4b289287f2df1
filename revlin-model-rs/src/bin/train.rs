//! Training binary.
//!
//! Usage:
//!   revlin-train [OPTIONS]
//!
//! Examples:
//!   # Train with a JSON config
//!   revlin-train --config configs/small.json --steps 10000
//!
//!   # Defaults, with a different token file, saving the weights
//!   revlin-train --dataset data/tokens.safetensors --save model.safetensors

use std::path::PathBuf;

use anyhow::Context;
use candle_core::Device;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use revlin_model_rs::{LinearAttention, RevlinConfig, SequenceLoader, Trainer};

#[derive(Parser)]
#[command(name = "revlin-train")]
#[command(about = "Train a reversible linear-attention language model")]
#[command(version)]
struct Args {
    /// JSON configuration file (defaults are used when absent)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Safetensors token file (overrides dataset.file_name)
    #[arg(short = 'd', long)]
    dataset: Option<PathBuf>,

    /// Optimizer steps to run
    #[arg(long, default_value = "1000")]
    steps: usize,

    /// Log every N steps
    #[arg(long, default_value = "10")]
    log_every: usize,

    /// Write the trained weights here (safetensors)
    #[arg(short = 's', long)]
    save: Option<PathBuf>,

    /// Override the initialization and shuffle seed
    #[arg(long)]
    seed: Option<u64>,

    /// Run on CUDA device N (requires the cuda feature)
    #[arg(long)]
    cuda_device: Option<usize>,
}

fn select_device(cuda_device: Option<usize>) -> anyhow::Result<Device> {
    match cuda_device {
        Some(index) => {
            #[cfg(feature = "cuda")]
            {
                tracing::info!("Initializing CUDA device {}...", index);
                Ok(Device::new_cuda(index)?)
            }
            #[cfg(not(feature = "cuda"))]
            {
                anyhow::bail!(
                    "CUDA device {index} requested but the cuda feature is not enabled"
                )
            }
        }
        None => Ok(Device::Cpu),
    }
}

/// Info for dependencies, debug for this crate.
fn log_filter() -> anyhow::Result<EnvFilter> {
    Ok(EnvFilter::from_default_env()
        .add_directive("info".parse()?)
        .add_directive("revlin_model_rs=debug".parse()?))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt().with_env_filter(log_filter()?).init();

    let mut config = match &args.config {
        Some(path) => RevlinConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => RevlinConfig::default(),
    };
    if let Some(path) = args.dataset {
        config = config.with_dataset_file(path);
    }
    if let Some(seed) = args.seed {
        config = config.with_seed(seed);
    }
    config.validate()?;

    let device = select_device(args.cuda_device)?;

    tracing::info!("=== Reversible Linear-Attention Training ===");
    tracing::info!("Device: {:?}", device);
    tracing::info!("Parameters: {}", config.parameter_count());
    tracing::info!(
        "Blocks: {} ({} cells x {} repeats)",
        config.model.num_blocks(),
        config.model.device_count,
        config.model.weight_shared_blocks
    );
    tracing::info!(
        "{}",
        config
            .activation_memory_estimate(config.model.batch_size, config.model.sequence_length)
            .format()
    );

    let mut loader = SequenceLoader::new(&config, device.clone())
        .with_context(|| format!("opening {}", config.dataset.file_name.display()))?;
    let model = LinearAttention::new(&config, &device)?;
    let mut trainer = Trainer::new(model);

    let log_every = args.log_every.max(1);
    let mut running = 0.0f32;
    let mut logged = 0usize;
    let mut step = 0usize;

    while step < args.steps {
        let batch = match loader.next() {
            Some(batch) => batch?,
            None => {
                loader.reset();
                tracing::info!("Starting epoch {}", loader.epoch());
                continue;
            }
        };

        let outcome = trainer.step(&batch)?;
        step = outcome.step;
        running += outcome.loss;
        logged += 1;

        if step % log_every == 0 || step == args.steps {
            tracing::info!(
                "step {:>6} | loss {:.4} | grad_norm {:.4}",
                step,
                running / logged as f32,
                outcome.gradient_norm
            );
            running = 0.0;
            logged = 0;
        }
    }

    if let Some(path) = args.save {
        trainer.model().save(&path)?;
        tracing::info!("Saved weights to {}", path.display());
    }

    Ok(())
}
