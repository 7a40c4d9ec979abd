//! sae-rs CLI: train a sparse autoencoder on stored activations

use anyhow::Result;
use clap::Parser;
use sae_rs::{
    ActivationSource, GaussianActivationStore, InMemoryActivationStore, SaeTrainer,
    SparseAutoencoder, SparseAutoencoderConfig, TrainerConfig,
};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "sae-rs")]
#[command(about = "Sparse autoencoder training over transformer activations")]
#[command(version)]
struct Cli {
    /// Safetensors file holding the activation matrix; omit to train on
    /// synthetic Gaussian activations (smoke-test mode)
    #[arg(short, long)]
    activations: Option<PathBuf>,

    /// Tensor name inside the activation file
    #[arg(long, default_value = "activations")]
    tensor_key: String,

    /// Hook point the activations were captured at
    #[arg(long, default_value = "blocks.0.hook_resid_pre")]
    hook_point: String,

    /// Input dimension (ignored when --activations is given)
    #[arg(long, default_value_t = 512)]
    d_in: usize,

    /// Dictionary size as a multiple of d_in
    #[arg(long, default_value_t = 4)]
    expansion_factor: usize,

    /// Number of training steps
    #[arg(short, long, default_value_t = 1000)]
    steps: usize,

    /// Activation rows per step
    #[arg(short, long, default_value_t = 32)]
    batch_size: usize,

    /// Sparsity penalty weight
    #[arg(long, default_value_t = 1e-3)]
    l1_coefficient: f64,

    /// Adam learning rate
    #[arg(long, default_value_t = 3e-4)]
    learning_rate: f64,

    /// Enable the ghost-gradient dead-feature recovery term
    #[arg(long)]
    use_ghost_grads: bool,

    /// Gaussian noise added to pre-activations during encoding
    #[arg(long, default_value_t = 0.0)]
    noise_scale: f64,

    /// Save a checkpoint every N steps (0 disables)
    #[arg(long, default_value_t = 0)]
    checkpoint_every: usize,

    /// Random seed for initialization and noise
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Output directory for the trained SAE and metrics
    #[arg(short, long, default_value = "outputs")]
    output: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let device = candle_core::Device::Cpu;

    // Activation source: stored matrix or synthetic fallback
    let mut source: Box<dyn ActivationSource> = match &cli.activations {
        Some(path) => {
            let store = InMemoryActivationStore::from_safetensors(path, &cli.tensor_key, &device)?;
            info!(
                "Loaded {} activation rows of width {} from {}",
                store.len(),
                store.d_in(),
                path.display()
            );
            Box::new(store)
        }
        None => {
            info!("No activation file given; training on synthetic Gaussian activations");
            Box::new(GaussianActivationStore::new(cli.d_in, cli.seed, &device)?)
        }
    };

    let d_in = source.d_in();
    let cfg = SparseAutoencoderConfig {
        d_in,
        d_sae: d_in * cli.expansion_factor,
        hook_point: cli.hook_point.clone(),
        l1_coefficient: cli.l1_coefficient,
        noise_scale: cli.noise_scale,
        use_ghost_grads: cli.use_ghost_grads,
        ..Default::default()
    };

    println!("=== sae-rs: sparse autoencoder training ===");
    println!("Hook point: {}", cfg.hook_point);
    println!("d_in:       {}", cfg.d_in);
    println!("d_sae:      {}", cfg.d_sae);
    println!("Steps:      {} (batch {})", cli.steps, cli.batch_size);

    let sae = SparseAutoencoder::new(cfg, &device, cli.seed)?;

    std::fs::create_dir_all(&cli.output)?;
    let checkpoint_dir = cli.output.clone();
    let trainer_cfg = TrainerConfig {
        learning_rate: cli.learning_rate,
        checkpoint_every: cli.checkpoint_every,
        ..Default::default()
    };
    let mut trainer = SaeTrainer::new(sae, trainer_cfg)?.with_checkpoint_fn(Box::new(
        move |step, sae| {
            let path = checkpoint_dir.join(format!("sae_step_{step}.safetensors"));
            sae.save(&path)?;
            info!("Checkpoint saved to {}", path.display());
            Ok(())
        },
    ));

    let history = trainer.fit(source.as_mut(), cli.batch_size, cli.steps)?;

    // Print results
    if let Some(last) = history.last() {
        println!("\n=== Results ===");
        println!("Final loss:         {:.5}", last.loss);
        println!("  mse:              {:.5}", last.mse_loss);
        println!("  l1:               {:.5}", last.l1_loss);
        println!("  ghost:            {:.5}", last.ghost_grad_loss);
        println!("L0:                 {:.1}", last.l0);
        println!("Explained variance: {:.3}", last.explained_variance);
        println!("Dead features:      {}", last.n_dead_features);
    }

    // Save the trained SAE and per-step metrics
    let sae_path = cli.output.join("sae_final.safetensors");
    trainer.sae().save(&sae_path)?;
    info!("Trained SAE saved to {}", sae_path.display());

    let metrics_path = cli.output.join("train_metrics.json");
    std::fs::write(&metrics_path, serde_json::to_string_pretty(&history)?)?;
    info!("Metrics saved to {}", metrics_path.display());

    Ok(())
}
