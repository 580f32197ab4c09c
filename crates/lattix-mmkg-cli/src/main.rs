//! mmkg - train and evaluate adversarial multimodal KG embeddings.
//!
//! # Usage
//!
//! ```bash
//! # Benchmark summary
//! mmkg stats benchmarks/DB15K
//!
//! # Train with image and text features, save the scorer
//! mmkg train benchmarks/DB15K \
//!     --feature visual=features/DB15K-visual.safetensors \
//!     --feature textual=features/DB15K-textual.npy \
//!     --epochs 1000 --save checkpoint/DB15K.safetensors
//!
//! # Filtered link prediction on the test split
//! mmkg eval benchmarks/DB15K checkpoint/DB15K.safetensors \
//!     --feature visual=features/DB15K-visual.safetensors \
//!     --feature textual=features/DB15K-textual.npy
//! ```
//!
//! Logging is controlled with `RUST_LOG` (default `info`).

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use candle_core::Device;
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use lattix_mmkg::{
    AdversarialTrainer, Benchmark, CorruptionStrategy, Modality, ModalityFeatures, MultimodalScorer,
    Tester, TrainingConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mmkg")]
#[command(about = "Adversarial multimodal knowledge graph embeddings", long_about = None)]
struct Cli {
    /// Run on the first CUDA device when available
    #[arg(long, global = true)]
    cuda: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show statistics about a benchmark directory
    Stats {
        /// Directory with entity2id.txt, relation2id.txt, train2id.txt, ...
        benchmark: PathBuf,
    },

    /// Train a scorer and generator
    Train {
        /// Benchmark directory
        benchmark: PathBuf,

        #[command(flatten)]
        features: FeatureArgs,

        /// JSON training config; flags below override it
        #[arg(long)]
        config: Option<PathBuf>,

        #[command(flatten)]
        overrides: Overrides,

        /// Scorer checkpoint path; the generator goes next to it
        #[arg(long)]
        save: Option<PathBuf>,
    },

    /// Filtered link prediction with a saved scorer
    Eval {
        /// Benchmark directory
        benchmark: PathBuf,

        /// Scorer checkpoint written by `train --save`
        checkpoint: PathBuf,

        #[command(flatten)]
        features: FeatureArgs,
    },
}

#[derive(Args)]
struct FeatureArgs {
    /// Feature table as MODALITY=PATH (.safetensors or .npy); repeatable
    #[arg(long = "feature", value_parser = parse_feature, required = true)]
    features: Vec<(Modality, PathBuf)>,

    /// Use feature tables at their raw width
    #[arg(long)]
    no_pool: bool,
}

#[derive(Args)]
struct Overrides {
    /// Rotation dimension d (entities are 2d wide)
    #[arg(long)]
    dim: Option<usize>,

    /// Score margin γ
    #[arg(long)]
    margin: Option<f64>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Negatives per positive
    #[arg(long)]
    negatives: Option<usize>,

    /// Negative corruption strategy
    #[arg(long)]
    corruption: Option<Corruption>,

    /// Scorer learning rate
    #[arg(long)]
    lr: Option<f64>,

    /// Generator learning rate
    #[arg(long)]
    lr_g: Option<f64>,

    /// Weight of the adversarial term in the scorer loss
    #[arg(long)]
    mu: Option<f64>,

    /// Self-adversarial temperature; 0 for uniform negative weights
    #[arg(long)]
    adv_temperature: Option<f64>,

    /// Evaluate every N epochs; 0 to evaluate only at the end
    #[arg(long)]
    eval_every: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Corruption {
    /// Head or tail with equal probability
    Uniform,
    /// Relation-dependent head probability tph / (tph + hpt)
    Bernoulli,
}

fn parse_feature(s: &str) -> std::result::Result<(Modality, PathBuf), String> {
    let (modality, path) = s
        .split_once('=')
        .ok_or_else(|| format!("expected MODALITY=PATH, got {s:?}"))?;
    let modality = modality.parse::<Modality>().map_err(|e| e.to_string())?;
    Ok((modality, PathBuf::from(path)))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let device = if cli.cuda {
        Device::cuda_if_available(0).context("Failed to open CUDA device")?
    } else {
        Device::Cpu
    };

    match cli.command {
        Commands::Stats { benchmark } => cmd_stats(&benchmark),
        Commands::Train {
            benchmark,
            features,
            config,
            overrides,
            save,
        } => cmd_train(&benchmark, &features, config.as_deref(), &overrides, save.as_deref(), &device),
        Commands::Eval {
            benchmark,
            checkpoint,
            features,
        } => cmd_eval(&benchmark, &checkpoint, &features, &device),
    }
}

fn load_benchmark(dir: &Path) -> Result<Benchmark> {
    Benchmark::load(dir).with_context(|| format!("Failed to load benchmark {}", dir.display()))
}

fn load_features(args: &FeatureArgs, num_entities: usize, device: &Device) -> Result<Vec<ModalityFeatures>> {
    let mut tables = Vec::with_capacity(args.features.len());
    for (modality, path) in &args.features {
        let mut table = ModalityFeatures::load(*modality, path, device)
            .with_context(|| format!("Failed to load {modality} features from {}", path.display()))?;
        if !args.no_pool {
            table = table.pooled_default()?;
        }
        if table.num_rows() != num_entities {
            bail!(
                "{modality} features have {} rows but the benchmark has {num_entities} entities",
                table.num_rows()
            );
        }
        info!(%modality, dim = table.feature_dim(), trainable = table.is_trainable(), "features ready");
        tables.push(table);
    }
    Ok(tables)
}

fn build_config(path: Option<&Path>, o: &Overrides) -> Result<TrainingConfig> {
    let mut config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            serde_json::from_str::<TrainingConfig>(&text)
                .with_context(|| format!("Invalid config {}", path.display()))?
        }
        None => TrainingConfig::default(),
    };

    if let Some(dim) = o.dim {
        config = config.with_embedding_dim(dim);
    }
    if let Some(margin) = o.margin {
        config = config.with_margin(margin);
    }
    if let Some(epochs) = o.epochs {
        config = config.with_epochs(epochs);
    }
    if let Some(batch_size) = o.batch_size {
        config = config.with_batch_size(batch_size);
    }
    if let Some(negatives) = o.negatives {
        config = config.with_negative_samples(negatives);
    }
    if let Some(corruption) = o.corruption {
        config = config.with_corruption(match corruption {
            Corruption::Uniform => CorruptionStrategy::Uniform,
            Corruption::Bernoulli => CorruptionStrategy::Bernoulli,
        });
    }
    if let Some(lr) = o.lr {
        config = config.with_learning_rate(lr);
    }
    if let Some(lr_g) = o.lr_g {
        config = config.with_generator_learning_rate(lr_g);
    }
    if let Some(mu) = o.mu {
        config = config.with_mu(mu);
    }
    if let Some(temperature) = o.adv_temperature {
        config = config.with_adv_temperature((temperature > 0.0).then_some(temperature));
    }
    if let Some(every) = o.eval_every {
        config = config.with_eval_every((every > 0).then_some(every));
    }
    if let Some(seed) = o.seed {
        config = config.with_seed(seed);
    }

    config.validate()?;
    Ok(config)
}

/// `scorer.safetensors` -> `scorer.generator.safetensors`
fn generator_path(scorer_path: &Path) -> PathBuf {
    let stem = scorer_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "checkpoint".to_string());
    scorer_path.with_file_name(format!("{stem}.generator.safetensors"))
}

fn cmd_stats(dir: &Path) -> Result<()> {
    let benchmark = load_benchmark(dir)?;
    let mut per_relation = vec![0usize; benchmark.num_relations()];
    for t in &benchmark.train {
        per_relation[t.relation as usize] += 1;
    }

    println!("Benchmark Statistics");
    println!("====================");
    println!("Entities:  {}", benchmark.num_entities());
    println!("Relations: {}", benchmark.num_relations());
    println!("Train:     {}", benchmark.train.len());
    println!("Valid:     {}", benchmark.valid.len());
    println!("Test:      {}", benchmark.test.len());

    let mut top: Vec<(usize, usize)> = per_relation.into_iter().enumerate().collect();
    top.sort_by(|a, b| b.1.cmp(&a.1));
    println!();
    println!("Most frequent relations:");
    for (id, count) in top.into_iter().take(10).filter(|(_, c)| *c > 0) {
        let name = benchmark.relations.name(id as u32).unwrap_or("?");
        println!("  {name:<40} {count}");
    }
    Ok(())
}

fn cmd_train(
    dir: &Path,
    feature_args: &FeatureArgs,
    config_path: Option<&Path>,
    overrides: &Overrides,
    save: Option<&Path>,
    device: &Device,
) -> Result<()> {
    let config = build_config(config_path, overrides)?;
    let benchmark = load_benchmark(dir)?;
    let features = load_features(feature_args, benchmark.num_entities(), device)?;

    let mut trainer = AdversarialTrainer::new(config.clone(), &benchmark, features, device)
        .context("Failed to build trainer")?;
    if !benchmark.test.is_empty() {
        trainer = trainer.with_tester(Tester::new(&benchmark));
    }

    let pb = ProgressBar::new(config.epochs as u64);
    pb.set_style(
        ProgressStyle::with_template("{elapsed_precise} [{bar:40}] {pos}/{len} epochs {msg}")
            .context("Invalid progress template")?
            .progress_chars("=> "),
    );

    let start = Instant::now();
    let report = trainer.run_with_callback(|epoch| {
        pb.inc(1);
        pb.set_message(format!(
            "D {:.4} G {:.4}",
            epoch.discriminator_loss, epoch.generator_loss
        ));
    })?;
    pb.finish_with_message(format!("done in {:.2?}", start.elapsed()));

    println!(
        "Best scorer loss {:.4} at epoch {}",
        report.best_loss, report.best_epoch
    );
    if let Some(evaluation) = report.final_evaluation() {
        println!("Head: {}", evaluation.head.summary());
        println!("Tail: {}", evaluation.tail.summary());
        println!("All:  {}", evaluation.overall.summary());
    }

    if let Some(path) = save {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        trainer.scorer().save_checkpoint(path)?;
        let gen_path = generator_path(path);
        trainer.generator().save_checkpoint(&gen_path)?;
        println!("Saved scorer to {} and generator to {}", path.display(), gen_path.display());
    }
    Ok(())
}

fn cmd_eval(dir: &Path, checkpoint: &Path, feature_args: &FeatureArgs, device: &Device) -> Result<()> {
    let benchmark = load_benchmark(dir)?;
    if benchmark.test.is_empty() {
        bail!("benchmark {} has no test triples", dir.display());
    }
    let features = load_features(feature_args, benchmark.num_entities(), device)?;
    let scorer = MultimodalScorer::from_checkpoint(checkpoint, features, device)
        .with_context(|| format!("Failed to load checkpoint {}", checkpoint.display()))?;

    let start = Instant::now();
    let pb = ProgressBar::new_spinner();
    pb.set_message(format!("Ranking {} test triples...", benchmark.test.len()));
    let report = Tester::new(&benchmark).run_link_prediction(&scorer)?;
    pb.finish_with_message(format!("Ranked in {:.2?}", start.elapsed()));

    println!("Head: {}", report.head.summary());
    println!("Tail: {}", report.tail.summary());
    println!("All:  {}", report.overall.summary());
    Ok(())
}
