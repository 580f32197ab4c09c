//! Adversarial multimodal knowledge graph embeddings.
//!
//! Entities in a multimodal knowledge graph carry more than their position
//! in the graph: images, descriptions, numeric attributes, audio, video.
//! This crate learns one embedding per entity that fuses all of them, and
//! scores triples with relational rotation.
//!
//! ## Scoring
//!
//! Every entity has a structural embedding and one projected embedding per
//! modality, all in the same `2d`-wide complex space. For a triple
//! `(h, r, t)` the relation gates an attention fusion over those slots
//! (see [`scoring`]), then a RotatE-style distance
//! ([Sun et al. 2019](https://arxiv.org/abs/1902.10197)) compares the fused
//! head, rotated by `r`, with the fused tail:
//!
//! ```text
//! score(h, r, t) = γ - Σ_i | joint(h)_i · e^{iθ_r,i} - joint(t)_i |
//! ```
//!
//! ## Adversarial training
//!
//! Besides the usual corrupted-triple negatives, a [`CombinedGenerator`]
//! synthesizes modality embeddings from noise, conditioned on the entity.
//! The scorer learns to rank real triples above fake-conditioned ones and
//! the generator learns to close the gap, which pushes the scorer to rely
//! on features that are hard to fake. See [`trainer`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use candle_core::Device;
//! use lattix_mmkg::{AdversarialTrainer, Benchmark, Modality, ModalityFeatures, Tester, TrainingConfig};
//!
//! let device = Device::Cpu;
//! let benchmark = Benchmark::load("benchmarks/DB15K")?;
//! let features = vec![
//!     ModalityFeatures::load(Modality::Visual, "features/visual.safetensors", &device)?.pooled_default()?,
//!     ModalityFeatures::load(Modality::Textual, "features/textual.npy", &device)?,
//! ];
//!
//! let config = TrainingConfig::default().with_epochs(1000);
//! let mut trainer = AdversarialTrainer::new(config, &benchmark, features, &device)?
//!     .with_tester(Tester::new(&benchmark));
//! let report = trainer.run()?;
//! trainer.scorer().save_checkpoint("checkpoint/scorer.safetensors")?;
//! ```
//!
//! ## References
//!
//! - Sun et al. (2019). "RotatE: Knowledge Graph Embedding by Relational
//!   Rotation in Complex Space." ICLR.
//! - Wang et al. (2014). "Knowledge Graph Embedding by Translating on
//!   Hyperplanes." AAAI. (Bernoulli negative sampling)

pub mod config;
pub mod data;
pub mod error;
pub mod evaluation;
pub mod features;
pub mod generator;
pub mod loss;
pub mod params;
pub mod scorer;
pub mod scoring;
pub mod trainer;

pub use config::{CorruptionStrategy, GeneratorConfig, SamplerConfig, ScorerConfig, TrainingConfig};
pub use data::{Benchmark, IdTriple, NegativeSampler, TripleBatch, Vocab};
pub use error::{Error, Result};
pub use evaluation::{LinkPredictionReport, RankMetrics, Tester};
pub use features::{Modality, ModalityFeatures};
pub use generator::CombinedGenerator;
pub use loss::{NegativeSamplingObjective, SigmoidLoss};
pub use params::ParamStore;
pub use scorer::{FakeScores, MultimodalEmbedding, MultimodalScorer};
pub use trainer::{AdversarialTrainer, EpochSummary, StepLoss, TrainingReport};
