//! Hyperparameters for adversarial multimodal training.
//!
//! [`TrainingConfig`] is the single user-facing knob set. The scorer,
//! generator and sampler each get a narrower config derived from it once the
//! benchmark size is known:
//!
//! ```rust,ignore
//! use lattix_mmkg::TrainingConfig;
//!
//! let config = TrainingConfig::default()
//!     .with_embedding_dim(250)
//!     .with_margin(12.0)
//!     .with_epochs(1000)
//!     .with_mu(1e-4);
//!
//! let scorer_config = config.scorer_config(num_entities, num_relations);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How corrupted triples choose which side to replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CorruptionStrategy {
    /// Head or tail with equal probability.
    Uniform,
    /// Replace the head with probability tph / (tph + hpt) of the relation.
    #[default]
    Bernoulli,
}

/// Training configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Rotation dimension `d`; entities live in `2d` (default: 250).
    pub embedding_dim: usize,
    /// Score offset `γ` in `γ - distance` (default: 12.0).
    pub margin: f64,
    /// Added to the margin when sizing the initialization range (default: 2.0).
    pub epsilon: f64,
    /// Number of training epochs (default: 1000).
    pub epochs: usize,
    /// Positive triples per batch (default: 1024).
    pub batch_size: usize,
    /// Negative samples per positive (default: 128).
    pub negative_samples: usize,
    /// How negatives corrupt triples (default: bernoulli).
    pub corruption: CorruptionStrategy,
    /// Reject corruptions that are known training triples (default: true).
    pub filter_negatives: bool,
    /// Scorer learning rate (default: 1e-3).
    pub learning_rate: f64,
    /// Generator learning rate (default: 1e-4).
    pub generator_learning_rate: f64,
    /// Weight of the real-vs-fake term in the scorer loss (default: 1e-4).
    pub mu: f64,
    /// Self-adversarial temperature for negatives; `None` averages uniformly (default: 2.0).
    pub adv_temperature: Option<f64>,
    /// L2 weight on structural embeddings (default: 1e-5).
    pub regul_rate: f64,
    /// Generator noise dimension (default: 64).
    pub noise_dim: usize,
    /// Generator hidden width; `None` uses `4 * embedding_dim`.
    pub generator_hidden_dim: Option<usize>,
    /// Run link prediction every N epochs (default: 100).
    pub eval_every: Option<usize>,
    /// Random seed (default: 42).
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 250,
            margin: 12.0,
            epsilon: 2.0,
            epochs: 1000,
            batch_size: 1024,
            negative_samples: 128,
            corruption: CorruptionStrategy::Bernoulli,
            filter_negatives: true,
            learning_rate: 1e-3,
            generator_learning_rate: 1e-4,
            mu: 1e-4,
            adv_temperature: Some(2.0),
            regul_rate: 1e-5,
            noise_dim: 64,
            generator_hidden_dim: None,
            eval_every: Some(100),
            seed: 42,
        }
    }
}

impl TrainingConfig {
    pub fn with_embedding_dim(mut self, dim: usize) -> Self {
        self.embedding_dim = dim;
        self
    }

    pub fn with_margin(mut self, margin: f64) -> Self {
        self.margin = margin;
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_negative_samples(mut self, n: usize) -> Self {
        self.negative_samples = n;
        self
    }

    pub fn with_corruption(mut self, corruption: CorruptionStrategy) -> Self {
        self.corruption = corruption;
        self
    }

    pub fn with_learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn with_generator_learning_rate(mut self, lr: f64) -> Self {
        self.generator_learning_rate = lr;
        self
    }

    pub fn with_mu(mut self, mu: f64) -> Self {
        self.mu = mu;
        self
    }

    pub fn with_adv_temperature(mut self, temperature: Option<f64>) -> Self {
        self.adv_temperature = temperature;
        self
    }

    pub fn with_regul_rate(mut self, rate: f64) -> Self {
        self.regul_rate = rate;
        self
    }

    pub fn with_eval_every(mut self, every: Option<usize>) -> Self {
        self.eval_every = every;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Reject settings the trainer cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.embedding_dim == 0 {
            return Err(Error::InvalidConfig("embedding_dim must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be positive".into()));
        }
        if self.negative_samples == 0 {
            return Err(Error::InvalidConfig("negative_samples must be positive".into()));
        }
        if !(self.margin + self.epsilon > 0.0) {
            return Err(Error::InvalidConfig("margin + epsilon must be positive".into()));
        }
        if !(self.learning_rate > 0.0 && self.generator_learning_rate > 0.0) {
            return Err(Error::InvalidConfig("learning rates must be positive".into()));
        }
        if self.mu < 0.0 || self.regul_rate < 0.0 {
            return Err(Error::InvalidConfig("mu and regul_rate must be non-negative".into()));
        }
        if self.eval_every == Some(0) {
            return Err(Error::InvalidConfig("eval_every must be positive when set".into()));
        }
        Ok(())
    }

    /// Scorer shape for a benchmark of the given size.
    pub fn scorer_config(&self, num_entities: usize, num_relations: usize) -> ScorerConfig {
        ScorerConfig {
            num_entities,
            num_relations,
            dim: self.embedding_dim,
            margin: self.margin,
            epsilon: self.epsilon,
            seed: self.seed,
        }
    }

    pub fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig {
            noise_dim: self.noise_dim,
            embedding_dim: 2 * self.embedding_dim,
            hidden_dim: self
                .generator_hidden_dim
                .unwrap_or(4 * self.embedding_dim),
            negative_slope: 0.2,
            seed: self.seed.wrapping_add(1),
        }
    }

    pub fn sampler_config(&self) -> SamplerConfig {
        SamplerConfig {
            batch_size: self.batch_size,
            negative_samples: self.negative_samples,
            corruption: self.corruption,
            filter: self.filter_negatives,
            seed: self.seed.wrapping_add(2),
        }
    }
}

/// Shape and constants of the multimodal scorer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScorerConfig {
    pub num_entities: usize,
    pub num_relations: usize,
    /// Rotation dimension `d`.
    pub dim: usize,
    pub margin: f64,
    pub epsilon: f64,
    pub seed: u64,
}

impl ScorerConfig {
    /// Width of entity and projected modality embeddings.
    pub fn entity_dim(&self) -> usize {
        2 * self.dim
    }

    /// Half-width of the entity initialization interval.
    pub fn entity_range(&self) -> f64 {
        (self.margin + self.epsilon) / self.entity_dim() as f64
    }

    /// Half-width of the relation phase interval; phases map to angles by `π / range`.
    pub fn relation_range(&self) -> f64 {
        (self.margin + self.epsilon) / self.dim as f64
    }
}

/// Generator shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub noise_dim: usize,
    /// Width of structural and produced modality embeddings (`2d`).
    pub embedding_dim: usize,
    pub hidden_dim: usize,
    /// LeakyReLU slope between the two layers.
    pub negative_slope: f64,
    pub seed: u64,
}

/// Negative sampler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    pub batch_size: usize,
    pub negative_samples: usize,
    pub corruption: CorruptionStrategy,
    pub filter: bool,
    pub seed: u64,
}
