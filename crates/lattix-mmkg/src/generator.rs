//! Generator of synthetic modality embeddings.
//!
//! For every modality the generator has its own two-layer head that reads
//! Gaussian noise, the entity's structural embedding and its real projected
//! modality embedding, and emits a fake embedding in the same `2d` space:
//!
//! ```text
//! [ z ~ N(0, I) | structure | real_m ] -> Linear(hidden) -> LeakyReLU -> Linear(2d) = fake_m
//! ```
//!
//! The scorer is trained to give fake-conditioned triples low scores; the
//! generator is trained to raise them. Conditioning on the real embedding
//! lets the generator produce hard, entity-specific negatives rather than
//! generic noise.

use std::path::Path;

use candle_core::{Device, Tensor};
use candle_nn::{Linear, Module};
use rand::prelude::*;
use rand_distr::StandardNormal;
use tracing::info;

use crate::config::GeneratorConfig;
use crate::error::{Error, Result};
use crate::features::Modality;
use crate::params::ParamStore;
use crate::scorer::{config_path, MultimodalEmbedding};

#[derive(Debug, Clone)]
struct GeneratorHead {
    modality: Modality,
    fc1: Linear,
    fc2: Linear,
}

/// Per-modality conditional generator.
#[derive(Debug)]
pub struct CombinedGenerator {
    config: GeneratorConfig,
    params: ParamStore,
    heads: Vec<GeneratorHead>,
    rng: StdRng,
}

impl CombinedGenerator {
    /// One head per modality, in the order the scorer uses.
    pub fn new(config: GeneratorConfig, modalities: &[Modality], device: &Device) -> Result<Self> {
        if modalities.is_empty() {
            return Err(Error::InvalidConfig("generator needs at least one modality".into()));
        }
        if config.embedding_dim == 0 || config.hidden_dim == 0 {
            return Err(Error::InvalidConfig("generator dimensions must be positive".into()));
        }

        let mut init_rng = StdRng::seed_from_u64(config.seed);
        let params = ParamStore::new(device);
        let input_dim = config.noise_dim + 2 * config.embedding_dim;

        let heads = modalities
            .iter()
            .map(|&modality| {
                let name = modality.name();
                Ok(GeneratorHead {
                    modality,
                    fc1: params.linear(&format!("{name}.fc1"), input_dim, config.hidden_dim, true, &mut init_rng)?,
                    fc2: params.linear(
                        &format!("{name}.fc2"),
                        config.hidden_dim,
                        config.embedding_dim,
                        true,
                        &mut init_rng,
                    )?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            noise_dim = config.noise_dim,
            hidden_dim = config.hidden_dim,
            heads = heads.len(),
            parameters = params.num_parameters(),
            "built generator"
        );

        // Noise stream is independent of the init stream.
        let rng = StdRng::seed_from_u64(config.seed.wrapping_add(0x5DEE_CE66));
        Ok(Self {
            config,
            params,
            heads,
            rng,
        })
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    pub fn modalities(&self) -> Vec<Modality> {
        self.heads.iter().map(|h| h.modality).collect()
    }

    fn noise(&mut self, rows: usize) -> Result<Tensor> {
        let values: Vec<f32> = (0..rows * self.config.noise_dim)
            .map(|_| self.rng.sample(StandardNormal))
            .collect();
        Ok(Tensor::from_vec(values, (rows, self.config.noise_dim), self.params.device())?)
    }

    /// One fake `(n, 2d)` embedding per modality.
    pub fn generate(&mut self, real: &MultimodalEmbedding) -> Result<Vec<Tensor>> {
        if real.modal.len() != self.heads.len() {
            return Err(Error::DimensionMismatch {
                expected: self.heads.len(),
                got: real.modal.len(),
            });
        }
        let (rows, width) = real.structure.dims2()?;
        if width != self.config.embedding_dim {
            return Err(Error::DimensionMismatch {
                expected: self.config.embedding_dim,
                got: width,
            });
        }

        let mut fakes = Vec::with_capacity(self.heads.len());
        for i in 0..self.heads.len() {
            let noise = self.noise(rows)?;
            let input = Tensor::cat(&[&noise, &real.structure, &real.modal[i]], 1)?;
            let head = &self.heads[i];
            let hidden = candle_nn::ops::leaky_relu(&head.fc1.forward(&input)?, self.config.negative_slope)?;
            fakes.push(head.fc2.forward(&hidden)?);
        }
        Ok(fakes)
    }

    pub fn save_checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.params.save(path)?;
        std::fs::write(config_path(path), serde_json::to_string_pretty(&self.config)?)?;
        info!(path = %path.display(), "saved generator checkpoint");
        Ok(())
    }

    pub fn load_checkpoint(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let cfg_path = config_path(path);
        if cfg_path.exists() {
            let stored: GeneratorConfig = serde_json::from_str(&std::fs::read_to_string(&cfg_path)?)?;
            if stored.noise_dim != self.config.noise_dim
                || stored.embedding_dim != self.config.embedding_dim
                || stored.hidden_dim != self.config.hidden_dim
            {
                return Err(Error::InvalidConfig("generator checkpoint shape mismatch".into()));
            }
        }
        self.params.load(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn config() -> GeneratorConfig {
        GeneratorConfig {
            noise_dim: 4,
            embedding_dim: 6,
            hidden_dim: 10,
            negative_slope: 0.2,
            seed: 5,
        }
    }

    fn real(rows: usize, modalities: usize) -> MultimodalEmbedding {
        let ones = Tensor::ones((rows, 6), DType::F32, &Device::Cpu).unwrap();
        MultimodalEmbedding {
            structure: ones.clone(),
            modal: vec![ones; modalities],
        }
    }

    #[test]
    fn test_one_fake_per_modality() {
        let modalities = [Modality::Visual, Modality::Textual, Modality::Audio];
        let mut generator = CombinedGenerator::new(config(), &modalities, &Device::Cpu).unwrap();
        let fakes = generator.generate(&real(3, 3)).unwrap();
        assert_eq!(fakes.len(), 3);
        for f in fakes {
            assert_eq!(f.dims(), &[3, 6]);
        }
        // 3 heads x (fc1 w+b, fc2 w+b)
        assert_eq!(generator.params().all_vars().len(), 12);
    }

    #[test]
    fn test_noise_varies_between_calls() {
        let mut generator = CombinedGenerator::new(config(), &[Modality::Visual], &Device::Cpu).unwrap();
        let a = generator.generate(&real(2, 1)).unwrap()[0].to_vec2::<f32>().unwrap();
        let b = generator.generate(&real(2, 1)).unwrap()[0].to_vec2::<f32>().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_same_seed_same_stream() {
        let mut g1 = CombinedGenerator::new(config(), &[Modality::Visual], &Device::Cpu).unwrap();
        let mut g2 = CombinedGenerator::new(config(), &[Modality::Visual], &Device::Cpu).unwrap();
        assert_eq!(
            g1.generate(&real(2, 1)).unwrap()[0].to_vec2::<f32>().unwrap(),
            g2.generate(&real(2, 1)).unwrap()[0].to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_rejects_modality_count_mismatch() {
        let mut generator = CombinedGenerator::new(config(), &[Modality::Visual], &Device::Cpu).unwrap();
        assert!(matches!(
            generator.generate(&real(2, 2)),
            Err(Error::DimensionMismatch { .. })
        ));
    }
}
