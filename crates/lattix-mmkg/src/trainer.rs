//! Adversarial training loop.
//!
//! Every batch runs two updates:
//!
//! 1. **Scorer (discriminator).** The negative-sampling loss on real triples,
//!    plus `μ · Σ_s (mean s - mean p)` over the three fake-conditioned score
//!    sets `s` (fake head, fake tail, both fake) against the positive scores
//!    `p`. Only scorer parameters move.
//! 2. **Generator.** Fresh fakes are drawn and the generator minimizes
//!    `Σ_s mean(γ - s) / 3`, i.e. it tries to make fake-conditioned triples
//!    look plausible. Only generator parameters move.
//!
//! The two networks have separate Adam optimizers.

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use tracing::{debug, info, warn};

use crate::config::TrainingConfig;
use crate::data::{Benchmark, NegativeSampler, TripleBatch};
use crate::error::{Error, Result};
use crate::evaluation::{LinkPredictionReport, Tester};
use crate::features::ModalityFeatures;
use crate::generator::CombinedGenerator;
use crate::loss::{NegativeSamplingObjective, SigmoidLoss};
use crate::scorer::{FakeScores, MultimodalEmbedding, MultimodalScorer};

/// Losses of one training step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepLoss {
    /// Scorer loss, including the `μ`-weighted adversarial term.
    pub discriminator: f64,
    /// Generator loss `Σ mean(γ - s) / 3`.
    pub generator: f64,
}

/// Summed losses of one epoch, handed to the epoch callback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochSummary {
    /// Zero-based epoch index.
    pub epoch: usize,
    pub discriminator_loss: f64,
    pub generator_loss: f64,
}

/// Outcome of [`AdversarialTrainer::run`].
#[derive(Debug, Clone, Default)]
pub struct TrainingReport {
    /// Per-epoch scorer loss, summed over batches.
    pub discriminator_losses: Vec<f64>,
    /// Per-epoch generator loss, summed over batches.
    pub generator_losses: Vec<f64>,
    /// Lowest per-epoch scorer loss.
    pub best_loss: f64,
    /// Epoch at which `best_loss` was reached.
    pub best_epoch: usize,
    /// `(epoch, report)` for every periodic evaluation.
    pub evaluations: Vec<(usize, LinkPredictionReport)>,
}

impl TrainingReport {
    /// The last periodic evaluation, normally the one after the final epoch.
    pub fn final_evaluation(&self) -> Option<&LinkPredictionReport> {
        self.evaluations.last().map(|(_, r)| r)
    }
}

fn adam(vars: Vec<Var>, lr: f64) -> Result<AdamW> {
    let params = ParamsAdamW {
        lr,
        weight_decay: 0.0,
        ..ParamsAdamW::default()
    };
    Ok(AdamW::new(vars, params)?)
}

/// Scorer, generator and their optimizers.
pub struct AdversarialTrainer {
    scorer: MultimodalScorer,
    generator: CombinedGenerator,
    objective: NegativeSamplingObjective,
    sampler: NegativeSampler,
    config: TrainingConfig,
    opt_d: AdamW,
    opt_g: AdamW,
    tester: Option<Tester>,
}

impl std::fmt::Debug for AdversarialTrainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdversarialTrainer")
            .field("scorer", &self.scorer)
            .field("generator", &self.generator)
            .field("objective", &self.objective)
            .field("config", &self.config)
            .field("has_tester", &self.tester.is_some())
            .finish()
    }
}

impl AdversarialTrainer {
    /// Build scorer, generator and sampler for `benchmark`'s training split.
    pub fn new(
        config: TrainingConfig,
        benchmark: &Benchmark,
        features: Vec<ModalityFeatures>,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let scorer = MultimodalScorer::new(
            config.scorer_config(benchmark.num_entities(), benchmark.num_relations()),
            features,
            device,
        )?;
        let generator = CombinedGenerator::new(config.generator_config(), &scorer.modalities(), device)?;
        let sampler = NegativeSampler::new(
            benchmark.train.clone(),
            benchmark.num_entities(),
            benchmark.num_relations(),
            config.sampler_config(),
        )?;
        Self::from_parts(scorer, generator, sampler, config)
    }

    /// Assemble a trainer from prebuilt parts; modalities must agree.
    pub fn from_parts(
        scorer: MultimodalScorer,
        generator: CombinedGenerator,
        sampler: NegativeSampler,
        config: TrainingConfig,
    ) -> Result<Self> {
        config.validate()?;
        if generator.modalities() != scorer.modalities() {
            return Err(Error::InvalidConfig(
                "generator and scorer modalities differ".into(),
            ));
        }
        let objective = NegativeSamplingObjective::new(
            SigmoidLoss::new(config.adv_temperature),
            config.regul_rate,
        );
        let opt_d = adam(scorer.params().all_vars(), config.learning_rate)?;
        let opt_g = adam(generator.params().all_vars(), config.generator_learning_rate)?;

        Ok(Self {
            scorer,
            generator,
            objective,
            sampler,
            config,
            opt_d,
            opt_g,
            tester: None,
        })
    }

    /// Evaluate with `tester` every `eval_every` epochs and after the last one.
    pub fn with_tester(mut self, tester: Tester) -> Self {
        self.tester = Some(tester);
        self
    }

    /// The scorer (discriminator).
    pub fn scorer(&self) -> &MultimodalScorer {
        &self.scorer
    }

    /// The fake-embedding generator.
    pub fn generator(&self) -> &CombinedGenerator {
        &self.generator
    }

    /// Hyperparameters in use.
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Batch source for the training split.
    pub fn sampler(&self) -> &NegativeSampler {
        &self.sampler
    }

    /// Consume the trainer, keeping the two trained networks.
    pub fn into_parts(self) -> (MultimodalScorer, CombinedGenerator) {
        (self.scorer, self.generator)
    }

    /// One scorer update followed by one generator update.
    pub fn train_step(&mut self, batch: &TripleBatch) -> Result<StepLoss> {
        batch.validate()?;
        let discriminator = self.discriminator_step(batch)?;
        let generator = self.generator_step(batch)?;
        Ok(StepLoss {
            discriminator,
            generator,
        })
    }

    /// Scorer update: real loss plus `μ` times the fake-vs-positive score gap.
    /// Fakes are constants, so generator parameters do not move.
    pub fn discriminator_step(&mut self, batch: &TripleBatch) -> Result<f64> {
        let (real_loss, positive) = self.objective.compute(&self.scorer, batch)?;
        let (heads, relations, tails) = self.positive_tensors(batch)?;

        let head_mm = self.scorer.multimodal_embeddings(&heads)?;
        let tail_mm = self.scorer.multimodal_embeddings(&tails)?;
        let fake_head = detach_all(self.generator.generate(&head_mm)?);
        let fake_tail = detach_all(self.generator.generate(&tail_mm)?);
        let fakes = self
            .scorer
            .fake_scores(&head_mm, &relations, &tail_mm, &fake_head, &fake_tail)?;

        let positive_mean = positive.mean_all()?;
        let mut adversarial = positive_mean.zeros_like()?;
        for score in fakes.scores() {
            adversarial = (adversarial + (score.mean_all()? - &positive_mean)?)?;
        }
        let d_loss = (real_loss + (adversarial * self.config.mu)?)?;
        self.opt_d.backward_step(&d_loss)?;
        to_f64(&d_loss)
    }

    /// Generator update against the current scorer. Only generator parameters move.
    pub fn generator_step(&mut self, batch: &TripleBatch) -> Result<f64> {
        batch.validate()?;
        let (heads, relations, tails) = self.positive_tensors(batch)?;

        let head_mm = self.scorer.multimodal_embeddings(&heads)?;
        let tail_mm = self.scorer.multimodal_embeddings(&tails)?;
        let fake_head = self.generator.generate(&detach_embedding(&head_mm))?;
        let fake_tail = self.generator.generate(&detach_embedding(&tail_mm))?;
        let fakes = self
            .scorer
            .fake_scores(&head_mm, &relations, &tail_mm, &fake_head, &fake_tail)?;

        let g_loss = generator_loss(&fakes, self.scorer.margin())?;
        self.opt_g.backward_step(&g_loss)?;
        to_f64(&g_loss)
    }

    fn positive_tensors(&self, batch: &TripleBatch) -> Result<(Tensor, Tensor, Tensor)> {
        let (heads, relations, tails) = batch.positive_ids();
        Ok((
            self.scorer.entity_ids(heads)?,
            self.scorer.relation_ids(relations)?,
            self.scorer.entity_ids(tails)?,
        ))
    }

    /// All batches of one epoch; returns the summed losses.
    pub fn train_epoch(&mut self, epoch: usize) -> Result<EpochSummary> {
        let mut d_total = 0.0;
        let mut g_total = 0.0;
        for (i, batch) in self.sampler.batches(epoch).iter().enumerate() {
            let step = self.train_step(batch)?;
            if !step.discriminator.is_finite() || !step.generator.is_finite() {
                return Err(Error::Training(format!(
                    "non-finite loss at epoch {epoch}, batch {i}: D={} G={}",
                    step.discriminator, step.generator
                )));
            }
            debug!(epoch, batch = i, d_loss = step.discriminator, g_loss = step.generator, "step");
            d_total += step.discriminator;
            g_total += step.generator;
        }
        Ok(EpochSummary {
            epoch,
            discriminator_loss: d_total,
            generator_loss: g_total,
        })
    }

    /// Evaluate now, if a tester is attached.
    pub fn evaluate(&self) -> Result<Option<LinkPredictionReport>> {
        self.tester
            .as_ref()
            .map(|t| t.run_link_prediction(&self.scorer))
            .transpose()
    }

    /// [`run_with_callback`](Self::run_with_callback) without a callback.
    pub fn run(&mut self) -> Result<TrainingReport> {
        self.run_with_callback(|_| {})
    }

    /// Train for `config.epochs`, calling `on_epoch` after every epoch.
    pub fn run_with_callback(&mut self, mut on_epoch: impl FnMut(&EpochSummary)) -> Result<TrainingReport> {
        let epochs = self.config.epochs;
        info!(
            epochs,
            batches = self.sampler.num_batches(),
            negatives = self.sampler.negatives_per_positive(),
            "starting adversarial training"
        );
        if self.tester.is_none() && self.config.eval_every.is_some() {
            warn!("eval_every is set but no tester is attached");
        }

        let mut report = TrainingReport {
            best_loss: f64::INFINITY,
            ..TrainingReport::default()
        };

        for epoch in 0..epochs {
            let summary = self.train_epoch(epoch)?;
            info!(
                epoch,
                d_loss = summary.discriminator_loss,
                g_loss = summary.generator_loss,
                "epoch done"
            );
            if summary.discriminator_loss < report.best_loss {
                report.best_loss = summary.discriminator_loss;
                report.best_epoch = epoch;
            }
            report.discriminator_losses.push(summary.discriminator_loss);
            report.generator_losses.push(summary.generator_loss);
            on_epoch(&summary);

            let due = self
                .config
                .eval_every
                .is_some_and(|every| (epoch + 1) % every == 0);
            if due || epoch + 1 == epochs {
                if let Some(evaluation) = self.evaluate()? {
                    info!(epoch, "{}", evaluation.overall.summary());
                    report.evaluations.push((epoch, evaluation));
                }
            }
        }

        Ok(report)
    }
}

/// `Σ_s mean(γ - s) / 3` over the three fake-conditioned score sets.
pub fn generator_loss(fakes: &FakeScores, margin: f64) -> Result<Tensor> {
    let [first, rest @ ..] = fakes.scores();
    let mut total = first.affine(-1.0, margin)?.mean_all()?;
    for score in rest {
        total = (total + score.affine(-1.0, margin)?.mean_all()?)?;
    }
    Ok((total / 3.0)?)
}

fn to_f64(t: &Tensor) -> Result<f64> {
    Ok(t.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}

fn detach_all(tensors: Vec<Tensor>) -> Vec<Tensor> {
    tensors.into_iter().map(|t| t.detach()).collect()
}

fn detach_embedding(mm: &MultimodalEmbedding) -> MultimodalEmbedding {
    MultimodalEmbedding {
        structure: mm.structure.detach(),
        modal: mm.modal.iter().map(|t| t.detach()).collect(),
    }
}
