//! The multimodal scorer (discriminator).
//!
//! Every entity has a structural embedding plus one feature row per modality.
//! Modality rows are projected into the structural space by a two-layer MLP,
//! fused with the structural embedding by relation-gated attention, and the
//! fused head/tail pair is scored by rotation distance:
//!
//! ```text
//!   ent[h] ─────────────────────────┐
//!   visual[h] ─ proj_visual ────────┤
//!   textual[h] ─ proj_textual ──────┼─ attention(gate[r]) ─ joint(h) ─┐
//!   numeric[h] ─ proj_numeric ──────┘                                 ├─ γ - dist(joint(h), r, joint(t))
//!                                                          joint(t) ──┘
//! ```
//!
//! The same fusion accepts generator output in place of the projected
//! modality rows; [`MultimodalScorer::fake_scores`] scores triples whose
//! head, tail, or both carry synthetic features, which is what the
//! adversarial trainer teaches the scorer to reject.

use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use candle_nn::{Linear, Module};
use rand::prelude::*;
use tracing::info;

use crate::config::ScorerConfig;
use crate::error::{Error, Result};
use crate::features::{Modality, ModalityFeatures};
use crate::params::ParamStore;
use crate::scoring::{attention_fusion, attention_weights, rotate_distance, stack_modalities};

/// Candidates scored per forward pass during ranking.
const RANKING_CHUNK: usize = 4096;

/// `Linear(raw, 2d) -> ReLU -> Linear(2d, 2d)`.
#[derive(Debug, Clone)]
struct Projection {
    fc1: Linear,
    fc2: Linear,
}

impl Module for Projection {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.fc2.forward(&self.fc1.forward(xs)?.relu()?)
    }
}

/// Feature table and projection for one modality.
#[derive(Debug, Clone)]
struct ModalityBranch {
    modality: Modality,
    table: Tensor,
    projection: Projection,
}

impl ModalityBranch {
    fn embed(&self, ids: &Tensor) -> Result<Tensor> {
        let rows = self.table.index_select(ids, 0)?;
        Ok(self.projection.forward(&rows)?)
    }
}

/// Structural and projected modality embeddings of a batch of entities.
#[derive(Debug, Clone)]
pub struct MultimodalEmbedding {
    /// `(n, 2d)`
    pub structure: Tensor,
    /// One `(n, 2d)` tensor per modality, in scorer order.
    pub modal: Vec<Tensor>,
}

/// Scores for triples with synthetic modality features.
#[derive(Debug, Clone)]
pub struct FakeScores {
    /// Fake head, real tail.
    pub fake_head: Tensor,
    /// Real head, fake tail.
    pub fake_tail: Tensor,
    /// Both sides fake.
    pub fake_both: Tensor,
    /// Fused head embedding built from fake features.
    pub head_joint: Tensor,
    /// Fused tail embedding built from fake features.
    pub tail_joint: Tensor,
}

impl FakeScores {
    pub fn scores(&self) -> [&Tensor; 3] {
        [&self.fake_head, &self.fake_tail, &self.fake_both]
    }
}

/// Gated multimodal rotation scorer.
#[derive(Debug)]
pub struct MultimodalScorer {
    config: ScorerConfig,
    params: ParamStore,
    /// `(E, 2d)`
    entities: Tensor,
    /// `(R, d)` phases.
    relations: Tensor,
    /// `(R, 1)` attention temperature logits.
    relation_gate: Tensor,
    /// `(1, 2d)` slot scoring vector.
    attention: Tensor,
    branches: Vec<ModalityBranch>,
}

/// Device-side `u32` index tensor.
pub(crate) fn index_tensor(ids: &[u32], device: &Device) -> Result<Tensor> {
    Ok(Tensor::from_slice(ids, ids.len(), device)?)
}

impl MultimodalScorer {
    /// Build a scorer over the given modality tables.
    ///
    /// Every table must have `config.num_entities` rows. Trainable tables are
    /// copied into the parameter store; frozen ones are kept as constants.
    pub fn new(config: ScorerConfig, features: Vec<ModalityFeatures>, device: &Device) -> Result<Self> {
        if features.is_empty() {
            return Err(Error::InvalidConfig("at least one modality is required".into()));
        }
        if config.dim == 0 || config.num_entities == 0 || config.num_relations == 0 {
            return Err(Error::InvalidConfig(
                "dim, num_entities and num_relations must be positive".into(),
            ));
        }
        for (i, f) in features.iter().enumerate() {
            if f.num_rows() != config.num_entities {
                return Err(Error::DimensionMismatch {
                    expected: config.num_entities,
                    got: f.num_rows(),
                });
            }
            if features[..i].iter().any(|g| g.modality() == f.modality()) {
                return Err(Error::InvalidConfig(format!("modality {} given twice", f.modality())));
            }
        }

        let mut rng = StdRng::seed_from_u64(config.seed);
        let params = ParamStore::new(device);
        let dim_e = config.entity_dim();
        let ent_range = config.entity_range();
        let rel_range = config.relation_range();

        let entities = params.uniform(
            "ent_embeddings",
            (config.num_entities, dim_e),
            -ent_range,
            ent_range,
            &mut rng,
        )?;
        let relations = params.uniform(
            "rel_embeddings",
            (config.num_relations, config.dim),
            -rel_range,
            rel_range,
            &mut rng,
        )?;
        let relation_gate = params.uniform("rel_gate", (config.num_relations, 1), -ent_range, ent_range, &mut rng)?;
        let bound = 1.0 / (dim_e as f64).sqrt();
        let attention = params.uniform("ent_attn.weight", (1, dim_e), -bound, bound, &mut rng)?;

        let mut branches = Vec::with_capacity(features.len());
        for f in features {
            let name = f.modality().name();
            let table = if f.is_trainable() {
                params.insert(&format!("features.{name}"), f.table())?
            } else {
                f.table().to_device(device)?
            };
            let projection = Projection {
                fc1: params.linear(&format!("proj.{name}.fc1"), f.feature_dim(), dim_e, true, &mut rng)?,
                fc2: params.linear(&format!("proj.{name}.fc2"), dim_e, dim_e, true, &mut rng)?,
            };
            branches.push(ModalityBranch {
                modality: f.modality(),
                table,
                projection,
            });
        }

        info!(
            entities = config.num_entities,
            relations = config.num_relations,
            dim = config.dim,
            modalities = ?branches.iter().map(|b| b.modality).collect::<Vec<_>>(),
            parameters = params.num_parameters(),
            "built multimodal scorer"
        );

        Ok(Self {
            config,
            params,
            entities,
            relations,
            relation_gate,
            attention,
            branches,
        })
    }

    /// Sizes, margin and seed this scorer was built with.
    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }

    /// Device holding every parameter.
    pub fn device(&self) -> &Device {
        self.params.device()
    }

    /// The margin `γ` added to every score.
    pub fn margin(&self) -> f64 {
        self.config.margin
    }

    /// Modalities in fusion order (after the structural slot).
    pub fn modalities(&self) -> Vec<Modality> {
        self.branches.iter().map(|b| b.modality).collect()
    }

    /// Trainable parameters, including trainable feature tables.
    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    /// Number of entities `E`.
    pub fn num_entities(&self) -> usize {
        self.config.num_entities
    }

    /// Number of relations `R`.
    pub fn num_relations(&self) -> usize {
        self.config.num_relations
    }

    /// Upload ids after bounds-checking against the vocabulary.
    pub fn entity_ids(&self, ids: &[u32]) -> Result<Tensor> {
        if let Some(&bad) = ids.iter().find(|&&i| i as usize >= self.config.num_entities) {
            return Err(Error::EntityNotFound(bad.to_string()));
        }
        index_tensor(ids, self.device())
    }

    pub fn relation_ids(&self, ids: &[u32]) -> Result<Tensor> {
        if let Some(&bad) = ids.iter().find(|&&i| i as usize >= self.config.num_relations) {
            return Err(Error::RelationNotFound(bad.to_string()));
        }
        index_tensor(ids, self.device())
    }

    /// Structural embedding and projected modality embeddings.
    pub fn multimodal_embeddings(&self, entity_ids: &Tensor) -> Result<MultimodalEmbedding> {
        let structure = self.entities.index_select(entity_ids, 0)?;
        let modal = self
            .branches
            .iter()
            .map(|b| b.embed(entity_ids))
            .collect::<Result<Vec<_>>>()?;
        Ok(MultimodalEmbedding { structure, modal })
    }

    /// Fuse a structural embedding with modality embeddings under a relation gate.
    pub fn joint_embedding(&self, structure: &Tensor, modal: &[Tensor], gate: &Tensor) -> Result<Tensor> {
        if modal.len() != self.branches.len() {
            return Err(Error::DimensionMismatch {
                expected: self.branches.len(),
                got: modal.len(),
            });
        }
        let stack = stack_modalities(structure, modal)?;
        attention_fusion(&stack, &self.attention, gate)
    }

    fn gate(&self, relation_ids: &Tensor) -> Result<Tensor> {
        Ok(self.relation_gate.index_select(relation_ids, 0)?)
    }

    fn relation(&self, relation_ids: &Tensor) -> Result<Tensor> {
        Ok(self.relations.index_select(relation_ids, 0)?)
    }

    /// `γ - dist` for embeddings already fused.
    pub fn score_joint(&self, head: &Tensor, relation_ids: &Tensor, tail: &Tensor) -> Result<Tensor> {
        let distance = rotate_distance(head, &self.relation(relation_ids)?, tail, self.config.relation_range())?;
        Ok(distance.affine(-1.0, self.config.margin)?)
    }

    /// Plausibility `γ - dist(joint(h), r, joint(t))` for index tensors; higher is better.
    pub fn forward(&self, heads: &Tensor, relations: &Tensor, tails: &Tensor) -> Result<Tensor> {
        let gate = self.gate(relations)?;
        let h = self.multimodal_embeddings(heads)?;
        let t = self.multimodal_embeddings(tails)?;
        let h_joint = self.joint_embedding(&h.structure, &h.modal, &gate)?;
        let t_joint = self.joint_embedding(&t.structure, &t.modal, &gate)?;
        self.score_joint(&h_joint, relations, &t_joint)
    }

    /// [`forward`](Self::forward) on id slices.
    pub fn score(&self, heads: &[u32], relations: &[u32], tails: &[u32]) -> Result<Tensor> {
        for got in [relations.len(), tails.len()] {
            if got != heads.len() {
                return Err(Error::DimensionMismatch {
                    expected: heads.len(),
                    got,
                });
            }
        }
        self.forward(
            &self.entity_ids(heads)?,
            &self.relation_ids(relations)?,
            &self.entity_ids(tails)?,
        )
    }

    /// Distance minus margin; lower is more plausible.
    pub fn predict(&self, heads: &[u32], relations: &[u32], tails: &[u32]) -> Result<Vec<f32>> {
        Ok(self
            .score(heads, relations, tails)?
            .detach()
            .neg()?
            .to_vec1::<f32>()?)
    }

    /// Scores with synthetic modality features substituted on each side.
    ///
    /// `fake_head`/`fake_tail` hold one `(n, 2d)` tensor per modality, in
    /// [`modalities`](Self::modalities) order.
    pub fn fake_scores(
        &self,
        head: &MultimodalEmbedding,
        relations: &Tensor,
        tail: &MultimodalEmbedding,
        fake_head: &[Tensor],
        fake_tail: &[Tensor],
    ) -> Result<FakeScores> {
        let gate = self.gate(relations)?;
        let h_real = self.joint_embedding(&head.structure, &head.modal, &gate)?;
        let t_real = self.joint_embedding(&tail.structure, &tail.modal, &gate)?;
        let h_fake = self.joint_embedding(&head.structure, fake_head, &gate)?;
        let t_fake = self.joint_embedding(&tail.structure, fake_tail, &gate)?;

        Ok(FakeScores {
            fake_head: self.score_joint(&h_fake, relations, &t_real)?,
            fake_tail: self.score_joint(&h_real, relations, &t_fake)?,
            fake_both: self.score_joint(&h_fake, relations, &t_fake)?,
            head_joint: h_fake,
            tail_joint: t_fake,
        })
    }

    /// `(mean h² + mean t² + mean r²) / 3` over structural embeddings.
    pub fn regularization(&self, heads: &Tensor, relations: &Tensor, tails: &Tensor) -> Result<Tensor> {
        let h = self.entities.index_select(heads, 0)?.sqr()?.mean_all()?;
        let t = self.entities.index_select(tails, 0)?.sqr()?.mean_all()?;
        let r = self.relation(relations)?.sqr()?.mean_all()?;
        Ok((((h + t)? + r)? / 3.0)?)
    }

    /// Per-entity attention over `[structure, modalities...]` under relation gates, `(n, 1 + m)`.
    pub fn attention_weights(&self, entities: &[u32], relations: &[u32]) -> Result<Vec<Vec<f32>>> {
        let ids = self.entity_ids(entities)?;
        let gate = self.gate(&self.relation_ids(relations)?)?;
        let mm = self.multimodal_embeddings(&ids)?;
        let stack = stack_modalities(&mm.structure, &mm.modal)?;
        Ok(attention_weights(&stack, &self.attention, &gate)?
            .detach()
            .to_vec2::<f32>()?)
    }

    /// Score `(head, relation, e)` for every entity `e`.
    pub fn score_tails(&self, head: u32, relation: u32) -> Result<Vec<f32>> {
        self.score_candidates(relation, |chunk| (vec![head; chunk.len()], chunk.to_vec()))
    }

    /// Score `(e, relation, tail)` for every entity `e`.
    pub fn score_heads(&self, relation: u32, tail: u32) -> Result<Vec<f32>> {
        self.score_candidates(relation, |chunk| (chunk.to_vec(), vec![tail; chunk.len()]))
    }

    fn score_candidates(
        &self,
        relation: u32,
        build: impl Fn(&[u32]) -> (Vec<u32>, Vec<u32>),
    ) -> Result<Vec<f32>> {
        let all: Vec<u32> = (0..self.config.num_entities as u32).collect();
        let mut scores = Vec::with_capacity(all.len());
        for chunk in all.chunks(RANKING_CHUNK) {
            let (heads, tails) = build(chunk);
            let relations = vec![relation; chunk.len()];
            let chunk_scores = self.score(&heads, &relations, &tails)?.detach().to_vec1::<f32>()?;
            scores.extend(chunk_scores);
        }
        Ok(scores)
    }

    /// Rebuild a scorer from a checkpoint, taking its shape from the sidecar config.
    ///
    /// `features` must be the tables the checkpoint was trained with.
    pub fn from_checkpoint(path: impl AsRef<Path>, features: Vec<ModalityFeatures>, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let config: ScorerConfig = serde_json::from_str(&std::fs::read_to_string(config_path(path))?)?;
        let mut scorer = Self::new(config, features, device)?;
        scorer.load_checkpoint(path)?;
        Ok(scorer)
    }

    /// Write parameters to `path` (safetensors) and the config to `path.json`.
    pub fn save_checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.params.save(path)?;
        std::fs::write(config_path(path), serde_json::to_string_pretty(&self.config)?)?;
        info!(path = %path.display(), "saved scorer checkpoint");
        Ok(())
    }

    /// Restore parameters saved by [`save_checkpoint`](Self::save_checkpoint).
    ///
    /// The stored config must match this scorer's shape.
    pub fn load_checkpoint(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let cfg_path = config_path(path);
        if cfg_path.exists() {
            let stored: ScorerConfig = serde_json::from_str(&std::fs::read_to_string(&cfg_path)?)?;
            if stored.num_entities != self.config.num_entities
                || stored.num_relations != self.config.num_relations
                || stored.dim != self.config.dim
            {
                return Err(Error::InvalidConfig(format!(
                    "checkpoint shape {}x{}x{} does not match scorer {}x{}x{}",
                    stored.num_entities,
                    stored.num_relations,
                    stored.dim,
                    self.config.num_entities,
                    self.config.num_relations,
                    self.config.dim
                )));
            }
            self.config.margin = stored.margin;
            self.config.epsilon = stored.epsilon;
        }
        self.params.load(path)?;
        info!(path = %path.display(), "loaded scorer checkpoint");
        Ok(())
    }
}

/// Sidecar JSON holding the config next to a parameter file.
pub(crate) fn config_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".json");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(seed: u64, rows: usize) -> Vec<ModalityFeatures> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut table = |cols: usize| -> Vec<f32> { (0..rows * cols).map(|_| rng.random::<f32>() - 0.5).collect() };
        vec![
            ModalityFeatures::from_vec(Modality::Visual, table(5), rows, &Device::Cpu).unwrap(),
            ModalityFeatures::from_vec(Modality::Textual, table(3), rows, &Device::Cpu).unwrap(),
        ]
    }

    fn config(seed: u64) -> ScorerConfig {
        ScorerConfig {
            num_entities: 6,
            num_relations: 2,
            dim: 4,
            margin: 6.0,
            epsilon: 2.0,
            seed,
        }
    }

    fn tiny_scorer(seed: u64) -> MultimodalScorer {
        MultimodalScorer::new(config(seed), features(100, 6), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_scores_bounded_by_margin() {
        let scorer = tiny_scorer(0);
        let scores = scorer
            .score(&[0, 1, 2], &[0, 1, 0], &[3, 4, 5])
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(scores.len(), 3);
        assert!(scores.iter().all(|s| s.is_finite() && *s <= 6.0));
    }

    #[test]
    fn test_predict_is_negated_score() {
        let scorer = tiny_scorer(0);
        let scores = scorer.score(&[0], &[1], &[2]).unwrap().to_vec1::<f32>().unwrap();
        let predicted = scorer.predict(&[0], &[1], &[2]).unwrap();
        assert!((scores[0] + predicted[0]).abs() < 1e-6);
    }

    #[test]
    fn test_real_features_as_fakes_reproduce_forward() {
        let scorer = tiny_scorer(1);
        let h = scorer.entity_ids(&[0, 1]).unwrap();
        let r = scorer.relation_ids(&[1, 0]).unwrap();
        let t = scorer.entity_ids(&[2, 3]).unwrap();

        let real = scorer.forward(&h, &r, &t).unwrap().to_vec1::<f32>().unwrap();
        let h_mm = scorer.multimodal_embeddings(&h).unwrap();
        let t_mm = scorer.multimodal_embeddings(&t).unwrap();
        let fake = scorer.fake_scores(&h_mm, &r, &t_mm, &h_mm.modal, &t_mm.modal).unwrap();

        for s in fake.scores() {
            let s = s.to_vec1::<f32>().unwrap();
            for (a, b) in s.iter().zip(&real) {
                assert!((a - b).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_attention_weights_cover_all_slots() {
        let scorer = tiny_scorer(2);
        let weights = scorer.attention_weights(&[0, 5], &[0, 1]).unwrap();
        assert_eq!(weights.len(), 2);
        for row in weights {
            assert_eq!(row.len(), 3);
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_candidate_scores_match_pointwise() {
        let scorer = tiny_scorer(3);
        let tails = scorer.score_tails(1, 0).unwrap();
        let heads = scorer.score_heads(0, 4).unwrap();
        assert_eq!(tails.len(), 6);
        assert_eq!(heads.len(), 6);

        let direct = scorer.score(&[1], &[0], &[4]).unwrap().to_vec1::<f32>().unwrap()[0];
        assert!((tails[4] - direct).abs() < 1e-5);
        assert!((heads[1] - direct).abs() < 1e-5);
    }

    #[test]
    fn test_trainable_text_table_is_a_parameter() {
        let scorer = tiny_scorer(0);
        // ent, rel, gate, attention + 2 x (fc1, fc2) x (weight, bias) + textual table
        assert_eq!(scorer.params().all_vars().len(), 4 + 8 + 1);
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let short = features(0, 5);
        assert!(matches!(
            MultimodalScorer::new(config(0), short, &Device::Cpu),
            Err(Error::DimensionMismatch { .. })
        ));
        assert!(MultimodalScorer::new(config(0), Vec::new(), &Device::Cpu).is_err());

        let scorer = tiny_scorer(0);
        assert!(matches!(scorer.score(&[9], &[0], &[0]), Err(Error::EntityNotFound(_))));
        assert!(matches!(scorer.score(&[0], &[7], &[0]), Err(Error::RelationNotFound(_))));
    }

    #[test]
    fn test_length_mismatch_reports_offending_slice() {
        let scorer = tiny_scorer(0);
        assert!(matches!(
            scorer.score(&[0, 1], &[0, 1], &[2, 3, 4]),
            Err(Error::DimensionMismatch { expected: 2, got: 3 })
        ));
        assert!(matches!(
            scorer.score(&[0, 1], &[0], &[2, 3]),
            Err(Error::DimensionMismatch { expected: 2, got: 1 })
        ));
    }

    #[test]
    fn test_regularization_is_mean_square() {
        let scorer = tiny_scorer(0);
        let ids = scorer.entity_ids(&[0]).unwrap();
        let rel = scorer.relation_ids(&[0]).unwrap();
        let reg = scorer.regularization(&ids, &rel, &ids).unwrap().to_scalar::<f32>().unwrap();
        assert!(reg > 0.0);
        // Entities lie in ±(8/8), relations in ±(8/4).
        assert!(reg <= (1.0 + 1.0 + 4.0) / 3.0);
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scorer.safetensors");

        let trained = tiny_scorer(11);
        trained.save_checkpoint(&path).unwrap();
        assert!(config_path(&path).exists());

        let mut fresh = tiny_scorer(12);
        let before = fresh.score(&[0], &[0], &[1]).unwrap().to_vec1::<f32>().unwrap();
        fresh.load_checkpoint(&path).unwrap();
        let after = fresh.score(&[0], &[0], &[1]).unwrap().to_vec1::<f32>().unwrap();
        let expected = trained.score(&[0], &[0], &[1]).unwrap().to_vec1::<f32>().unwrap();

        assert_ne!(before, expected);
        assert!((after[0] - expected[0]).abs() < 1e-6);
    }

    #[test]
    fn test_from_checkpoint_uses_stored_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scorer.safetensors");
        let trained = tiny_scorer(4);
        trained.save_checkpoint(&path).unwrap();

        let restored = MultimodalScorer::from_checkpoint(&path, features(100, 6), &Device::Cpu).unwrap();
        assert_eq!(restored.config(), trained.config());
        assert_eq!(
            restored.predict(&[2], &[1], &[5]).unwrap(),
            trained.predict(&[2], &[1], &[5]).unwrap()
        );
    }

    #[test]
    fn test_checkpoint_shape_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scorer.safetensors");
        tiny_scorer(0).save_checkpoint(&path).unwrap();

        let mut other_cfg = config(0);
        other_cfg.num_relations = 3;
        let mut other = MultimodalScorer::new(other_cfg, features(0, 6), &Device::Cpu).unwrap();
        assert!(matches!(other.load_checkpoint(&path), Err(Error::InvalidConfig(_))));
    }
}
