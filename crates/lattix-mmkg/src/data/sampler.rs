//! Mini-batches with corrupted negatives.
//!
//! Each [`TripleBatch`] holds `B` positives followed by `K` blocks of `B`
//! negatives, so negative `k` of positive `i` sits at `B + k * B + i`:
//!
//! ```text
//! [ p_0 .. p_{B-1} | n_0^0 .. n_{B-1}^0 | ... | n_0^{K-1} .. n_{B-1}^{K-1} ]
//! ```
//!
//! # Corruption
//!
//! A negative replaces either the head or the tail with a random entity.
//! Under [`CorruptionStrategy::Bernoulli`] (Wang et al. 2014) the head is
//! replaced with probability `tph / (tph + hpt)`: for 1-to-N relations
//! (many tails per head) replacing the head is less likely to produce a
//! false negative.

use std::collections::{HashMap, HashSet};

use rand::prelude::*;
use tracing::debug;

use super::IdTriple;
use crate::config::{CorruptionStrategy, SamplerConfig};
use crate::error::{Error, Result};

/// Attempts at drawing an unseen corruption before accepting a known triple.
const MAX_FILTER_RETRIES: usize = 16;

/// One training batch of positives and their negatives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripleBatch {
    pub heads: Vec<u32>,
    pub relations: Vec<u32>,
    pub tails: Vec<u32>,
    /// Number of positives `B`.
    pub batch_size: usize,
    /// Negatives per positive `K`.
    pub negatives: usize,
}

impl TripleBatch {
    /// Total rows, `B * (1 + K)`.
    pub fn len(&self) -> usize {
        self.heads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    pub fn positives(&self) -> impl Iterator<Item = IdTriple> + '_ {
        (0..self.batch_size).map(|i| self.triple(i))
    }

    pub fn triple(&self, i: usize) -> IdTriple {
        IdTriple::new(self.heads[i], self.relations[i], self.tails[i])
    }

    /// Check the `B * (1 + K)` layout with `B, K > 0`.
    pub fn validate(&self) -> Result<()> {
        let (b, k) = (self.batch_size, self.negatives);
        let rows = self.heads.len();
        if b == 0
            || k == 0
            || rows != b * (1 + k)
            || self.relations.len() != rows
            || self.tails.len() != rows
        {
            return Err(Error::Training(format!(
                "malformed batch: {}/{}/{} rows for {} positives x {} negatives",
                rows,
                self.relations.len(),
                self.tails.len(),
                b,
                k
            )));
        }
        Ok(())
    }

    /// The positive rows only. Call [`validate`](Self::validate) first.
    pub fn positive_ids(&self) -> (&[u32], &[u32], &[u32]) {
        let b = self.batch_size;
        (&self.heads[..b], &self.relations[..b], &self.tails[..b])
    }
}

/// Shuffles training triples and emits corrupted batches.
#[derive(Debug, Clone)]
pub struct NegativeSampler {
    triples: Vec<IdTriple>,
    known: HashSet<IdTriple>,
    num_entities: usize,
    /// Probability of replacing the head, per relation.
    head_probability: Vec<f64>,
    config: SamplerConfig,
}

impl NegativeSampler {
    pub fn new(
        triples: Vec<IdTriple>,
        num_entities: usize,
        num_relations: usize,
        config: SamplerConfig,
    ) -> Result<Self> {
        if triples.is_empty() {
            return Err(Error::InvalidConfig("no training triples provided".into()));
        }
        if num_entities < 2 {
            return Err(Error::InvalidConfig("corruption needs at least two entities".into()));
        }
        if config.batch_size == 0 || config.negative_samples == 0 {
            return Err(Error::InvalidConfig(
                "batch_size and negative_samples must be positive".into(),
            ));
        }

        let head_probability = match config.corruption {
            CorruptionStrategy::Uniform => vec![0.5; num_relations],
            CorruptionStrategy::Bernoulli => bernoulli_head_probability(&triples, num_relations),
        };
        let known = triples.iter().copied().collect();

        Ok(Self {
            triples,
            known,
            num_entities,
            head_probability,
            config,
        })
    }

    /// Positive batches per epoch.
    pub fn num_batches(&self) -> usize {
        self.triples.len().div_ceil(self.config.batch_size)
    }

    pub fn negatives_per_positive(&self) -> usize {
        self.config.negative_samples
    }

    pub fn head_probability(&self, relation: u32) -> f64 {
        self.head_probability
            .get(relation as usize)
            .copied()
            .unwrap_or(0.5)
    }

    /// All batches of one epoch. Deterministic in (seed, epoch).
    pub fn batches(&self, epoch: usize) -> Vec<TripleBatch> {
        let mut rng = StdRng::seed_from_u64(
            self.config
                .seed
                .wrapping_mul(0x9E37_79B9_7F4A_7C15)
                .wrapping_add(epoch as u64),
        );

        let mut order = self.triples.clone();
        order.shuffle(&mut rng);

        let batches: Vec<TripleBatch> = order
            .chunks(self.config.batch_size)
            .map(|chunk| self.corrupt(chunk, &mut rng))
            .collect();
        debug!(epoch, batches = batches.len(), "sampled epoch");
        batches
    }

    fn corrupt(&self, positives: &[IdTriple], rng: &mut StdRng) -> TripleBatch {
        let b = positives.len();
        let k = self.config.negative_samples;
        let total = b * (1 + k);

        let mut heads = Vec::with_capacity(total);
        let mut relations = Vec::with_capacity(total);
        let mut tails = Vec::with_capacity(total);

        for t in positives {
            heads.push(t.head);
            relations.push(t.relation);
            tails.push(t.tail);
        }

        for _ in 0..k {
            for &t in positives {
                let replace_head = rng.random::<f64>() < self.head_probability(t.relation);
                let negative = self.draw_negative(t, replace_head, rng);
                heads.push(negative.head);
                relations.push(negative.relation);
                tails.push(negative.tail);
            }
        }

        TripleBatch {
            heads,
            relations,
            tails,
            batch_size: b,
            negatives: k,
        }
    }

    fn draw_negative(&self, positive: IdTriple, replace_head: bool, rng: &mut StdRng) -> IdTriple {
        let current = if replace_head { positive.head } else { positive.tail };
        let replace = |entity: u32| {
            if replace_head {
                positive.with_head(entity)
            } else {
                positive.with_tail(entity)
            }
        };

        let mut candidate = replace(self.random_other(current, rng));
        if !self.config.filter {
            return candidate;
        }
        for _ in 1..MAX_FILTER_RETRIES {
            if !self.known.contains(&candidate) {
                return candidate;
            }
            candidate = replace(self.random_other(current, rng));
        }
        if !self.known.contains(&candidate) {
            return candidate;
        }

        // Dense neighbourhood: walk the entity ring from a random start.
        let n = self.num_entities as u32;
        let start = rng.random_range(0..n);
        (0..n)
            .map(|offset| (start + offset) % n)
            .filter(|&e| e != current)
            .map(replace)
            .find(|c| !self.known.contains(c))
            .unwrap_or(candidate)
    }

    /// Uniform entity different from `current`.
    fn random_other(&self, current: u32, rng: &mut StdRng) -> u32 {
        let n = self.num_entities as u32;
        let draw = rng.random_range(0..n - 1);
        if draw >= current {
            draw + 1
        } else {
            draw
        }
    }
}

/// `tph / (tph + hpt)` for every relation; 0.5 for relations absent from training.
fn bernoulli_head_probability(triples: &[IdTriple], num_relations: usize) -> Vec<f64> {
    let mut count = vec![0usize; num_relations];
    let mut heads: HashMap<u32, HashSet<u32>> = HashMap::new();
    let mut tails: HashMap<u32, HashSet<u32>> = HashMap::new();

    for t in triples {
        if let Some(c) = count.get_mut(t.relation as usize) {
            *c += 1;
        }
        heads.entry(t.relation).or_default().insert(t.head);
        tails.entry(t.relation).or_default().insert(t.tail);
    }

    (0..num_relations as u32)
        .map(|r| {
            let n = count[r as usize] as f64;
            let distinct_heads = heads.get(&r).map_or(0, HashSet::len) as f64;
            let distinct_tails = tails.get(&r).map_or(0, HashSet::len) as f64;
            if n == 0.0 || distinct_heads == 0.0 || distinct_tails == 0.0 {
                return 0.5;
            }
            let tph = n / distinct_heads;
            let hpt = n / distinct_tails;
            tph / (tph + hpt)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(batch_size: usize, negatives: usize) -> SamplerConfig {
        SamplerConfig {
            batch_size,
            negative_samples: negatives,
            corruption: CorruptionStrategy::Bernoulli,
            filter: true,
            seed: 7,
        }
    }

    fn star() -> Vec<IdTriple> {
        // One hub with many tails under relation 0.
        (1..6).map(|t| IdTriple::new(0, 0, t)).collect()
    }

    #[test]
    fn test_batch_layout() {
        let sampler = NegativeSampler::new(star(), 8, 1, config(2, 3)).unwrap();
        let batches = sampler.batches(0);
        assert_eq!(batches.len(), 3);
        assert_eq!(sampler.num_batches(), 3);

        let first = &batches[0];
        assert_eq!(first.batch_size, 2);
        assert_eq!(first.len(), 2 * 4);
        for k in 0..3 {
            for i in 0..2 {
                let pos = first.triple(i);
                let neg = first.triple(2 + k * 2 + i);
                assert_eq!(neg.relation, pos.relation);
                assert!(neg.head == pos.head || neg.tail == pos.tail);
                assert_ne!(neg, pos);
            }
        }
        // Last chunk is partial.
        assert_eq!(batches[2].batch_size, 1);
    }

    #[test]
    fn test_epochs_are_deterministic_and_distinct() {
        let sampler = NegativeSampler::new(star(), 8, 1, config(5, 2)).unwrap();
        assert_eq!(sampler.batches(3), sampler.batches(3));
        assert_ne!(sampler.batches(3), sampler.batches(4));
    }

    #[test]
    fn test_bernoulli_prefers_head_for_one_to_many() {
        let sampler = NegativeSampler::new(star(), 8, 1, config(5, 1)).unwrap();
        // tph = 5, hpt = 1
        assert!((sampler.head_probability(0) - 5.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_filter_avoids_known_triples() {
        // Entities 0..3; every tail of (0, r0, *) except 0 is known.
        let triples = vec![IdTriple::new(0, 0, 1), IdTriple::new(0, 0, 2)];
        let mut cfg = config(2, 20);
        cfg.corruption = CorruptionStrategy::Uniform;
        let sampler = NegativeSampler::new(triples.clone(), 3, 1, cfg).unwrap();
        let known: HashSet<IdTriple> = triples.into_iter().collect();

        for batch in sampler.batches(0) {
            for i in batch.batch_size..batch.len() {
                assert!(!known.contains(&batch.triple(i)));
            }
        }
    }

    #[test]
    fn test_validate_rejects_short_batch() {
        let sampler = NegativeSampler::new(star(), 8, 1, config(2, 3)).unwrap();
        let mut batch = sampler.batches(0).remove(0);
        assert!(batch.validate().is_ok());
        batch.tails.pop();
        assert!(matches!(batch.validate(), Err(Error::Training(_))));
        batch.tails.push(0);
        batch.batch_size += 1;
        assert!(matches!(batch.validate(), Err(Error::Training(_))));
    }

    #[test]
    fn test_rejects_empty_training_set() {
        assert!(NegativeSampler::new(Vec::new(), 4, 1, config(2, 2)).is_err());
    }
}
