//! Filtered link-prediction evaluation.
//!
//! For a test triple `(h, r, t)`:
//! 1. **Tail prediction**: score every `(h, r, e)`, rank the true tail
//! 2. **Head prediction**: score every `(e, r, t)`, rank the true head
//!
//! Candidates that form a known triple (any split) are skipped, so a model is
//! not penalized for ranking another true fact above the test one.
//!
//! | Metric | Range | Description |
//! |--------|-------|-------------|
//! | MRR | (0, 1] | Mean of 1/rank |
//! | MR | [1, E] | Mean rank |
//! | Hits@k | [0, 1] | Fraction with rank <= k |

use std::collections::HashSet;

use tracing::{debug, info};

use crate::data::{Benchmark, IdTriple};
use crate::error::{Error, Result};
use crate::scorer::MultimodalScorer;

/// Rank-based evaluation results.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RankMetrics {
    /// Mean Reciprocal Rank: E\[1/rank\]
    pub mrr: f64,
    /// Mean Rank: E\[rank\]
    pub mr: f64,
    /// Fraction of ranks equal to 1
    pub hits_at_1: f64,
    /// Fraction of ranks <= 3
    pub hits_at_3: f64,
    /// Fraction of ranks <= 10
    pub hits_at_10: f64,
    /// Number of ranks aggregated
    pub num_triples: usize,
}

impl RankMetrics {
    pub fn from_ranks(ranks: &[usize]) -> Self {
        if ranks.is_empty() {
            return Self::default();
        }

        let n = ranks.len() as f64;
        let hits = |k: usize| ranks.iter().filter(|&&r| r <= k).count() as f64 / n;

        Self {
            mrr: ranks.iter().map(|&r| 1.0 / r as f64).sum::<f64>() / n,
            mr: ranks.iter().map(|&r| r as f64).sum::<f64>() / n,
            hits_at_1: hits(1),
            hits_at_3: hits(3),
            hits_at_10: hits(10),
            num_triples: ranks.len(),
        }
    }

    /// Count-weighted average of several runs.
    pub fn merge(metrics: &[Self]) -> Self {
        let total: usize = metrics.iter().map(|m| m.num_triples).sum();
        if total == 0 {
            return Self::default();
        }
        let weighted = |f: fn(&Self) -> f64| {
            metrics
                .iter()
                .map(|m| f(m) * m.num_triples as f64)
                .sum::<f64>()
                / total as f64
        };

        Self {
            mrr: weighted(|m| m.mrr),
            mr: weighted(|m| m.mr),
            hits_at_1: weighted(|m| m.hits_at_1),
            hits_at_3: weighted(|m| m.hits_at_3),
            hits_at_10: weighted(|m| m.hits_at_10),
            num_triples: total,
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "MRR: {:.4} | MR: {:.1} | H@1: {:.3} | H@3: {:.3} | H@10: {:.3} (n={})",
            self.mrr, self.mr, self.hits_at_1, self.hits_at_3, self.hits_at_10, self.num_triples
        )
    }
}

/// Head, tail and combined metrics of one evaluation pass.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LinkPredictionReport {
    pub head: RankMetrics,
    pub tail: RankMetrics,
    pub overall: RankMetrics,
}

/// 1 + number of candidates scoring strictly higher than `target_score`.
pub fn compute_rank(target_score: f32, all_scores: &[f32]) -> usize {
    1 + all_scores.iter().filter(|&&s| s > target_score).count()
}

/// Filtered ranker over a fixed set of test triples.
#[derive(Debug, Clone)]
pub struct Tester {
    test: Vec<IdTriple>,
    known: HashSet<IdTriple>,
}

impl Tester {
    /// Rank the benchmark's test split, filtering against every split.
    pub fn new(benchmark: &Benchmark) -> Self {
        Self::from_parts(benchmark.test.clone(), benchmark.known_triples())
    }

    /// Rank `test`, filtering against `known` (the test triples are added to it).
    pub fn from_parts(test: Vec<IdTriple>, known: HashSet<IdTriple>) -> Self {
        let mut known = known;
        known.extend(test.iter().copied());
        Self { test, known }
    }

    /// Number of triples ranked by [`run_link_prediction`](Self::run_link_prediction).
    pub fn num_test_triples(&self) -> usize {
        self.test.len()
    }

    /// Filtered rank of the true tail.
    pub fn rank_tail(&self, scorer: &MultimodalScorer, triple: IdTriple) -> Result<usize> {
        let scores = scorer.score_tails(triple.head, triple.relation)?;
        self.filtered_rank(&scores, triple.tail, |e| triple.with_tail(e))
    }

    /// Filtered rank of the true head.
    pub fn rank_head(&self, scorer: &MultimodalScorer, triple: IdTriple) -> Result<usize> {
        let scores = scorer.score_heads(triple.relation, triple.tail)?;
        self.filtered_rank(&scores, triple.head, |e| triple.with_head(e))
    }

    fn filtered_rank(&self, scores: &[f32], target: u32, candidate: impl Fn(u32) -> IdTriple) -> Result<usize> {
        let target_score = *scores
            .get(target as usize)
            .ok_or_else(|| Error::EntityNotFound(target.to_string()))?;
        let competitors: Vec<f32> = scores
            .iter()
            .enumerate()
            .filter(|&(e, _)| e as u32 != target && !self.known.contains(&candidate(e as u32)))
            .map(|(_, &s)| s)
            .collect();
        Ok(compute_rank(target_score, &competitors))
    }

    pub fn run_link_prediction(&self, scorer: &MultimodalScorer) -> Result<LinkPredictionReport> {
        let mut head_ranks = Vec::with_capacity(self.test.len());
        let mut tail_ranks = Vec::with_capacity(self.test.len());

        for (i, &triple) in self.test.iter().enumerate() {
            tail_ranks.push(self.rank_tail(scorer, triple)?);
            head_ranks.push(self.rank_head(scorer, triple)?);
            if (i + 1) % 1000 == 0 {
                debug!(done = i + 1, total = self.test.len(), "ranking test triples");
            }
        }

        let head = RankMetrics::from_ranks(&head_ranks);
        let tail = RankMetrics::from_ranks(&tail_ranks);
        let overall = RankMetrics::merge(&[head.clone(), tail.clone()]);
        info!(
            mrr = overall.mrr,
            mr = overall.mr,
            hits_at_10 = overall.hits_at_10,
            "link prediction"
        );
        Ok(LinkPredictionReport { head, tail, overall })
    }
}
