//! Benchmark loading and negative sampling.
//!
//! - [`benchmark`]: OpenKE-style id files (`entity2id.txt`, `train2id.txt`, ...)
//! - [`sampler`]: shuffled mini-batches with corrupted negatives

pub mod benchmark;
pub mod sampler;

pub use benchmark::{Benchmark, Vocab};
pub use sampler::{NegativeSampler, TripleBatch};

use serde::{Deserialize, Serialize};

/// A triple of vocabulary ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdTriple {
    pub head: u32,
    pub relation: u32,
    pub tail: u32,
}

impl IdTriple {
    pub fn new(head: u32, relation: u32, tail: u32) -> Self {
        Self { head, relation, tail }
    }

    /// Same relation and tail, different head.
    pub fn with_head(self, head: u32) -> Self {
        Self { head, ..self }
    }

    /// Same head and relation, different tail.
    pub fn with_tail(self, tail: u32) -> Self {
        Self { tail, ..self }
    }
}
