//! Objective on real triples.
//!
//! Positives should score high and corrupted negatives low. With logistic
//! loss on both sides:
//!
//! ```text
//! L = -( mean_b log σ(p_b) + mean_b Σ_k w_bk log σ(-n_bk) ) / 2
//! ```
//!
//! Uniform weighting uses `w_bk = 1/K`. Self-adversarial weighting
//! (Sun et al. 2019) uses `w_b = softmax(T · n_b)` treated as a constant,
//! which concentrates the loss on the negatives the scorer currently finds
//! most plausible.

use candle_core::{Tensor, D};

use crate::data::TripleBatch;
use crate::error::Result;
use crate::scorer::MultimodalScorer;
use crate::scoring::log_sigmoid;

/// Logistic loss over positive `(B,)` and negative `(B, K)` scores.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SigmoidLoss {
    /// Softmax temperature for negative weights; `None` for uniform.
    pub adv_temperature: Option<f64>,
}

impl SigmoidLoss {
    pub fn new(adv_temperature: Option<f64>) -> Self {
        Self { adv_temperature }
    }

    pub fn compute(&self, positive: &Tensor, negative: &Tensor) -> Result<Tensor> {
        let pos = log_sigmoid(positive)?.mean_all()?;
        let neg_terms = log_sigmoid(&negative.neg()?)?;
        let neg = match self.adv_temperature {
            Some(temperature) => {
                let weights = candle_nn::ops::softmax(&(negative * temperature)?, D::Minus1)?.detach();
                weights.mul(&neg_terms)?.sum(D::Minus1)?.mean_all()?
            }
            None => neg_terms.mean_all()?,
        };
        Ok(((pos + neg)? * -0.5)?)
    }
}

/// Negative-sampling objective: scores a [`TripleBatch`] and applies [`SigmoidLoss`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NegativeSamplingObjective {
    pub loss: SigmoidLoss,
    /// Weight of [`MultimodalScorer::regularization`]; `0` disables it.
    pub regul_rate: f64,
}

impl NegativeSamplingObjective {
    pub fn new(loss: SigmoidLoss, regul_rate: f64) -> Self {
        Self { loss, regul_rate }
    }

    /// `(loss, positive scores)` for one batch.
    pub fn compute(&self, scorer: &MultimodalScorer, batch: &TripleBatch) -> Result<(Tensor, Tensor)> {
        batch.validate()?;
        let (b, k) = (batch.batch_size, batch.negatives);

        let heads = scorer.entity_ids(&batch.heads)?;
        let relations = scorer.relation_ids(&batch.relations)?;
        let tails = scorer.entity_ids(&batch.tails)?;

        let scores = scorer.forward(&heads, &relations, &tails)?;
        let positive = scores.narrow(0, 0, b)?;
        let negative = scores
            .narrow(0, b, b * k)?
            .reshape((k, b))?
            .t()?
            .contiguous()?;

        let mut loss = self.loss.compute(&positive, &negative)?;
        if self.regul_rate != 0.0 {
            let regul = scorer.regularization(&heads, &relations, &tails)?;
            loss = (loss + (regul * self.regul_rate)?)?;
        }
        Ok((loss, positive))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn scalar(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn test_uniform_loss_value() {
        let p = Tensor::new(&[0f32], &Device::Cpu).unwrap();
        let n = Tensor::new(&[[0f32, 0.0]], &Device::Cpu).unwrap();
        let loss = SigmoidLoss::new(None).compute(&p, &n).unwrap();
        // -(ln 0.5 + ln 0.5) / 2 = ln 2
        assert!((scalar(&loss) - std::f32::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn test_separated_scores_give_small_loss() {
        let p = Tensor::new(&[20f32, 20.0], &Device::Cpu).unwrap();
        let n = Tensor::new(&[[-20f32, -20.0], [-20.0, -20.0]], &Device::Cpu).unwrap();
        let good = scalar(&SigmoidLoss::new(Some(1.0)).compute(&p, &n).unwrap());
        let bad = scalar(&SigmoidLoss::new(Some(1.0)).compute(&n.sum(1).unwrap(), &(n.neg().unwrap())).unwrap());
        assert!(good < 1e-6);
        assert!(bad > 10.0);
    }

    #[test]
    fn test_adversarial_weights_focus_on_hard_negatives() {
        let p = Tensor::new(&[0f32], &Device::Cpu).unwrap();
        // One easy, one hard negative.
        let n = Tensor::new(&[[-10f32, 5.0]], &Device::Cpu).unwrap();
        let uniform = scalar(&SigmoidLoss::new(None).compute(&p, &n).unwrap());
        let adversarial = scalar(&SigmoidLoss::new(Some(1.0)).compute(&p, &n).unwrap());
        assert!(adversarial > uniform);
    }
}
