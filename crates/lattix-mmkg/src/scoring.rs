//! Differentiable scoring primitives.
//!
//! # Rotation distance
//!
//! Entities are `2d`-wide real vectors read as `d` complex numbers, real
//! parts in the first half and imaginary parts in the second:
//!
//! ```text
//! h = [ Re h_1 .. Re h_d | Im h_1 .. Im h_d ]
//! ```
//!
//! A relation is `d` phases. Phase `p` maps to the angle `θ = p · π / range`
//! where `range = (margin + ε) / d` is the relation initialization range, so
//! freshly initialized relations cover `(-π, π)`. The distance is
//!
//! ```text
//! dist(h, r, t) = Σ_i | h_i · e^{iθ_i} - t_i |
//! ```
//!
//! Because `|e^{iθ}| = 1`, `|h ∘ r - t| = |h - t ∘ conj(r)|`: head and tail
//! prediction share one formula.
//!
//! # Attention fusion
//!
//! The structural embedding and each projected modality embedding are stacked
//! into `(n, m, D)`. A single learned vector `w` scores every slot,
//! `s_j = w · tanh(e_j)`, and a per-relation gate `g` sets the softmax
//! temperature `σ(g)`:
//!
//! ```text
//! α = softmax(s / σ(g))      fused = Σ_j α_j e_j
//! ```
//!
//! Small `σ(g)` sharpens attention onto one modality; large `σ(g)` averages.

use std::f64::consts::PI;

use candle_core::{Tensor, D};

use crate::error::{Error, Result};

/// Keeps `sqrt` differentiable when a complex residual is exactly zero.
const MODULUS_EPS: f64 = 1e-12;

/// Rotation distance between `h ∘ r` and `t`.
///
/// Shapes: `h`, `t` are `(n, 2d)`, `r` is `(n, d)`; returns `(n,)`.
pub fn rotate_distance(h: &Tensor, r: &Tensor, t: &Tensor, relation_range: f64) -> Result<Tensor> {
    let d = r.dim(D::Minus1)?;
    let width = h.dim(D::Minus1)?;
    if width != 2 * d || t.dim(D::Minus1)? != width {
        return Err(Error::DimensionMismatch {
            expected: 2 * d,
            got: width,
        });
    }

    let re_h = h.narrow(1, 0, d)?;
    let im_h = h.narrow(1, d, d)?;
    let re_t = t.narrow(1, 0, d)?;
    let im_t = t.narrow(1, d, d)?;

    let phase = (r * (PI / relation_range))?;
    let re_r = phase.cos()?;
    let im_r = phase.sin()?;

    let re = ((re_h.mul(&re_r)? - im_h.mul(&im_r)?)? - re_t)?;
    let im = ((re_h.mul(&im_r)? + im_h.mul(&re_r)?)? - im_t)?;

    let modulus = ((re.sqr()? + im.sqr()?)? + MODULUS_EPS)?.sqrt()?;
    Ok(modulus.sum(1)?)
}

/// Modality attention weights, `(n, m)`.
///
/// `stack` is `(n, m, D)`, `attention` is `(1, D)`, `gate` is `(n, 1)`.
pub fn attention_weights(stack: &Tensor, attention: &Tensor, gate: &Tensor) -> Result<Tensor> {
    let logits = stack
        .tanh()?
        .broadcast_mul(&attention.unsqueeze(0)?)?
        .sum(D::Minus1)?;
    let temperature = candle_nn::ops::sigmoid(gate)?;
    let weights = candle_nn::ops::softmax(&logits.broadcast_div(&temperature)?, D::Minus1)?;
    Ok(weights)
}

/// Attention-weighted sum over the modality axis, `(n, D)`.
pub fn attention_fusion(stack: &Tensor, attention: &Tensor, gate: &Tensor) -> Result<Tensor> {
    let weights = attention_weights(stack, attention, gate)?;
    let fused = weights.unsqueeze(D::Minus1)?.broadcast_mul(stack)?.sum(1)?;
    Ok(fused)
}

/// Stack `structure` and modality embeddings into `(n, 1 + m, D)`.
pub fn stack_modalities(structure: &Tensor, modal: &[Tensor]) -> Result<Tensor> {
    let mut parts = Vec::with_capacity(1 + modal.len());
    parts.push(structure);
    parts.extend(modal.iter());
    Ok(Tensor::stack(&parts, 1)?)
}

/// `log σ(x) = min(x, 0) - log(1 + e^{-|x|})`, stable for large `|x|`.
pub fn log_sigmoid(x: &Tensor) -> Result<Tensor> {
    let min_zero = x.neg()?.relu()?.neg()?;
    let softplus_tail = (x.abs()?.neg()?.exp()? + 1.0)?.log()?;
    Ok((min_zero - softplus_tail)?)
}
