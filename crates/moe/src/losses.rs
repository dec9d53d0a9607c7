//! Auxiliary routing losses computed from a [`FullCache`].
//!
//! Every function returns a scalar tensor connected to the routing logits, so
//! the losses can be added to the training objective. With `p` the softmax
//! over experts of the stacked `[layers, tokens, experts]` logits and `d` the
//! stacked dispatch matrix:
//!
//! * load balancing: `E · Σ_l Σ_e mean_t(d) · mean_t(p)`
//! * router z: `Σ_l mean_t logsumexp_e(logits)²`
//! * importance: squared coefficient of variation of `Σ_t p` over `(l, e)`
//! * local entropy: `mean_t Σ_{l,e} -p log p`
//! * global entropy: `-Σ_{l,e} p̄ log p̄` with `p̄ = mean_t p`

use candle_core::{Tensor, D};
use candle_nn::ops::{log_softmax, softmax};
use serde::{Deserialize, Serialize};

use crate::cache::FullCache;
use crate::config::MoeConfig;
use crate::error::Result;
use crate::router::logsumexp_last;

const IMPORTANCE_MEAN_FLOOR: f64 = 1e-9;
const PROB_FLOOR: f64 = 1e-12;

fn routing_probs(cache: &FullCache) -> Result<(Tensor, Tensor)> {
    let logits = cache.stacked_logits()?;
    let probs = softmax(&logits, D::Minus1)?;
    Ok((logits, probs))
}

/// Switch-style load balancing loss summed over layers.
pub fn load_balancing_loss(cache: &FullCache) -> Result<Tensor> {
    let (logits, probs) = routing_probs(cache)?;
    let num_experts = logits.dim(2)?;
    let dispatch = cache.stacked_dispatch()?.to_dtype(probs.dtype())?;
    let token_fraction = dispatch.mean(1)?;
    let prob_fraction = probs.mean(1)?;
    Ok(token_fraction
        .mul(&prob_fraction)?
        .sum_all()?
        .affine(num_experts as f64, 0.0)?)
}

/// Router z loss: squared log-partition of the router logits.
pub fn router_z_loss(cache: &FullCache) -> Result<Tensor> {
    let logits = cache.stacked_logits()?;
    let lse = logsumexp_last(&logits)?;
    Ok(lse.sqr()?.mean(1)?.sum_all()?)
}

/// Expert importance loss, `(std / mean)²` with the unbiased standard
/// deviation. Fewer than two (layer, expert) entries give zero.
pub fn importance_loss(cache: &FullCache) -> Result<Tensor> {
    let (_, probs) = routing_probs(cache)?;
    let importance = probs.sum(1)?.flatten_all()?;
    let n = importance.dim(0)?;
    if n < 2 {
        return Ok(importance.sum_all()?.zeros_like()?);
    }
    let mean = importance.mean_all()?;
    let variance = importance
        .broadcast_sub(&mean)?
        .sqr()?
        .sum_all()?
        .affine(1.0 / (n - 1) as f64, 0.0)?;
    let mean = mean.maximum(IMPORTANCE_MEAN_FLOOR)?;
    Ok(variance.div(&mean.sqr()?)?)
}

/// Mean per-token routing entropy, summed over layers.
pub fn local_entropy_loss(cache: &FullCache) -> Result<Tensor> {
    let logits = cache.stacked_logits()?;
    let probs = softmax(&logits, D::Minus1)?;
    let log_probs = log_softmax(&logits, D::Minus1)?;
    let per_token = probs.mul(&log_probs)?.sum(2)?.sum(0)?;
    Ok(per_token.mean_all()?.neg()?)
}

/// Entropy of the token-averaged routing distribution.
pub fn global_entropy_loss(cache: &FullCache) -> Result<Tensor> {
    let (_, probs) = routing_probs(cache)?;
    let mean_probs = probs.mean(1)?;
    let log_mean = mean_probs.clamp(PROB_FLOOR, 1.0)?.log()?;
    Ok(mean_probs.mul(&log_mean)?.sum_all()?.neg()?)
}

/// `max(0, threshold - H_global)`: only penalises entropies below the
/// threshold.
pub fn global_entropy_penalty(cache: &FullCache, threshold: f64) -> Result<Tensor> {
    Ok(global_entropy_loss(cache)?.affine(-1.0, threshold)?.relu()?)
}

/// Coefficients for combining the auxiliary losses.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuxLossWeights {
    pub lb_coef: f64,
    pub z_coef: f64,
    pub importance_coef: f64,
    pub local_entropy_coef: f64,
    pub global_entropy_coef: f64,
}

impl Default for AuxLossWeights {
    fn default() -> Self {
        Self {
            lb_coef: 0.01,
            z_coef: 0.001,
            importance_coef: 0.0,
            local_entropy_coef: 0.0,
            global_entropy_coef: 0.0,
        }
    }
}

impl AuxLossWeights {
    /// Load-balancing and z coefficients come from the layer config.
    pub fn from_config(config: &MoeConfig) -> Self {
        Self {
            lb_coef: config.lb_coef,
            z_coef: config.z_coef,
            ..Self::default()
        }
    }

    pub fn combine(&self, cache: &FullCache) -> Result<AuxLosses> {
        let load_balancing = load_balancing_loss(cache)?;
        let router_z = router_z_loss(cache)?;
        let importance = importance_loss(cache)?;
        let local_entropy = local_entropy_loss(cache)?;
        let global_entropy = global_entropy_loss(cache)?;
        let total = load_balancing
            .affine(self.lb_coef, 0.0)?
            .add(&router_z.affine(self.z_coef, 0.0)?)?
            .add(&importance.affine(self.importance_coef, 0.0)?)?
            .add(&local_entropy.affine(self.local_entropy_coef, 0.0)?)?
            .add(&global_entropy.affine(self.global_entropy_coef, 0.0)?)?;
        Ok(AuxLosses {
            load_balancing,
            router_z,
            importance,
            local_entropy,
            global_entropy,
            total,
        })
    }
}

/// Individual auxiliary losses and their weighted sum.
#[derive(Debug, Clone)]
pub struct AuxLosses {
    pub load_balancing: Tensor,
    pub router_z: Tensor,
    pub importance: Tensor,
    pub local_entropy: Tensor,
    pub global_entropy: Tensor,
    pub total: Tensor,
}
