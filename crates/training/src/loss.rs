use candle_core::{DType, Tensor, D};
use candle_nn::loss::cross_entropy;
use model::MoETOutput;
use moe::{AuxLossWeights, FullCache};

use crate::{config::to_runtime_error, TrainingError};

/// Language-modelling cross entropy plus the weighted auxiliary routing
/// losses of every routed block.
#[derive(Debug, Clone)]
pub struct MoeObjective {
    weights: AuxLossWeights,
}

impl MoeObjective {
    pub fn new(weights: AuxLossWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &AuxLossWeights {
        &self.weights
    }

    /// `output.logits` is `[batch, seq, vocab]`, `targets` `[batch, seq]`.
    pub fn compute(&self, output: &MoETOutput, targets: &Tensor) -> Result<LossOutput, TrainingError> {
        let (batch, seq, vocab) = output.logits.dims3().map_err(to_runtime_error)?;
        if targets.dims() != [batch, seq] {
            return Err(TrainingError::runtime(format!(
                "targets {:?} do not match logits [{batch}, {seq}, _]",
                targets.dims()
            )));
        }
        let tokens = batch * seq;
        let logits = output
            .logits
            .reshape((tokens, vocab))
            .and_then(|l| l.to_dtype(DType::F32))
            .map_err(to_runtime_error)?;
        let targets = targets
            .reshape(tokens)
            .and_then(|t| t.to_dtype(DType::U32))
            .map_err(to_runtime_error)?;

        let ce = cross_entropy(&logits, &targets).map_err(to_runtime_error)?;
        let correct_tokens = logits
            .argmax(D::Minus1)
            .and_then(|p| p.eq(&targets))
            .and_then(|m| m.to_dtype(DType::F32))
            .and_then(|m| m.sum_all())
            .and_then(|s| s.to_vec0::<f32>())
            .map_err(to_runtime_error)?
            .round() as usize;

        let (loss, aux) = if output.moe_cache.is_empty() {
            (ce.clone(), AuxMetrics::default())
        } else {
            let aux = self
                .weights
                .combine(&output.moe_cache)
                .map_err(|err| TrainingError::runtime(err.to_string()))?;
            let total = ce
                .add(&aux.total.to_dtype(DType::F32).map_err(to_runtime_error)?)
                .map_err(to_runtime_error)?;
            (total, AuxMetrics::from_losses(&aux)?)
        };

        Ok(LossOutput {
            metrics: LossMetrics {
                total: scalar(&loss)?,
                cross_entropy: scalar(&ce)?,
                aux,
                total_tokens: tokens,
                correct_tokens,
            },
            loss,
        })
    }
}

fn scalar(t: &Tensor) -> Result<f64, TrainingError> {
    t.to_dtype(DType::F32)
        .and_then(|t| t.to_vec0::<f32>())
        .map(f64::from)
        .map_err(to_runtime_error)
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Scalar objective to backpropagate.
    pub loss: Tensor,
    pub metrics: LossMetrics,
}

/// Unweighted auxiliary loss values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuxMetrics {
    pub load_balancing: f64,
    pub router_z: f64,
    pub importance: f64,
    pub local_entropy: f64,
    pub global_entropy: f64,
    /// Weighted sum actually added to the objective.
    pub weighted_total: f64,
}

impl AuxMetrics {
    fn from_losses(losses: &moe::AuxLosses) -> Result<Self, TrainingError> {
        Ok(Self {
            load_balancing: scalar(&losses.load_balancing)?,
            router_z: scalar(&losses.router_z)?,
            importance: scalar(&losses.importance)?,
            local_entropy: scalar(&losses.local_entropy)?,
            global_entropy: scalar(&losses.global_entropy)?,
            weighted_total: scalar(&losses.total)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LossMetrics {
    pub total: f64,
    pub cross_entropy: f64,
    pub aux: AuxMetrics,
    pub total_tokens: usize,
    pub correct_tokens: usize,
}

impl LossMetrics {
    pub fn accuracy(&self) -> f64 {
        if self.total_tokens == 0 {
            0.0
        } else {
            self.correct_tokens as f64 / self.total_tokens as f64
        }
    }

    pub fn perplexity(&self) -> f64 {
        self.cross_entropy.exp()
    }
}

/// Fraction of dispatched tokens each expert received, per routed block.
pub fn expert_utilization(cache: &FullCache) -> Result<Vec<(usize, Vec<f64>)>, TrainingError> {
    cache
        .iter()
        .map(|layer| {
            let per_expert = layer
                .dispatch()
                .to_dtype(DType::F32)
                .and_then(|d| d.sum(0))
                .and_then(|d| d.to_vec1::<f32>())
                .map_err(to_runtime_error)?;
            let total: f32 = per_expert.iter().sum();
            let fractions = per_expert
                .iter()
                .map(|&count| if total > 0.0 { (count / total) as f64 } else { 0.0 })
                .collect();
            Ok((layer.layer_index(), fractions))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use moe::{LayerCache, RoutingKind};

    fn output(logits: Tensor, cache: FullCache) -> MoETOutput {
        MoETOutput {
            logits,
            moe_cache: cache,
        }
    }

    fn uniform_cache(tokens: usize, experts: usize) -> Result<FullCache, TrainingError> {
        let device = Device::Cpu;
        let logits = Tensor::zeros((tokens, experts), DType::F32, &device).map_err(to_runtime_error)?;
        let ids: Vec<u32> = (0..tokens as u32).map(|t| t % experts as u32).collect();
        let assignments = Tensor::from_vec(ids.clone(), (tokens, 1), &device).map_err(to_runtime_error)?;
        let gates = Tensor::ones((tokens, 1), DType::F32, &device).map_err(to_runtime_error)?;
        let mut dispatch = vec![0f32; tokens * experts];
        for (t, e) in ids.iter().enumerate() {
            dispatch[t * experts + *e as usize] = 1.0;
        }
        let dispatch = Tensor::from_vec(dispatch, (tokens, experts), &device).map_err(to_runtime_error)?;
        let layer = LayerCache::new(0, RoutingKind::TokenChoice, gates, Some(assignments), logits, dispatch)
            .map_err(|err| TrainingError::runtime(err.to_string()))?;
        let mut cache = FullCache::new();
        cache.push(layer);
        Ok(cache)
    }

    #[test]
    fn uniform_logits_give_log_vocab_cross_entropy() -> Result<(), TrainingError> {
        let logits = Tensor::zeros((2, 3, 5), DType::F32, &Device::Cpu).map_err(to_runtime_error)?;
        let targets = Tensor::zeros((2, 3), DType::U32, &Device::Cpu).map_err(to_runtime_error)?;
        let objective = MoeObjective::new(AuxLossWeights::default());
        let out = objective.compute(&output(logits, FullCache::new()), &targets)?;
        assert!((out.metrics.cross_entropy - 5f64.ln()).abs() < 1e-5);
        assert_eq!(out.metrics.total, out.metrics.cross_entropy);
        assert_eq!(out.metrics.aux, AuxMetrics::default());
        assert_eq!(out.metrics.total_tokens, 6);
        Ok(())
    }

    #[test]
    fn aux_terms_are_added_with_coefficients() -> Result<(), TrainingError> {
        let logits = Tensor::zeros((1, 4, 3), DType::F32, &Device::Cpu).map_err(to_runtime_error)?;
        let targets = Tensor::zeros((1, 4), DType::U32, &Device::Cpu).map_err(to_runtime_error)?;
        let weights = AuxLossWeights {
            lb_coef: 1.0,
            z_coef: 0.0,
            ..AuxLossWeights::default()
        };
        let out = MoeObjective::new(weights).compute(&output(logits, uniform_cache(4, 2)?), &targets)?;
        // Balanced dispatch with uniform probabilities: lb = 1.
        assert!((out.metrics.aux.load_balancing - 1.0).abs() < 1e-5);
        assert!((out.metrics.total - (3f64.ln() + 1.0)).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn utilization_fractions_sum_to_one() -> Result<(), TrainingError> {
        let cache = uniform_cache(6, 3)?;
        let utilization = expert_utilization(&cache)?;
        assert_eq!(utilization.len(), 1);
        let (layer, fractions) = &utilization[0];
        assert_eq!(*layer, 0);
        assert!(fractions.iter().all(|f| (f - 1.0 / 3.0).abs() < 1e-6));
        Ok(())
    }
}
