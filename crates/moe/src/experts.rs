//! Expert networks and the SMEAR parameter merge.
//!
//! Every expert is the standard feed-forward block from the `layers` crate:
//! up-projection with bias, activation, down-projection with bias, dropout.
//! The bank knows nothing about routing; callers hand it the token subset an
//! expert should process.

use candle_core::Tensor;
use candle_nn::VarBuilder;
use layers::{ActivationKind, FeedForward, FeedForwardConfig, FeedForwardLayer};

use crate::error::{MoeError, Result};

/// One routed feed-forward network.
#[derive(Debug, Clone)]
pub struct Expert {
    ffn: FeedForward,
}

impl Expert {
    pub fn new(config: FeedForwardConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            ffn: FeedForward::new(config, vb)?,
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        Ok(self.ffn.forward(x, train)?)
    }

    fn params(&self) -> Result<[&Tensor; 4]> {
        let missing = || MoeError::Config("expert projections must carry a bias".into());
        Ok([
            self.ffn.up().weight(),
            self.ffn.up().bias().ok_or_else(missing)?,
            self.ffn.down().weight(),
            self.ffn.down().bias().ok_or_else(missing)?,
        ])
    }
}

/// Parameters of a single expert laid out as Candle linear weights.
#[derive(Debug, Clone)]
pub struct ExpertLinearParams {
    /// `[intermediate, hidden]`
    pub up_weight: Tensor,
    /// `[intermediate]`
    pub up_bias: Tensor,
    /// `[hidden, intermediate]`
    pub down_weight: Tensor,
    /// `[hidden]`
    pub down_bias: Tensor,
}

/// An expert evaluated from explicit (typically merged) parameters.
#[derive(Debug, Clone)]
pub struct ExpertFromWeights {
    ffn: FeedForward,
}

impl ExpertFromWeights {
    pub fn new(
        params: ExpertLinearParams,
        hidden_size: usize,
        activation: ActivationKind,
        dropout: f32,
    ) -> Result<Self> {
        let intermediate = params.up_bias.dim(0)?;
        let config = FeedForwardConfig::new(hidden_size, intermediate, activation).with_dropout(dropout);
        let ffn = FeedForward::from_weights(
            config,
            params.up_weight,
            params.up_bias,
            params.down_weight,
            params.down_bias,
        )?;
        Ok(Self { ffn })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        Ok(self.ffn.forward(x, train)?)
    }
}

/// Fixed set of experts owned by one layer, registered as `{prefix}.{index}`.
#[derive(Debug, Clone)]
pub struct ExpertBank {
    config: FeedForwardConfig,
    experts: Vec<Expert>,
}

impl ExpertBank {
    pub fn new(num_experts: usize, config: FeedForwardConfig, vb: VarBuilder) -> Result<Self> {
        if num_experts == 0 {
            return Err(MoeError::Config("expert bank needs at least one expert".into()));
        }
        let experts = (0..num_experts)
            .map(|index| Expert::new(config.clone(), vb.pp(index.to_string())))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { config, experts })
    }

    pub fn len(&self) -> usize {
        self.experts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experts.is_empty()
    }

    pub fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    pub fn expert(&self, index: usize) -> Option<&Expert> {
        self.experts.get(index)
    }

    /// Runs expert `index` on `x_subset` (`[tokens, hidden]`).
    pub fn apply(&self, index: usize, x_subset: &Tensor, train: bool) -> Result<Tensor> {
        let expert = self.experts.get(index).ok_or_else(|| {
            MoeError::Shape(format!("expert {index} out of range for {} experts", self.len()))
        })?;
        expert.forward(x_subset, train)
    }

    fn stacked(&self, slot: usize) -> Result<Tensor> {
        let tensors = self
            .experts
            .iter()
            .map(|expert| expert.params().map(|params| params[slot]))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::stack(&tensors, 0)?)
    }

    /// `[experts, intermediate, hidden]`
    pub fn stacked_up_weights(&self) -> Result<Tensor> {
        self.stacked(0)
    }

    /// `[experts, intermediate]`
    pub fn stacked_up_biases(&self) -> Result<Tensor> {
        self.stacked(1)
    }

    /// `[experts, hidden, intermediate]`
    pub fn stacked_down_weights(&self) -> Result<Tensor> {
        self.stacked(2)
    }

    /// `[experts, hidden]`
    pub fn stacked_down_biases(&self) -> Result<Tensor> {
        self.stacked(3)
    }

    /// Weighted sum of all expert parameters, `Σ_e w[e] · param_e`.
    pub fn merge_weights_and_biases(&self, merging_weights: &Tensor) -> Result<ExpertLinearParams> {
        let dims = merging_weights.dims();
        if dims != [self.len()].as_slice() {
            return Err(MoeError::Shape(format!(
                "merging weights expected [{}], got {dims:?}",
                self.len()
            )));
        }
        Ok(ExpertLinearParams {
            up_weight: weighted_sum(&self.stacked_up_weights()?, merging_weights)?,
            up_bias: weighted_sum(&self.stacked_up_biases()?, merging_weights)?,
            down_weight: weighted_sum(&self.stacked_down_weights()?, merging_weights)?,
            down_bias: weighted_sum(&self.stacked_down_biases()?, merging_weights)?,
        })
    }
}

/// Reduces a `[experts, ...]` stack over the expert axis with `weights`.
fn weighted_sum(stacked: &Tensor, weights: &Tensor) -> Result<Tensor> {
    let mut shape = vec![1usize; stacked.rank()];
    shape[0] = weights.dim(0)?;
    let weights = weights.to_dtype(stacked.dtype())?.reshape(shape)?;
    Ok(stacked.broadcast_mul(&weights)?.sum(0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn max_diff(a: &Tensor, b: &Tensor) -> candle_core::Result<f32> {
        a.sub(b)?.abs()?.flatten_all()?.max(0)?.to_vec0::<f32>()
    }

    fn bank(varmap: &VarMap, experts: usize) -> Result<ExpertBank> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        ExpertBank::new(
            experts,
            FeedForwardConfig::new(4, 6, ActivationKind::Gelu),
            vb.pp("experts"),
        )
    }

    #[test]
    fn stacks_parameters_along_expert_axis() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let bank = bank(&varmap, 3)?;
        assert_eq!(bank.stacked_up_weights()?.dims(), &[3, 6, 4]);
        assert_eq!(bank.stacked_up_biases()?.dims(), &[3, 6]);
        assert_eq!(bank.stacked_down_weights()?.dims(), &[3, 4, 6]);
        assert_eq!(bank.stacked_down_biases()?.dims(), &[3, 4]);
        assert_eq!(varmap.all_vars().len(), 12);
        Ok(())
    }

    #[test]
    fn one_hot_merge_reproduces_expert_exactly() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let bank = bank(&varmap, 3)?;
        let one_hot = Tensor::new(&[0f32, 1.0, 0.0], &Device::Cpu)?;
        let merged = bank.merge_weights_and_biases(&one_hot)?;
        let up = bank.stacked_up_weights()?.get(1)?;
        let down_bias = bank.stacked_down_biases()?.get(1)?;
        assert_eq!(max_diff(&merged.up_weight, &up)?, 0.0);
        assert_eq!(max_diff(&merged.down_bias, &down_bias)?, 0.0);

        let x = Tensor::randn(0f32, 1.0, (5, 4), &Device::Cpu)?;
        let from_merge = ExpertFromWeights::new(merged, 4, ActivationKind::Gelu, 0.0)?.forward(&x, false)?;
        let direct = bank.apply(1, &x, false)?;
        assert_eq!(max_diff(&from_merge, &direct)?, 0.0);
        Ok(())
    }

    #[test]
    fn uniform_merge_is_parameter_mean() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let bank = bank(&varmap, 2)?;
        let merged = bank.merge_weights_and_biases(&Tensor::new(&[0.5f32, 0.5], &Device::Cpu)?)?;
        let mean = bank.stacked_up_biases()?.mean(0)?;
        assert!(max_diff(&merged.up_bias, &mean)? < 1e-6);
        Ok(())
    }

    #[test]
    fn rejects_wrong_merge_length() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let bank = bank(&varmap, 2)?;
        let weights = Tensor::ones(3, DType::F32, &Device::Cpu)?;
        assert!(matches!(
            bank.merge_weights_and_biases(&weights),
            Err(MoeError::Shape(_))
        ));
        assert!(bank.apply(5, &Tensor::zeros((1, 4), DType::F32, &Device::Cpu)?, false).is_err());
        Ok(())
    }
}
