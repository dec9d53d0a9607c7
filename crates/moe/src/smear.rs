//! SMEAR: soft merging of experts with adaptive routing.
//!
//! Instead of sending tokens to experts, each group averages its router
//! probabilities, merges the expert parameters with those weights and runs
//! the single merged expert on the whole group.

use candle_core::{Tensor, D};
use candle_nn::{ops::softmax, Linear, Module, VarBuilder};

use crate::cache::{LayerCache, RoutingKind};
use crate::capacity::groups;
use crate::config::MoeConfig;
use crate::error::Result;
use crate::experts::{ExpertBank, ExpertFromWeights};
use crate::layer::flatten_tokens;

#[derive(Debug)]
pub struct SmearLayer {
    layer_index: usize,
    config: MoeConfig,
    router: Linear,
    experts: ExpertBank,
}

impl SmearLayer {
    pub fn new(config: &MoeConfig, layer_index: usize, vb: VarBuilder) -> Result<Self> {
        config.validate_dims()?;
        let router = candle_nn::linear_no_bias(config.hidden_size, config.num_experts, vb.pp("router"))?;
        let experts = ExpertBank::new(config.num_experts, config.expert_config(), vb.pp("experts"))?;
        Ok(Self {
            layer_index,
            config: config.clone(),
            router,
            experts,
        })
    }

    pub fn layer_index(&self) -> usize {
        self.layer_index
    }

    pub fn experts(&self) -> &ExpertBank {
        &self.experts
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<(Tensor, LayerCache)> {
        let (tokens, dims) = flatten_tokens(x, self.config.hidden_size)?;
        let num_tokens = tokens.dim(0)?;
        let num_experts = self.config.num_experts;
        let logits = self.router.forward(&tokens)?;
        let probs = softmax(&logits, D::Minus1)?;

        let mut outputs = Vec::new();
        let mut merge_rows = Vec::new();
        for group in groups(num_tokens, self.config.group_size) {
            let len = group.len();
            let weights = probs.narrow(0, group.start, len)?.mean(0)?;
            let merged = ExpertFromWeights::new(
                self.experts.merge_weights_and_biases(&weights)?,
                self.config.hidden_size,
                self.config.activation,
                self.config.expert_dropout,
            )?;
            outputs.push(merged.forward(&tokens.narrow(0, group.start, len)?, train)?);
            merge_rows.push(weights.unsqueeze(0)?.broadcast_as((len, num_experts))?);
        }
        let output = Tensor::cat(&outputs, 0)?;
        let gates = Tensor::cat(&merge_rows, 0)?.contiguous()?;

        let cache = LayerCache::new(
            self.layer_index,
            RoutingKind::Smear,
            gates.clone(),
            None,
            logits,
            gates,
        )?;
        Ok((output.reshape(dims)?, cache))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn config() -> MoeConfig {
        MoeConfig {
            num_experts: 3,
            group_size: 4,
            hidden_size: 6,
            intermediate_size: 12,
            expert_dropout: 0.0,
            ..MoeConfig::default()
        }
    }

    #[test]
    fn merged_expert_output_has_input_shape_and_trains_router() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let layer = SmearLayer::new(&config(), 2, vb.pp("smear"))?;
        let x = Tensor::randn(0f32, 1.0, (2, 5, 6), &device)?;
        let (y, cache) = layer.forward(&x, true)?;
        assert_eq!(y.dims(), &[2, 5, 6]);
        assert_eq!(cache.layer_index(), 2);
        assert_eq!(cache.gates().dims(), &[10, 3]);

        let grads = y.sum_all()?.backward()?;
        let data = varmap.data().lock().map_err(|e| anyhow::anyhow!("{e}"))?;
        let router = data.get("smear.router.weight").ok_or_else(|| anyhow::anyhow!("router"))?;
        assert!(grads.get(router.as_tensor()).is_some());
        Ok(())
    }

    #[test]
    fn tokens_in_a_group_share_merge_weights() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let layer = SmearLayer::new(&config(), 0, VarBuilder::from_varmap(&VarMap::new(), DType::F32, &device))?;
        let x = Tensor::randn(0f32, 1.0, (6, 6), &device)?;
        let (_, cache) = layer.forward(&x, false)?;
        let gates = cache.gates().to_vec2::<f32>()?;
        assert_eq!(gates[0], gates[3]);
        assert_eq!(gates[4], gates[5]);
        let total: f32 = gates[0].iter().sum();
        assert!((total - 1.0).abs() < 1e-5);
        Ok(())
    }
}
