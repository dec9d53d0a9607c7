//! Soft mixture of experts.
//!
//! Nothing is routed discretely. Within each group, every expert slot
//! receives a convex combination of the group's tokens (softmax over the token
//! axis) and every token reads back a convex combination of all slot outputs
//! (softmax over the flattened expert-slot axis).

use candle_core::{Tensor, D};
use candle_nn::{ops::softmax, Init, VarBuilder};

use crate::cache::{LayerCache, RoutingKind};
use crate::capacity::groups;
use crate::config::MoeConfig;
use crate::error::{MoeError, Result};
use crate::experts::ExpertBank;
use crate::layer::flatten_tokens;
use crate::router::logsumexp_last;

#[derive(Debug)]
pub struct SoftExpertLayer {
    layer_index: usize,
    config: MoeConfig,
    /// `[hidden, experts * slots]` slot embeddings.
    phi: Tensor,
    experts: ExpertBank,
}

impl SoftExpertLayer {
    pub fn new(config: &MoeConfig, layer_index: usize, vb: VarBuilder) -> Result<Self> {
        config.validate_dims()?;
        let slots = config.num_experts * config.slots_per_expert;
        let phi = vb.get_with_hints(
            (config.hidden_size, slots),
            "phi",
            Init::Randn {
                mean: 0.0,
                stdev: 1.0 / (config.hidden_size as f64).sqrt(),
            },
        )?;
        let experts = ExpertBank::new(config.num_experts, config.expert_config(), vb.pp("experts"))?;
        log::debug!(
            "soft moe layer {layer_index}: {} experts x {} slots",
            config.num_experts,
            config.slots_per_expert
        );
        Ok(Self {
            layer_index,
            config: config.clone(),
            phi,
            experts,
        })
    }

    pub fn layer_index(&self) -> usize {
        self.layer_index
    }

    pub fn experts(&self) -> &ExpertBank {
        &self.experts
    }

    /// `routing_logits`, when given, replaces the learned `x · phi` scores and
    /// must be `[tokens, experts, slots]`.
    pub fn forward(
        &self,
        x: &Tensor,
        routing_logits: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, LayerCache)> {
        let (tokens, dims) = flatten_tokens(x, self.config.hidden_size)?;
        let num_tokens = tokens.dim(0)?;
        let (experts, slots) = (self.config.num_experts, self.config.slots_per_expert);

        let logits = match routing_logits {
            Some(logits) => {
                if logits.dims() != [num_tokens, experts, slots].as_slice() {
                    return Err(MoeError::Shape(format!(
                        "soft routing logits expected [{num_tokens}, {experts}, {slots}], got {:?}",
                        logits.dims()
                    )));
                }
                logits.to_dtype(tokens.dtype())?
            }
            None => tokens.matmul(&self.phi)?.reshape((num_tokens, experts, slots))?,
        };
        let flat_logits = logits.reshape((num_tokens, experts * slots))?;

        let mut outputs = Vec::new();
        let mut combines = Vec::new();
        for group in groups(num_tokens, self.config.group_size) {
            let x_group = tokens.narrow(0, group.start, group.len())?;
            let l_group = flat_logits.narrow(0, group.start, group.len())?;

            let dispatch = softmax(&l_group, 0)?;
            let slot_inputs = dispatch.t()?.contiguous()?.matmul(&x_group)?;
            let slot_outputs = (0..experts)
                .map(|expert| {
                    let inputs = slot_inputs.narrow(0, expert * slots, slots)?;
                    self.experts.apply(expert, &inputs, train)
                })
                .collect::<Result<Vec<_>>>()?;
            let slot_outputs = Tensor::cat(&slot_outputs, 0)?;

            let combine = softmax(&l_group, D::Minus1)?;
            outputs.push(combine.matmul(&slot_outputs)?);
            combines.push(combine);
        }
        let output = Tensor::cat(&outputs, 0)?;
        let combine = Tensor::cat(&combines, 0)?;

        let per_expert = combine.reshape((num_tokens, experts, slots))?.sum(2)?;
        let cache = LayerCache::new(
            self.layer_index,
            RoutingKind::Soft,
            combine,
            None,
            logsumexp_last(&logits)?,
            per_expert,
        )?;
        Ok((output.reshape(dims)?, cache))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Var};
    use candle_nn::VarMap;

    fn config(experts: usize, slots: usize) -> MoeConfig {
        MoeConfig {
            num_experts: experts,
            slots_per_expert: slots,
            group_size: 2,
            hidden_size: 8,
            intermediate_size: 16,
            expert_dropout: 0.0,
            ..MoeConfig::default()
        }
    }

    #[test]
    fn explicit_logits_reach_expert_parameters() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let layer = SoftExpertLayer::new(&config(2, 2), 0, vb.pp("soft"))?;

        let x = Var::randn(0f32, 1.0, (8, 8), &device)?;
        let logits = Tensor::randn(0f32, 1.0, (8, 2, 2), &device)?;
        let (y, cache) = layer.forward(x.as_tensor(), Some(&logits), true)?;
        assert_eq!(y.dims(), &[8, 8]);
        assert_eq!(cache.routing_logits().dims(), &[8, 2]);
        assert!(cache.assignments().is_none());

        let grads = y.sum_all()?.backward()?;
        let with_grad = varmap
            .all_vars()
            .iter()
            .filter_map(|var| grads.get(var.as_tensor()).map(|g| (var.dims().to_vec(), g.dims().to_vec())))
            .collect::<Vec<_>>();
        assert!(!with_grad.is_empty());
        assert!(with_grad.iter().all(|(param, grad)| param == grad));
        assert!(grads.get(x.as_tensor()).is_some());
        Ok(())
    }

    #[test]
    fn combine_weights_sum_to_one_per_token() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let layer = SoftExpertLayer::new(&config(3, 2), 0, vb)?;
        let x = Tensor::randn(0f32, 1.0, (2, 3, 8), &device)?;
        let (y, cache) = layer.forward(&x, None, false)?;
        assert_eq!(y.dims(), &[2, 3, 8]);
        assert_eq!(cache.gates().dims(), &[6, 6]);
        for total in cache.combine_weights()?.sum(1)?.to_vec1::<f32>()? {
            assert!((total - 1.0).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn dispatch_weights_normalise_over_group_tokens() -> anyhow::Result<()> {
        // With uniform logits each slot averages its group, so a group of
        // identical tokens produces identical outputs.
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let layer = SoftExpertLayer::new(&config(2, 1), 0, vb)?;
        let row = Tensor::randn(0f32, 1.0, (1, 8), &device)?;
        let x = Tensor::cat(&[&row, &row], 0)?;
        let logits = Tensor::zeros((2, 2, 1), DType::F32, &device)?;
        let (y, _) = layer.forward(&x, Some(&logits), false)?;
        let rows = y.to_vec2::<f32>()?;
        assert_eq!(rows[0], rows[1]);
        Ok(())
    }

    #[test]
    fn rejects_misshaped_logits() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let layer = SoftExpertLayer::new(&config(2, 2), 0, VarBuilder::zeros(DType::F32, &device))?;
        let x = Tensor::zeros((4, 8), DType::F32, &device)?;
        let logits = Tensor::zeros((4, 2, 3), DType::F32, &device)?;
        assert!(matches!(
            layer.forward(&x, Some(&logits), false),
            Err(MoeError::Shape(_))
        ));
        Ok(())
    }
}
