//! Per-layer routing records and their model-wide collection.
//!
//! A [`LayerCache`] is produced by every MoE layer forward pass and is
//! read-only afterwards. The enclosing model gathers them in layer order into
//! a [`FullCache`], whose stacked `[layers, tokens, experts]` views feed the
//! auxiliary losses.

use candle_core::{DType, Tensor};

use crate::error::{MoeError, Result};

/// Which policy produced a cache entry; decides how `gates` and
/// `assignments` are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingKind {
    TokenChoice,
    ExpertChoice,
    Hash,
    Soft,
    Smear,
}

/// Routing decisions of one layer for one forward pass.
#[derive(Debug, Clone)]
pub struct LayerCache {
    layer_index: usize,
    kind: RoutingKind,
    gates: Tensor,
    assignments: Option<Tensor>,
    routing_logits: Tensor,
    dispatch: Tensor,
}

impl LayerCache {
    /// `routing_logits` and `dispatch` must both be `[tokens, experts]`.
    pub fn new(
        layer_index: usize,
        kind: RoutingKind,
        gates: Tensor,
        assignments: Option<Tensor>,
        routing_logits: Tensor,
        dispatch: Tensor,
    ) -> Result<Self> {
        let logits_dims = routing_logits.dims2()?;
        let dispatch_dims = dispatch.dims2()?;
        if logits_dims != dispatch_dims {
            return Err(MoeError::Shape(format!(
                "routing logits {logits_dims:?} and dispatch {dispatch_dims:?} must match"
            )));
        }
        if let Some(assignments) = &assignments {
            if assignments.dims() != gates.dims() {
                return Err(MoeError::Shape(format!(
                    "assignments {:?} and gates {:?} must match",
                    assignments.dims(),
                    gates.dims()
                )));
            }
        }
        Ok(Self {
            layer_index,
            kind,
            gates,
            assignments,
            routing_logits,
            dispatch,
        })
    }

    pub fn layer_index(&self) -> usize {
        self.layer_index
    }

    pub fn kind(&self) -> RoutingKind {
        self.kind
    }

    /// Softmaxed routing weights G.
    ///
    /// `[tokens, k]` for token-choice and hash, `[experts, per_expert]` for
    /// expert-choice, `[tokens, experts * slots]` for soft routing and
    /// `[tokens, experts]` for SMEAR.
    pub fn gates(&self) -> &Tensor {
        &self.gates
    }

    /// Expert ids (token-choice, hash) or token ids (expert-choice). Soft
    /// routing has no discrete assignment.
    pub fn assignments(&self) -> Option<&Tensor> {
        self.assignments.as_ref()
    }

    /// Raw router output, `[tokens, experts]`.
    pub fn routing_logits(&self) -> &Tensor {
        &self.routing_logits
    }

    /// `[tokens, experts]` share of each token processed by each expert.
    pub fn dispatch(&self) -> &Tensor {
        &self.dispatch
    }

    pub fn num_tokens(&self) -> usize {
        self.routing_logits.dims()[0]
    }

    pub fn num_experts(&self) -> usize {
        self.routing_logits.dims()[1]
    }

    /// Dense `[tokens, experts]` view of the weight each expert's output
    /// receives for each token.
    pub fn combine_weights(&self) -> Result<Tensor> {
        let (tokens, experts) = (self.num_tokens(), self.num_experts());
        let dtype = self.gates.dtype();
        let device = self.gates.device();
        match (self.kind, &self.assignments) {
            (RoutingKind::TokenChoice | RoutingKind::Hash, Some(ids)) => Ok(Tensor::zeros(
                (tokens, experts),
                dtype,
                device,
            )?
            .scatter_add(&ids.to_dtype(DType::U32)?, &self.gates, 1)?),
            (RoutingKind::ExpertChoice, Some(ids)) => Ok(Tensor::zeros((experts, tokens), dtype, device)?
                .scatter_add(&ids.to_dtype(DType::U32)?, &self.gates, 1)?
                .t()?
                .contiguous()?),
            (RoutingKind::Soft, _) => {
                let slots = self.gates.dim(1)? / experts.max(1);
                Ok(self.gates.reshape((tokens, experts, slots))?.sum(2)?)
            }
            (RoutingKind::Smear, _) => Ok(self.gates.clone()),
            (kind, None) => Err(MoeError::Shape(format!(
                "{kind:?} cache is missing its assignments"
            ))),
        }
    }
}

/// Layer caches of one forward pass, in layer order.
#[derive(Debug, Clone, Default)]
pub struct FullCache {
    layers: Vec<LayerCache>,
}

impl FullCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, cache: LayerCache) {
        self.layers.push(cache);
    }

    pub fn get(&self, position: usize) -> Option<&LayerCache> {
        self.layers.get(position)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LayerCache> {
        self.layers.iter()
    }

    pub fn layer_indices(&self) -> Vec<usize> {
        self.layers.iter().map(LayerCache::layer_index).collect()
    }

    pub fn num_experts(&self) -> Option<usize> {
        self.layers.first().map(LayerCache::num_experts)
    }

    fn stack(&self, view: impl Fn(&LayerCache) -> &Tensor) -> Result<Tensor> {
        if self.layers.is_empty() {
            return Err(MoeError::Shape("routing cache holds no layers".into()));
        }
        let first = view(&self.layers[0]).dims().to_vec();
        let tensors: Vec<&Tensor> = self.layers.iter().map(&view).collect();
        if let Some(odd) = tensors.iter().find(|t| t.dims() != first.as_slice()) {
            return Err(MoeError::Shape(format!(
                "cannot stack layer views {first:?} and {:?}",
                odd.dims()
            )));
        }
        Ok(Tensor::stack(&tensors, 0)?)
    }

    /// `[layers, tokens, experts]`
    pub fn stacked_logits(&self) -> Result<Tensor> {
        self.stack(LayerCache::routing_logits)
    }

    /// `[layers, tokens, experts]`
    pub fn stacked_dispatch(&self) -> Result<Tensor> {
        self.stack(LayerCache::dispatch)
    }
}

impl<'a> IntoIterator for &'a FullCache {
    type Item = &'a LayerCache;
    type IntoIter = std::slice::Iter<'a, LayerCache>;

    fn into_iter(self) -> Self::IntoIter {
        self.layers.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn token_choice_cache(layer: usize, tokens: usize) -> Result<LayerCache> {
        let device = Device::Cpu;
        let logits = Tensor::zeros((tokens, 3), DType::F32, &device)?;
        let ids: Vec<u32> = (0..tokens as u32).map(|t| t % 3).collect();
        let assignments = Tensor::from_vec(ids, (tokens, 1), &device)?;
        let gates = Tensor::ones((tokens, 1), DType::F32, &device)?;
        let dispatch = Tensor::zeros((tokens, 3), DType::F32, &device)?;
        LayerCache::new(layer, RoutingKind::TokenChoice, gates, Some(assignments), logits, dispatch)
    }

    #[test]
    fn full_cache_stacks_layers_in_order() -> anyhow::Result<()> {
        let mut cache = FullCache::new();
        cache.push(token_choice_cache(1, 4)?);
        cache.push(token_choice_cache(3, 4)?);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.layer_indices(), vec![1, 3]);
        assert_eq!(cache.stacked_logits()?.dims(), &[2, 4, 3]);
        assert_eq!(cache.stacked_dispatch()?.dims(), &[2, 4, 3]);
        assert_eq!(cache.get(1).map(LayerCache::layer_index), Some(3));
        Ok(())
    }

    #[test]
    fn stacking_mismatched_layers_errors() -> anyhow::Result<()> {
        let mut cache = FullCache::new();
        cache.push(token_choice_cache(0, 4)?);
        cache.push(token_choice_cache(1, 5)?);
        assert!(matches!(cache.stacked_logits(), Err(MoeError::Shape(_))));
        assert!(matches!(FullCache::new().stacked_logits(), Err(MoeError::Shape(_))));
        Ok(())
    }

    #[test]
    fn combine_weights_scatter_token_choice_gates() -> anyhow::Result<()> {
        let cache = token_choice_cache(0, 4)?;
        let combine = cache.combine_weights()?.to_vec2::<f32>()?;
        assert_eq!(
            combine,
            vec![
                vec![1.0, 0.0, 0.0],
                vec![0.0, 1.0, 0.0],
                vec![0.0, 0.0, 1.0],
                vec![1.0, 0.0, 0.0],
            ]
        );
        Ok(())
    }

    #[test]
    fn combine_weights_transpose_expert_choice() -> anyhow::Result<()> {
        let device = Device::Cpu;
        // Two experts, one token each: expert 0 takes token 2, expert 1 takes token 0.
        let assignments = Tensor::new(&[[2u32], [0]], &device)?;
        let gates = Tensor::new(&[[0.7f32], [0.4]], &device)?;
        let logits = Tensor::zeros((3, 2), DType::F32, &device)?;
        let cache = LayerCache::new(
            0,
            RoutingKind::ExpertChoice,
            gates,
            Some(assignments),
            logits.clone(),
            logits,
        )?;
        let combine = cache.combine_weights()?.to_vec2::<f32>()?;
        assert_eq!(combine, vec![vec![0.0, 0.4], vec![0.0, 0.0], vec![0.7, 0.0]]);
        Ok(())
    }

    #[test]
    fn rejects_mismatched_dispatch() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::zeros((3, 2), DType::F32, &device)?;
        let dispatch = Tensor::zeros((3, 4), DType::F32, &device)?;
        let gates = Tensor::zeros((3, 1), DType::F32, &device)?;
        assert!(LayerCache::new(0, RoutingKind::Soft, gates, None, logits, dispatch).is_err());
        Ok(())
    }
}
