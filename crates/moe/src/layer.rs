//! Grouped mixture-of-experts layer with discrete routing.

use candle_core::{DType, Tensor};
use candle_nn::VarBuilder;

use crate::assignment::{self, Assignment};
use crate::cache::LayerCache;
use crate::combiner::dispatch_and_combine;
use crate::config::{MoeConfig, RoutingScheme};
use crate::error::{MoeError, Result};
use crate::experts::ExpertBank;
use crate::router::Router;

/// Flattens `[batch, seq, hidden]` or `[tokens, hidden]` to `[tokens, hidden]`
/// and returns the original dims for restoring the output.
pub(crate) fn flatten_tokens(x: &Tensor, hidden_size: usize) -> Result<(Tensor, Vec<usize>)> {
    let dims = x.dims().to_vec();
    match dims.as_slice() {
        [_, hidden] | [_, _, hidden] if *hidden == hidden_size => {
            let tokens = dims[..dims.len() - 1].iter().product::<usize>();
            Ok((x.reshape((tokens, hidden_size))?, dims))
        }
        _ => Err(MoeError::Shape(format!(
            "expected [tokens, {hidden_size}] or [batch, seq, {hidden_size}], got {dims:?}"
        ))),
    }
}

/// Token routing layer: a router, an assignment policy and a bank of experts.
///
/// Tokens of the flattened `batch * seq` order are routed in consecutive
/// groups of `group_size`; capacity limits apply within each group.
#[derive(Debug)]
pub struct GroupMoELayer {
    layer_index: usize,
    config: MoeConfig,
    scheme: RoutingScheme,
    router: Router,
    experts: ExpertBank,
}

impl GroupMoELayer {
    /// Registers `router.weight` (linear routing only) and
    /// `experts.{i}.{up,down}.{weight,bias}` under `vb`.
    pub fn new(config: &MoeConfig, layer_index: usize, vb: VarBuilder) -> Result<Self> {
        let scheme = config.routing_scheme()?;
        let router = match scheme {
            RoutingScheme::Hash { hash } => Router::hash(hash, config.num_experts),
            RoutingScheme::TokenChoice { .. } | RoutingScheme::ExpertChoice { .. } => {
                Router::linear(config.hidden_size, config.num_experts, vb.pp("router"))?
            }
        };
        let experts = ExpertBank::new(config.num_experts, config.expert_config(), vb.pp("experts"))?;
        log::debug!(
            "moe layer {layer_index}: {} routing over {} experts, group_size={}",
            scheme.name(),
            config.num_experts,
            config.group_size
        );
        Ok(Self {
            layer_index,
            config: config.clone(),
            scheme,
            router,
            experts,
        })
    }

    pub fn layer_index(&self) -> usize {
        self.layer_index
    }

    pub fn scheme(&self) -> RoutingScheme {
        self.scheme
    }

    pub fn config(&self) -> &MoeConfig {
        &self.config
    }

    pub fn experts(&self) -> &ExpertBank {
        &self.experts
    }

    /// Routes `x` through the experts. `input_ids` holds the raw token ids in
    /// the same `batch, seq` layout and is required by hash routing.
    pub fn forward(
        &self,
        x: &Tensor,
        input_ids: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, LayerCache)> {
        if matches!(self.scheme, RoutingScheme::Hash { .. }) && input_ids.is_none() {
            return Err(MoeError::MissingTokenIds);
        }
        let (tokens, dims) = flatten_tokens(x, self.config.hidden_size)?;
        let num_tokens = tokens.dim(0)?;
        let num_experts = self.config.num_experts;

        let token_ids = match input_ids {
            Some(ids) => {
                let ids = ids.flatten_all()?.to_dtype(DType::U32)?.to_vec1::<u32>()?;
                if ids.len() != num_tokens {
                    return Err(MoeError::Shape(format!(
                        "{} token ids for {num_tokens} tokens",
                        ids.len()
                    )));
                }
                Some(ids)
            }
            None => None,
        };

        let logits = if num_tokens == 0 {
            Tensor::zeros((0, num_experts), tokens.dtype(), tokens.device())?
        } else {
            self.router.route_logits(&tokens, token_ids.as_deref())?
        };
        let routed: Assignment = match self.scheme {
            RoutingScheme::Hash { .. } => {
                let ids = token_ids.as_deref().ok_or(MoeError::MissingTokenIds)?;
                assignment::hash_choice(self.router.hash_assignments(ids)?, tokens.dtype(), tokens.device())?
            }
            RoutingScheme::TokenChoice { k, capacity_factor } => {
                assignment::token_choice(&logits, k, capacity_factor, self.config.group_size)?
            }
            RoutingScheme::ExpertChoice { capacity_factor } => {
                assignment::expert_choice(&logits, capacity_factor, self.config.group_size)?
            }
        };
        let dropped = routed.dropped_pairs();
        if dropped > 0 {
            log::trace!("moe layer {}: {dropped} pairs over capacity", self.layer_index);
        }

        let plan = routed.dispatch_plan(num_experts);
        let combined = dispatch_and_combine(&self.experts, &tokens, &routed.gates, &plan, train)?;
        let dispatch = Tensor::from_vec(
            routed.dispatch_counts(num_tokens, num_experts),
            (num_tokens, num_experts),
            tokens.device(),
        )?;
        let cache = LayerCache::new(
            self.layer_index,
            routed.kind,
            routed.gates,
            Some(routed.indices),
            logits,
            dispatch,
        )?;
        Ok((combined.reshape(dims)?, cache))
    }
}
