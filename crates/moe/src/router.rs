//! Token-to-expert scoring.

use candle_core::{Tensor, D};
use candle_nn::{Linear, Module, VarBuilder};

use crate::config::HashKind;
use crate::error::{MoeError, Result};

/// Produces `[tokens, experts]` routing logits.
#[derive(Debug, Clone)]
pub enum Router {
    /// Bias-free projection registered as `weight` under the router prefix.
    Linear { proj: Linear, num_experts: usize },
    /// Parameter-free hash of the token id.
    Hash { hash: HashKind, num_experts: usize },
}

impl Router {
    pub fn linear(hidden_size: usize, num_experts: usize, vb: VarBuilder) -> Result<Self> {
        let proj = candle_nn::linear_no_bias(hidden_size, num_experts, vb)?;
        Ok(Router::Linear { proj, num_experts })
    }

    pub fn hash(hash: HashKind, num_experts: usize) -> Self {
        Router::Hash { hash, num_experts }
    }

    pub fn num_experts(&self) -> usize {
        match self {
            Router::Linear { num_experts, .. } | Router::Hash { num_experts, .. } => *num_experts,
        }
    }

    /// Expert chosen by the hash for each token id.
    pub fn hash_assignments(&self, token_ids: &[u32]) -> Result<Vec<u32>> {
        match self {
            Router::Hash { hash, num_experts } => Ok(token_ids
                .iter()
                .map(|&id| hash.expert_for(id, *num_experts))
                .collect()),
            Router::Linear { .. } => Err(MoeError::InvalidRouting(
                "hash assignments requested from a linear router".into(),
            )),
        }
    }

    /// Scores `tokens` (`[T, hidden]`). Hash routers report one-hot logits
    /// over the hashed expert and require `token_ids`.
    pub fn route_logits(&self, tokens: &Tensor, token_ids: Option<&[u32]>) -> Result<Tensor> {
        match self {
            Router::Linear { proj, .. } => Ok(proj.forward(tokens)?),
            Router::Hash { num_experts, .. } => {
                let ids = token_ids.ok_or(MoeError::MissingTokenIds)?;
                let num_tokens = tokens.dim(0)?;
                if ids.len() != num_tokens {
                    return Err(MoeError::Shape(format!(
                        "{} token ids for {num_tokens} tokens",
                        ids.len()
                    )));
                }
                let experts = self.hash_assignments(ids)?;
                let mut one_hot = vec![0f32; num_tokens * num_experts];
                for (token, &expert) in experts.iter().enumerate() {
                    one_hot[token * num_experts + expert as usize] = 1.0;
                }
                Ok(Tensor::from_vec(one_hot, (num_tokens, *num_experts), tokens.device())?
                    .to_dtype(tokens.dtype())?)
            }
        }
    }
}

/// Numerically stable `log(sum(exp(x)))` over the last axis.
pub fn logsumexp_last(x: &Tensor) -> candle_core::Result<Tensor> {
    let max = x.max_keepdim(D::Minus1)?;
    let shifted = x.broadcast_sub(&max)?;
    shifted
        .exp()?
        .sum_keepdim(D::Minus1)?
        .log()?
        .add(&max)?
        .squeeze(D::Minus1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn linear_router_has_no_bias() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let router = Router::linear(6, 4, vb.pp("router"))?;
        let tokens = Tensor::randn(0f32, 1.0, (5, 6), &device)?;
        assert_eq!(router.route_logits(&tokens, None)?.dims(), &[5, 4]);
        assert_eq!(varmap.all_vars().len(), 1);
        Ok(())
    }

    #[test]
    fn hash_router_reports_one_hot_logits() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let router = Router::hash(HashKind::Modulo, 3);
        let tokens = Tensor::zeros((4, 2), DType::F32, &device)?;
        let logits = router.route_logits(&tokens, Some(&[0, 4, 5, 9]))?.to_vec2::<f32>()?;
        assert_eq!(
            logits,
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
    fn hash_router_requires_ids() -> anyhow::Result<()> {
        let router = Router::hash(HashKind::Modulo, 3);
        let tokens = Tensor::zeros((2, 2), DType::F32, &Device::Cpu)?;
        assert!(matches!(
            router.route_logits(&tokens, None),
            Err(MoeError::MissingTokenIds)
        ));
        assert!(matches!(
            router.route_logits(&tokens, Some(&[1])),
            Err(MoeError::Shape(_))
        ));
        Ok(())
    }

    #[test]
    fn logsumexp_is_stable_for_large_logits() -> anyhow::Result<()> {
        let x = Tensor::new(&[[1000f32, 1000.0], [0.0, 0.0]], &Device::Cpu)?;
        let lse = logsumexp_last(&x)?.to_vec1::<f32>()?;
        let ln2 = std::f32::consts::LN_2;
        assert!((lse[0] - (1000.0 + ln2)).abs() < 1e-3);
        assert!((lse[1] - ln2).abs() < 1e-6);
        Ok(())
    }
}
