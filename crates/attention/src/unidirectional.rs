//! Multi-head causal self-attention with key/value caching.
//!
//! A fused `qkv_proj` produces queries, keys and values in one matmul. When a
//! cache is supplied the new keys and values are appended to the cached prefix
//! and the queries attend over the whole prefix, so decoding one token at a
//! time reproduces the rows of a full forward pass.

use candle_core::Tensor;
use candle_nn::{Dropout, Linear, Module, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::core::{Attention, AttentionError, Config};
use crate::kv_cache::{AttentionCache, KeyValueCache};
use crate::masks::{alibi_slopes, build_alibi_bias, build_causal_mask};
use crate::reference::ExactAttention;

/// Positional scheme applied as an additive attention bias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionalBias {
    /// Plain causal mask; positions come from a learned embedding elsewhere.
    #[default]
    #[serde(rename = "standard", alias = "causal")]
    Causal,
    /// Causal mask plus the ALiBi distance penalty.
    Alibi,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnidirectionalConfig {
    pub hidden_size: usize,
    pub num_heads: usize,
    /// Shared by the attention weights and the residual output.
    pub dropout: f32,
    pub bias: PositionalBias,
}

impl UnidirectionalConfig {
    pub fn new(hidden_size: usize, num_heads: usize) -> Self {
        Self {
            hidden_size,
            num_heads,
            dropout: 0.0,
            bias: PositionalBias::Causal,
        }
    }

    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn with_bias(mut self, bias: PositionalBias) -> Self {
        self.bias = bias;
        self
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads.max(1)
    }

    pub fn validate(&self) -> Result<(), AttentionError> {
        if self.hidden_size == 0 || self.num_heads == 0 {
            return Err(AttentionError::shape(format!(
                "hidden_size ({}) and num_heads ({}) must be positive",
                self.hidden_size, self.num_heads
            )));
        }
        if self.hidden_size % self.num_heads != 0 {
            return Err(AttentionError::shape(format!(
                "hidden_size ({}) must be divisible by num_heads ({})",
                self.hidden_size, self.num_heads
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(AttentionError::Backend {
                message: format!("attention dropout must be in [0, 1), got {}", self.dropout),
            });
        }
        Ok(())
    }
}

/// Decoder self-attention layer.
#[derive(Debug)]
pub struct UnidirectionalAttention {
    config: UnidirectionalConfig,
    qkv_proj: Linear,
    out_proj: Linear,
    kernel: ExactAttention,
    kernel_config: Config,
    resid_dropout: Dropout,
    slopes: Vec<f32>,
}

impl UnidirectionalAttention {
    /// Registers `qkv_proj` and `out_proj` under `vb`.
    pub fn new(config: UnidirectionalConfig, vb: VarBuilder) -> Result<Self, AttentionError> {
        config.validate()?;
        let hidden = config.hidden_size;
        let qkv_proj = candle_nn::linear(hidden, 3 * hidden, vb.pp("qkv_proj"))?;
        let out_proj = candle_nn::linear(hidden, hidden, vb.pp("out_proj"))?;
        let slopes = match config.bias {
            PositionalBias::Causal => Vec::new(),
            PositionalBias::Alibi => alibi_slopes(config.num_heads),
        };
        Ok(Self {
            kernel_config: Config::with_dropout(config.dropout),
            resid_dropout: Dropout::new(config.dropout),
            qkv_proj,
            out_proj,
            kernel: ExactAttention::new(),
            slopes,
            config,
        })
    }

    pub fn config(&self) -> &UnidirectionalConfig {
        &self.config
    }

    fn expand_to_heads(&self, tensor: &Tensor) -> candle_core::Result<Tensor> {
        let (batch, seq, _) = tensor.dims3()?;
        tensor
            .reshape((batch, seq, self.config.num_heads, self.config.head_dim()))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn merge_from_heads(&self, tensor: &Tensor) -> candle_core::Result<Tensor> {
        let (batch, _, seq, _) = tensor.dims4()?;
        tensor
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq, self.config.hidden_size))
    }

    fn positional_bias(&self, q_len: usize, k_len: usize, x: &Tensor) -> candle_core::Result<Tensor> {
        match self.config.bias {
            PositionalBias::Causal => build_causal_mask(x.device(), q_len, k_len),
            PositionalBias::Alibi => build_alibi_bias(x.device(), &self.slopes, q_len, k_len),
        }
    }

    /// `x` is `[batch, seq, hidden]`. Returns the attention output with the
    /// same shape and the cache grown by `seq` positions.
    pub fn forward(
        &self,
        x: &Tensor,
        cache: Option<&AttentionCache>,
        train: bool,
    ) -> Result<(Tensor, AttentionCache), AttentionError> {
        let (batch, seq, hidden) = match x.dims() {
            [b, s, h] => (*b, *s, *h),
            dims => {
                return Err(AttentionError::shape(format!(
                    "attention input expected [batch, seq, hidden] got {dims:?}"
                )))
            }
        };
        if hidden != self.config.hidden_size {
            return Err(AttentionError::shape(format!(
                "attention input hidden {hidden} does not match configured {}",
                self.config.hidden_size
            )));
        }

        let qkv = self.qkv_proj.forward(x)?;
        let q = self.expand_to_heads(&qkv.narrow(2, 0, hidden)?)?;
        let k = self.expand_to_heads(&qkv.narrow(2, hidden, hidden)?)?;
        let v = self.expand_to_heads(&qkv.narrow(2, 2 * hidden, hidden)?)?;

        let cache = match cache {
            Some(prefix) => {
                if prefix.keys().dims()[0] != batch {
                    return Err(AttentionError::shape(format!(
                        "cache batch {} does not match input batch {batch}",
                        prefix.keys().dims()[0]
                    )));
                }
                prefix.extended(&k, &v)?
            }
            None => AttentionCache::new(k, v)?,
        };

        let bias = self.positional_bias(seq, cache.len(), x)?;
        let attended = self.kernel.attend(
            &q,
            cache.keys(),
            cache.values(),
            Some(&bias),
            &self.kernel_config,
            train,
        )?;
        let merged = self.merge_from_heads(&attended)?;
        let out = self.out_proj.forward(&merged)?;
        let out = self.resid_dropout.forward(&out, train)?;
        Ok((out, cache))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn max_diff(a: &Tensor, b: &Tensor) -> candle_core::Result<f32> {
        a.sub(b)?.abs()?.max_all()?.to_vec0::<f32>()
    }

    fn build(bias: PositionalBias) -> anyhow::Result<(VarMap, UnidirectionalAttention)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let attn = UnidirectionalAttention::new(
            UnidirectionalConfig::new(16, 4).with_bias(bias),
            vb.pp("attn"),
        )?;
        Ok((varmap, attn))
    }

    fn cached_decode_matches_full(bias: PositionalBias) -> anyhow::Result<()> {
        let (_varmap, attn) = build(bias)?;
        let x = Tensor::randn(0f32, 1.0, (2, 5, 16), &Device::Cpu)?;
        let (full, full_cache) = attn.forward(&x, None, false)?;
        assert_eq!(full.dims(), &[2, 5, 16]);
        assert_eq!(full_cache.len(), 5);

        let (_, prefix) = attn.forward(&x.narrow(1, 0, 4)?, None, false)?;
        let (step, grown) = attn.forward(&x.narrow(1, 4, 1)?, Some(&prefix), false)?;
        assert_eq!(step.dims(), &[2, 1, 16]);
        assert_eq!(grown.len(), 5);

        let last = full.narrow(1, 4, 1)?;
        assert!(max_diff(&step, &last)? < 1e-5);
        assert!(max_diff(grown.keys(), full_cache.keys())? < 1e-6);
        Ok(())
    }

    #[test]
    fn cached_causal_decoding_matches_full_forward() -> anyhow::Result<()> {
        cached_decode_matches_full(PositionalBias::Causal)
    }

    #[test]
    fn cached_alibi_decoding_matches_full_forward() -> anyhow::Result<()> {
        cached_decode_matches_full(PositionalBias::Alibi)
    }

    #[test]
    fn first_position_ignores_future_tokens() -> anyhow::Result<()> {
        let (_varmap, attn) = build(PositionalBias::Alibi)?;
        let x = Tensor::randn(0f32, 1.0, (1, 4, 16), &Device::Cpu)?;
        let (full, _) = attn.forward(&x, None, false)?;
        let (single, _) = attn.forward(&x.narrow(1, 0, 1)?, None, false)?;
        assert!(max_diff(&full.narrow(1, 0, 1)?, &single)? < 1e-5);
        Ok(())
    }

    #[test]
    fn registers_fused_projections() -> anyhow::Result<()> {
        let (varmap, attn) = build(PositionalBias::Causal)?;
        assert_eq!(varmap.all_vars().len(), 4);
        assert_eq!(attn.config().head_dim(), 4);
        Ok(())
    }

    #[test]
    fn rejects_indivisible_heads() {
        let config = UnidirectionalConfig::new(10, 4);
        assert!(matches!(
            config.validate(),
            Err(AttentionError::InvalidShape { .. })
        ));
    }
}
