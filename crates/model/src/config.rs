use attention::PositionalBias;
use candle_core::{Error, Result};
use layers::norm::NormKind;
use moe::MoeConfig;
use serde::{Deserialize, Serialize};

/// Feed-forward flavour used by the routed blocks of the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockPattern {
    /// Grouped MoE with hash, token-choice or expert-choice routing.
    #[default]
    Moe,
    /// Every block uses a dense MLP.
    Dense,
    Soft,
    Smear,
}

/// High-level configuration for assembling the MoE transformer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MoETConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    /// Length of the learned position table. Unused with ALiBi.
    pub max_seq_len: usize,
    pub dropout: f32,
    pub layer_norm_epsilon: f64,
    /// Normalisation used by `ln1`, `ln2` and `ln_f`.
    pub norm: NormKind,
    pub attention: PositionalBias,
    pub block_pattern: BlockPattern,
    /// Block `i` is routed when `(i + 1) % moe_every == 0`; the rest are dense.
    pub moe_every: usize,
    /// Expert settings. `hidden_size` here is overridden by the model's.
    pub moe: MoeConfig,
}

impl Default for MoETConfig {
    fn default() -> Self {
        Self {
            vocab_size: 65,
            hidden_size: 256,
            num_layers: 4,
            num_heads: 4,
            max_seq_len: 256,
            dropout: 0.1,
            layer_norm_epsilon: 1e-5,
            norm: NormKind::LayerNorm,
            attention: PositionalBias::Causal,
            block_pattern: BlockPattern::Moe,
            moe_every: 1,
            moe: MoeConfig::default(),
        }
    }
}

impl MoETConfig {
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(Error::Msg("vocab_size must be greater than zero".into()));
        }
        if self.hidden_size == 0 {
            return Err(Error::Msg("hidden_size must be greater than zero".into()));
        }
        if self.num_layers == 0 {
            return Err(Error::Msg("num_layers must be greater than zero".into()));
        }
        if self.num_heads == 0 || self.hidden_size % self.num_heads != 0 {
            return Err(Error::Msg(format!(
                "hidden_size ({}) must be divisible by num_heads ({})",
                self.hidden_size, self.num_heads
            )));
        }
        if self.attention == PositionalBias::Causal && self.max_seq_len == 0 {
            return Err(Error::Msg("max_seq_len must be greater than zero".into()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::Msg(format!("dropout must be in [0, 1), got {}", self.dropout)));
        }
        if self.layer_norm_epsilon <= 0.0 {
            return Err(Error::Msg("layer_norm_epsilon must be positive".into()));
        }
        if self.moe_every == 0 {
            return Err(Error::Msg("moe_every must be at least 1".into()));
        }
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    /// Whether block `index` carries the routed feed-forward.
    pub fn is_routed_block(&self, index: usize) -> bool {
        self.block_pattern != BlockPattern::Dense && (index + 1) % self.moe_every == 0
    }

    pub fn num_routed_blocks(&self) -> usize {
        (0..self.num_layers).filter(|&i| self.is_routed_block(i)).count()
    }

    /// Expert settings with the model width applied.
    pub fn layer_moe_config(&self) -> MoeConfig {
        MoeConfig {
            hidden_size: self.hidden_size,
            ..self.moe.clone()
        }
    }

    pub fn uses_learned_positions(&self) -> bool {
        self.attention == PositionalBias::Causal
    }
}
