use std::fmt;

use attention::{AttentionCache, UnidirectionalAttention, UnidirectionalConfig};
use candle_core::{Error, Result, Tensor};
use candle_nn::VarBuilder;
use layers::{
    mlp::{FeedForward, FeedForwardConfig, FeedForwardLayer},
    norm::{build_norm, NormConfig, NormalizationLayer},
};
use moe::{GroupMoELayer, LayerCache, SmearLayer, SoftExpertLayer};

use crate::config::{BlockPattern, MoETConfig};

fn moe_err(err: moe::MoeError) -> Error {
    Error::Msg(err.to_string())
}

/// Position-wise half of a block.
#[derive(Debug)]
pub enum BlockFeedForward {
    Dense(FeedForward),
    Routed(GroupMoELayer),
    Soft(SoftExpertLayer),
    Smear(SmearLayer),
}

impl BlockFeedForward {
    fn forward(
        &self,
        x: &Tensor,
        input_ids: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Option<LayerCache>)> {
        match self {
            BlockFeedForward::Dense(mlp) => Ok((mlp.forward(x, train)?, None)),
            BlockFeedForward::Routed(layer) => {
                let (out, cache) = layer.forward(x, Some(input_ids), train).map_err(moe_err)?;
                Ok((out, Some(cache)))
            }
            BlockFeedForward::Soft(layer) => {
                let (out, cache) = layer.forward(x, None, train).map_err(moe_err)?;
                Ok((out, Some(cache)))
            }
            BlockFeedForward::Smear(layer) => {
                let (out, cache) = layer.forward(x, train).map_err(moe_err)?;
                Ok((out, Some(cache)))
            }
        }
    }

    pub fn is_routed(&self) -> bool {
        !matches!(self, BlockFeedForward::Dense(_))
    }
}

/// Output of one block step.
#[derive(Debug)]
pub struct BlockOutput {
    pub hidden: Tensor,
    pub attention_cache: AttentionCache,
    pub moe_cache: Option<LayerCache>,
}

/// Pre-norm block: `x + attn(ln1(x))` followed by `x + ffn(ln2(x))`.
pub struct MoETBlock {
    index: usize,
    ln1: Box<dyn NormalizationLayer>,
    attn: UnidirectionalAttention,
    ln2: Box<dyn NormalizationLayer>,
    ffn: BlockFeedForward,
}

impl fmt::Debug for MoETBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MoETBlock")
            .field("index", &self.index)
            .field("attention", self.attn.config())
            .field("routed", &self.ffn.is_routed())
            .finish()
    }
}

impl MoETBlock {
    /// Registers `ln1`, `attn`, `ln2` and `ffn` under `vb`.
    pub fn new(index: usize, config: &MoETConfig, vb: VarBuilder) -> Result<Self> {
        let norm_config =
            NormConfig::new(config.hidden_size, config.norm).with_epsilon(config.layer_norm_epsilon);
        let ln1 = build_norm(norm_config.clone(), vb.pp("ln1"))?;
        let ln2 = build_norm(norm_config, vb.pp("ln2"))?;

        let attn_config = UnidirectionalConfig::new(config.hidden_size, config.num_heads)
            .with_dropout(config.dropout)
            .with_bias(config.attention);
        let attn = UnidirectionalAttention::new(attn_config, vb.pp("attn"))
            .map_err(|e| Error::Msg(e.to_string()))?;

        let moe_config = config.layer_moe_config();
        let ffn_vb = vb.pp("ffn");
        let ffn = if config.is_routed_block(index) {
            match config.block_pattern {
                BlockPattern::Moe => {
                    BlockFeedForward::Routed(GroupMoELayer::new(&moe_config, index, ffn_vb).map_err(moe_err)?)
                }
                BlockPattern::Soft => {
                    BlockFeedForward::Soft(SoftExpertLayer::new(&moe_config, index, ffn_vb).map_err(moe_err)?)
                }
                BlockPattern::Smear => {
                    BlockFeedForward::Smear(SmearLayer::new(&moe_config, index, ffn_vb).map_err(moe_err)?)
                }
                BlockPattern::Dense => {
                    return Err(Error::Msg("dense pattern has no routed blocks".into()))
                }
            }
        } else {
            let mlp_config = FeedForwardConfig::new(
                config.hidden_size,
                moe_config.intermediate_size,
                moe_config.activation,
            )
            .with_dropout(config.dropout);
            BlockFeedForward::Dense(FeedForward::new(mlp_config, ffn_vb)?)
        };

        Ok(Self {
            index,
            ln1,
            attn,
            ln2,
            ffn,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn feed_forward(&self) -> &BlockFeedForward {
        &self.ffn
    }

    /// `hidden` is `[batch, seq, hidden]`; `input_ids` the matching `[batch, seq]`
    /// token ids, consumed by hash routing.
    pub fn forward(
        &self,
        hidden: &Tensor,
        input_ids: &Tensor,
        cache: Option<&AttentionCache>,
        train: bool,
    ) -> Result<BlockOutput> {
        let normed = self.ln1.forward(hidden)?;
        let (attended, attention_cache) = self
            .attn
            .forward(&normed, cache, train)
            .map_err(|e| Error::Msg(e.to_string()))?;
        let hidden = (hidden + attended)?;

        let normed = self.ln2.forward(&hidden)?;
        let (ffn_out, moe_cache) = self.ffn.forward(&normed, input_ids, train)?;
        Ok(BlockOutput {
            hidden: (hidden + ffn_out)?,
            attention_cache,
            moe_cache,
        })
    }
}
