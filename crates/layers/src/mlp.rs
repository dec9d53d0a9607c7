//! Position-wise feed-forward blocks built on Candle linear projections.
//!
//! An MLP expands the hidden dimension to `config.intermediate_size`, applies
//! an activation, contracts back to the model hidden size and finally applies
//! dropout. Inputs may be `(tokens, hidden)` or `(batch, seq, hidden)`; the
//! output has the same layout.
//!
//! The same block is the unit of computation for each expert of a
//! mixture-of-experts layer, which is why the projections can also be built
//! directly from weight tensors (see [`FeedForward::from_weights`]).

use candle_core::{Error, Result, Tensor};
use candle_nn::{Dropout, Linear, Module, VarBuilder};

use crate::{activations::ActivationKind, checks};

/// Configuration shared by transformer feed-forward networks.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedForwardConfig {
    pub hidden_size: usize,
    /// Width of the activation space.
    pub intermediate_size: usize,
    pub activation: ActivationKind,
    /// Dropout probability applied to the block output while training.
    pub dropout: f32,
}

impl FeedForwardConfig {
    /// Creates a standard two-projection MLP configuration without dropout.
    pub fn new(hidden_size: usize, intermediate_size: usize, activation: ActivationKind) -> Self {
        Self {
            hidden_size,
            intermediate_size,
            activation,
            dropout: 0.0,
        }
    }

    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.hidden_size == 0 || self.intermediate_size == 0 {
            return Err(Error::Msg(format!(
                "feed-forward dimensions must be positive (hidden={}, intermediate={})",
                self.hidden_size, self.intermediate_size
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::Msg(format!(
                "feed-forward dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        Ok(())
    }
}

/// Shared interface for feed-forward stacks.
pub trait FeedForwardLayer: Send + Sync {
    /// Configuration metadata used during block assembly.
    fn config(&self) -> &FeedForwardConfig;

    /// Performs the forward pass through the MLP.
    fn forward(&self, hidden: &Tensor, train: bool) -> Result<Tensor>;
}

/// Up-projection, activation, down-projection, dropout.
#[derive(Debug, Clone)]
pub struct FeedForward {
    config: FeedForwardConfig,
    up: Linear,
    down: Linear,
    dropout: Dropout,
}

impl FeedForward {
    /// Registers `up.{weight,bias}` and `down.{weight,bias}` under `vb`.
    pub fn new(config: FeedForwardConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let up = candle_nn::linear(config.hidden_size, config.intermediate_size, vb.pp("up"))?;
        let down = candle_nn::linear(config.intermediate_size, config.hidden_size, vb.pp("down"))?;
        let dropout = Dropout::new(config.dropout);
        Ok(Self {
            config,
            up,
            down,
            dropout,
        })
    }

    /// Builds the block from explicit parameters laid out as Candle linear
    /// weights: `up_weight` is `(intermediate, hidden)`, `down_weight` is
    /// `(hidden, intermediate)`.
    pub fn from_weights(
        config: FeedForwardConfig,
        up_weight: Tensor,
        up_bias: Tensor,
        down_weight: Tensor,
        down_bias: Tensor,
    ) -> Result<Self> {
        config.validate()?;
        let (hidden, intermediate) = (config.hidden_size, config.intermediate_size);
        checks::expect_shape("up_weight", &up_weight, &[intermediate, hidden])?;
        checks::expect_shape("up_bias", &up_bias, &[intermediate])?;
        checks::expect_shape("down_weight", &down_weight, &[hidden, intermediate])?;
        checks::expect_shape("down_bias", &down_bias, &[hidden])?;
        let dropout = Dropout::new(config.dropout);
        Ok(Self {
            config,
            up: Linear::new(up_weight, Some(up_bias)),
            down: Linear::new(down_weight, Some(down_bias)),
            dropout,
        })
    }

    pub fn up(&self) -> &Linear {
        &self.up
    }

    pub fn down(&self) -> &Linear {
        &self.down
    }
}

impl FeedForwardLayer for FeedForward {
    fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, train: bool) -> Result<Tensor> {
        checks::expect_last_dim("feed_forward.input", hidden, self.config.hidden_size)?;
        let expanded = self.up.forward(hidden)?;
        let activated = crate::activations::apply(self.config.activation, &expanded)?;
        let contracted = self.down.forward(&activated)?;
        self.dropout.forward(&contracted, train)
    }
}
