//! Building blocks for transformer layers.
//!
//! The crate hosts the activation catalogue, normalisation layers and the
//! position-wise feed-forward block that doubles as the expert network of the
//! mixture-of-experts layers. Parameters are registered through
//! `candle_nn::VarBuilder` so that every weight is a trainable variable.

pub mod activations;
pub mod checks;
pub mod mlp;
pub mod norm;

pub use activations::ActivationKind;
pub use mlp::{FeedForward, FeedForwardConfig, FeedForwardLayer};
pub use norm::{BatchNorm2d, LayerNorm, NormConfig, NormKind, NormalizationLayer, RmsNorm};
