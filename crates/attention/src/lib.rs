//! Causal self-attention primitives for the MoE transformer.
//!
//! Query, key and value tensors use the layout `[batch, n_heads, seq_len,
//! head_dim]`; the output mirrors the query layout and dtype. Positional
//! information is supplied as an additive bias: either a plain causal mask or
//! the ALiBi linear distance penalty, both shaped `[1, n_heads|1, q_len,
//! k_len]`.
//!
//! [`UnidirectionalAttention`] wraps the projections around the kernel and
//! threads an [`AttentionCache`] through autoregressive decoding so that each
//! step only projects the newest tokens.
//!
//! Dropout is an optional, train-only concern controlled via [`Config`].

pub mod core;
pub mod kv_cache;
pub mod masks;
pub mod reference;
pub mod unidirectional;

pub use core::{Attention, AttentionError, Config};
pub use kv_cache::{AttentionCache, KeyValueCache};
pub use reference::ExactAttention;
pub use unidirectional::{PositionalBias, UnidirectionalAttention, UnidirectionalConfig};
