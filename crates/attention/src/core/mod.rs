//! Core traits and types shared across attention implementations.
//!
//! Implementations operate on tensors with layout
//! `[batch, n_heads, seq_len, head_dim]`. The output tensor mirrors the query
//! layout.

pub mod config;
pub mod errors;

use candle_core::Tensor;

pub use config::Config;
pub use errors::AttentionError;

/// Unified interface for attention kernels.
///
/// * `q` is `[batch, n_heads, q_len, head_dim]`; `k` and `v` are
///   `[batch, n_heads, k_len, head_dim]` with `k_len >= q_len` when a cache
///   prefix is present.
/// * `bias`, when present, is additive and must broadcast to
///   `[batch, n_heads, q_len, k_len]` (leading dims may be 1).
/// * Dropout from [`Config::dropout_p`] is only applied when `train` is set.
pub trait Attention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        bias: Option<&Tensor>,
        config: &Config,
        train: bool,
    ) -> Result<Tensor, AttentionError>;
}
