//! Additive positional masks shared by attention implementations.
//!
//! All masks produced here have dtype `f32` and shape
//! `[1, heads, q_len, k_len]` (`heads` is 1 for the plain causal mask) so they
//! broadcast over the batch. Entries are `0.0` or a finite penalty where
//! attention is permitted and `f32::NEG_INFINITY` where it is not.
//!
//! When `k_len > q_len` the queries are aligned with the most recent `q_len`
//! keys, which is the situation during cached decoding.

pub mod alibi;
pub mod causal;

use candle_core::DType;

/// Dtype shared by all additive masks.
pub const MASK_DTYPE: DType = DType::F32;

pub use alibi::{alibi_slopes, build_alibi_bias};
pub use causal::build_causal_mask;

#[cfg(test)]
mod tests;
