//! Attention with Linear Biases (ALiBi).
//!
//! Instead of adding positional embeddings to the token stream, ALiBi
//! penalises each attention score by the query/key distance scaled with a
//! head-specific slope: `bias[h, i, j] = -m_h * (i - j)` for `j <= i`. Keys in
//! the future are masked with `-inf` exactly like the causal mask.
//!
//! Slopes follow a geometric schedule. With at most eight heads
//! `m_h = 2^-h`; wider layers halve the decay rate, `m_h = 2^(-h / 2)`, so
//! that later heads still see a useful range.

use candle_core::{Device, Error, Result, Tensor};

/// Head slopes `m_h` for `h in 0..num_heads`.
pub fn alibi_slopes(num_heads: usize) -> Vec<f32> {
    (0..num_heads)
        .map(|h| {
            let exponent = if num_heads <= 8 {
                h as f32
            } else {
                h as f32 / 2.0
            };
            1.0 / 2f32.powf(exponent)
        })
        .collect()
}

/// Build the `[1, num_heads, q_len, k_len]` ALiBi bias for `slopes`.
pub fn build_alibi_bias(
    device: &Device,
    slopes: &[f32],
    q_len: usize,
    k_len: usize,
) -> Result<Tensor> {
    if slopes.is_empty() {
        return Err(Error::Msg("alibi bias requires at least one head".into()));
    }
    let offset = k_len.saturating_sub(q_len);
    let mut data = Vec::with_capacity(slopes.len() * q_len * k_len);
    for &slope in slopes {
        for q in 0..q_len {
            let position = q + offset;
            for k in 0..k_len {
                data.push(if k > position {
                    f32::NEG_INFINITY
                } else {
                    -slope * (position - k) as f32
                });
            }
        }
    }
    Tensor::from_vec(data, (1, slopes.len(), q_len, k_len), device)
}
