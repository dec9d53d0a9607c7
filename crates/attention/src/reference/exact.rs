//! Reference scaled dot-product attention.
//!
//! The exact path prioritises numerical fidelity: scores are computed in
//! `f32`, the additive bias is applied before a max-subtracted softmax and the
//! output is cast back to the query dtype. Every operation is differentiable
//! through Candle's autograd.

use std::sync::OnceLock;

use candle_core::{DType, Tensor, D};
use candle_nn::ops::{dropout, softmax};

use crate::core::{Attention, AttentionError, Config};
use crate::masks::MASK_DTYPE;

/// Numerically stable, portable attention kernel.
#[derive(Debug, Default)]
pub struct ExactAttention {
    first_call: OnceLock<()>,
}

impl ExactAttention {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Attention for ExactAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        bias: Option<&Tensor>,
        config: &Config,
        train: bool,
    ) -> Result<Tensor, AttentionError> {
        if self.first_call.set(()).is_ok() {
            log::debug!(
                "attention::reference init device={:?} dtype={:?} dropout={:?}",
                q.device().location(),
                q.dtype(),
                config.dropout_p
            );
        }

        let device = q.device();
        if !device.same_device(k.device()) || !device.same_device(v.device()) {
            return Err(AttentionError::shape("q, k, v must reside on the same device"));
        }

        let dtype = q.dtype();
        if dtype != k.dtype() || dtype != v.dtype() {
            return Err(AttentionError::shape("q, k, v must share the same dtype"));
        }
        if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{dtype:?}"),
            });
        }

        let (batch, heads, q_len, head_dim) = q
            .dims4()
            .map_err(|_| AttentionError::shape("q must have shape [batch, heads, seq_len, head_dim]"))?;
        let (kb, kh, k_len, kd) = k
            .dims4()
            .map_err(|_| AttentionError::shape("k must have shape [batch, heads, seq_len, head_dim]"))?;
        let (vb, vh, vk, vd) = v
            .dims4()
            .map_err(|_| AttentionError::shape("v must have shape [batch, heads, seq_len, head_dim]"))?;

        if kb != batch || kh != heads || kd != head_dim {
            return Err(AttentionError::shape(format!(
                "k shape mismatch: expected [{batch}, {heads}, ?, {head_dim}] got [{kb}, {kh}, {k_len}, {kd}]"
            )));
        }
        if vb != batch || vh != heads || vk != k_len || vd != head_dim {
            return Err(AttentionError::shape(format!(
                "v shape mismatch: expected [{batch}, {heads}, {k_len}, {head_dim}] got [{vb}, {vh}, {vk}, {vd}]"
            )));
        }
        if k_len < q_len {
            return Err(AttentionError::shape(format!(
                "key length {k_len} shorter than query length {q_len}"
            )));
        }

        let q_work = q.to_dtype(DType::F32)?.contiguous()?;
        let k_work = k.to_dtype(DType::F32)?.contiguous()?;
        let v_work = v.to_dtype(DType::F32)?.contiguous()?;

        let scale = 1.0 / (head_dim as f64).sqrt();
        let mut scores = q_work
            .matmul(&k_work.transpose(2, 3)?.contiguous()?)?
            .affine(scale, 0.0)?;

        if let Some(bias) = bias {
            if bias.dtype() != MASK_DTYPE {
                return Err(AttentionError::UnsupportedDType {
                    requested: format!("bias expects dtype {MASK_DTYPE:?}, got {:?}", bias.dtype()),
                });
            }
            let (mb, mh, mq, mk) = bias
                .dims4()
                .map_err(|_| AttentionError::shape("bias must have shape [batch|1, heads|1, q_len, k_len]"))?;
            if (mb != 1 && mb != batch) || (mh != 1 && mh != heads) || mq != q_len || mk != k_len {
                return Err(AttentionError::shape(format!(
                    "bias shape mismatch: expected [1|{batch}, 1|{heads}, {q_len}, {k_len}] got [{mb}, {mh}, {mq}, {mk}]"
                )));
            }
            scores = scores.broadcast_add(&bias.to_device(device)?)?;
        }

        let mut probs = softmax(&scores, D::Minus1)?;
        if train {
            if let Some(p) = config.dropout_p {
                if !(0.0..1.0).contains(&p) {
                    return Err(AttentionError::Backend {
                        message: format!("dropout probability must be in [0, 1), got {p}"),
                    });
                }
                if p > 0.0 {
                    probs = dropout(&probs, p)?;
                }
            }
        }

        Ok(probs.matmul(&v_work)?.to_dtype(dtype)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masks::{alibi_slopes, build_alibi_bias, build_causal_mask};
    use candle_core::{Device, Result as CandleResult};

    fn build_inputs(device: &Device) -> CandleResult<(Tensor, Tensor, Tensor)> {
        let data: Vec<f32> = (0..64).map(|i| ((i * 7 % 13) as f32) * 0.05).collect();
        let q = Tensor::from_vec(data.clone(), (1, 2, 4, 8), device)?;
        let k = Tensor::from_vec(data.iter().rev().copied().collect::<Vec<_>>(), (1, 2, 4, 8), device)?;
        let v = Tensor::from_vec(data, (1, 2, 4, 8), device)?;
        Ok((q, k, v))
    }

    fn naive_attention(q: &Tensor, k: &Tensor, v: &Tensor, bias: &Tensor) -> CandleResult<Tensor> {
        let (batch, heads, q_len, head_dim) = q.dims4()?;
        let (_, _, k_len, _) = k.dims4()?;
        let bias = bias
            .broadcast_as((batch, heads, q_len, k_len))?
            .contiguous()?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let q_vec = q.flatten_all()?.to_vec1::<f32>()?;
        let k_vec = k.flatten_all()?.to_vec1::<f32>()?;
        let v_vec = v.flatten_all()?.to_vec1::<f32>()?;
        let scale = 1.0 / (head_dim as f32).sqrt();
        let mut output = vec![0f32; batch * heads * q_len * head_dim];

        for bh in 0..batch * heads {
            for qi in 0..q_len {
                let row: Vec<f32> = (0..k_len)
                    .map(|ki| {
                        let dot: f32 = (0..head_dim)
                            .map(|d| {
                                q_vec[(bh * q_len + qi) * head_dim + d]
                                    * k_vec[(bh * k_len + ki) * head_dim + d]
                            })
                            .sum();
                        dot * scale + bias[(bh * q_len + qi) * k_len + ki]
                    })
                    .collect();
                let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let weights: Vec<f32> = row.iter().map(|s| (s - max).exp()).collect();
                let denom: f32 = weights.iter().sum();
                for d in 0..head_dim {
                    output[(bh * q_len + qi) * head_dim + d] = (0..k_len)
                        .map(|ki| weights[ki] / denom * v_vec[(bh * k_len + ki) * head_dim + d])
                        .sum();
                }
            }
        }
        Tensor::from_vec(output, (batch, heads, q_len, head_dim), q.device())
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> CandleResult<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()
    }

    #[test]
    fn exact_attention_matches_naive_with_causal_mask() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let mask = build_causal_mask(&device, 4, 4)?;
        let output = ExactAttention::new().attend(&q, &k, &v, Some(&mask), &Config::default(), false)?;
        let expected = naive_attention(&q, &k, &v, &mask)?;
        assert!(max_diff(&output, &expected)? < 1e-4);
        Ok(())
    }

    #[test]
    fn exact_attention_matches_naive_with_alibi() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let bias = build_alibi_bias(&device, &alibi_slopes(2), 4, 4)?;
        let output = ExactAttention::new().attend(&q, &k, &v, Some(&bias), &Config::default(), false)?;
        let expected = naive_attention(&q, &k, &v, &bias)?;
        assert!(max_diff(&output, &expected)? < 1e-4);
        Ok(())
    }

    #[test]
    fn mismatched_shapes_error() -> CandleResult<()> {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 4, 8), DType::F32, &device)?;
        let k = Tensor::zeros((1, 2, 5, 8), DType::F32, &device)?;
        let v = Tensor::zeros((1, 2, 4, 8), DType::F32, &device)?;
        let err = ExactAttention::new()
            .attend(&q, &k, &v, None, &Config::default(), false)
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
        Ok(())
    }

    #[test]
    fn bias_shape_validation() -> CandleResult<()> {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 4, 8), DType::F32, &device)?;
        let bias = Tensor::zeros((1, 3, 4, 4), DType::F32, &device)?;
        let err = ExactAttention::new()
            .attend(&q, &q, &q, Some(&bias), &Config::default(), false)
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
        Ok(())
    }

    #[test]
    fn reduced_precision_inputs_track_f32() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let mask = build_causal_mask(&device, 4, 4)?;
        let reference = ExactAttention::new().attend(&q, &k, &v, Some(&mask), &Config::default(), false)?;
        for dtype in [DType::BF16, DType::F16] {
            let out = ExactAttention::new().attend(
                &q.to_dtype(dtype)?,
                &k.to_dtype(dtype)?,
                &v.to_dtype(dtype)?,
                Some(&mask),
                &Config::default(),
                false,
            )?;
            assert_eq!(out.dtype(), dtype);
            let diff = max_diff(&out, &reference)?;
            assert!(diff < 5e-2, "dtype {dtype:?} diverged by {diff}");
        }
        Ok(())
    }

    #[test]
    fn numerical_stability() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let q = Tensor::full(10_000.0f32, (1, 1, 4, 4), &device)?;
        let k = Tensor::full(-10_000.0f32, (1, 1, 4, 4), &device)?;
        let v = Tensor::ones((1, 1, 4, 4), DType::F32, &device)?;
        let out = ExactAttention::new()
            .attend(&q, &k, &v, None, &Config::default(), false)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        assert!(out.iter().all(|value| value.is_finite()));
        Ok(())
    }

    #[test]
    fn dropout_ignored_outside_training() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let mask = build_causal_mask(&device, 4, 4)?;
        let with_dropout = ExactAttention::new().attend(&q, &k, &v, Some(&mask), &Config::with_dropout(0.5), false)?;
        let reference = ExactAttention::new().attend(&q, &k, &v, Some(&mask), &Config::default(), false)?;
        assert!(max_diff(&with_dropout, &reference)? < 1e-6);
        Ok(())
    }
}
