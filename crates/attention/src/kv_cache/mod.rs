//! Key/value caching for autoregressive decoding.
//!
//! A cache holds the projected keys and values of every position processed so
//! far, laid out as `[batch, n_heads, len, head_dim]`. Each decoding step
//! appends the projections of the new tokens along the sequence axis and
//! attends over the full cached prefix.

use candle_core::Tensor;

use crate::core::AttentionError;

/// Abstract cache capable of storing projected keys and values across steps.
pub trait KeyValueCache {
    /// Append a new slice of keys and values along the sequence axis.
    fn append(&mut self, k: &Tensor, v: &Tensor) -> Result<(), AttentionError>;

    /// Number of cached positions.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn keys(&self) -> &Tensor;

    fn values(&self) -> &Tensor;
}

/// Per-layer cache produced by [`UnidirectionalAttention`](crate::UnidirectionalAttention).
#[derive(Debug, Clone)]
pub struct AttentionCache {
    keys: Tensor,
    values: Tensor,
}

impl AttentionCache {
    pub fn new(keys: Tensor, values: Tensor) -> Result<Self, AttentionError> {
        let k_dims = keys.dims4()?;
        let v_dims = values.dims4()?;
        if k_dims != v_dims {
            return Err(AttentionError::shape(format!(
                "cached keys {k_dims:?} and values {v_dims:?} must share a shape"
            )));
        }
        Ok(Self { keys, values })
    }

    /// Returns a cache extended with `k`/`v` without mutating `self`.
    pub fn extended(&self, k: &Tensor, v: &Tensor) -> Result<Self, AttentionError> {
        let mut next = self.clone();
        next.append(k, v)?;
        Ok(next)
    }
}

impl KeyValueCache for AttentionCache {
    fn append(&mut self, k: &Tensor, v: &Tensor) -> Result<(), AttentionError> {
        let (b, h, _, d) = self.keys.dims4()?;
        let (kb, kh, _, kd) = k.dims4()?;
        if (kb, kh, kd) != (b, h, d) || k.dims() != v.dims() {
            return Err(AttentionError::shape(format!(
                "cannot append k {:?} / v {:?} to cache of [{b}, {h}, _, {d}]",
                k.dims(),
                v.dims()
            )));
        }
        self.keys = Tensor::cat(&[&self.keys, k], 2)?;
        self.values = Tensor::cat(&[&self.values, v], 2)?;
        Ok(())
    }

    fn len(&self) -> usize {
        self.keys.dims()[2]
    }

    fn keys(&self) -> &Tensor {
        &self.keys
    }

    fn values(&self) -> &Tensor {
        &self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn append_grows_sequence_axis() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let k = Tensor::rand(0f32, 1.0, (2, 3, 4, 8), &device)?;
        let v = Tensor::rand(0f32, 1.0, (2, 3, 4, 8), &device)?;
        let mut cache = AttentionCache::new(k.clone(), v)?;
        assert_eq!(cache.len(), 4);

        let step_k = Tensor::ones((2, 3, 1, 8), DType::F32, &device)?;
        let step_v = Tensor::zeros((2, 3, 1, 8), DType::F32, &device)?;
        cache.append(&step_k, &step_v)?;
        assert_eq!(cache.len(), 5);
        assert_eq!(cache.keys().dims(), &[2, 3, 5, 8]);

        let prefix = cache.keys().narrow(2, 0, 4)?;
        let diff = prefix.sub(&k)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn extended_leaves_original_untouched() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let base = Tensor::zeros((1, 2, 3, 4), DType::F32, &device)?;
        let cache = AttentionCache::new(base.clone(), base)?;
        let step = Tensor::ones((1, 2, 2, 4), DType::F32, &device)?;
        let grown = cache.extended(&step, &step)?;
        assert_eq!(cache.len(), 3);
        assert_eq!(grown.len(), 5);
        Ok(())
    }

    #[test]
    fn rejects_mismatched_heads() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let base = Tensor::zeros((1, 2, 3, 4), DType::F32, &device)?;
        let mut cache = AttentionCache::new(base.clone(), base)?;
        let wrong = Tensor::zeros((1, 3, 1, 4), DType::F32, &device)?;
        assert!(cache.append(&wrong, &wrong).is_err());
        assert!(!cache.is_empty());
        Ok(())
    }
}
