//! Normalisation layers with learnable parameters registered through a
//! [`VarBuilder`].
//!
//! [`LayerNorm`] and [`RmsNorm`] normalise along the last axis and accept any
//! leading layout (`(tokens, hidden)` or `(batch, seq, hidden)`).
//! [`BatchNorm2d`] normalises each channel of a `(batch, channels, height,
//! width)` tensor across the batch and spatial axes and tracks running
//! statistics for evaluation.

use std::sync::Mutex;

use candle_core::{DType, Error, Result, Tensor, D};
use candle_nn::{Init, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::checks;

/// Available normalisation strategies for transformer blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormKind {
    /// Standard LayerNorm with learnable affine parameters.
    #[default]
    LayerNorm,
    /// RMSNorm variant without mean centering or bias.
    RmsNorm,
}

/// Configuration shared by the last-axis normalisation layers.
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    pub hidden_size: usize,
    /// Numeric stabiliser applied to variance or RMS computations.
    pub epsilon: f64,
    pub kind: NormKind,
    /// Whether post-normalisation affine parameters should be trained.
    pub elementwise_affine: bool,
}

impl NormConfig {
    /// Creates a configuration using defaults aligned with transformer blocks.
    pub fn new(hidden_size: usize, kind: NormKind) -> Self {
        Self {
            hidden_size,
            epsilon: 1e-5,
            kind,
            elementwise_affine: true,
        }
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }
}

/// Shared interface for normalisation layers used inside transformer blocks.
pub trait NormalizationLayer: Send + Sync + std::fmt::Debug {
    fn config(&self) -> &NormConfig;

    /// Applies the normalisation to a hidden state tensor.
    fn forward(&self, hidden: &Tensor) -> Result<Tensor>;
}

#[derive(Debug, Clone)]
struct NormImpl {
    config: NormConfig,
    weight: Option<Tensor>,
    bias: Option<Tensor>,
}

impl NormImpl {
    fn load(config: NormConfig, vb: VarBuilder) -> Result<Self> {
        if config.hidden_size == 0 {
            return Err(Error::Msg("norm hidden_size must be positive".into()));
        }
        let (weight, bias) = if config.elementwise_affine {
            let weight = vb.get_with_hints(config.hidden_size, "weight", Init::Const(1.0))?;
            let bias = match config.kind {
                NormKind::LayerNorm => {
                    Some(vb.get_with_hints(config.hidden_size, "bias", Init::Const(0.0))?)
                }
                NormKind::RmsNorm => None,
            };
            (Some(weight), bias)
        } else {
            (None, None)
        };
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        checks::expect_last_dim("norm.input", hidden, self.config.hidden_size)?;

        let hidden_size = self.config.hidden_size as f64;
        let dtype = hidden.dtype();
        let mut compute = hidden.to_dtype(DType::F32)?;

        if matches!(self.config.kind, NormKind::LayerNorm) {
            let mean = (compute.sum_keepdim(D::Minus1)? / hidden_size)?;
            compute = compute.broadcast_sub(&mean)?;
        }

        let variance = (compute.sqr()?.sum_keepdim(D::Minus1)? / hidden_size)?;
        let denom = (variance + self.config.epsilon)?.sqrt()?;
        let mut normalized = compute.broadcast_div(&denom)?.to_dtype(dtype)?;

        if let Some(weight) = &self.weight {
            normalized = normalized.broadcast_mul(&weight.to_dtype(dtype)?)?;
        }
        if let Some(bias) = &self.bias {
            normalized = normalized.broadcast_add(&bias.to_dtype(dtype)?)?;
        }
        Ok(normalized)
    }
}

/// Standard LayerNorm implementation with optional affine parameters.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    inner: NormImpl,
}

impl LayerNorm {
    /// Registers `weight` (ones) and `bias` (zeros) under `vb` when affine.
    pub fn new(mut config: NormConfig, vb: VarBuilder) -> Result<Self> {
        config.kind = NormKind::LayerNorm;
        Ok(Self {
            inner: NormImpl::load(config, vb)?,
        })
    }
}

impl NormalizationLayer for LayerNorm {
    fn config(&self) -> &NormConfig {
        &self.inner.config
    }

    fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        self.inner.forward(hidden)
    }
}

/// Root mean square norm with a learnable scale.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    inner: NormImpl,
}

impl RmsNorm {
    pub fn new(mut config: NormConfig, vb: VarBuilder) -> Result<Self> {
        config.kind = NormKind::RmsNorm;
        Ok(Self {
            inner: NormImpl::load(config, vb)?,
        })
    }
}

impl NormalizationLayer for RmsNorm {
    fn config(&self) -> &NormConfig {
        &self.inner.config
    }

    fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        self.inner.forward(hidden)
    }
}

/// Builds the normalisation selected by `config.kind`.
pub fn build_norm(config: NormConfig, vb: VarBuilder) -> Result<Box<dyn NormalizationLayer>> {
    Ok(match config.kind {
        NormKind::LayerNorm => Box::new(LayerNorm::new(config, vb)?),
        NormKind::RmsNorm => Box::new(RmsNorm::new(config, vb)?),
    })
}

/// Per-channel batch normalisation for `(batch, channels, height, width)`
/// inputs.
///
/// In training mode the batch mean and biased variance over `(0, 2, 3)` are
/// used and folded into the running statistics with `momentum`. In evaluation
/// mode the running statistics are used instead. The normaliser is
/// `sqrt(var) + epsilon`, so `epsilon` bounds the denominator away from zero
/// rather than the variance.
#[derive(Debug)]
pub struct BatchNorm2d {
    num_features: usize,
    epsilon: f64,
    momentum: f64,
    weight: Tensor,
    bias: Tensor,
    running: Mutex<RunningStats>,
}

#[derive(Debug, Clone)]
struct RunningStats {
    mean: Vec<f32>,
    var: Vec<f32>,
    batches_tracked: u64,
}

impl BatchNorm2d {
    pub fn new(num_features: usize, epsilon: f64, momentum: f64, vb: VarBuilder) -> Result<Self> {
        if num_features == 0 {
            return Err(Error::Msg("batch norm requires at least one channel".into()));
        }
        if !(0.0..=1.0).contains(&momentum) {
            return Err(Error::Msg(format!(
                "batch norm momentum must be in [0, 1], got {momentum}"
            )));
        }
        Ok(Self {
            num_features,
            epsilon,
            momentum,
            weight: vb.get_with_hints(num_features, "weight", Init::Const(1.0))?,
            bias: vb.get_with_hints(num_features, "bias", Init::Const(0.0))?,
            running: Mutex::new(RunningStats {
                mean: vec![0.0; num_features],
                var: vec![1.0; num_features],
                batches_tracked: 0,
            }),
        })
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn running_mean(&self) -> Result<Vec<f32>> {
        Ok(self.lock_running()?.mean.clone())
    }

    pub fn running_var(&self) -> Result<Vec<f32>> {
        Ok(self.lock_running()?.var.clone())
    }

    pub fn batches_tracked(&self) -> Result<u64> {
        Ok(self.lock_running()?.batches_tracked)
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (_batch, channels, _height, _width) = x.dims4()?;
        if channels != self.num_features {
            return Err(Error::Msg(format!(
                "batch norm expected {} channels, got {}",
                self.num_features, channels
            )));
        }
        let device = x.device();
        let per_channel = (1, channels, 1, 1);

        let (mean, var) = if train {
            let mean = x.mean_keepdim(0)?.mean_keepdim(2)?.mean_keepdim(3)?;
            let centered = x.broadcast_sub(&mean)?;
            let var = centered
                .sqr()?
                .mean_keepdim(0)?
                .mean_keepdim(2)?
                .mean_keepdim(3)?;
            self.update_running(&mean, &var)?;
            (mean, var)
        } else {
            let running = self.lock_running()?;
            (
                Tensor::from_slice(&running.mean, per_channel, device)?.to_dtype(x.dtype())?,
                Tensor::from_slice(&running.var, per_channel, device)?.to_dtype(x.dtype())?,
            )
        };

        let denom = (var.sqrt()? + self.epsilon)?;
        let normalized = x.broadcast_sub(&mean)?.broadcast_div(&denom)?;
        normalized
            .broadcast_mul(&self.weight.reshape(per_channel)?)?
            .broadcast_add(&self.bias.reshape(per_channel)?)
    }

    fn update_running(&self, mean: &Tensor, var: &Tensor) -> Result<()> {
        let batch_mean = mean.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        let batch_var = var.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        let momentum = self.momentum as f32;
        let mut running = self.lock_running()?;
        for (slot, value) in running.mean.iter_mut().zip(batch_mean) {
            *slot = (1.0 - momentum) * *slot + momentum * value;
        }
        for (slot, value) in running.var.iter_mut().zip(batch_var) {
            *slot = (1.0 - momentum) * *slot + momentum * value;
        }
        running.batches_tracked += 1;
        Ok(())
    }

    fn lock_running(&self) -> Result<std::sync::MutexGuard<'_, RunningStats>> {
        self.running
            .lock()
            .map_err(|_| Error::Msg("batch norm running statistics poisoned".into()))
    }
}
