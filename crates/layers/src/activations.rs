//! Activation catalogue for transformer and expert feed-forward stacks.
//!
//! Activations are shape preserving and run in the dtype of their input.
//!
//! # Built-in formulas
//!
//! * **ReLU** zeroes negative values.
//! * **GELU** uses the erf form `0.5 * x * (1 + erf(x / sqrt(2)))`.
//! * **NewGELU** uses the tanh approximation popularised by GPT-2,
//!   `0.5 * x * (1 + tanh(sqrt(2 / pi) * (x + 0.044715 * x^3)))`.
//! * **SiLU / Swish** computes `x * sigmoid(x)`.

use std::{fmt, str::FromStr, sync::Arc};

use candle_core::{Error, Result, Tensor};
use serde::{Deserialize, Serialize};

/// Identifies which non-linearity is implemented by an [`Activation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    Relu,
    /// Exact (erf based) GELU.
    #[default]
    Gelu,
    /// GELU with the tanh approximation used by GPT style models.
    NewGelu,
    Silu,
}

impl ActivationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivationKind::Relu => "relu",
            ActivationKind::Gelu => "gelu",
            ActivationKind::NewGelu => "new_gelu",
            ActivationKind::Silu => "silu",
        }
    }
}

impl fmt::Display for ActivationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivationKind {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "relu" => Ok(ActivationKind::Relu),
            "gelu" => Ok(ActivationKind::Gelu),
            "new_gelu" | "gelu_new" | "gelu_tanh" => Ok(ActivationKind::NewGelu),
            "silu" | "swish" => Ok(ActivationKind::Silu),
            other => Err(Error::Msg(format!("unknown activation '{other}'"))),
        }
    }
}

/// Common interface shared by activation functions.
pub trait Activation: Send + Sync {
    /// Returns the [`ActivationKind`] for introspection when wiring composite blocks.
    fn kind(&self) -> ActivationKind;

    fn forward(&self, input: &Tensor) -> Result<Tensor>;
}

/// Built-in activation backed by Candle kernels.
struct BuiltinActivation {
    kind: ActivationKind,
}

impl Activation for BuiltinActivation {
    fn kind(&self) -> ActivationKind {
        self.kind
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        apply(self.kind, input)
    }
}

/// Returns a shared built-in activation implementation.
pub fn builtin(kind: ActivationKind) -> Arc<dyn Activation> {
    Arc::new(BuiltinActivation { kind })
}

/// Applies `kind` to `input` without allocating a trait object.
pub fn apply(kind: ActivationKind, input: &Tensor) -> Result<Tensor> {
    match kind {
        ActivationKind::Relu => input.relu(),
        ActivationKind::Gelu => input.gelu_erf(),
        ActivationKind::NewGelu => input.gelu(),
        ActivationKind::Silu => input.silu(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use std::f64::consts::{PI, SQRT_2};

    fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        a.sub(b)?.abs()?.max_all()?.to_vec0::<f32>()
    }

    #[test]
    fn gelu_matches_reference_formula() -> Result<()> {
        let device = Device::Cpu;
        let activation = builtin(ActivationKind::Gelu);
        let input = Tensor::from_slice(&[-2.5f32, -0.5, 0.0, 1.0, 3.0], (5,), &device)?;
        let output = activation.forward(&input)?;

        let reference = {
            let scaled = input.affine(1.0 / SQRT_2, 0.0)?;
            let inner = (scaled.erf()? + 1.0)?;
            input.affine(0.5, 0.0)?.mul(&inner)?
        };

        assert!(max_diff(&output, &reference)? < 5e-6);
        Ok(())
    }

    #[test]
    fn new_gelu_matches_tanh_approximation() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::from_slice(&[-3.0f32, -1.0, 0.0, 0.25, 2.0], (5,), &device)?;
        let output = apply(ActivationKind::NewGelu, &input)?;

        let cubic = input.powf(3.0)?.affine(0.044715, 0.0)?;
        let inner = (input.clone() + cubic)?.affine((2.0 / PI).sqrt(), 0.0)?;
        let reference = input
            .affine(0.5, 0.0)?
            .mul(&(inner.tanh()? + 1.0)?)?;

        assert!(max_diff(&output, &reference)? < 1e-5);
        Ok(())
    }

    #[test]
    fn relu_zeroes_negatives() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::from_slice(&[-2.0f32, -0.0, 0.5, 4.0], (4,), &device)?;
        let output = apply(ActivationKind::Relu, &input)?.to_vec1::<f32>()?;
        assert_eq!(output, vec![0.0, 0.0, 0.5, 4.0]);
        Ok(())
    }

    #[test]
    fn silu_matches_swish_reference() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::from_slice(&[-3.0f32, -1.0, 0.0, 0.5, 2.0], (5,), &device)?;
        let output = builtin(ActivationKind::Silu).forward(&input)?;

        let sigmoid = (input.neg()?.exp()? + 1.0)?.recip()?;
        let reference = input.mul(&sigmoid)?;
        assert!(max_diff(&output, &reference)? < 5e-6);
        assert_eq!(output.dtype(), DType::F32);
        Ok(())
    }

    #[test]
    fn parses_config_strings() -> Result<()> {
        assert_eq!("relu".parse::<ActivationKind>()?, ActivationKind::Relu);
        assert_eq!("new_gelu".parse::<ActivationKind>()?, ActivationKind::NewGelu);
        assert_eq!("GELU".parse::<ActivationKind>()?, ActivationKind::Gelu);
        assert!("tanh".parse::<ActivationKind>().is_err());
        Ok(())
    }
}
