//! Lightweight validation helpers shared across layer components.
//!
//! Each routine takes a `name` used to prefix the error message so that a
//! failing check points at the tensor that was malformed. They return
//! `candle_core::Result<()>` so call sites can propagate errors without
//! panicking.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(name: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected shape {expected:?}, got {actual:?}"
        )))
    }
}

pub fn expect_rank(name: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    if tensor.rank() == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected rank {rank}, got shape {:?}",
            tensor.dims()
        )))
    }
}

/// Validates the trailing feature dimension regardless of leading layout.
pub fn expect_last_dim(name: &str, tensor: &Tensor, size: usize) -> Result<()> {
    match tensor.dims().last() {
        Some(&actual) if actual == size => Ok(()),
        _ => Err(Error::Msg(format!(
            "{name}: expected trailing dimension {size}, got {:?}",
            tensor.dims()
        ))),
    }
}

/// Validates the `(batch, seq, hidden)` convention with a known hidden size.
pub fn expect_batch_seq_hidden(name: &str, tensor: &Tensor, hidden: usize) -> Result<()> {
    match tensor.dims() {
        [_, _, actual_hidden] if *actual_hidden == hidden => Ok(()),
        dims => Err(Error::Msg(format!(
            "{name}: expected (batch, seq, {hidden}) layout, got {dims:?}"
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(name: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected dtype in {allowed:?}, got {dtype:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn shape_checks_report_tensor_name() -> Result<()> {
        let tensor = Tensor::zeros((2, 3, 4), DType::F32, &Device::Cpu)?;
        expect_shape("x", &tensor, &[2, 3, 4])?;
        expect_rank("x", &tensor, 3)?;
        expect_last_dim("x", &tensor, 4)?;
        expect_batch_seq_hidden("x", &tensor, 4)?;

        let err = expect_batch_seq_hidden("hidden", &tensor, 8).unwrap_err();
        assert!(err.to_string().contains("hidden"));
        assert!(expect_last_dim("x", &tensor, 3).is_err());
        assert!(expect_rank("x", &tensor, 2).is_err());
        Ok(())
    }

    #[test]
    fn dtype_check_accepts_listed_types() -> Result<()> {
        let tensor = Tensor::zeros(4, DType::U32, &Device::Cpu)?;
        expect_dtype_in("ids", &tensor, &[DType::U32, DType::I64])?;
        assert!(expect_dtype_in("ids", &tensor, &[DType::F32]).is_err());
        Ok(())
    }
}
