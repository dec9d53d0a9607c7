//! Scatter of weighted expert outputs back into token order.

use candle_core::{DType, Device, Tensor};

use crate::assignment::ExpertDispatch;
use crate::error::Result;
use crate::experts::ExpertBank;

/// Accumulates expert outputs into a `[tokens, hidden]` buffer that starts at
/// zero, so tokens no expert processed come out as zero.
#[derive(Debug, Clone)]
pub struct Combiner {
    acc: Tensor,
}

impl Combiner {
    pub fn new(num_tokens: usize, hidden_size: usize, dtype: DType, device: &Device) -> Result<Self> {
        Ok(Self {
            acc: Tensor::zeros((num_tokens, hidden_size), dtype, device)?,
        })
    }

    /// Adds `expert_out[i] * weights[i]` to row `tokens[i]`.
    pub fn accumulate(&mut self, tokens: &Tensor, expert_out: &Tensor, weights: &Tensor) -> Result<()> {
        let scaled = expert_out.broadcast_mul(&weights.unsqueeze(1)?)?;
        self.acc = self.acc.index_add(tokens, &scaled, 0)?;
        Ok(())
    }

    pub fn finish(self) -> Tensor {
        self.acc
    }
}

/// Runs every expert on its share of `tokens` and combines the weighted
/// results. `gates` is read by flat position as recorded in `plan`.
pub fn dispatch_and_combine(
    bank: &ExpertBank,
    tokens: &Tensor,
    gates: &Tensor,
    plan: &[ExpertDispatch],
    train: bool,
) -> Result<Tensor> {
    let (num_tokens, hidden) = tokens.dims2()?;
    let device = tokens.device();
    let flat_gates = gates.flatten_all()?.to_dtype(tokens.dtype())?;
    let mut combiner = Combiner::new(num_tokens, hidden, tokens.dtype(), device)?;
    for entry in plan {
        let count = entry.tokens.len();
        let token_ids = Tensor::from_vec(entry.tokens.clone(), count, device)?;
        let positions = Tensor::from_vec(entry.gate_positions.clone(), count, device)?;
        let inputs = tokens.index_select(&token_ids, 0)?;
        let outputs = bank.apply(entry.expert, &inputs, train)?;
        let weights = flat_gates.index_select(&positions, 0)?;
        combiner.accumulate(&token_ids, &outputs, &weights)?;
    }
    Ok(combiner.finish())
}
