//! Assignment policies: turning routing logits into discrete selections and
//! combination weights.
//!
//! Selections are computed on host copies of the logits (indices carry no
//! gradient) while the gate values are gathered from the live tensors, so the
//! router still receives gradients through the weights.

use candle_core::{DType, Device, Tensor, D};
use candle_nn::ops::softmax;

use crate::cache::RoutingKind;
use crate::capacity::{capacity, groups, keep_within_capacity, top_indices};
use crate::error::{MoeError, Result};

/// Host-side record of which tokens each expert processes.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// Row-major `[tokens, k]` expert ids. `kept[p]` is false for pairs
    /// dropped by capacity enforcement.
    PerToken {
        k: usize,
        experts: Vec<u32>,
        kept: Vec<bool>,
    },
    /// Row-major `[experts, per_expert]` global token ids.
    PerExpert { per_expert: usize, tokens: Vec<u32> },
}

/// Work handed to one expert: the tokens it processes and, for each, the
/// flat position of its weight in the gate tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpertDispatch {
    pub expert: usize,
    pub tokens: Vec<u32>,
    pub gate_positions: Vec<u32>,
}

/// Output of an assignment policy.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub kind: RoutingKind,
    /// `[tokens, k]` for per-token policies, `[experts, per_expert]` for
    /// expert-choice.
    pub gates: Tensor,
    /// Same shape as `gates`: expert ids or token ids.
    pub indices: Tensor,
    pub selection: Selection,
}

impl Assignment {
    pub fn dispatch_plan(&self, num_experts: usize) -> Vec<ExpertDispatch> {
        let mut plan: Vec<ExpertDispatch> = (0..num_experts)
            .map(|expert| ExpertDispatch {
                expert,
                tokens: Vec::new(),
                gate_positions: Vec::new(),
            })
            .collect();
        match &self.selection {
            Selection::PerToken { k, experts, kept } => {
                for (position, (&expert, &keep)) in experts.iter().zip(kept).enumerate() {
                    if !keep {
                        continue;
                    }
                    if let Some(entry) = plan.get_mut(expert as usize) {
                        entry.tokens.push((position / k) as u32);
                        entry.gate_positions.push(position as u32);
                    }
                }
            }
            Selection::PerExpert { per_expert, tokens } => {
                for (expert, entry) in plan.iter_mut().enumerate() {
                    let start = expert * per_expert;
                    entry.tokens = tokens[start..start + per_expert].to_vec();
                    entry.gate_positions = (start as u32..(start + per_expert) as u32).collect();
                }
            }
        }
        plan.retain(|entry| !entry.tokens.is_empty());
        plan
    }

    /// Row-major `[tokens, experts]` count of dispatched (token, expert) pairs.
    pub fn dispatch_counts(&self, num_tokens: usize, num_experts: usize) -> Vec<f32> {
        let mut counts = vec![0f32; num_tokens * num_experts];
        for entry in self.dispatch_plan(num_experts) {
            for &token in &entry.tokens {
                counts[token as usize * num_experts + entry.expert] += 1.0;
            }
        }
        counts
    }

    /// Number of (token, expert) pairs removed by capacity enforcement.
    pub fn dropped_pairs(&self) -> usize {
        match &self.selection {
            Selection::PerToken { kept, .. } => kept.iter().filter(|keep| !**keep).count(),
            Selection::PerExpert { .. } => 0,
        }
    }
}

fn host_rows(t: &Tensor) -> Result<Vec<Vec<f32>>> {
    Ok(t.to_dtype(DType::F32)?.to_vec2::<f32>()?)
}

/// Top-k token-choice routing over `[tokens, experts]` logits.
///
/// Gates are the softmax over the `k` selected logits. With a capacity factor
/// the pairs routed to an expert within a group are ranked by the full router
/// probability; those past capacity get a zero gate and are not dispatched.
pub fn token_choice(
    logits: &Tensor,
    k: usize,
    capacity_factor: Option<f64>,
    group_size: usize,
) -> Result<Assignment> {
    let (num_tokens, num_experts) = logits.dims2()?;
    if k == 0 || k > num_experts {
        return Err(MoeError::InvalidRouting(format!(
            "top-k routing needs 1 <= k <= {num_experts}, got {k}"
        )));
    }
    let device = logits.device();
    if num_tokens == 0 {
        return Ok(Assignment {
            kind: RoutingKind::TokenChoice,
            gates: Tensor::zeros((0, k), logits.dtype(), device)?,
            indices: Tensor::from_vec(Vec::<u32>::new(), (0, k), device)?,
            selection: Selection::PerToken {
                k,
                experts: Vec::new(),
                kept: Vec::new(),
            },
        });
    }
    let experts: Vec<u32> = host_rows(logits)?
        .iter()
        .flat_map(|row| top_indices(row, k).into_iter().map(|e| e as u32))
        .collect();
    let indices = Tensor::from_vec(experts.clone(), (num_tokens, k), device)?;
    let mut gates = softmax(&logits.contiguous()?.gather(&indices, 1)?, D::Minus1)?;

    let mut kept = vec![true; num_tokens * k];
    if let Some(factor) = capacity_factor {
        let scores = softmax(logits, D::Minus1)?
            .contiguous()?
            .gather(&indices, 1)?
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        for group in groups(num_tokens, group_size) {
            let cap = capacity(factor, group.len(), k, num_experts);
            let span = group.start * k..group.end * k;
            let group_kept =
                keep_within_capacity(&experts[span.clone()], &scores[span.clone()], k, num_experts, cap);
            kept[span].copy_from_slice(&group_kept);
        }
        if kept.iter().any(|keep| !keep) {
            let mask: Vec<f32> = kept.iter().map(|&keep| if keep { 1.0 } else { 0.0 }).collect();
            let mask = Tensor::from_vec(mask, (num_tokens, k), device)?.to_dtype(gates.dtype())?;
            gates = gates.mul(&mask)?;
        }
    }

    Ok(Assignment {
        kind: RoutingKind::TokenChoice,
        gates,
        indices,
        selection: Selection::PerToken { k, experts, kept },
    })
}

/// Expert-choice routing: within each group every expert takes its
/// `capacity` best tokens by softmax score. Tokens no expert picks are
/// dropped.
pub fn expert_choice(logits: &Tensor, capacity_factor: f64, group_size: usize) -> Result<Assignment> {
    let (num_tokens, num_experts) = logits.dims2()?;
    if num_tokens == 0 {
        let device = logits.device();
        return Ok(Assignment {
            kind: RoutingKind::ExpertChoice,
            gates: Tensor::zeros((num_experts, 0), logits.dtype(), device)?,
            indices: Tensor::from_vec(Vec::<u32>::new(), (num_experts, 0), device)?,
            selection: Selection::PerExpert {
                per_expert: 0,
                tokens: Vec::new(),
            },
        });
    }
    let scores = softmax(logits, D::Minus1)?;
    let host = host_rows(&scores)?;

    let mut per_expert_tokens: Vec<Vec<u32>> = vec![Vec::new(); num_experts];
    for group in groups(num_tokens, group_size) {
        let cap = capacity(capacity_factor, group.len(), 1, num_experts);
        for (expert, chosen) in per_expert_tokens.iter_mut().enumerate() {
            let column: Vec<f32> = group.clone().map(|token| host[token][expert]).collect();
            chosen.extend(
                top_indices(&column, cap)
                    .into_iter()
                    .map(|local| (group.start + local) as u32),
            );
        }
    }
    let per_expert = per_expert_tokens.first().map(Vec::len).unwrap_or(0);
    let tokens = per_expert_tokens.concat();
    let indices = Tensor::from_vec(tokens.clone(), (num_experts, per_expert), logits.device())?;
    let gates = scores.t()?.contiguous()?.gather(&indices, 1)?;

    Ok(Assignment {
        kind: RoutingKind::ExpertChoice,
        gates,
        indices,
        selection: Selection::PerExpert { per_expert, tokens },
    })
}

/// Hash routing: one expert per token with weight exactly one.
pub fn hash_choice(experts: Vec<u32>, dtype: DType, device: &Device) -> Result<Assignment> {
    let num_tokens = experts.len();
    let indices = Tensor::from_vec(experts.clone(), (num_tokens, 1), device)?;
    let gates = Tensor::ones((num_tokens, 1), dtype, device)?;
    Ok(Assignment {
        kind: RoutingKind::Hash,
        gates,
        indices,
        selection: Selection::PerToken {
            k: 1,
            kept: vec![true; num_tokens],
            experts,
        },
    })
}
