//! Per-expert capacity and overflow handling.
//!
//! All ranking happens on host copies of the routing scores before any expert
//! runs, so the selected indices never carry gradients.

use std::ops::Range;

/// Tokens an expert may accept from one group.
///
/// `ceil(capacity_factor * group_tokens * k / num_experts)` clamped to
/// `[1, group_tokens]`. An empty group has zero capacity.
pub fn capacity(capacity_factor: f64, group_tokens: usize, k: usize, num_experts: usize) -> usize {
    if group_tokens == 0 {
        return 0;
    }
    let raw = capacity_factor * group_tokens as f64 * k as f64 / num_experts.max(1) as f64;
    let rounded = if raw.is_finite() { raw.ceil() } else { group_tokens as f64 };
    (rounded.max(1.0) as usize).min(group_tokens)
}

/// Consecutive token ranges of at most `group_size` tokens; the last one may
/// be shorter.
pub fn groups(num_tokens: usize, group_size: usize) -> impl Iterator<Item = Range<usize>> {
    let step = group_size.max(1);
    (0..num_tokens)
        .step_by(step)
        .map(move |start| start..(start + step).min(num_tokens))
}

/// Marks the (token, expert) pairs that fit within `capacity`.
///
/// `experts` and `scores` are the row-major `[tokens, k]` selections of one
/// group. Pairs routed to the same expert are ranked by score, highest first,
/// with ties going to the lower token index; pairs beyond `capacity` are
/// reported as `false`.
pub fn keep_within_capacity(
    experts: &[u32],
    scores: &[f32],
    k: usize,
    num_experts: usize,
    capacity: usize,
) -> Vec<bool> {
    let mut kept = vec![true; experts.len()];
    let mut per_expert: Vec<Vec<usize>> = vec![Vec::new(); num_experts];
    for (position, &expert) in experts.iter().enumerate() {
        if let Some(bucket) = per_expert.get_mut(expert as usize) {
            bucket.push(position);
        }
    }
    for mut positions in per_expert {
        if positions.len() <= capacity {
            continue;
        }
        positions.sort_by(|&a, &b| {
            scores[b]
                .total_cmp(&scores[a])
                .then((a / k.max(1)).cmp(&(b / k.max(1))))
        });
        for &position in &positions[capacity..] {
            kept[position] = false;
        }
    }
    kept
}

/// Indices of the `count` largest values, highest first, ties to the lower
/// index.
pub fn top_indices(values: &[f32], count: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[b].total_cmp(&values[a]).then(a.cmp(&b)));
    order.truncate(count);
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_rounds_up_and_clamps() {
        assert_eq!(capacity(1.0, 2, 1, 8), 1);
        assert_eq!(capacity(1.0, 16, 1, 8), 2);
        assert_eq!(capacity(1.5, 16, 1, 8), 3);
        assert_eq!(capacity(1.0, 16, 2, 4), 8);
        assert_eq!(capacity(10.0, 4, 1, 2), 4);
        assert_eq!(capacity(0.01, 4, 1, 8), 1);
        assert_eq!(capacity(1.0, 0, 1, 8), 0);
    }

    #[test]
    fn groups_cover_tokens_with_ragged_tail() {
        let ranges: Vec<_> = groups(7, 3).collect();
        assert_eq!(ranges, vec![0..3, 3..6, 6..7]);
        assert_eq!(groups(0, 4).count(), 0);
    }

    #[test]
    fn overflow_drops_lowest_scores() {
        // Four tokens all chose expert 0 with k = 1.
        let experts = [0, 0, 0, 0];
        let scores = [0.2, 0.9, 0.5, 0.9];
        let kept = keep_within_capacity(&experts, &scores, 1, 2, 2);
        assert_eq!(kept, vec![false, true, false, true]);
    }

    #[test]
    fn overflow_ties_keep_lower_token() {
        let experts = [1, 1, 1];
        let scores = [0.5, 0.5, 0.5];
        let kept = keep_within_capacity(&experts, &scores, 1, 2, 1);
        assert_eq!(kept, vec![true, false, false]);
    }

    #[test]
    fn overflow_is_per_expert_with_top_k() {
        // Two tokens, k = 2: token 0 -> (0, 1), token 1 -> (1, 0).
        let experts = [0, 1, 1, 0];
        let scores = [0.6, 0.4, 0.7, 0.3];
        let kept = keep_within_capacity(&experts, &scores, 2, 2, 1);
        assert_eq!(kept, vec![true, false, true, false]);
    }

    #[test]
    fn top_indices_prefers_lower_index_on_ties() {
        assert_eq!(top_indices(&[0.1, 0.7, 0.7, 0.2], 2), vec![1, 2]);
        assert_eq!(top_indices(&[1.0, 1.0, 1.0], 1), vec![0]);
    }
}
