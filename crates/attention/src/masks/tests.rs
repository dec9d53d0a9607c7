use super::*;
use candle_core::{Device, Result};

fn idx(h: usize, q: usize, k: usize, q_len: usize, k_len: usize) -> usize {
    ((h * q_len) + q) * k_len + k
}

#[test]
fn causal_mask_respects_offsets() -> Result<()> {
    let device = Device::Cpu;
    let (q_len, k_len) = (3, 5);

    let mask = build_causal_mask(&device, q_len, k_len)?;
    assert_eq!(mask.dims(), &[1, 1, q_len, k_len]);
    assert_eq!(mask.dtype(), MASK_DTYPE);

    let values = mask.flatten_all()?.to_vec1::<f32>()?;

    // Earliest query can only see the prefix (offset = k_len - q_len).
    assert_eq!(values[idx(0, 0, 2, q_len, k_len)], 0.0);
    assert_eq!(values[idx(0, 0, 3, q_len, k_len)], f32::NEG_INFINITY);

    // Later queries gain access to more keys.
    assert_eq!(values[idx(0, 2, 4, q_len, k_len)], 0.0);
    Ok(())
}

#[test]
fn causal_mask_handles_single_token_cases() -> Result<()> {
    let device = Device::Cpu;

    let mask = build_causal_mask(&device, 1, 1)?;
    assert_eq!(mask.flatten_all()?.to_vec1::<f32>()?, vec![0.0]);

    // A single decoding step sees the whole cache.
    let mask = build_causal_mask(&device, 1, 4)?;
    assert_eq!(mask.flatten_all()?.to_vec1::<f32>()?, vec![0.0; 4]);
    Ok(())
}

#[test]
fn alibi_slopes_follow_geometric_schedule() {
    assert_eq!(alibi_slopes(4), vec![1.0, 0.5, 0.25, 0.125]);

    let wide = alibi_slopes(12);
    assert_eq!(wide.len(), 12);
    assert!((wide[1] - 1.0 / 2f32.sqrt()).abs() < 1e-6);
    assert!((wide[2] - 0.5).abs() < 1e-6);
}

#[test]
fn alibi_bias_penalises_distance_per_head() -> Result<()> {
    let device = Device::Cpu;
    let slopes = alibi_slopes(2);
    let bias = build_alibi_bias(&device, &slopes, 3, 3)?;
    assert_eq!(bias.dims(), &[1, 2, 3, 3]);

    let values = bias.flatten_all()?.to_vec1::<f32>()?;
    // head 0, slope 1: lower triangle holds -(i - j)
    assert_eq!(values[idx(0, 0, 0, 3, 3)], 0.0);
    assert_eq!(values[idx(0, 2, 0, 3, 3)], -2.0);
    assert_eq!(values[idx(0, 2, 1, 3, 3)], -1.0);
    assert_eq!(values[idx(0, 0, 1, 3, 3)], f32::NEG_INFINITY);
    // head 1, slope 0.5
    assert_eq!(values[idx(1, 2, 0, 3, 3)], -1.0);
    assert_eq!(values[idx(1, 1, 2, 3, 3)], f32::NEG_INFINITY);
    Ok(())
}

#[test]
fn alibi_bias_aligns_queries_with_cache_tail() -> Result<()> {
    let device = Device::Cpu;
    let bias = build_alibi_bias(&device, &[1.0], 1, 4)?;
    assert_eq!(
        bias.flatten_all()?.to_vec1::<f32>()?,
        vec![-3.0, -2.0, -1.0, 0.0]
    );

    let full = build_alibi_bias(&device, &[1.0], 4, 4)?;
    let last_row = full.flatten_all()?.to_vec1::<f32>()?[12..].to_vec();
    assert_eq!(last_row, vec![-3.0, -2.0, -1.0, 0.0]);
    Ok(())
}

#[test]
fn alibi_rejects_zero_heads() {
    assert!(build_alibi_bias(&Device::Cpu, &[], 2, 2).is_err());
}
