use anyhow::Result;
use candle_core::{Device, Tensor};
use moet::{
    build_model, select_device, AuxLossWeights, BlockPattern, DevicePreference, MoETConfig, MoeConfig,
    PositionalBias,
};
use rand::{rngs::StdRng, SeedableRng};

fn config(pattern: BlockPattern) -> MoETConfig {
    MoETConfig {
        vocab_size: 20,
        hidden_size: 16,
        num_layers: 2,
        num_heads: 2,
        max_seq_len: 16,
        dropout: 0.0,
        attention: PositionalBias::Alibi,
        block_pattern: pattern,
        moe: MoeConfig {
            num_experts: 4,
            k: 2,
            c: 0.0,
            group_size: 4,
            intermediate_size: 32,
            expert_dropout: 0.0,
            ..MoeConfig::default()
        },
        ..MoETConfig::default()
    }
}

#[test]
fn routed_model_trains_end_to_end() -> Result<()> {
    let device = select_device(DevicePreference::Cpu)?;
    let config = config(BlockPattern::Moe);
    let (varmap, model) = build_model(&config, &device)?;

    let ids: Vec<u32> = (0..16u32).map(|i| (i * 3) % 20).collect();
    let input = Tensor::from_vec(ids, (2, 8), &device)?;
    let output = model.forward(&input, true)?;
    assert_eq!(output.logits.dims(), &[2, 8, 20]);
    assert_eq!(output.moe_cache.len(), 2);

    let weights = AuxLossWeights::from_config(&config.moe);
    let aux = weights.combine(&output.moe_cache)?;
    let loss = (output.logits.sqr()?.mean_all()? + aux.total)?;
    let grads = loss.backward()?;

    let vars = varmap.data().lock().expect("varmap lock");
    let router = vars
        .iter()
        .find(|(name, _)| name.contains("router"))
        .map(|(_, var)| var.as_tensor().clone())
        .expect("router weight");
    assert!(grads.get(&router).is_some());
    Ok(())
}

#[test]
fn generation_uses_the_alibi_cache() -> Result<()> {
    let (_, model) = build_model(&config(BlockPattern::Soft), &Device::Cpu)?;
    let mut rng = StdRng::seed_from_u64(3);
    // ALiBi has no position table, so generation can exceed max_seq_len.
    let tokens = model.generate(&[1, 2, 3], 20, 1.0, &mut rng)?;
    assert_eq!(tokens.len(), 23);
    assert_eq!(&tokens[..3], &[1, 2, 3]);
    assert!(tokens.iter().all(|&t| t < 20));
    assert!(!moet::backend_summary().is_empty());
    Ok(())
}
