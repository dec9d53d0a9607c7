//! Mixture-of-experts transformer experiments on candle.
//!
//! The workspace crates are re-exported under their own names:
//!
//! - [`layers`]: activations, normalization and the dense feed-forward block;
//! - [`attention`]: causal and ALiBi self-attention with key/value caches;
//! - [`moe`]: routers, assignment policies, the expert bank and auxiliary losses;
//! - [`model`]: the MoET decoder and its block patterns;
//! - [`training`]: the character-level training loop and checkpoints.

pub use attention;
pub use layers;
pub use model;
pub use moe;
pub use training;

pub use attention::{AttentionCache, PositionalBias};
pub use model::{BlockPattern, MoET, MoETConfig, MoETOutput};
pub use moe::{AuxLossWeights, FullCache, GroupMoELayer, LayerCache, MoeConfig, SmearLayer, SoftExpertLayer};
pub use training::{select_device, DevicePreference};

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    DType, Device, Result,
};
use candle_nn::{VarBuilder, VarMap};

/// Builds a freshly initialised model on `device` together with the
/// [`VarMap`] holding its parameters.
pub fn build_model(config: &MoETConfig, device: &Device) -> Result<(VarMap, MoET)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = MoET::new(config, vb)?;
    let parameters: usize = varmap
        .all_vars()
        .iter()
        .map(|var| var.as_tensor().elem_count())
        .sum();
    log::info!(
        "built MoET with {} block(s), {} routed, {} parameter(s) on {:?}",
        config.num_layers,
        config.num_routed_blocks(),
        parameters,
        device
    );
    Ok((varmap, model))
}

/// One-line description of the host and the accelerators candle can see.
pub fn backend_summary() -> String {
    format!(
        "os={} arch={} cuda_available={} metal_available={}",
        std::env::consts::OS,
        std::env::consts::ARCH,
        cuda_is_available(),
        metal_is_available()
    )
}
