use attention::{AttentionCache, KeyValueCache};
use candle_core::{DType, Device, Error, IndexOp, Result, Tensor, D};
use candle_nn::{ops::softmax, Dropout, Embedding, Linear, Module, VarBuilder};
use layers::norm::{build_norm, NormConfig, NormalizationLayer};
use moe::FullCache;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use crate::{block::MoETBlock, config::MoETConfig};

/// Logits plus the routing state of every routed block.
#[derive(Debug)]
pub struct MoETOutput {
    /// `[batch, seq, vocab_size]`.
    pub logits: Tensor,
    pub moe_cache: FullCache,
}

/// Decoder-only transformer whose feed-forward blocks are mixtures of experts.
#[derive(Debug)]
pub struct MoET {
    config: MoETConfig,
    wte: Embedding,
    wpe: Option<Embedding>,
    drop: Dropout,
    blocks: Vec<MoETBlock>,
    ln_f: Box<dyn NormalizationLayer>,
    lm_head: Linear,
}

impl MoET {
    /// Builds the model, registering every parameter under `vb`.
    pub fn new(config: &MoETConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let wte = candle_nn::embedding(config.vocab_size, config.hidden_size, vb.pp("wte"))?;
        let wpe = if config.uses_learned_positions() {
            Some(candle_nn::embedding(
                config.max_seq_len,
                config.hidden_size,
                vb.pp("wpe"),
            )?)
        } else {
            None
        };

        let blocks_vb = vb.pp("blocks");
        let blocks = (0..config.num_layers)
            .map(|index| MoETBlock::new(index, config, blocks_vb.pp(index)))
            .collect::<Result<Vec<_>>>()?;

        let ln_f = build_norm(
            NormConfig::new(config.hidden_size, config.norm).with_epsilon(config.layer_norm_epsilon),
            vb.pp("ln_f"),
        )?;
        let lm_head = candle_nn::linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("lm_head"))?;

        log::info!(
            "built MoET: {} layers ({} routed, {:?}), hidden={}, heads={}, attention={:?}",
            config.num_layers,
            config.num_routed_blocks(),
            config.block_pattern,
            config.hidden_size,
            config.num_heads,
            config.attention
        );

        Ok(Self {
            config: config.clone(),
            wte,
            wpe,
            drop: Dropout::new(config.dropout),
            blocks,
            ln_f,
            lm_head,
        })
    }

    pub fn config(&self) -> &MoETConfig {
        &self.config
    }

    pub fn blocks(&self) -> &[MoETBlock] {
        &self.blocks
    }

    pub fn device(&self) -> &Device {
        self.wte.embeddings().device()
    }

    /// Produces logits shaped `[batch, seq, vocab_size]` for `token_ids`.
    pub fn forward(&self, token_ids: &Tensor, train: bool) -> Result<MoETOutput> {
        self.forward_with_cache(token_ids, None, train)
            .map(|(output, _)| output)
    }

    /// Runs `token_ids` as the continuation of the positions held in `caches`
    /// (one per block) and returns the grown caches.
    pub fn forward_with_cache(
        &self,
        token_ids: &Tensor,
        caches: Option<&[AttentionCache]>,
        train: bool,
    ) -> Result<(MoETOutput, Vec<AttentionCache>)> {
        let (_batch, seq) = token_ids.dims2()?;
        if seq == 0 {
            return Err(Error::Msg("token_ids must contain at least one position".into()));
        }
        if let Some(caches) = caches {
            if caches.len() != self.blocks.len() {
                return Err(Error::Msg(format!(
                    "expected {} attention caches, got {}",
                    self.blocks.len(),
                    caches.len()
                )));
            }
        }
        let offset = caches
            .and_then(|c| c.first())
            .map(|cache| cache.len())
            .unwrap_or(0);

        let mut hidden = self.wte.forward(token_ids)?;
        if let Some(wpe) = &self.wpe {
            if offset + seq > self.config.max_seq_len {
                return Err(Error::Msg(format!(
                    "sequence end {} exceeds max_seq_len {}",
                    offset + seq,
                    self.config.max_seq_len
                )));
            }
            let positions = Tensor::arange(offset as u32, (offset + seq) as u32, token_ids.device())?;
            hidden = hidden.broadcast_add(&wpe.forward(&positions)?)?;
        }
        let mut hidden = self.drop.forward(&hidden, train)?;

        let mut moe_cache = FullCache::new();
        let mut next_caches = Vec::with_capacity(self.blocks.len());
        for (index, block) in self.blocks.iter().enumerate() {
            let prefix = caches.map(|c| &c[index]);
            let out = block.forward(&hidden, token_ids, prefix, train)?;
            hidden = out.hidden;
            next_caches.push(out.attention_cache);
            if let Some(layer_cache) = out.moe_cache {
                moe_cache.push(layer_cache);
            }
        }

        let normalized = self.ln_f.forward(&hidden)?;
        let logits = self.lm_head.forward(&normalized)?;
        Ok((MoETOutput { logits, moe_cache }, next_caches))
    }

    /// Samples `max_new_tokens` continuations of `prompt` and returns the
    /// prompt followed by the sampled ids. A non-positive `temperature` picks
    /// the arg-max.
    ///
    /// With learned positions the context is cropped to the last
    /// `max_seq_len` tokens and re-encoded once the cache would overflow.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        prompt: &[u32],
        max_new_tokens: usize,
        temperature: f64,
        rng: &mut R,
    ) -> Result<Vec<u32>> {
        if prompt.is_empty() {
            return Err(Error::Msg("generate requires a non-empty prompt".into()));
        }
        let mut tokens = prompt.to_vec();
        let mut pending = prompt.to_vec();
        let mut caches: Option<Vec<AttentionCache>> = None;

        for _ in 0..max_new_tokens {
            let cached = caches
                .as_ref()
                .and_then(|c| c.first())
                .map(|cache| cache.len())
                .unwrap_or(0);
            if self.wpe.is_some() && cached + pending.len() > self.config.max_seq_len {
                let start = tokens.len().saturating_sub(self.config.max_seq_len);
                pending = tokens[start..].to_vec();
                caches = None;
            }

            let input = Tensor::new(pending.as_slice(), self.device())?.unsqueeze(0)?;
            let (output, next) = self.forward_with_cache(&input, caches.as_deref(), false)?;
            let last = output.logits.i((0, pending.len() - 1))?;
            let token = sample_token(&last, temperature, rng)?;

            tokens.push(token);
            pending = vec![token];
            caches = Some(next);
        }
        Ok(tokens)
    }
}

fn sample_token<R: Rng + ?Sized>(logits: &Tensor, temperature: f64, rng: &mut R) -> Result<u32> {
    let logits = logits.to_dtype(DType::F32)?;
    if temperature <= 0.0 {
        return logits.argmax(D::Minus1)?.to_scalar::<u32>();
    }
    let probs = softmax(&(logits / temperature)?, D::Minus1)?.to_vec1::<f32>()?;
    let dist = WeightedIndex::new(&probs).map_err(|e| Error::Msg(format!("sampling failed: {e}")))?;
    Ok(dist.sample(rng) as u32)
}
