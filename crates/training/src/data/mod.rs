use std::{collections::HashMap, fs, path::Path};

use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{config::to_runtime_error, TrainingError};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Validation,
}

/// Character-level corpus: the vocabulary is the sorted set of distinct
/// characters and the encoded text is split into a train and a validation
/// prefix/suffix.
#[derive(Debug, Clone)]
pub struct CharCorpus {
    vocab: Vec<char>,
    index: HashMap<char, u32>,
    train: Vec<u32>,
    validation: Vec<u32>,
}

impl CharCorpus {
    pub fn from_text(text: &str, train_split: f64) -> Result<Self> {
        if !(train_split > 0.0 && train_split < 1.0) {
            return Err(TrainingError::initialization(format!(
                "train_split must be in (0, 1), got {train_split}"
            )));
        }
        let mut vocab: Vec<char> = text.chars().collect();
        vocab.sort_unstable();
        vocab.dedup();
        if vocab.is_empty() {
            return Err(TrainingError::initialization("training corpus is empty"));
        }
        let index: HashMap<char, u32> = vocab
            .iter()
            .enumerate()
            .map(|(id, ch)| (*ch, id as u32))
            .collect();

        let encoded: Vec<u32> = text.chars().map(|ch| index[&ch]).collect();
        let cut = (encoded.len() as f64 * train_split) as usize;
        let validation = encoded[cut..].to_vec();
        let mut train = encoded;
        train.truncate(cut);

        Ok(Self {
            vocab,
            index,
            train,
            validation,
        })
    }

    pub fn from_path(path: &Path, train_split: f64) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|err| {
            TrainingError::initialization(format!("failed to read corpus {}: {err}", path.display()))
        })?;
        Self::from_text(&text, train_split)
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        text.chars()
            .map(|ch| {
                self.index.get(&ch).copied().ok_or_else(|| {
                    TrainingError::runtime(format!("character {ch:?} is not in the vocabulary"))
                })
            })
            .collect()
    }

    /// Ids outside the vocabulary decode to U+FFFD.
    pub fn decode(&self, ids: &[u32]) -> String {
        ids.iter()
            .map(|&id| self.vocab.get(id as usize).copied().unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect()
    }

    pub fn split(&self, split: Split) -> &[u32] {
        match split {
            Split::Train => &self.train,
            Split::Validation => &self.validation,
        }
    }
}

/// Inputs and next-token targets, both `[batch, block_size]` u32.
#[derive(Debug)]
pub struct Batch {
    pub inputs: Tensor,
    pub targets: Tensor,
}

impl Batch {
    pub fn num_tokens(&self) -> usize {
        self.inputs.elem_count()
    }
}

/// Draws random contiguous blocks from a corpus split.
#[derive(Debug)]
pub struct BatchSampler {
    rng: StdRng,
    block_size: usize,
    batch_size: usize,
    device: Device,
}

impl BatchSampler {
    pub fn new(seed: u64, block_size: usize, batch_size: usize, device: Device) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            block_size,
            batch_size,
            device,
        }
    }

    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    pub fn sample(&mut self, corpus: &CharCorpus, split: Split) -> Result<Batch> {
        let data = corpus.split(split);
        if data.len() <= self.block_size {
            return Err(TrainingError::runtime(format!(
                "{split:?} split has {} tokens, need more than block_size {}",
                data.len(),
                self.block_size
            )));
        }
        let mut inputs = Vec::with_capacity(self.batch_size * self.block_size);
        let mut targets = Vec::with_capacity(self.batch_size * self.block_size);
        for _ in 0..self.batch_size {
            let start = self.rng.gen_range(0..data.len() - self.block_size);
            inputs.extend_from_slice(&data[start..start + self.block_size]);
            targets.extend_from_slice(&data[start + 1..start + 1 + self.block_size]);
        }
        let shape = (self.batch_size, self.block_size);
        Ok(Batch {
            inputs: Tensor::from_vec(inputs, shape, &self.device).map_err(to_runtime_error)?,
            targets: Tensor::from_vec(targets, shape, &self.device).map_err(to_runtime_error)?,
        })
    }
}
