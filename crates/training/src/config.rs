use model::MoETConfig;
use moe::AuxLossWeights;
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use crate::device::DevicePreference;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub model: MoETConfig,
    pub data: DataConfig,
    #[serde(default)]
    pub objective: ObjectiveConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if let Err(err) = self.model.validate() {
            errors.push(format!("model: {err}"));
        }
        if self.model.block_pattern != model::BlockPattern::Dense {
            let layer = self.model.layer_moe_config();
            let check = match self.model.block_pattern {
                model::BlockPattern::Moe => layer.validate(),
                _ => layer.validate_dims(),
            };
            if let Err(err) = check {
                errors.push(format!("model.moe: {err}"));
            }
        }

        if self.data.corpus.as_os_str().is_empty() {
            errors.push("data.corpus must not be empty".to_string());
        }
        if self.data.block_size == 0 {
            errors.push("data.block_size must be greater than 0".to_string());
        }
        if self.model.uses_learned_positions() && self.data.block_size > self.model.max_seq_len {
            errors.push(format!(
                "data.block_size ({}) cannot exceed model.max_seq_len ({})",
                self.data.block_size, self.model.max_seq_len
            ));
        }
        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }
        if !(self.data.train_split > 0.0 && self.data.train_split < 1.0) {
            errors.push("data.train_split must be in (0, 1)".to_string());
        }

        for (name, value) in [
            ("objective.importance_coef", self.objective.importance_coef),
            ("objective.local_entropy_coef", self.objective.local_entropy_coef),
            ("objective.global_entropy_coef", self.objective.global_entropy_coef),
        ] {
            if value < 0.0 || !value.is_finite() {
                errors.push(format!("{name} must be finite and >= 0"));
            }
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }
        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }
        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }
        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }
        if let Some(norm) = self.optimizer.max_grad_norm {
            if norm <= 0.0 {
                errors.push("optimizer.max_grad_norm must be greater than 0".to_string());
            }
        }

        if self.scheduler.min_lr < 0.0 {
            errors.push("scheduler.min_lr must be >= 0".to_string());
        }
        if self.scheduler.min_lr > self.optimizer.learning_rate {
            errors.push("scheduler.min_lr cannot exceed optimizer.learning_rate".to_string());
        }
        if self.scheduler.warmup_steps > self.runtime.max_steps {
            errors.push("scheduler.warmup_steps cannot exceed runtime.max_steps".to_string());
        }

        if self.runtime.max_steps == 0 {
            errors.push("runtime.max_steps must be greater than 0".to_string());
        }
        if self.runtime.log_every_n_steps == 0 {
            errors.push("runtime.log_every_n_steps must be greater than 0".to_string());
        }
        if let Some(0) = self.runtime.evaluation.every_n_steps {
            errors.push("runtime.evaluation.every_n_steps must be greater than 0".to_string());
        }
        if self.runtime.evaluation.eval_iters == 0 {
            errors.push("runtime.evaluation.eval_iters must be greater than 0".to_string());
        }
        if let Some(checkpoint) = &self.runtime.checkpoint {
            if checkpoint.directory.as_os_str().is_empty() {
                errors.push("runtime.checkpoint.directory must not be empty".to_string());
            }
            if checkpoint.every_n_steps == 0 {
                errors.push("runtime.checkpoint.every_n_steps must be greater than 0".to_string());
            }
            if let Some(0) = checkpoint.max_keep {
                errors.push("runtime.checkpoint.max_keep must be greater than 0".to_string());
            }
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    /// Auxiliary loss coefficients: `lb_coef`/`z_coef` from the expert
    /// settings, the rest from the objective section.
    pub fn aux_loss_weights(&self) -> AuxLossWeights {
        AuxLossWeights {
            importance_coef: self.objective.importance_coef,
            local_entropy_coef: self.objective.local_entropy_coef,
            global_entropy_coef: self.objective.global_entropy_coef,
            ..AuxLossWeights::from_config(&self.model.moe)
        }
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.data.corpus, base);
        self.runtime.apply_base_path(base);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Plain-text file read as a character-level corpus.
    pub corpus: PathBuf,
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_train_split")]
    pub train_split: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectiveConfig {
    pub importance_coef: f64,
    pub local_entropy_coef: f64,
    pub global_entropy_coef: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
    /// Global L2 norm above which gradients are rescaled.
    #[serde(default)]
    pub max_grad_norm: Option<f64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            weight_decay: 0.0,
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            max_grad_norm: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub strategy: LearningRateSchedule,
    #[serde(default)]
    pub warmup_steps: usize,
    #[serde(default)]
    pub min_lr: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningRateSchedule {
    #[default]
    Constant,
    /// Linear warmup followed by cosine decay to `min_lr` at `runtime.max_steps`.
    Cosine,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_log_every_n_steps")]
    pub log_every_n_steps: usize,
    #[serde(default)]
    pub device: DevicePreference,
    #[serde(default)]
    pub checkpoint: Option<CheckpointConfig>,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            max_steps: default_max_steps(),
            log_every_n_steps: default_log_every_n_steps(),
            device: DevicePreference::default(),
            checkpoint: None,
            evaluation: EvaluationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    fn apply_base_path(&mut self, base: &Path) {
        if let Some(checkpoint) = self.checkpoint.as_mut() {
            absolutize_in_place(&mut checkpoint.directory, base);
        }
        if let Some(dir) = self.logging.tensorboard.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub directory: PathBuf,
    #[serde(default = "default_checkpoint_every")]
    pub every_n_steps: usize,
    #[serde(default)]
    pub max_keep: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default)]
    pub every_n_steps: Option<usize>,
    /// Validation batches averaged per evaluation.
    #[serde(default = "default_eval_iters")]
    pub eval_iters: usize,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            every_n_steps: None,
            eval_iters: default_eval_iters(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard: Option<PathBuf>,
    #[serde(default = "default_flush_every")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: true,
            tensorboard: None,
            tensorboard_flush_every_n: default_flush_every(),
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_block_size() -> usize {
    64
}

fn default_batch_size() -> usize {
    16
}

fn default_train_split() -> f64 {
    0.9
}

fn default_learning_rate() -> f64 {
    3e-4
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.95
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_seed() -> u64 {
    42
}

fn default_max_steps() -> usize {
    5_000
}

fn default_log_every_n_steps() -> usize {
    100
}

fn default_checkpoint_every() -> usize {
    1_000
}

fn default_eval_iters() -> usize {
    20
}

fn default_true() -> bool {
    true
}

fn default_flush_every() -> usize {
    10
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "i/o error: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            TrainingError::ConfigFormat(_)
            | TrainingError::Validation(_)
            | TrainingError::Initialization(_)
            | TrainingError::Runtime(_) => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

pub(crate) fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
