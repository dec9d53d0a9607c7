use std::path::Path;

use candle_core::{backprop::GradStore, DType, Device, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use model::MoET;
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    checkpoint::{self, CheckpointDescriptor, LoadOutcome, RngSnapshot, SaveRequest, TrainingProgressSnapshot},
    config::to_runtime_error,
    data::{BatchSampler, CharCorpus, Split},
    device::select_device,
    logging::{Logger, LoggingSettings},
    loss::{expert_utilization, LossOutput, MoeObjective},
    metrics::{EvaluationMetrics, EvaluationSummary, TrainingMetrics},
    scheduler::{build_scheduler, LRScheduler},
    TrainingConfig, TrainingError,
};

const PREVIEW_PROMPT_CHARS: usize = 8;
const PREVIEW_NEW_TOKENS: usize = 200;
const PREVIEW_TEMPERATURE: f64 = 0.8;
const EVAL_SEED_OFFSET: u64 = 0x5eed;

/// Owns the corpus, the MoET model and its optimizer and runs the
/// training loop described by a [`TrainingConfig`].
pub struct Trainer {
    config: TrainingConfig,
    device: Device,
    corpus: CharCorpus,
    sampler: BatchSampler,
    varmap: VarMap,
    parameters: Vec<Var>,
    model: MoET,
    optimizer: AdamW,
    scheduler: Box<dyn LRScheduler>,
    objective: MoeObjective,
    progress: TrainingProgressSnapshot,
    rng_snapshot: RngSnapshot,
    metrics: TrainingMetrics,
    logger: Logger,
}

impl Trainer {
    pub fn new(mut config: TrainingConfig) -> Result<Self, TrainingError> {
        config.validate()?;

        let device = select_device(config.runtime.device)?;
        log::info!(
            "device selected: is_cuda={} is_metal={} is_cpu={}",
            device.is_cuda(),
            device.is_metal(),
            device.is_cpu()
        );
        if let Err(err) = device.set_seed(config.runtime.seed) {
            log::warn!("failed to seed device RNG: {err}");
        }

        let corpus = CharCorpus::from_path(&config.data.corpus, config.data.train_split)?;
        for split in [Split::Train, Split::Validation] {
            let available = corpus.split(split).len();
            if available <= config.data.block_size {
                return Err(TrainingError::initialization(format!(
                    "{split:?} split has {available} characters, need more than block_size {}",
                    config.data.block_size
                )));
            }
        }
        config.model.vocab_size = corpus.vocab_size();
        log::info!(
            "corpus {} loaded: vocab={} train={} validation={}",
            config.data.corpus.display(),
            corpus.vocab_size(),
            corpus.split(Split::Train).len(),
            corpus.split(Split::Validation).len()
        );

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = MoET::new(&config.model, vb).map_err(|err| {
            TrainingError::initialization(format!("failed to build model: {err}"))
        })?;

        let parameters = varmap.all_vars();
        if parameters.is_empty() {
            return Err(TrainingError::initialization(
                "model produced no trainable parameters",
            ));
        }
        let parameter_count: usize = parameters.iter().map(|v| v.as_tensor().elem_count()).sum();
        log::info!(
            "optimizer will track {} tensor(s), {} parameter(s)",
            parameters.len(),
            parameter_count
        );

        let optimizer = AdamW::new(
            parameters.clone(),
            ParamsAdamW {
                lr: config.optimizer.learning_rate,
                beta1: config.optimizer.beta1,
                beta2: config.optimizer.beta2,
                eps: config.optimizer.epsilon,
                weight_decay: config.optimizer.weight_decay,
            },
        )
        .map_err(to_runtime_error)?;
        let scheduler = build_scheduler(
            &config.scheduler,
            config.optimizer.learning_rate,
            config.runtime.max_steps,
        )?;

        let sampler = BatchSampler::new(
            config.runtime.seed,
            config.data.block_size,
            config.data.batch_size,
            device.clone(),
        );
        let objective = MoeObjective::new(config.aux_loss_weights());
        let logger = Logger::new(LoggingSettings::from_config(&config.runtime.logging))?;
        let rng_snapshot = RngSnapshot {
            master_seed: config.runtime.seed,
        };

        Ok(Self {
            config,
            device,
            corpus,
            sampler,
            varmap,
            parameters,
            model,
            optimizer,
            scheduler,
            objective,
            progress: TrainingProgressSnapshot::default(),
            rng_snapshot,
            metrics: TrainingMetrics::new(),
            logger,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn model(&self) -> &MoET {
        &self.model
    }

    pub fn corpus(&self) -> &CharCorpus {
        &self.corpus
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn progress(&self) -> &TrainingProgressSnapshot {
        &self.progress
    }

    pub fn resume_from_latest(&mut self) -> Result<Option<CheckpointDescriptor>, TrainingError> {
        let Some(settings) = &self.config.runtime.checkpoint else {
            return Ok(None);
        };
        let Some(descriptor) = checkpoint::latest_checkpoint(&settings.directory)? else {
            return Ok(None);
        };
        log::info!(
            "resuming from checkpoint {} (step {})",
            descriptor.directory.display(),
            descriptor.manifest.progress.step
        );
        let outcome = checkpoint::load_checkpoint(&descriptor.directory)?;
        self.apply_checkpoint(outcome)?;
        Ok(Some(descriptor))
    }

    pub fn resume_from_path(&mut self, directory: &Path) -> Result<CheckpointDescriptor, TrainingError> {
        let outcome = checkpoint::load_checkpoint(directory)?;
        let manifest = outcome.manifest.clone();
        self.apply_checkpoint(outcome)?;
        Ok(CheckpointDescriptor {
            directory: directory.to_path_buf(),
            manifest,
        })
    }

    pub fn train(&mut self) -> Result<(), TrainingError> {
        self.train_with_shutdown(|| false)
    }

    /// Runs optimizer steps until `runtime.max_steps` or until
    /// `should_stop` returns true.
    pub fn train_with_shutdown<F>(&mut self, mut should_stop: F) -> Result<(), TrainingError>
    where
        F: FnMut() -> bool,
    {
        log::info!(
            "starting training on {:?} at step {} (vocab={}, routed blocks={})",
            self.device,
            self.progress.step,
            self.corpus.vocab_size(),
            self.config.model.num_routed_blocks()
        );
        let log_every = self.config.runtime.log_every_n_steps.max(1);

        while self.progress.step < self.config.runtime.max_steps {
            if should_stop() {
                log::info!("stop requested at step {}", self.progress.step);
                break;
            }

            let batch = self.sampler.sample(&self.corpus, Split::Train)?;
            let output = self
                .model
                .forward(&batch.inputs, true)
                .map_err(to_runtime_error)?;
            let LossOutput { loss, metrics } = self.objective.compute(&output, &batch.targets)?;
            if !metrics.total.is_finite() {
                return Err(TrainingError::runtime(format!(
                    "non-finite loss {} at step {}",
                    metrics.total,
                    self.progress.step + 1
                )));
            }

            let mut grads = loss.backward().map_err(to_runtime_error)?;
            let grad_norm = self.clip_gradients(&mut grads, self.config.optimizer.max_grad_norm)?;

            let lr = self.scheduler.step();
            self.optimizer.set_learning_rate(lr);
            self.optimizer.step(&grads).map_err(to_runtime_error)?;

            self.progress.step += 1;
            self.progress.tokens_seen += metrics.total_tokens as u64;
            let step = self.progress.step;

            let snapshot = self.metrics.record_step(&metrics, grad_norm);
            if step % log_every == 0 || step == 1 {
                self.logger.log_training_step(step, lr, &snapshot);
                if !output.moe_cache.is_empty() {
                    let utilization = expert_utilization(&output.moe_cache)?;
                    self.logger.log_expert_utilization(step, &utilization);
                }
            }

            self.maybe_evaluate(step)?;
            self.maybe_checkpoint(step)?;
        }

        self.logger.flush();
        Ok(())
    }

    /// Mean loss over `eval_iters` validation batches drawn from a sampler
    /// seeded from the current step, so training batches are unaffected.
    pub fn evaluate(&mut self, eval_iters: usize) -> Result<EvaluationSummary, TrainingError> {
        let mut sampler = BatchSampler::new(
            self.config
                .runtime
                .seed
                .wrapping_add(EVAL_SEED_OFFSET)
                .wrapping_add(self.progress.step as u64),
            self.config.data.block_size,
            self.config.data.batch_size,
            self.device.clone(),
        );
        let mut metrics = EvaluationMetrics::default();
        for _ in 0..eval_iters {
            let batch = sampler.sample(&self.corpus, Split::Validation)?;
            let output = self
                .model
                .forward(&batch.inputs, false)
                .map_err(to_runtime_error)?;
            let loss = self.objective.compute(&output, &batch.targets)?;
            metrics.update(&loss.metrics);
        }
        metrics
            .finalize()
            .ok_or_else(|| TrainingError::runtime("evaluation produced no tokens"))
    }

    /// Decodes a sampled continuation of `prompt`.
    pub fn sample_text(
        &self,
        prompt: &str,
        max_new_tokens: usize,
        temperature: f64,
    ) -> Result<String, TrainingError> {
        let prompt_ids = self.corpus.encode(prompt)?;
        let mut rng = StdRng::seed_from_u64(
            self.rng_snapshot.master_seed ^ self.progress.step as u64,
        );
        let tokens = self
            .model
            .generate(&prompt_ids, max_new_tokens, temperature, &mut rng)
            .map_err(to_runtime_error)?;
        Ok(self.corpus.decode(&tokens))
    }

    pub fn save_checkpoint(&self) -> Result<Option<CheckpointDescriptor>, TrainingError> {
        let Some(settings) = &self.config.runtime.checkpoint else {
            return Ok(None);
        };
        let descriptor = checkpoint::save_checkpoint(SaveRequest {
            base_dir: &settings.directory,
            config: &self.config,
            varmap: &self.varmap,
            progress: self.progress.clone(),
            rng: self.rng_snapshot.clone(),
            max_keep: settings.max_keep,
        })?;
        log::info!(
            "checkpoint saved at step {} -> {}",
            self.progress.step,
            descriptor.directory.display()
        );
        Ok(Some(descriptor))
    }

    /// Rescales gradients in place when their global L2 norm exceeds
    /// `max_norm`; returns the norm before clipping.
    fn clip_gradients(&self, grads: &mut GradStore, max_norm: Option<f64>) -> Result<f64, TrainingError> {
        let mut sum_squares = 0.0f64;
        for var in &self.parameters {
            if let Some(grad) = grads.get(var.as_tensor()) {
                let sq = grad
                    .to_dtype(DType::F32)
                    .and_then(|g| g.sqr())
                    .and_then(|g| g.sum_all())
                    .and_then(|g| g.to_vec0::<f32>())
                    .map_err(to_runtime_error)?;
                sum_squares += f64::from(sq);
            }
        }
        let total_norm = sum_squares.sqrt();

        if let Some(max_norm) = max_norm {
            if total_norm > max_norm {
                let clip_coef = max_norm / (total_norm + 1e-6);
                for var in &self.parameters {
                    if let Some(grad) = grads.remove(var.as_tensor()) {
                        let clipped = (grad * clip_coef).map_err(to_runtime_error)?;
                        grads.insert(var.as_tensor(), clipped);
                    }
                }
            }
        }
        Ok(total_norm)
    }

    fn maybe_checkpoint(&mut self, step: usize) -> Result<(), TrainingError> {
        let due = self
            .config
            .runtime
            .checkpoint
            .as_ref()
            .map_or(false, |c| step % c.every_n_steps == 0 || step == self.config.runtime.max_steps);
        if due {
            self.save_checkpoint()?;
        }
        Ok(())
    }

    fn maybe_evaluate(&mut self, step: usize) -> Result<(), TrainingError> {
        let Some(every) = self.config.runtime.evaluation.every_n_steps else {
            return Ok(());
        };
        if step % every != 0 {
            return Ok(());
        }

        let summary = self.evaluate(self.config.runtime.evaluation.eval_iters)?;
        self.logger.log_evaluation(step, &summary);
        self.logger.flush();
        let improved = self
            .progress
            .best_eval_loss
            .map_or(true, |best| summary.average_loss < best);
        if improved {
            self.progress.best_eval_loss = Some(summary.average_loss);
        }

        let validation = self.corpus.split(Split::Validation);
        let prompt = self
            .corpus
            .decode(&validation[..PREVIEW_PROMPT_CHARS.min(validation.len())]);
        match self.sample_text(&prompt, PREVIEW_NEW_TOKENS, PREVIEW_TEMPERATURE) {
            Ok(sample) => log::info!("sample at step {step}: {sample:?}"),
            Err(err) => log::warn!("failed to sample at step {step}: {err}"),
        }
        Ok(())
    }

    fn apply_checkpoint(&mut self, outcome: LoadOutcome) -> Result<(), TrainingError> {
        let LoadOutcome {
            manifest,
            config,
            model_weights_path,
        } = outcome;

        if config.model != self.config.model {
            return Err(TrainingError::runtime(
                "checkpoint model configuration does not match the current model",
            ));
        }
        if manifest.config_sha256 != checkpoint::fingerprint_config(&self.config)? {
            log::warn!("training configuration changed since the checkpoint was written");
        }
        if manifest.rng.master_seed != self.rng_snapshot.master_seed {
            log::warn!(
                "checkpoint seed {} differs from configured seed {}",
                manifest.rng.master_seed,
                self.rng_snapshot.master_seed
            );
        }

        checkpoint::apply_model_weights(&mut self.varmap, &model_weights_path)?;

        self.progress = manifest.progress;
        self.scheduler.seek(self.progress.step);
        self.optimizer.set_learning_rate(self.scheduler.learning_rate());
        // Moments restart from zero; only the batch stream continues.
        self.sampler.reseed(
            self.rng_snapshot
                .master_seed
                .wrapping_add(self.progress.step as u64),
        );
        Ok(())
    }
}
