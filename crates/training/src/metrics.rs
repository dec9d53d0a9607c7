use std::time::{Duration, Instant};

use crate::loss::{AuxMetrics, LossMetrics};

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Running throughput and smoothed loss for the training loop.
#[derive(Debug)]
pub struct TrainingMetrics {
    step_timer: Instant,
    tokens_processed: u64,
    loss_ema: ExponentialMovingAverage,
    throughput_ema: ExponentialMovingAverage,
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainingMetrics {
    pub fn new() -> Self {
        Self {
            step_timer: Instant::now(),
            tokens_processed: 0,
            loss_ema: ExponentialMovingAverage::new(0.1),
            throughput_ema: ExponentialMovingAverage::new(0.1),
        }
    }

    pub fn record_step(&mut self, loss: &LossMetrics, grad_norm: f64) -> StepSnapshot {
        let now = Instant::now();
        let step_duration = now.duration_since(self.step_timer);
        self.step_timer = now;

        let tokens = loss.total_tokens as u64;
        self.tokens_processed = self.tokens_processed.saturating_add(tokens);
        let step_tokens_per_sec = if step_duration > Duration::ZERO {
            tokens as f64 / step_duration.as_secs_f64()
        } else {
            0.0
        };

        StepSnapshot {
            loss: loss.total,
            loss_ema: self.loss_ema.update(loss.total),
            cross_entropy: loss.cross_entropy,
            aux: loss.aux.clone(),
            tokens,
            tokens_per_sec: self.throughput_ema.update(step_tokens_per_sec),
            grad_norm,
            total_tokens: self.tokens_processed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepSnapshot {
    pub loss: f64,
    pub loss_ema: f64,
    pub cross_entropy: f64,
    pub aux: AuxMetrics,
    pub tokens: u64,
    pub tokens_per_sec: f64,
    pub grad_norm: f64,
    pub total_tokens: u64,
}

/// Token-weighted accumulation of validation batches.
#[derive(Debug, Default)]
pub struct EvaluationMetrics {
    loss_sum: f64,
    ce_sum: f64,
    token_count: u64,
    correct_tokens: u64,
    batches: usize,
}

impl EvaluationMetrics {
    pub fn update(&mut self, metrics: &LossMetrics) {
        let tokens = metrics.total_tokens as u64;
        self.loss_sum += metrics.total * tokens as f64;
        self.ce_sum += metrics.cross_entropy * tokens as f64;
        self.token_count += tokens;
        self.correct_tokens += metrics.correct_tokens as u64;
        self.batches += 1;
    }

    pub fn finalize(self) -> Option<EvaluationSummary> {
        if self.token_count == 0 {
            return None;
        }
        let tokens = self.token_count as f64;
        let cross_entropy = self.ce_sum / tokens;
        Some(EvaluationSummary {
            average_loss: self.loss_sum / tokens,
            cross_entropy,
            perplexity: cross_entropy.exp(),
            accuracy: self.correct_tokens as f64 / tokens,
            tokens: self.token_count,
            batches: self.batches,
        })
    }
}

#[derive(Debug, Clone)]
pub struct EvaluationSummary {
    pub average_loss: f64,
    pub cross_entropy: f64,
    pub perplexity: f64,
    pub accuracy: f64,
    pub tokens: u64,
    pub batches: usize,
}
