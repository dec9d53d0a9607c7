use std::f64::consts::PI;

use crate::{
    config::{LearningRateSchedule, SchedulerConfig},
    TrainingError,
};

pub trait LRScheduler: Send {
    /// Learning rate for the next optimizer step; advances the schedule.
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
    /// Moves the schedule to `step` without emitting rates, used on resume.
    fn seek(&mut self, step: usize);
}

pub fn build_scheduler(
    cfg: &SchedulerConfig,
    base_lr: f64,
    total_steps: usize,
) -> Result<Box<dyn LRScheduler>, TrainingError> {
    if base_lr <= 0.0 {
        return Err(TrainingError::initialization(
            "scheduler requires base learning rate > 0",
        ));
    }
    if total_steps == 0 {
        return Err(TrainingError::initialization(
            "scheduler requires total_steps greater than zero",
        ));
    }
    let warmup_steps = cfg.warmup_steps.min(total_steps);
    let schedule = WarmupSchedule {
        base_lr,
        warmup_steps,
        step: 0,
        current_lr: 0.0,
    };
    match cfg.strategy {
        LearningRateSchedule::Constant => Ok(Box::new(ConstantWithWarmup { schedule })),
        LearningRateSchedule::Cosine => {
            if cfg.min_lr < 0.0 || cfg.min_lr > base_lr {
                return Err(TrainingError::initialization(
                    "scheduler min_lr must be in [0, base_lr]",
                ));
            }
            Ok(Box::new(LinearWarmupCosine {
                schedule,
                min_lr: cfg.min_lr,
                total_steps,
            }))
        }
    }
}

struct WarmupSchedule {
    base_lr: f64,
    warmup_steps: usize,
    step: usize,
    current_lr: f64,
}

impl WarmupSchedule {
    fn warmup_lr(&self, step: usize) -> Option<f64> {
        (self.warmup_steps > 0 && step < self.warmup_steps)
            .then(|| self.base_lr * (step + 1) as f64 / self.warmup_steps as f64)
    }

    fn advance(&mut self, lr: f64) -> f64 {
        self.current_lr = lr;
        self.step = self.step.saturating_add(1);
        lr
    }
}

struct ConstantWithWarmup {
    schedule: WarmupSchedule,
}

impl ConstantWithWarmup {
    fn compute_lr(&self, step: usize) -> f64 {
        self.schedule
            .warmup_lr(step)
            .unwrap_or(self.schedule.base_lr)
    }
}

impl LRScheduler for ConstantWithWarmup {
    fn step(&mut self) -> f64 {
        let lr = self.compute_lr(self.schedule.step);
        self.schedule.advance(lr)
    }

    fn learning_rate(&self) -> f64 {
        self.schedule.current_lr
    }

    fn seek(&mut self, step: usize) {
        self.schedule.step = step;
        self.schedule.current_lr = self.compute_lr(step.saturating_sub(1));
    }
}

struct LinearWarmupCosine {
    schedule: WarmupSchedule,
    min_lr: f64,
    total_steps: usize,
}

impl LinearWarmupCosine {
    fn compute_lr(&self, step: usize) -> f64 {
        if let Some(lr) = self.schedule.warmup_lr(step) {
            return lr;
        }
        let warmup = self.schedule.warmup_steps;
        if self.total_steps <= warmup {
            return self.schedule.base_lr;
        }
        let effective = step.saturating_sub(warmup) as f64;
        let denom = (self.total_steps - warmup).max(1) as f64;
        let progress = (effective / denom).clamp(0.0, 1.0);
        let cosine = 0.5 * (1.0 + f64::cos(PI * progress));
        self.min_lr + (self.schedule.base_lr - self.min_lr) * cosine
    }
}

impl LRScheduler for LinearWarmupCosine {
    fn step(&mut self) -> f64 {
        let lr = self.compute_lr(self.schedule.step);
        self.schedule.advance(lr)
    }

    fn learning_rate(&self) -> f64 {
        self.schedule.current_lr
    }

    fn seek(&mut self, step: usize) {
        self.schedule.step = step;
        self.schedule.current_lr = self.compute_lr(step.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(strategy: LearningRateSchedule, warmup_steps: usize, min_lr: f64) -> SchedulerConfig {
        SchedulerConfig {
            strategy,
            warmup_steps,
            min_lr,
        }
    }

    #[test]
    fn constant_schedule_warms_up_linearly() -> Result<(), TrainingError> {
        let mut scheduler = build_scheduler(&config(LearningRateSchedule::Constant, 4, 0.0), 1.0, 10)?;
        let rates: Vec<f64> = (0..6).map(|_| scheduler.step()).collect();
        assert_eq!(rates, vec![0.25, 0.5, 0.75, 1.0, 1.0, 1.0]);
        assert_eq!(scheduler.learning_rate(), 1.0);
        Ok(())
    }

    #[test]
    fn cosine_decays_to_min_lr() -> Result<(), TrainingError> {
        let mut scheduler = build_scheduler(&config(LearningRateSchedule::Cosine, 0, 0.1), 1.0, 10)?;
        let first = scheduler.step();
        assert!((first - 1.0).abs() < 1e-12);
        let mut last = first;
        for _ in 1..10 {
            let lr = scheduler.step();
            assert!(lr <= last + 1e-12);
            last = lr;
        }
        // One step past the horizon stays clamped.
        assert!((scheduler.step() - 0.1).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn seek_resumes_mid_schedule() -> Result<(), TrainingError> {
        let cfg = config(LearningRateSchedule::Cosine, 2, 0.0);
        let mut straight = build_scheduler(&cfg, 0.5, 20)?;
        for _ in 0..7 {
            straight.step();
        }
        let mut resumed = build_scheduler(&cfg, 0.5, 20)?;
        resumed.seek(7);
        assert_eq!(resumed.learning_rate(), straight.learning_rate());
        assert_eq!(resumed.step(), straight.step());
        Ok(())
    }

    #[test]
    fn min_lr_above_base_is_rejected() {
        assert!(build_scheduler(&config(LearningRateSchedule::Cosine, 0, 2.0), 1.0, 10).is_err());
    }
}
