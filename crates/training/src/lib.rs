//! Character-level training loop for the MoET model: corpus sampling, the
//! routed objective, AdamW with optional clipping and cosine schedule,
//! periodic evaluation and checksummed checkpoints.

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod device;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{CheckpointDescriptor, CheckpointManifest, TrainingProgressSnapshot};
pub use config::{TrainingConfig, TrainingError};
pub use data::{Batch, BatchSampler, CharCorpus, Split};
pub use device::{select_device, DevicePreference};
pub use loss::{expert_utilization, AuxMetrics, LossMetrics, LossOutput, MoeObjective};
pub use metrics::{EvaluationSummary, StepSnapshot};
pub use scheduler::{build_scheduler, LRScheduler};
pub use trainer::Trainer;
