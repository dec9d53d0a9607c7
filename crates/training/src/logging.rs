use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::{
    config::LoggingConfig,
    metrics::{EvaluationSummary, StepSnapshot},
    TrainingError,
};

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
}

impl LoggingSettings {
    pub fn from_config(config: &LoggingConfig) -> Self {
        Self {
            enable_stdout: config.enable_stdout,
            tensorboard_dir: config.tensorboard.clone(),
            tensorboard_flush_every_n: config.tensorboard_flush_every_n.max(1),
        }
    }
}

/// Step and evaluation reporter: one stdout line per event plus optional
/// TensorBoard scalars.
pub struct Logger {
    settings: LoggingSettings,
    tensorboard: Option<TensorBoardWriter>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let tensorboard = match settings.tensorboard_dir.as_ref() {
            Some(dir) => Some(TensorBoardWriter::create(
                dir,
                settings.tensorboard_flush_every_n,
            )?),
            None => None,
        };
        Ok(Self {
            settings,
            tensorboard,
        })
    }

    pub fn log_training_step(&mut self, step: usize, lr: f64, snapshot: &StepSnapshot) {
        let aux = &snapshot.aux;
        if self.settings.enable_stdout {
            println!(
                "train step={} loss={:.4} ce={:.4} lb={:.4} z={:.4} aux={:.5} tok/s={:.1} grad_norm={:.3} lr={:.5e}",
                step,
                snapshot.loss,
                snapshot.cross_entropy,
                aux.load_balancing,
                aux.router_z,
                aux.weighted_total,
                snapshot.tokens_per_sec,
                snapshot.grad_norm,
                lr
            );
        }

        if let Some(writer) = self.tensorboard.as_mut() {
            let step = step as i64;
            for (tag, value) in [
                ("train/loss", snapshot.loss),
                ("train/loss_ema", snapshot.loss_ema),
                ("train/cross_entropy", snapshot.cross_entropy),
                ("train/aux/load_balancing", aux.load_balancing),
                ("train/aux/router_z", aux.router_z),
                ("train/aux/importance", aux.importance),
                ("train/aux/local_entropy", aux.local_entropy),
                ("train/aux/global_entropy", aux.global_entropy),
                ("train/aux/weighted_total", aux.weighted_total),
                ("train/tokens_per_sec", snapshot.tokens_per_sec),
                ("train/grad_norm", snapshot.grad_norm),
                ("train/learning_rate", lr),
            ] {
                if let Err(err) = writer.write_scalar(tag, step, value) {
                    log::warn!("{err}");
                }
            }
        }
    }

    /// `utilization` holds, per routed block, the fraction of dispatched
    /// tokens each expert received.
    pub fn log_expert_utilization(&mut self, step: usize, utilization: &[(usize, Vec<f64>)]) {
        if self.settings.enable_stdout {
            for (layer, fractions) in utilization {
                let formatted: Vec<String> = fractions.iter().map(|f| format!("{f:.3}")).collect();
                println!("experts step={} layer={} load=[{}]", step, layer, formatted.join(", "));
            }
        }

        if let Some(writer) = self.tensorboard.as_mut() {
            for (layer, fractions) in utilization {
                for (expert, fraction) in fractions.iter().enumerate() {
                    let tag = format!("experts/layer{layer}/expert{expert}");
                    if let Err(err) = writer.write_scalar(&tag, step as i64, *fraction) {
                        log::warn!("{err}");
                    }
                }
            }
        }
    }

    pub fn log_evaluation(&mut self, step: usize, summary: &EvaluationSummary) {
        if self.settings.enable_stdout {
            println!(
                "eval step={} loss={:.4} ce={:.4} ppl={:.4} acc={:.2}% tokens={}",
                step,
                summary.average_loss,
                summary.cross_entropy,
                summary.perplexity,
                summary.accuracy * 100.0,
                summary.tokens
            );
        }

        if let Some(writer) = self.tensorboard.as_mut() {
            let step = step as i64;
            for (tag, value) in [
                ("eval/loss", summary.average_loss),
                ("eval/cross_entropy", summary.cross_entropy),
                ("eval/perplexity", summary.perplexity),
                ("eval/accuracy", summary.accuracy),
            ] {
                if let Err(err) = writer.write_scalar(tag, step, value) {
                    log::warn!("{err}");
                }
            }
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            if let Err(err) = writer.flush() {
                log::warn!("{err}");
            }
        }
    }
}

struct TensorBoardWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let wall_time = current_wall_time();
        let summary = Summary {
            value: vec![summary::Value {
                tag: tag.to_string(),
                simple_value: Some(value as f32),
            }],
        };
        let event = Event {
            wall_time,
            step,
            summary: Some(summary),
        };
        self.write_event(&event)
    }

    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;

        let data = buffer.freeze();
        // TFRecord framing: len, crc(len), payload, crc(payload).
        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc_bytes = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc_bytes = masked_crc32(data.as_ref()).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc_bytes))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc_bytes))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "3")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "7")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::AuxMetrics;

    fn snapshot() -> StepSnapshot {
        StepSnapshot {
            loss: 2.0,
            loss_ema: 2.0,
            cross_entropy: 1.9,
            aux: AuxMetrics {
                load_balancing: 1.0,
                weighted_total: 0.1,
                ..AuxMetrics::default()
            },
            tokens: 16,
            tokens_per_sec: 100.0,
            grad_norm: 0.5,
            total_tokens: 16,
        }
    }

    #[test]
    fn tensorboard_records_are_framed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = LoggingSettings {
            enable_stdout: false,
            tensorboard_dir: Some(dir.path().to_path_buf()),
            tensorboard_flush_every_n: 1,
        };
        let mut logger = Logger::new(settings).expect("logger");
        logger.log_training_step(1, 1e-3, &snapshot());
        logger.log_expert_utilization(1, &[(0, vec![0.5, 0.5])]);
        logger.flush();

        let entry = fs::read_dir(dir.path())
            .expect("read dir")
            .next()
            .expect("event file")
            .expect("entry");
        let bytes = fs::read(entry.path()).expect("read events");
        let mut offset = 0;
        let mut records = 0;
        while offset < bytes.len() {
            let mut len = [0u8; 8];
            len.copy_from_slice(&bytes[offset..offset + 8]);
            let len = u64::from_le_bytes(len) as usize;
            let payload = &bytes[offset + 12..offset + 12 + len];
            let event = Event::decode(payload).expect("decode event");
            assert_eq!(event.step, 1);
            offset += 12 + len + 4;
            records += 1;
        }
        assert_eq!(records, 14);
    }
}
