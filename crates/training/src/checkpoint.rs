use std::{
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_nn::VarMap;
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{config::to_runtime_error, TrainingConfig, TrainingError};

pub const CHECKPOINT_VERSION: u32 = 1;
const MODEL_FILENAME: &str = "model.safetensors";
const CONFIG_FILENAME: &str = "config.json";
const MANIFEST_FILENAME: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingProgressSnapshot {
    /// Optimizer steps completed.
    pub step: usize,
    pub tokens_seen: u64,
    pub best_eval_loss: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RngSnapshot {
    pub master_seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub config_sha256: String,
    pub model: FileRecord,
    pub config: FileRecord,
    pub progress: TrainingProgressSnapshot,
    pub rng: RngSnapshot,
}

pub struct SaveRequest<'a> {
    pub base_dir: &'a Path,
    pub config: &'a TrainingConfig,
    pub varmap: &'a VarMap,
    pub progress: TrainingProgressSnapshot,
    pub rng: RngSnapshot,
    pub max_keep: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

#[derive(Debug)]
pub struct LoadOutcome {
    pub manifest: CheckpointManifest,
    /// Configuration the checkpoint was trained with.
    pub config: TrainingConfig,
    pub model_weights_path: PathBuf,
}

pub fn save_checkpoint(request: SaveRequest<'_>) -> Result<CheckpointDescriptor, TrainingError> {
    fs::create_dir_all(request.base_dir).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create checkpoint directory {}: {err}",
            request.base_dir.display()
        ))
    })?;

    let checkpoint_dir = request
        .base_dir
        .join(format!("step_{:012}", request.progress.step));
    if checkpoint_dir.exists() {
        fs::remove_dir_all(&checkpoint_dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to remove existing checkpoint directory {}: {err}",
                checkpoint_dir.display()
            ))
        })?;
    }
    fs::create_dir(&checkpoint_dir).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create checkpoint directory {}: {err}",
            checkpoint_dir.display()
        ))
    })?;

    let model_path = checkpoint_dir.join(MODEL_FILENAME);
    if request.varmap.all_vars().is_empty() {
        return Err(TrainingError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }
    request.varmap.save(&model_path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize model weights to {}: {err}",
            model_path.display()
        ))
    })?;
    let model_record = file_record(&model_path)?;

    let config_path = checkpoint_dir.join(CONFIG_FILENAME);
    write_json(&config_path, request.config)?;
    let config_record = file_record(&config_path)?;

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        created_unix_timestamp: unix_timestamp(),
        config_sha256: fingerprint_config(request.config)?,
        model: model_record,
        config: config_record,
        progress: request.progress,
        rng: request.rng,
    };
    write_json(&checkpoint_dir.join(MANIFEST_FILENAME), &manifest)?;

    prune_checkpoints(request.base_dir, request.max_keep)?;

    Ok(CheckpointDescriptor {
        directory: checkpoint_dir,
        manifest,
    })
}

/// Newest `step_*` directory under `base_dir`, if any.
pub fn latest_checkpoint(base_dir: &Path) -> Result<Option<CheckpointDescriptor>, TrainingError> {
    let Some(path) = checkpoint_directories(base_dir)?.into_iter().max() else {
        return Ok(None);
    };
    let manifest = load_manifest(&path)?;
    Ok(Some(CheckpointDescriptor {
        directory: path,
        manifest,
    }))
}

pub fn load_checkpoint(directory: &Path) -> Result<LoadOutcome, TrainingError> {
    let manifest = load_manifest(directory)?;
    ensure_version_supported(manifest.version)?;

    let model_path = directory.join(&manifest.model.filename);
    validate_file(&model_path, &manifest.model.sha256)?;

    let config_path = directory.join(&manifest.config.filename);
    validate_file(&config_path, &manifest.config.sha256)?;
    let config: TrainingConfig = read_json(&config_path)?;

    Ok(LoadOutcome {
        manifest,
        config,
        model_weights_path: model_path,
    })
}

/// Overwrites every variable of `varmap` with the tensor of the same name
/// stored at `weights_path`.
pub fn apply_model_weights(varmap: &mut VarMap, weights_path: &Path) -> Result<(), TrainingError> {
    varmap.load(weights_path).map_err(to_runtime_error)
}

pub fn fingerprint_config(config: &TrainingConfig) -> Result<String, TrainingError> {
    let json = serde_json::to_vec(config)
        .map_err(|err| TrainingError::runtime(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha256 = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256,
        bytes,
    })
}

fn checkpoint_directories(base: &Path) -> Result<Vec<PathBuf>, TrainingError> {
    let mut dirs = Vec::new();
    if !base.exists() {
        return Ok(dirs);
    }
    let entries = fs::read_dir(base).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to read checkpoint directory {}: {err}",
            base.display()
        ))
    })?;
    for entry in entries {
        let entry = entry.map_err(|err| {
            TrainingError::runtime(format!("failed to read checkpoint entry: {err}"))
        })?;
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if is_dir && entry.file_name().to_string_lossy().starts_with("step_") {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn load_manifest(directory: &Path) -> Result<CheckpointManifest, TrainingError> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(TrainingError::runtime(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    read_json(&manifest_path)
}

fn ensure_version_supported(version: u32) -> Result<(), TrainingError> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::runtime(format!(
            "unsupported checkpoint version {version} (expected {CHECKPOINT_VERSION})"
        )));
    }
    Ok(())
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    if sha256_file(path)? != expected_sha {
        return Err(TrainingError::runtime(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1 << 20];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    data.push(b'\n');
    File::create(path)
        .and_then(|mut file| file.write_all(&data))
        .map_err(|err| TrainingError::runtime(format!("failed to write {}: {err}", path.display())))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

fn prune_checkpoints(base: &Path, max_keep: Option<usize>) -> Result<(), TrainingError> {
    let Some(limit) = max_keep.filter(|&n| n > 0) else {
        return Ok(());
    };
    let mut dirs = checkpoint_directories(base)?;
    dirs.sort();
    let excess = dirs.len().saturating_sub(limit);
    for victim in dirs.into_iter().take(excess) {
        log::debug!("pruning checkpoint {}", victim.display());
        fs::remove_dir_all(&victim).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to prune checkpoint {}: {err}",
                victim.display()
            ))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{Init, VarBuilder};

    fn config() -> TrainingConfig {
        toml::from_str("[data]\ncorpus = \"input.txt\"\n").expect("config")
    }

    fn varmap_with(value: f64) -> VarMap {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.pp("layer")
            .get_with_hints((2, 3), "weight", Init::Const(value))
            .expect("create var");
        varmap
    }

    fn save(base: &Path, varmap: &VarMap, step: usize, max_keep: Option<usize>) -> CheckpointDescriptor {
        save_checkpoint(SaveRequest {
            base_dir: base,
            config: &config(),
            varmap,
            progress: TrainingProgressSnapshot {
                step,
                tokens_seen: step as u64 * 64,
                best_eval_loss: None,
            },
            rng: RngSnapshot { master_seed: 7 },
            max_keep,
        })
        .expect("save checkpoint")
    }

    fn weight(varmap: &VarMap) -> Tensor {
        let data = varmap.data().lock().expect("lock varmap");
        data.get("layer.weight").expect("var").as_tensor().clone()
    }

    #[test]
    fn weights_round_trip_through_latest_checkpoint() {
        let dir = tempfile::tempdir().expect("tempdir");
        save(dir.path(), &varmap_with(1.5), 10, None);
        save(dir.path(), &varmap_with(2.5), 20, None);

        let latest = latest_checkpoint(dir.path()).expect("latest").expect("some");
        assert!(latest.directory.ends_with("step_000000000020"));
        assert_eq!(latest.manifest.progress.step, 20);

        let outcome = load_checkpoint(&latest.directory).expect("load");
        assert_eq!(outcome.config.data.block_size, config().data.block_size);
        let mut restored = varmap_with(0.0);
        apply_model_weights(&mut restored, &outcome.model_weights_path).expect("apply");
        let values = weight(&restored)
            .flatten_all()
            .and_then(|t| t.to_vec1::<f32>())
            .expect("values");
        assert!(values.iter().all(|&v| v == 2.5));
    }

    #[test]
    fn tampered_weights_fail_validation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let descriptor = save(dir.path(), &varmap_with(1.0), 1, None);
        let weights = descriptor.directory.join(MODEL_FILENAME);
        let mut bytes = fs::read(&weights).expect("read");
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&weights, bytes).expect("write");
        assert!(load_checkpoint(&descriptor.directory).is_err());
    }

    #[test]
    fn pruning_keeps_newest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let varmap = varmap_with(1.0);
        for step in [1, 2, 3, 4] {
            save(dir.path(), &varmap, step, Some(2));
        }
        let mut remaining = checkpoint_directories(dir.path()).expect("dirs");
        remaining.sort();
        assert_eq!(remaining.len(), 2);
        assert!(remaining[0].ends_with("step_000000000003"));
    }

    #[test]
    fn empty_directory_has_no_latest() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(latest_checkpoint(&dir.path().join("missing")).expect("ok").is_none());
    }
}
