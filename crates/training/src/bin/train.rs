use std::{
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use serde_json::{Map, Number, Value};
use tracing_subscriber::EnvFilter;
use training::{Trainer, TrainingConfig, TrainingError};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Mixture-of-experts transformer training CLI", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to training config file (.toml or .json)"
    )]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(
        long,
        value_name = "CHECKPOINT",
        num_args = 0..=1,
        help = "Resume from the given checkpoint directory, or the latest one when no path is given"
    )]
    resume: Option<Option<PathBuf>>,

    #[arg(
        long,
        default_value_t = 0,
        help = "Characters to sample from the trained model before exiting"
    )]
    sample_tokens: usize,

    #[arg(long, default_value_t = 0.8, help = "Sampling temperature; 0 picks the arg-max")]
    temperature: f64,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = TrainingConfig::load(&args.config)?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
        config.validate()?;
    }

    let mut trainer = Trainer::new(config)?;

    match &args.resume {
        Some(Some(path)) => {
            let descriptor = trainer.resume_from_path(path)?;
            println!(
                "resumed from checkpoint {} (step {})",
                descriptor.directory.display(),
                descriptor.manifest.progress.step
            );
        }
        Some(None) => match trainer.resume_from_latest()? {
            Some(descriptor) => println!(
                "resumed from checkpoint {} (step {})",
                descriptor.directory.display(),
                descriptor.manifest.progress.step
            ),
            None => println!("no checkpoint found, starting from scratch"),
        },
        None => {}
    }

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

    trainer.train_with_shutdown(|| shutdown_flag.load(Ordering::Relaxed))?;

    if shutdown_flag.load(Ordering::Relaxed) {
        trainer.save_checkpoint()?;
    }

    if args.sample_tokens > 0 {
        let validation = trainer.corpus().split(training::Split::Validation);
        let prompt = trainer.corpus().decode(&validation[..validation.len().min(1)]);
        let text = trainer.sample_text(&prompt, args.sample_tokens, args.temperature)?;
        println!("{text}");
    }

    Ok(())
}

fn apply_overrides(
    config: TrainingConfig,
    overrides: &[OverrideArg],
) -> Result<TrainingConfig, TrainingError> {
    let mut value = serde_json::to_value(config).map_err(|err| {
        TrainingError::runtime(format!("failed to serialize config for overrides: {err}"))
    })?;

    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value)?;
        set_value_at_path(&mut value, &override_arg.path, new_value)?;
    }

    serde_json::from_value(value).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to deserialize config after overrides: {err}"
        ))
    })
}

/// Booleans, `null`, numbers and inline JSON arrays/objects are typed; any
/// other value is kept as a string.
fn parse_override_value(raw: &str) -> Result<Value, TrainingError> {
    let trimmed = raw.trim();
    let lowered = trimmed.to_ascii_lowercase();
    let value = match lowered.as_str() {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        _ => {
            if let Ok(int_val) = trimmed.parse::<i64>() {
                Value::Number(Number::from(int_val))
            } else if let Some(number) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
                Value::Number(number)
            } else if trimmed.starts_with('[') || trimmed.starts_with('{') {
                serde_json::from_str(trimmed).map_err(|err| {
                    TrainingError::runtime(format!("invalid JSON override value '{trimmed}': {err}"))
                })?
            } else {
                Value::String(trimmed.to_string())
            }
        }
    };
    Ok(value)
}

/// Walks the dot-separated `path` through nested objects, creating missing
/// tables, and replaces the leaf.
fn set_value_at_path(root: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let segments: Vec<&str> = path.split('.').map(str::trim).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(TrainingError::runtime(format!(
            "override path '{path}' has an empty segment"
        )));
    }
    let Some((leaf, parents)) = segments.split_last() else {
        return Err(TrainingError::runtime("override path must not be empty"));
    };

    let mut current = root;
    for segment in parents {
        let map = as_object(current, segment)?;
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    as_object(current, leaf)?.insert(leaf.to_string(), new_value);
    Ok(())
}

fn as_object<'a>(value: &'a mut Value, segment: &str) -> Result<&'a mut Map<String, Value>, TrainingError> {
    if value.is_null() {
        *value = Value::Object(Map::new());
    }
    value.as_object_mut().ok_or_else(|| {
        TrainingError::runtime(format!(
            "override path segment '{segment}' points into a non-object value"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_reach_nested_moe_settings() {
        let config: TrainingConfig =
            toml::from_str("[data]\ncorpus = \"input.txt\"\n").expect("config");
        let overrides = [
            "model.moe.num_experts=8".parse::<OverrideArg>().expect("override"),
            "model.moe.router_str=hash".parse().expect("override"),
            "runtime.max_steps=3".parse().expect("override"),
        ];
        let updated = apply_overrides(config, &overrides).expect("apply");
        assert_eq!(updated.model.moe.num_experts, 8);
        assert_eq!(updated.model.moe.router_str, "hash");
        assert_eq!(updated.runtime.max_steps, 3);
    }

    #[test]
    fn override_values_are_typed() {
        assert_eq!(parse_override_value("true").expect("bool"), Value::Bool(true));
        assert_eq!(parse_override_value("3").expect("int"), Value::from(3));
        assert_eq!(
            parse_override_value("alibi").expect("string"),
            Value::String("alibi".into())
        );
        assert!("missing-equals".parse::<OverrideArg>().is_err());
        let mut root = Value::from(3);
        assert!(set_value_at_path(&mut root, "a.b", Value::Null).is_err());
    }
}
