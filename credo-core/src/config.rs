//! Run configuration.
//!
//! Uses `figment` for layered configuration: defaults -> user config ->
//! run config file -> environment -> explicit overrides. The user config lives
//! at `~/.config/credo/config.toml`; environment variables are prefixed with
//! `CREDO_` and use `__` for nesting (`CREDO_DATASET__EXAMPLES=200`).

use crate::checkpoint::Selection;
use crate::error::{CredoError, Result};
use crate::evaluator::Evaluator;
use crate::trainer::{FitOptions, NonFinitePolicy};
use candle_core::Device;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Everything a registered entry point needs to run one experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub epochs: usize,
    pub batch_size: usize,
    /// Fraction of the training split held out for validation.
    pub validate_size: Option<f64>,
    /// Keep the best checkpoint (requires validation).
    pub saved: bool,
    pub save_dir: PathBuf,
    pub save_name: Option<String>,
    /// `cpu`, `cuda`, `cuda:N`, `metal` or `metal:N`.
    pub device: String,
    pub seed: u64,
    pub lr: f64,
    pub weight_decay: f64,
    pub metrics: Vec<String>,
    pub selection: Selection,
    pub grad_clip_max_norm: Option<f64>,
    pub non_finite: NonFinitePolicy,
    pub dataset: DatasetConfig,
}

/// Size of the synthetic dataset built by the reference entry points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub examples: usize,
    /// Share of examples reserved for the final test evaluation.
    pub test_fraction: f64,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            examples: 512,
            test_fraction: 0.2,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 32,
            validate_size: Some(0.2),
            saved: false,
            save_dir: PathBuf::from("save"),
            save_name: None,
            device: "cpu".into(),
            seed: 42,
            lr: 1e-3,
            weight_decay: 0.0,
            metrics: ["accuracy", "precision", "recall", "f1"]
                .map(String::from)
                .to_vec(),
            selection: Selection::default(),
            grad_clip_max_norm: None,
            non_finite: NonFinitePolicy::default(),
            dataset: DatasetConfig::default(),
        }
    }
}

impl RunConfig {
    /// Reject inconsistent options before any data is built.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(CredoError::config("batch_size must be positive"));
        }
        if let Some(f) = self.validate_size {
            if !(f > 0.0 && f < 1.0) {
                return Err(CredoError::config(format!(
                    "validate_size must be in (0, 1), got {f}"
                )));
            }
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(CredoError::config(format!("lr must be positive, got {}", self.lr)));
        }
        if !(0.0..1.0).contains(&self.dataset.test_fraction) {
            return Err(CredoError::config(format!(
                "dataset.test_fraction must be in [0, 1), got {}",
                self.dataset.test_fraction
            )));
        }
        parse_device_spec(&self.device)?;
        self.evaluator()?;
        self.fit_options().check(&self.evaluator()?)
    }

    pub fn evaluator(&self) -> Result<Evaluator> {
        Evaluator::new(&self.metrics)
    }

    pub fn device(&self) -> Result<Device> {
        parse_device(&self.device)
    }

    pub fn fit_options(&self) -> FitOptions {
        FitOptions {
            epochs: self.epochs,
            batch_size: self.batch_size,
            validate_size: self.validate_size,
            saved: self.saved,
            save_dir: self.save_dir.clone(),
            save_name: self.save_name.clone(),
            selection: self.selection.clone(),
            grad_clip_max_norm: self.grad_clip_max_norm,
            non_finite: self.non_finite,
            seed: self.seed,
            shuffle: true,
        }
    }
}

/// Command-line overrides. Unset fields leave lower layers untouched.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epochs: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save_dir: Option<PathBuf>,
}

/// Location of the user-level config file, if a home directory is known.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "credo", "credo")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides
/// 2. Environment variables (prefixed with `CREDO_`)
/// 3. `file`, when given
/// 4. User config (`~/.config/credo/config.toml`)
/// 5. Built-in defaults
pub fn load_run_config(file: Option<&Path>, overrides: &ConfigOverrides) -> Result<RunConfig> {
    let mut figment = Figment::from(Serialized::defaults(RunConfig::default()));

    if let Some(user) = user_config_path().filter(|p| p.exists()) {
        figment = figment.merge(Toml::file(user));
    }

    if let Some(path) = file {
        if !path.exists() {
            return Err(CredoError::config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        figment = figment.merge(Toml::file(path));
    }

    figment = figment
        .merge(Env::prefixed("CREDO_").split("__"))
        .merge(Serialized::defaults(overrides));

    let config: RunConfig = figment.extract().map_err(Box::new)?;
    config.validate()?;
    Ok(config)
}

enum DeviceSpec {
    Cpu,
    Cuda(usize),
    Metal(usize),
}

fn parse_device_spec(spec: &str) -> Result<DeviceSpec> {
    let spec = spec.trim().to_ascii_lowercase();
    let (kind, ordinal) = match spec.split_once(':') {
        Some((kind, n)) => {
            let n = n
                .parse::<usize>()
                .map_err(|_| CredoError::config(format!("bad device ordinal in '{spec}'")))?;
            (kind.to_string(), n)
        }
        None => (spec.clone(), 0),
    };
    match kind.as_str() {
        "cpu" if ordinal == 0 => Ok(DeviceSpec::Cpu),
        "cuda" => Ok(DeviceSpec::Cuda(ordinal)),
        "metal" => Ok(DeviceSpec::Metal(ordinal)),
        _ => Err(CredoError::config(format!(
            "unknown device '{spec}' (expected cpu, cuda[:N] or metal[:N])"
        ))),
    }
}

/// Resolve a device string. An unrecognized string is a configuration error;
/// a device that exists in name but cannot be opened is a device error.
pub fn parse_device(spec: &str) -> Result<Device> {
    let device = match parse_device_spec(spec)? {
        DeviceSpec::Cpu => return Ok(Device::Cpu),
        DeviceSpec::Cuda(n) => Device::new_cuda(n),
        DeviceSpec::Metal(n) => Device::new_metal(n),
    };
    device.map_err(|e| CredoError::device(format!("cannot open '{spec}': {e}")))
}
