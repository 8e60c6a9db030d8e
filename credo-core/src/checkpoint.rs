//! Best-checkpoint selection and persistence.
//!
//! A run keeps a single "best so far" slot. Each write stages the weights and
//! the JSON manifest as temporary siblings, then renames the weights and the
//! manifest into place. A crash before the renames leaves the previous pair
//! untouched. A crash between them leaves a manifest whose digest no longer
//! matches the weights, which [`CheckpointRecord::verify`] reports.

use crate::error::{CredoError, Result};
use crate::evaluator::{Metric, MetricReport};
use candle_nn::VarMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};

/// Direction in which a selection score improves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Goal {
    Minimize,
    Maximize,
}

/// The scalar that decides whether a new checkpoint supersedes the best one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum Selection {
    /// Mean validation loss, lower is better.
    #[default]
    ValidationLoss,
    /// A metric reported by the evaluator.
    Metric { name: String, goal: Goal },
}

impl Selection {
    /// Select on a metric where higher is better.
    pub fn maximize(name: impl Into<String>) -> Self {
        Self::Metric {
            name: name.into(),
            goal: Goal::Maximize,
        }
    }

    pub fn goal(&self) -> Goal {
        match self {
            Self::ValidationLoss => Goal::Minimize,
            Self::Metric { goal, .. } => *goal,
        }
    }

    /// Pick this criterion's value out of a validation pass. A metric missing
    /// from the report yields `None`.
    pub fn score(&self, val_loss: f64, report: &MetricReport) -> Option<f64> {
        match self {
            Self::ValidationLoss => Some(val_loss),
            Self::Metric { name, .. } => {
                let canonical = Metric::parse(name).ok()?;
                report.get(canonical.name())
            }
        }
    }
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ValidationLoss => f.write_str("val_loss"),
            Self::Metric { name, goal } => write!(f, "{name} ({goal:?})"),
        }
    }
}

/// Tracks the best selection score seen so far in a run.
#[derive(Debug, Clone)]
pub struct BestTracker {
    goal: Goal,
    best: Option<f64>,
}

impl BestTracker {
    pub fn new(goal: Goal) -> Self {
        Self { goal, best: None }
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    /// Whether `score` is strictly better than every score recorded so far.
    /// Non-finite scores never qualify.
    pub fn is_improvement(&self, score: f64) -> bool {
        if !score.is_finite() {
            return false;
        }
        match (self.best, self.goal) {
            (None, _) => true,
            (Some(best), Goal::Minimize) => score < best,
            (Some(best), Goal::Maximize) => score > best,
        }
    }

    /// Record `score` if it improves on the best; returns whether it did.
    pub fn offer(&mut self, score: f64) -> bool {
        let improved = self.is_improvement(score);
        if improved {
            self.best = Some(score);
        }
        improved
    }
}

/// Manifest written next to the best weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub id: String,
    pub name: String,
    pub model: String,
    pub epoch: usize,
    pub selection: String,
    pub score: f64,
    /// Run seed, recorded for reproducibility audits.
    pub seed: u64,
    pub weights_path: PathBuf,
    pub sha256: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl CheckpointRecord {
    /// Load a manifest. Returns `Ok(None)` when none has been written.
    pub fn load_manifest(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Check that the weights file still matches the recorded size and digest.
    pub fn verify(&self) -> Result<()> {
        let bytes = std::fs::read(&self.weights_path).map_err(|e| {
            CredoError::checkpoint(format!("reading {}: {e}", self.weights_path.display()))
        })?;
        if bytes.len() as u64 != self.size_bytes {
            return Err(CredoError::checkpoint(format!(
                "{} is {} bytes, manifest records {}",
                self.weights_path.display(),
                bytes.len(),
                self.size_bytes
            )));
        }
        let digest = format!("{:x}", Sha256::digest(&bytes));
        if digest != self.sha256 {
            return Err(CredoError::checkpoint(format!(
                "{} does not match the manifest digest",
                self.weights_path.display()
            )));
        }
        Ok(())
    }
}

/// Metadata accompanying a checkpoint write.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointMeta<'a> {
    pub model: &'a str,
    pub epoch: usize,
    pub selection: &'a Selection,
    pub score: f64,
    pub seed: u64,
}

/// Writes the best-checkpoint slot for one run.
#[derive(Debug, Clone)]
pub struct CheckpointWriter {
    dir: PathBuf,
    name: String,
}

impl CheckpointWriter {
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            name: name.into(),
        }
    }

    /// `<model>-<UTC timestamp>`, used when the caller supplies no name.
    pub fn default_name(model: &str) -> String {
        format!("{model}-{}", Utc::now().format("%Y%m%dT%H%M%SZ"))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn weights_path(&self) -> PathBuf {
        self.dir.join(format!("{}.safetensors", self.name))
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(format!("{}.json", self.name))
    }

    /// Persist `vars` as the new best checkpoint, replacing the previous one.
    pub fn write(&self, vars: &VarMap, meta: CheckpointMeta<'_>) -> Result<CheckpointRecord> {
        std::fs::create_dir_all(&self.dir)?;
        let weights_path = self.weights_path();
        let manifest_path = self.manifest_path();
        let weights_tmp = staging_path(&weights_path);
        let manifest_tmp = staging_path(&manifest_path);

        vars.save(&weights_tmp)
            .map_err(|e| CredoError::checkpoint(format!("saving weights: {e}")))?;
        let bytes = std::fs::read(&weights_tmp)?;
        let record = CheckpointRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name: self.name.clone(),
            model: meta.model.to_string(),
            epoch: meta.epoch,
            selection: meta.selection.to_string(),
            score: meta.score,
            seed: meta.seed,
            weights_path: weights_path.clone(),
            sha256: format!("{:x}", Sha256::digest(&bytes)),
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
        };

        let json = serde_json::to_string_pretty(&record)?;
        if let Err(e) = std::fs::write(&manifest_tmp, json) {
            let _ = std::fs::remove_file(&weights_tmp);
            return Err(e.into());
        }

        std::fs::rename(&weights_tmp, &weights_path)?;
        std::fs::rename(&manifest_tmp, &manifest_path)?;
        Ok(record)
    }
}

/// Load checkpointed weights into an existing parameter store. Variable names
/// must match the ones the checkpoint was written with.
pub fn load_checkpoint(vars: &mut VarMap, path: &Path) -> Result<()> {
    vars.load(path)
        .map_err(|e| CredoError::checkpoint(format!("loading {}: {e}", path.display())))
}

fn staging_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}
