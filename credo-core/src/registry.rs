//! Model registry: maps a model name to the function that runs it.
//!
//! Entry points are plain function pointers registered at startup, so the
//! command line can pick a model by name without any dynamic lookup. Each one
//! receives the caller's cancellation token and hands it to its trainer.

use crate::config::RunConfig;
use crate::error::{CredoError, Result};
use crate::evaluator::MetricReport;
use crate::trainer::FitReport;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Everything a finished run hands back to its caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub model: String,
    pub fit: FitReport,
    /// Metrics on the held-out test split, when one was carved out.
    pub test: Option<MetricReport>,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {:?} after {} epoch(s)",
            self.model, self.fit.status, self.fit.epochs_completed
        )?;
        if let Some(best) = &self.fit.best {
            write!(f, ", best epoch {} ({}={:.4})", best.epoch, best.selection, best.score)?;
        }
        if let Some(test) = &self.test {
            write!(f, ", test: {test}")?;
        }
        Ok(())
    }
}

/// Runs one model end to end from a resolved configuration.
pub type EntryPoint = fn(&RunConfig, &CancellationToken) -> Result<RunSummary>;

#[derive(Debug, Clone, Copy)]
pub struct RegisteredModel {
    pub description: &'static str,
    pub entry: EntryPoint,
}

#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, RegisteredModel>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model. Returns error if the name is already taken.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        description: &'static str,
        entry: EntryPoint,
    ) -> Result<()> {
        let name = name.into();
        if self.models.contains_key(&name) {
            return Err(CredoError::config(format!(
                "model '{name}' is already registered"
            )));
        }
        debug!(model = %name, "Registering model");
        self.models.insert(name, RegisteredModel { description, entry });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&RegisteredModel> {
        self.models.get(name).ok_or_else(|| CredoError::UnknownModel {
            name: name.to_string(),
            known: self.names().join(", "),
        })
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.models.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RegisteredModel)> {
        self.models.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Validate `config` and run the named model with it. Cancelling `cancel`
    /// stops training after the current batch.
    pub fn run(
        &self,
        name: &str,
        config: &RunConfig,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        let model = self.get(name)?;
        config.validate()?;
        info!(model = %name, epochs = config.epochs, device = %config.device, seed = config.seed, "Running model");
        (model.entry)(config, cancel)
    }
}
