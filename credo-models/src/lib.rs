//! # credo-models: reference models for the Credo harness
//!
//! One model per supported batch shape, each trainable end to end on seeded
//! synthetic data:
//!
//! - `text_mlp`: keyed-tensor batches (`input_ids`, `mask`, `label`)
//! - `graph_mean`: structured-graph batches (labels in `y`)

mod init;

pub mod graph;
pub mod runner;
pub mod synthetic;
pub mod text;

pub use graph::{GraphMean, GraphMeanConfig};
pub use synthetic::{GraphDataset, TextDataset};
pub use text::{TextMlp, TextMlpConfig};

use credo_core::{ModelRegistry, Result};

/// Register every built-in model.
pub fn register_builtin(registry: &mut ModelRegistry) -> Result<()> {
    registry.register(
        "text_mlp",
        "Mean-pooled token embeddings with a linear head (keyed batches)",
        runner::run_text_mlp,
    )?;
    registry.register(
        "graph_mean",
        "One mean-aggregation message-passing layer with mean pooling (graph batches)",
        runner::run_graph_mean,
    )?;
    Ok(())
}

/// A registry holding every built-in model.
pub fn builtin_registry() -> Result<ModelRegistry> {
    let mut registry = ModelRegistry::new();
    register_builtin(&mut registry)?;
    Ok(registry)
}
