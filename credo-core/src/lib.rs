//! # credo-core: uniform training and evaluation harness
//!
//! One orchestrator trains, validates, checkpoints and evaluates models of
//! different families. Models plug in through [`TrainableModel`]; the only
//! family-specific knowledge the orchestrator holds is a [`BatchProtocol`]
//! that says where a batch keeps its labels.
//!
//! Evaluation always concatenates predictions and labels across batches and
//! computes metrics once, so non-decomposable metrics (F1, AUC) are exact.

// Data
pub mod batch;
pub mod data;

// Models and training
pub mod model;
pub mod scheduler;
pub mod trainer;

// Evaluation and selection
pub mod checkpoint;
pub mod evaluator;

// Foundation
pub mod config;
pub mod error;
pub mod registry;
pub mod reproducibility;

// Re-exports
pub use batch::{Batch, BatchProtocol, Graph, GraphBatch, KeyedBatch, ModelInput};
pub use checkpoint::{CheckpointRecord, CheckpointWriter, Goal, Selection, load_checkpoint};
pub use config::{ConfigOverrides, DatasetConfig, RunConfig, load_run_config, parse_device};
pub use data::{DataLoader, DataSource, Dataset, PreBatched, Subset, split_indices};
pub use error::{CredoError, Result};
pub use evaluator::{Evaluator, Metric, MetricReport};
pub use model::{Mode, TrainableModel};
pub use registry::{EntryPoint, ModelRegistry, RunSummary};
pub use reproducibility::SeedManager;
pub use scheduler::{CosineLr, LambdaLr, LrScheduler, StepLr};
pub use tokio_util::sync::CancellationToken;
pub use trainer::{
    EpochRecord, FitOptions, FitReport, NonFiniteLoss, NonFinitePolicy, RunStatus, Trainer,
    TrainerState,
};
