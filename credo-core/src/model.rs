//! The contract every trainable model exposes to the orchestrator.

use crate::batch::Batch;
use crate::error::Result;
use candle_core::{Device, Tensor, Var};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

/// Training or evaluation behaviour of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Regularization such as dropout is active.
    Train,
    Eval,
}

/// A model that can be driven by [`crate::trainer::Trainer`].
///
/// `compute_loss` receives the whole batch, not a pre-split input/label pair,
/// because some models read auxiliary fields (event ids, masks) next to the
/// label. `predict` must return one row per example, aligned with the label
/// tensor the batch protocol extracts from the same batch.
pub trait TrainableModel {
    /// Stable identifier, used for default checkpoint names.
    fn name(&self) -> &str;

    /// Scalar loss, differentiable with respect to [`Self::parameters`].
    fn compute_loss(&self, batch: &Batch) -> Result<Tensor>;

    /// Per-example scores or class indices, leading dimension = example count.
    fn predict(&self, batch: &Batch) -> Result<Tensor>;

    /// Named parameter store, used for optimizer construction and checkpoints.
    fn var_map(&self) -> &VarMap;

    /// Device every tensor produced by this model lives on.
    fn device(&self) -> &Device;

    fn set_mode(&mut self, mode: Mode);

    fn parameters(&self) -> Vec<Var> {
        self.var_map().all_vars()
    }
}
