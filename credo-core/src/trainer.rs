//! The training orchestrator.
//!
//! One epoch loop serves every model family. The only family-specific piece
//! is the [`BatchProtocol`] chosen at construction, which says where a batch
//! keeps its labels.
//!
//! Lifecycle: `Idle -> Training(epoch) -> Validating(epoch) -> ... -> Done`,
//! or `Cancelled` when the cancellation token fires between batches.

use crate::batch::{Batch, BatchProtocol};
use crate::checkpoint::{BestTracker, CheckpointMeta, CheckpointRecord, CheckpointWriter, Selection};
use crate::data::{DataLoader, DataSource, Dataset, split_indices};
use crate::error::{CredoError, Result};
use crate::evaluator::{Evaluator, MetricReport};
use crate::model::{Mode, TrainableModel};
use crate::reproducibility::{SHUFFLE, SPLIT, SeedManager};
use crate::scheduler::LrScheduler;
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::Optimizer;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where the orchestrator is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainerState {
    Idle,
    Training { epoch: usize },
    Validating { epoch: usize },
    Done,
    Cancelled,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// Interrupted between batches; the last written checkpoint is intact.
    Cancelled,
}

/// What to do when a training batch produces a NaN or infinite loss.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NonFinitePolicy {
    /// Report it, skip the optimizer step for that batch, keep going.
    #[default]
    Skip,
    /// Stop the run with [`CredoError::NonFiniteLoss`].
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NonFiniteLoss {
    pub epoch: usize,
    pub batch: usize,
    pub value: f64,
}

/// Everything observed during one epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    /// Example-weighted mean of the finite training losses.
    pub train_loss: Option<f64>,
    pub examples: usize,
    pub optimizer_steps: usize,
    pub learning_rate: f64,
    pub val_loss: Option<f64>,
    pub metrics: Option<MetricReport>,
    pub checkpointed: bool,
    pub non_finite: Vec<NonFiniteLoss>,
    /// The run was cancelled partway through this epoch. Only the training
    /// fields are filled in; no validation ran.
    #[serde(default)]
    pub interrupted: bool,
}

/// Result of [`Trainer::fit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitReport {
    pub status: RunStatus,
    pub epochs_completed: usize,
    pub history: Vec<EpochRecord>,
    pub best: Option<CheckpointRecord>,
}

impl FitReport {
    pub fn total_optimizer_steps(&self) -> usize {
        self.history.iter().map(|r| r.optimizer_steps).sum()
    }

    pub fn non_finite_losses(&self) -> impl Iterator<Item = &NonFiniteLoss> {
        self.history.iter().flat_map(|r| r.non_finite.iter())
    }
}

/// Options for one call to [`Trainer::fit`] or [`Trainer::fit_dataset`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitOptions {
    pub epochs: usize,
    /// Ignored by [`Trainer::fit`]; pre-batched sources carry their own size.
    pub batch_size: usize,
    /// Fraction of a raw dataset held out for validation.
    pub validate_size: Option<f64>,
    /// Keep the best checkpoint. Has no effect without validation.
    pub saved: bool,
    pub save_dir: PathBuf,
    pub save_name: Option<String>,
    pub selection: Selection,
    pub grad_clip_max_norm: Option<f64>,
    pub non_finite: NonFinitePolicy,
    pub seed: u64,
    pub shuffle: bool,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 64,
            validate_size: None,
            saved: false,
            save_dir: PathBuf::from("save"),
            save_name: None,
            selection: Selection::default(),
            grad_clip_max_norm: None,
            non_finite: NonFinitePolicy::default(),
            seed: 42,
            shuffle: true,
        }
    }
}

impl FitOptions {
    pub fn epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn validate_size(mut self, fraction: f64) -> Self {
        self.validate_size = Some(fraction);
        self
    }

    pub fn saved(mut self, dir: impl Into<PathBuf>) -> Self {
        self.saved = true;
        self.save_dir = dir.into();
        self
    }

    pub fn save_name(mut self, name: impl Into<String>) -> Self {
        self.save_name = Some(name.into());
        self
    }

    pub fn selection(mut self, selection: Selection) -> Self {
        self.selection = selection;
        self
    }

    pub fn grad_clip(mut self, max_norm: f64) -> Self {
        self.grad_clip_max_norm = Some(max_norm);
        self
    }

    pub fn non_finite(mut self, policy: NonFinitePolicy) -> Self {
        self.non_finite = policy;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub(crate) fn check(&self, evaluator: &Evaluator) -> Result<()> {
        if self.batch_size == 0 {
            return Err(CredoError::config("batch_size must be positive"));
        }
        if let Some(clip) = self.grad_clip_max_norm {
            if !(clip.is_finite() && clip > 0.0) {
                return Err(CredoError::config(format!(
                    "grad_clip_max_norm must be positive, got {clip}"
                )));
            }
        }
        if let Selection::Metric { name, .. } = &self.selection {
            if !evaluator.reports(name) {
                return Err(CredoError::config(format!(
                    "selection metric '{name}' is not computed by the evaluator"
                )));
            }
        }
        Ok(())
    }
}

/// Concatenated output of one evaluation pass.
struct Pass {
    report: MetricReport,
    loss: Option<f64>,
}

/// Per-epoch training tallies.
#[derive(Default)]
struct EpochTally {
    batches: usize,
    examples: usize,
    loss_sum: f64,
    loss_examples: usize,
    steps: usize,
    non_finite: Vec<NonFiniteLoss>,
    cancelled: bool,
}

impl EpochTally {
    fn into_record(self, epoch: usize, learning_rate: f64) -> EpochRecord {
        EpochRecord {
            epoch,
            train_loss: (self.loss_examples > 0)
                .then(|| self.loss_sum / self.loss_examples as f64),
            examples: self.examples,
            optimizer_steps: self.steps,
            learning_rate,
            val_loss: None,
            metrics: None,
            checkpointed: false,
            non_finite: self.non_finite,
            interrupted: false,
        }
    }
}

/// Drives training and evaluation of one borrowed model.
///
/// The trainer owns the optimizer, the optional scheduler, and the evaluator
/// for the duration of the run. The model and data sources are borrowed and
/// outlive it.
pub struct Trainer<'m, M: TrainableModel + ?Sized, O: Optimizer> {
    model: &'m mut M,
    evaluator: Evaluator,
    optimizer: O,
    scheduler: Option<Box<dyn LrScheduler>>,
    protocol: BatchProtocol,
    device: Device,
    cancel: CancellationToken,
    state: TrainerState,
}

impl<'m, M: TrainableModel + ?Sized, O: Optimizer> Trainer<'m, M, O> {
    /// Assemble a trainer around an optimizer already bound to the model's
    /// parameters. Fails if the model does not live on `device`.
    pub fn new(
        model: &'m mut M,
        evaluator: Evaluator,
        optimizer: O,
        protocol: BatchProtocol,
        device: &Device,
    ) -> Result<Self> {
        if !model.device().same_device(device) {
            return Err(CredoError::device(format!(
                "model '{}' is on {:?}, trainer requested {device:?}",
                model.name(),
                model.device()
            )));
        }
        if let Some(var) = model
            .parameters()
            .iter()
            .find(|v| !v.device().same_device(device))
        {
            return Err(CredoError::device(format!(
                "parameter of shape {:?} is on {:?}, expected {device:?}",
                var.shape(),
                var.device()
            )));
        }
        Ok(Self {
            model,
            evaluator,
            optimizer,
            scheduler: None,
            protocol,
            device: device.clone(),
            cancel: CancellationToken::new(),
            state: TrainerState::Idle,
        })
    }

    /// Build the optimizer from the model's parameters and `config`.
    pub fn with_optimizer_config(
        model: &'m mut M,
        evaluator: Evaluator,
        config: O::Config,
        protocol: BatchProtocol,
        device: &Device,
    ) -> Result<Self> {
        let optimizer = O::new(model.parameters(), config)?;
        Self::new(model, evaluator, optimizer, protocol, device)
    }

    pub fn with_scheduler(mut self, scheduler: impl LrScheduler + 'static) -> Self {
        self.scheduler = Some(Box::new(scheduler));
        self
    }

    /// Poll `token` between batches and stop the run when it fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    pub fn protocol(&self) -> &BatchProtocol {
        &self.protocol
    }

    pub fn model(&self) -> &M {
        &*self.model
    }

    /// Train for `opts.epochs` epochs over an already-batched source.
    ///
    /// Checkpointing only happens when `validation` is supplied: without it
    /// there is no selection signal, whatever `opts.saved` says.
    pub fn fit(
        &mut self,
        train: &dyn DataSource,
        validation: Option<&dyn DataSource>,
        opts: &FitOptions,
    ) -> Result<FitReport> {
        opts.check(&self.evaluator)?;
        if opts.validate_size.is_some() {
            return Err(CredoError::config(
                "validate_size requires a raw dataset; use fit_dataset or pass a validation source",
            ));
        }

        let mut report = FitReport {
            status: RunStatus::Completed,
            epochs_completed: 0,
            history: Vec::with_capacity(opts.epochs),
            best: None,
        };
        if opts.epochs == 0 {
            self.state = TrainerState::Done;
            info!(model = self.model.name(), "zero epochs requested, nothing to train");
            return Ok(report);
        }

        let writer = match (opts.saved, validation.is_some()) {
            (true, true) => {
                let name = opts
                    .save_name
                    .clone()
                    .unwrap_or_else(|| CheckpointWriter::default_name(self.model.name()));
                Some(CheckpointWriter::new(&opts.save_dir, name))
            }
            (true, false) => {
                warn!("checkpointing requested without a validation source; no checkpoint will be written");
                None
            }
            (false, _) => None,
        };
        let mut tracker = BestTracker::new(opts.selection.goal());

        for epoch in 1..=opts.epochs {
            self.state = TrainerState::Training { epoch };
            let learning_rate = self.optimizer.learning_rate();
            let tally = self.train_epoch(train, epoch, opts)?;

            if tally.batches == 0 && !tally.cancelled {
                return Err(CredoError::empty_data(
                    "training source yielded no batches",
                ));
            }
            let (cancelled, processed) = (tally.cancelled, tally.batches > 0);
            let mut record = tally.into_record(epoch, learning_rate);
            if cancelled {
                self.state = TrainerState::Cancelled;
                report.status = RunStatus::Cancelled;
                warn!(
                    epoch,
                    optimizer_steps = record.optimizer_steps,
                    "run cancelled; keeping last checkpoint"
                );
                if processed {
                    record.interrupted = true;
                    report.history.push(record);
                }
                return Ok(report);
            }

            if let Some(scheduler) = self.scheduler.as_mut() {
                let next = scheduler.next_lr(epoch, learning_rate);
                self.optimizer.set_learning_rate(next);
                debug!(epoch, lr = next, "scheduler step");
            }

            if let Some(source) = validation {
                self.state = TrainerState::Validating { epoch };
                let pass = self.run_pass(source, true)?;
                let val_loss = pass.loss.unwrap_or(f64::NAN);

                if let Some(writer) = &writer {
                    let score = opts
                        .selection
                        .score(val_loss, &pass.report)
                        .unwrap_or(f64::NAN);
                    if tracker.offer(score) {
                        let saved = writer.write(
                            self.model.var_map(),
                            CheckpointMeta {
                                model: self.model.name(),
                                epoch,
                                selection: &opts.selection,
                                score,
                                seed: opts.seed,
                            },
                        )?;
                        info!(epoch, score, path = %saved.weights_path.display(), "saved best checkpoint");
                        record.checkpointed = true;
                        report.best = Some(saved);
                    }
                }
                record.val_loss = Some(val_loss);
                record.metrics = Some(pass.report);
            }

            info!(
                epoch,
                train_loss = ?record.train_loss,
                val_loss = ?record.val_loss,
                metrics = %record.metrics.as_ref().map(ToString::to_string).unwrap_or_default(),
                checkpointed = record.checkpointed,
                non_finite = record.non_finite.len(),
                "epoch finished"
            );
            report.history.push(record);
            report.epochs_completed = epoch;
        }

        self.state = TrainerState::Done;
        Ok(report)
    }

    /// Train over a raw dataset, batching it with `opts.batch_size`.
    ///
    /// Validation comes from either `validate_data` or `opts.validate_size`,
    /// never both. A fractional split is drawn once from the run seed and kept
    /// for the whole run.
    pub fn fit_dataset<'d>(
        &mut self,
        data: &'d dyn Dataset,
        validate_data: Option<&'d dyn Dataset>,
        opts: &FitOptions,
    ) -> Result<FitReport> {
        opts.check(&self.evaluator)?;
        if validate_data.is_some() && opts.validate_size.is_some() {
            return Err(CredoError::config(
                "pass either validate_data or validate_size, not both",
            ));
        }
        if opts.epochs > 0 && data.is_empty() {
            return Err(CredoError::empty_data("training dataset has no examples"));
        }

        let seeds = SeedManager::new(opts.seed);
        let mut train: DataLoader<'d, dyn Dataset + 'd> =
            DataLoader::new(data, opts.batch_size, &self.device)?;
        let mut held_out: Option<DataLoader<'d, dyn Dataset + 'd>> = None;

        if let Some(fraction) = opts.validate_size.filter(|_| opts.epochs > 0) {
            let (train_idx, val_idx) =
                split_indices(data.len(), fraction, seeds.seed_for(SPLIT))?;
            info!(
                train = train_idx.len(),
                validation = val_idx.len(),
                "split training data"
            );
            held_out = Some(
                DataLoader::new(data, opts.batch_size, &self.device)?.with_indices(val_idx)?,
            );
            train = train.with_indices(train_idx)?;
        } else if let Some(val) = validate_data {
            held_out = Some(DataLoader::new(val, opts.batch_size, &self.device)?);
        }
        if opts.shuffle {
            train = train.shuffled(seeds.seed_for(SHUFFLE));
        }

        let inner = FitOptions {
            validate_size: None,
            ..opts.clone()
        };
        self.fit(
            &train,
            held_out.as_ref().map(|l| l as &dyn DataSource),
            &inner,
        )
    }

    /// Evaluate on held-out data. Metrics are computed once over the full
    /// concatenation of predictions and labels.
    pub fn evaluate(&mut self, source: &dyn DataSource) -> Result<MetricReport> {
        let pass = self.run_pass(source, false)?;
        info!(result = %pass.report, "evaluation finished");
        Ok(pass.report)
    }

    pub fn evaluate_dataset(&mut self, data: &dyn Dataset, batch_size: usize) -> Result<MetricReport> {
        let loader = DataLoader::new(data, batch_size, &self.device)?;
        self.evaluate(&loader)
    }

    fn train_epoch(
        &mut self,
        source: &dyn DataSource,
        epoch: usize,
        opts: &FitOptions,
    ) -> Result<EpochTally> {
        self.model.set_mode(Mode::Train);
        let params: Vec<Var> = match opts.grad_clip_max_norm {
            Some(_) => self.model.parameters(),
            None => Vec::new(),
        };
        let mut tally = EpochTally::default();

        for (index, batch) in source.batches(epoch - 1).enumerate() {
            if self.cancel.is_cancelled() {
                tally.cancelled = true;
                break;
            }
            let batch = batch?;
            let examples = self.checked_example_count(&batch)?;
            tally.batches += 1;
            tally.examples += examples;

            let loss = self.model.compute_loss(&batch)?;
            let value = scalar(&loss)?;
            if !value.is_finite() {
                let event = NonFiniteLoss {
                    epoch,
                    batch: index,
                    value,
                };
                warn!(epoch, batch = index, value, "non-finite training loss");
                if opts.non_finite == NonFinitePolicy::Abort {
                    return Err(CredoError::NonFiniteLoss {
                        epoch,
                        batch: index,
                        value,
                    });
                }
                tally.non_finite.push(event);
                continue;
            }

            // backward() builds a fresh gradient store, so nothing carries over
            // from the previous step.
            let mut grads = loss.backward()?;
            if let Some(max_norm) = opts.grad_clip_max_norm {
                clip_grad_norm(&mut grads, &params, max_norm)?;
            }
            self.optimizer.step(&grads)?;
            tally.steps += 1;
            tally.loss_sum += value * examples as f64;
            tally.loss_examples += examples;
            debug!(epoch, batch = index, loss = value, "train step");
        }
        Ok(tally)
    }

    /// One evaluation-mode pass: collect predictions and labels in order,
    /// concatenate once, evaluate once.
    fn run_pass(&mut self, source: &dyn DataSource, with_loss: bool) -> Result<Pass> {
        self.model.set_mode(Mode::Eval);
        let mut predictions = Vec::new();
        let mut labels = Vec::new();
        let mut loss_sum = 0.0;
        let mut examples = 0usize;

        for batch in source.batches(0) {
            let batch = batch?;
            let count = self.checked_example_count(&batch)?;
            let batch_labels = self.protocol.labels(&batch)?;
            let batch_predictions = self.model.predict(&batch)?.detach();

            let rows = batch_predictions.dims().first().copied().unwrap_or(0);
            if rows != count {
                return Err(CredoError::batch(format!(
                    "model '{}' returned {rows} predictions for {count} examples",
                    self.model.name()
                )));
            }
            if with_loss {
                loss_sum += scalar(&self.model.compute_loss(&batch)?)? * count as f64;
            }
            examples += count;
            predictions.push(batch_predictions);
            labels.push(batch_labels);
        }

        if predictions.is_empty() {
            return Err(CredoError::empty_data("evaluation source yielded no batches"));
        }
        let predictions = Tensor::cat(&predictions, 0)?;
        let labels = Tensor::cat(&labels, 0)?;
        let report = self.evaluator.evaluate(&predictions, &labels)?;
        Ok(Pass {
            report,
            loss: with_loss.then(|| loss_sum / examples as f64),
        })
    }

    fn checked_example_count(&self, batch: &Batch) -> Result<usize> {
        self.protocol.check_device(batch, &self.device)?;
        self.protocol.example_count(batch)
    }
}

/// Read a one-element loss tensor as `f64`.
fn scalar(loss: &Tensor) -> Result<f64> {
    let values = loss.flatten_all()?.to_dtype(DType::F64)?.to_vec1::<f64>()?;
    match values.as_slice() {
        [v] => Ok(*v),
        _ => Err(CredoError::batch(format!(
            "loss must be a scalar, got shape {:?}",
            loss.dims()
        ))),
    }
}

/// Rescale gradients so their global L2 norm is at most `max_norm`.
fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<()> {
    let mut total = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.sqr()?.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        }
    }
    let norm = total.sqrt();
    if norm <= max_norm || norm == 0.0 {
        return Ok(());
    }
    let scale = max_norm / norm;
    for var in vars {
        if let Some(g) = grads.remove(var.as_tensor()) {
            grads.insert(var.as_tensor(), g.affine(scale, 0.0)?);
        }
    }
    Ok(())
}
