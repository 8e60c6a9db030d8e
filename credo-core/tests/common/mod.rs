//! Small models and data sources shared by the integration tests.

#![allow(dead_code)]

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Init, Optimizer, SGD, VarMap};
use credo_core::{
    Batch, CredoError, DataSource, Dataset, KeyedBatch, Mode, PreBatched, Result, TrainableModel,
};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;

fn keyed(batch: &Batch) -> Result<&KeyedBatch> {
    batch
        .as_keyed()
        .ok_or_else(|| CredoError::batch("expected a keyed batch"))
}

fn field<'b>(batch: &'b KeyedBatch, name: &str) -> Result<&'b Tensor> {
    batch
        .get(name)
        .ok_or_else(|| CredoError::batch(format!("missing field '{name}'")))
}

/// Two-class logistic regression over a `(N, 2)` field named `x`.
pub struct Linear {
    vars: VarMap,
    w: Tensor,
    b: Tensor,
    device: Device,
}

impl Linear {
    pub fn new(device: &Device) -> Self {
        let vars = VarMap::new();
        let w = vars
            .get((2, 2), "w", Init::Const(0.0), DType::F32, device)
            .unwrap();
        let b = vars
            .get(2, "b", Init::Const(0.0), DType::F32, device)
            .unwrap();
        Self {
            vars,
            w,
            b,
            device: device.clone(),
        }
    }

    pub fn weights(&self) -> Vec<Vec<f32>> {
        self.w.to_vec2::<f32>().unwrap()
    }

    /// Weights then bias, flattened.
    pub fn flat_parameters(&self) -> Vec<f32> {
        let mut all: Vec<f32> = self.weights().into_iter().flatten().collect();
        all.extend(self.b.to_vec1::<f32>().unwrap());
        all
    }

    fn logits(&self, batch: &Batch) -> Result<Tensor> {
        let x = field(keyed(batch)?, "x")?;
        Ok(x.matmul(&self.w)?.broadcast_add(&self.b)?)
    }
}

impl TrainableModel for Linear {
    fn name(&self) -> &str {
        "linear"
    }

    fn compute_loss(&self, batch: &Batch) -> Result<Tensor> {
        let labels = field(keyed(batch)?, "label")?;
        Ok(candle_nn::loss::cross_entropy(&self.logits(batch)?, labels)?)
    }

    fn predict(&self, batch: &Batch) -> Result<Tensor> {
        Ok(candle_nn::ops::softmax(&self.logits(batch)?, 1)?)
    }

    fn var_map(&self) -> &VarMap {
        &self.vars
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn set_mode(&mut self, _mode: Mode) {}
}

/// A model whose predictions are read straight from a `pred` field and whose
/// losses follow a script.
pub struct Scripted {
    vars: VarMap,
    w: Tensor,
    device: Device,
    pub mode: Mode,
    train_losses: RefCell<VecDeque<f64>>,
    val_losses: RefCell<VecDeque<f64>>,
    pub predict_calls: Cell<usize>,
}

impl Scripted {
    pub fn new() -> Self {
        let vars = VarMap::new();
        let w = vars
            .get(1, "w", Init::Const(1.0), DType::F32, &Device::Cpu)
            .unwrap();
        Self {
            vars,
            w,
            device: Device::Cpu,
            mode: Mode::Eval,
            train_losses: RefCell::default(),
            val_losses: RefCell::default(),
            predict_calls: Cell::new(0),
        }
    }

    /// Losses for successive training batches; unscripted batches get 1.0.
    pub fn with_train_losses(self, losses: &[f64]) -> Self {
        self.train_losses.borrow_mut().extend(losses);
        self
    }

    /// Losses for successive evaluation-mode batches; unscripted ones get 0.0.
    pub fn with_val_losses(self, losses: &[f64]) -> Self {
        self.val_losses.borrow_mut().extend(losses);
        self
    }
}

impl TrainableModel for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    fn compute_loss(&self, _batch: &Batch) -> Result<Tensor> {
        match self.mode {
            Mode::Train => {
                let value = self.train_losses.borrow_mut().pop_front().unwrap_or(1.0);
                Ok(self.w.sqr()?.sum_all()?.affine(0.0, value)?)
            }
            Mode::Eval => {
                let value = self.val_losses.borrow_mut().pop_front().unwrap_or(0.0);
                Ok(Tensor::new(value as f32, &self.device)?)
            }
        }
    }

    fn predict(&self, batch: &Batch) -> Result<Tensor> {
        self.predict_calls.set(self.predict_calls.get() + 1);
        Ok(field(keyed(batch)?, "pred")?.clone())
    }

    fn var_map(&self) -> &VarMap {
        &self.vars
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }
}

/// SGD that counts its steps.
pub struct CountingSgd {
    inner: SGD,
    pub steps: usize,
}

impl Optimizer for CountingSgd {
    type Config = f64;

    fn new(vars: Vec<Var>, learning_rate: f64) -> candle_core::Result<Self> {
        Ok(Self {
            inner: SGD::new(vars, learning_rate)?,
            steps: 0,
        })
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        self.steps += 1;
        self.inner.step(grads)
    }

    fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.inner.set_learning_rate(lr)
    }
}

/// One keyed batch with `pred` scores and `label` classes.
pub fn scored_batch(preds: &[f32], labels: &[u32]) -> Batch {
    KeyedBatch::from_pairs([
        ("pred", Tensor::new(preds, &Device::Cpu).unwrap()),
        ("label", Tensor::new(labels, &Device::Cpu).unwrap()),
    ])
    .unwrap()
    .into()
}

/// Split scored examples into consecutive batches of `batch_size`.
pub fn scored_batches(preds: &[f32], labels: &[u32], batch_size: usize) -> PreBatched {
    PreBatched::new(
        preds
            .chunks(batch_size)
            .zip(labels.chunks(batch_size))
            .map(|(p, l)| scored_batch(p, l))
            .collect(),
    )
}

/// Linearly separable two-feature examples: class 1 when the first feature
/// dominates. Classes are interleaved across batches when `n` is coprime to 7.
pub fn separable_batches(n: usize, batch_size: usize) -> PreBatched {
    let points: Vec<(f32, u32)> = (0..n)
        .map(|i| {
            let v = ((i * 7) % n) as f32 / n as f32 + 0.5 / n as f32;
            (v, u32::from(v > 0.5))
        })
        .collect();
    let batches = points
        .chunks(batch_size)
        .map(|chunk| {
            let x: Vec<f32> = chunk.iter().flat_map(|(v, _)| [*v, 1.0 - v]).collect();
            let labels: Vec<u32> = chunk.iter().map(|(_, l)| *l).collect();
            Batch::from(
                KeyedBatch::from_pairs([
                    ("x", Tensor::from_vec(x, (chunk.len(), 2), &Device::Cpu).unwrap()),
                    ("label", Tensor::new(labels.as_slice(), &Device::Cpu).unwrap()),
                ])
                .unwrap(),
            )
        })
        .collect();
    PreBatched::new(batches)
}

/// `n` scored examples, alternating labels, predictions always 0.9.
pub struct ScoredDataset {
    pub n: usize,
}

impl Dataset for ScoredDataset {
    fn len(&self) -> usize {
        self.n
    }

    fn collate(&self, indices: &[usize], device: &Device) -> Result<Batch> {
        let preds = vec![0.9f32; indices.len()];
        let labels: Vec<u32> = indices.iter().map(|&i| (i % 2) as u32).collect();
        Ok(KeyedBatch::from_pairs([
            ("pred", Tensor::new(preds.as_slice(), device)?),
            ("label", Tensor::new(labels.as_slice(), device)?),
        ])?
        .into())
    }
}

/// Cancels `token` as soon as batch number `after` (counted from 1) is drawn.
pub struct CancelAfter {
    pub inner: PreBatched,
    pub token: CancellationToken,
    pub after: usize,
}

impl DataSource for CancelAfter {
    fn batches(&self, epoch: usize) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        Box::new(self.inner.batches(epoch).enumerate().map(move |(i, batch)| {
            if i + 1 == self.after {
                self.token.cancel();
            }
            batch
        }))
    }
}
