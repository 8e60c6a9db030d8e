//! Metric evaluator.
//!
//! Scores are always computed once over the full, concatenated set of
//! predictions and labels of an evaluation pass. Averaging precision, recall or
//! F1 over class-imbalanced mini-batches gives a biased estimate, so the
//! evaluator never sees individual batches.

use crate::batch::labels_to_classes;
use crate::error::{CredoError, Result};
use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A recognized metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Accuracy,
    Precision,
    Recall,
    F1,
    /// Binary ROC-AUC from prediction scores.
    Auc,
}

impl Metric {
    pub const ALL: [Metric; 5] = [
        Metric::Accuracy,
        Metric::Precision,
        Metric::Recall,
        Metric::F1,
        Metric::Auc,
    ];

    /// Parse a metric name. Matching is case-insensitive.
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "accuracy" | "acc" => Ok(Self::Accuracy),
            "precision" => Ok(Self::Precision),
            "recall" => Ok(Self::Recall),
            "f1" | "f1_score" | "f1-score" => Ok(Self::F1),
            "auc" | "roc_auc" => Ok(Self::Auc),
            _ => Err(CredoError::config(format!(
                "unknown metric '{name}' (known: {})",
                Self::ALL.map(|m| m.name()).join(", ")
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Accuracy => "accuracy",
            Self::Precision => "precision",
            Self::Recall => "recall",
            Self::F1 => "f1",
            Self::Auc => "auc",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordered metric name → score mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricReport {
    entries: Vec<(String, f64)>,
}

impl MetricReport {
    pub fn from_entries(entries: Vec<(String, f64)>) -> Self {
        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| *v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for MetricReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{name}={value:.4}")?;
        }
        Ok(())
    }
}

/// Computes a fixed, ordered set of metrics from predictions and labels.
///
/// Holds no state between calls: the same two tensors always produce the same
/// report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluator {
    metrics: Vec<Metric>,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self {
            metrics: vec![
                Metric::Accuracy,
                Metric::Precision,
                Metric::Recall,
                Metric::F1,
            ],
        }
    }
}

impl Evaluator {
    /// Build an evaluator from metric names. Unknown names are rejected here,
    /// before any data is touched.
    pub fn new<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        if names.is_empty() {
            return Err(CredoError::config("at least one metric must be requested"));
        }
        let mut metrics = Vec::with_capacity(names.len());
        for name in names {
            let metric = Metric::parse(name.as_ref())?;
            if !metrics.contains(&metric) {
                metrics.push(metric);
            }
        }
        Ok(Self { metrics })
    }

    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    /// Whether this evaluator reports a metric with the given name.
    pub fn reports(&self, name: &str) -> bool {
        Metric::parse(name).is_ok_and(|m| self.metrics.contains(&m))
    }

    pub fn evaluate(&self, predictions: &Tensor, labels: &Tensor) -> Result<MetricReport> {
        let decoded = Decoded::from_tensor(predictions)?;
        let truth = labels_to_classes(&labels.to_device(&Device::Cpu)?)?;

        if truth.is_empty() {
            return Err(CredoError::evaluation("no examples to evaluate"));
        }
        if truth.len() != decoded.classes.len() {
            return Err(CredoError::evaluation(format!(
                "{} predictions for {} labels",
                decoded.classes.len(),
                truth.len()
            )));
        }

        let counts = ClassCounts::new(&decoded.classes, &truth);
        let mut entries = Vec::with_capacity(self.metrics.len());
        for metric in &self.metrics {
            let value = match metric {
                Metric::Accuracy => counts.accuracy(),
                Metric::Precision => counts.precision(),
                Metric::Recall => counts.recall(),
                Metric::F1 => counts.f1(),
                Metric::Auc => {
                    let scores = decoded.scores.as_deref().ok_or_else(|| {
                        CredoError::evaluation(
                            "auc needs binary scores (a score vector or two columns), \
                             got class indices or more than two columns",
                        )
                    })?;
                    roc_auc(scores, &truth)?
                }
            };
            entries.push((metric.name().to_string(), value));
        }
        Ok(MetricReport { entries })
    }
}

/// Predictions reduced to class indices and, when available, positive-class
/// scores.
struct Decoded {
    classes: Vec<usize>,
    scores: Option<Vec<f64>>,
}

impl Decoded {
    fn from_tensor(predictions: &Tensor) -> Result<Self> {
        let p = predictions.to_device(&Device::Cpu)?;
        match p.dims() {
            [_, 1] => Self::from_vector(&p.flatten_all()?),
            [_, c] => {
                let classes = p
                    .argmax(1)?
                    .to_vec1::<u32>()?
                    .into_iter()
                    .map(|c| c as usize)
                    .collect();
                let scores = if *c == 2 {
                    Some(binary_margin(&p)?)
                } else {
                    None
                };
                Ok(Self { classes, scores })
            }
            [_] => Self::from_vector(&p),
            other => Err(CredoError::evaluation(format!(
                "predictions must be rank 1 or 2, got shape {other:?}"
            ))),
        }
    }

    fn from_vector(p: &Tensor) -> Result<Self> {
        let values = p.to_dtype(DType::F64)?.to_vec1::<f64>()?;
        if p.dtype().is_int() {
            return Ok(Self {
                classes: labels_to_classes(p)?,
                scores: None,
            });
        }
        let classes = values.iter().map(|&v| usize::from(v >= 0.5)).collect();
        Ok(Self {
            classes,
            scores: Some(values),
        })
    }
}

/// Positive-class score of a two-column prediction as `col1 - col0`. Ranks
/// examples the same way for logits and for probabilities.
fn binary_margin(p: &Tensor) -> Result<Vec<f64>> {
    let p = p.to_dtype(DType::F64)?;
    Ok(p.narrow(1, 1, 1)?
        .sub(&p.narrow(1, 0, 1)?)?
        .flatten_all()?
        .to_vec1::<f64>()?)
}

/// Per-class true/false positive counts over the whole evaluation set.
struct ClassCounts {
    total: usize,
    correct: usize,
    /// `(class, tp, fp, fn)` for every class seen in either predictions or labels.
    per_class: Vec<(usize, usize, usize, usize)>,
    binary: bool,
}

impl ClassCounts {
    fn new(predicted: &[usize], truth: &[usize]) -> Self {
        let classes: BTreeSet<usize> = predicted.iter().chain(truth).copied().collect();
        let binary = classes.iter().all(|&c| c <= 1);
        let per_class = classes
            .iter()
            .map(|&class| {
                let mut tp = 0;
                let mut fp = 0;
                let mut fn_ = 0;
                for (&p, &t) in predicted.iter().zip(truth) {
                    match (p == class, t == class) {
                        (true, true) => tp += 1,
                        (true, false) => fp += 1,
                        (false, true) => fn_ += 1,
                        (false, false) => {}
                    }
                }
                (class, tp, fp, fn_)
            })
            .collect();
        let correct = predicted.iter().zip(truth).filter(|(p, t)| p == t).count();
        Self {
            total: truth.len(),
            correct,
            per_class,
            binary,
        }
    }

    fn accuracy(&self) -> f64 {
        self.correct as f64 / self.total as f64
    }

    fn precision(&self) -> f64 {
        self.reduce(|tp, fp, _| ratio(tp, tp + fp))
    }

    fn recall(&self) -> f64 {
        self.reduce(|tp, _, fn_| ratio(tp, tp + fn_))
    }

    fn f1(&self) -> f64 {
        self.reduce(|tp, fp, fn_| ratio(2 * tp, 2 * tp + fp + fn_))
    }

    /// Binary problems score the positive class 1; otherwise macro-average.
    fn reduce(&self, score: impl Fn(usize, usize, usize) -> f64) -> f64 {
        if self.binary {
            return self
                .per_class
                .iter()
                .find(|(c, ..)| *c == 1)
                .map_or(0.0, |&(_, tp, fp, fn_)| score(tp, fp, fn_));
        }
        let sum: f64 = self
            .per_class
            .iter()
            .map(|&(_, tp, fp, fn_)| score(tp, fp, fn_))
            .sum();
        sum / self.per_class.len() as f64
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 { 0.0 } else { num as f64 / den as f64 }
}

/// Binary ROC-AUC via the Mann-Whitney rank statistic, averaging tied ranks.
fn roc_auc(scores: &[f64], truth: &[usize]) -> Result<f64> {
    if truth.iter().any(|&t| t > 1) {
        return Err(CredoError::evaluation("auc is only defined for binary labels"));
    }
    let positives = truth.iter().filter(|&&t| t == 1).count();
    let negatives = truth.len() - positives;
    if positives == 0 || negatives == 0 {
        return Err(CredoError::evaluation(
            "auc needs both positive and negative examples",
        ));
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut ranks = vec![0.0; scores.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = avg_rank;
        }
        i = j + 1;
    }

    let positive_rank_sum: f64 = truth
        .iter()
        .zip(&ranks)
        .filter(|(t, _)| **t == 1)
        .map(|(_, r)| r)
        .sum();
    let p = positives as f64;
    Ok((positive_rank_sum - p * (p + 1.0) / 2.0) / (p * negatives as f64))
}
