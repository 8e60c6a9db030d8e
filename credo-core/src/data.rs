//! Data sources the orchestrator iterates over.
//!
//! The orchestrator only ever sees a sequential stream of batches through
//! [`DataSource`]. Batching, shuffling and collation belong to the source.

use crate::batch::Batch;
use crate::error::{CredoError, Result};
use candle_core::Device;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

/// A stream of batches, re-readable once per epoch.
pub trait DataSource {
    /// Batches for one pass, in processing order. `epoch` lets shuffling
    /// sources reseed deterministically.
    fn batches(&self, epoch: usize) -> Box<dyn Iterator<Item = Result<Batch>> + '_>;
}

/// Batches that were built ahead of time.
#[derive(Debug, Clone, Default)]
pub struct PreBatched {
    batches: Vec<Batch>,
}

impl PreBatched {
    pub fn new(batches: Vec<Batch>) -> Self {
        Self { batches }
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

impl From<Vec<Batch>> for PreBatched {
    fn from(batches: Vec<Batch>) -> Self {
        Self::new(batches)
    }
}

impl DataSource for PreBatched {
    fn batches(&self, _epoch: usize) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        Box::new(self.batches.iter().cloned().map(Ok))
    }
}

/// Indexable examples that can be collated into a [`Batch`].
pub trait Dataset {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Collate the examples at `indices`, in that order, onto `device`.
    fn collate(&self, indices: &[usize], device: &Device) -> Result<Batch>;
}

/// Batches a [`Dataset`] (or a fixed subset of it) on the fly.
pub struct DataLoader<'a, D: Dataset + ?Sized> {
    dataset: &'a D,
    indices: Vec<usize>,
    batch_size: usize,
    shuffle_seed: Option<u64>,
    device: Device,
}

impl<'a, D: Dataset + ?Sized> DataLoader<'a, D> {
    pub fn new(dataset: &'a D, batch_size: usize, device: &Device) -> Result<Self> {
        if batch_size == 0 {
            return Err(CredoError::config("batch_size must be positive"));
        }
        Ok(Self {
            dataset,
            indices: (0..dataset.len()).collect(),
            batch_size,
            shuffle_seed: None,
            device: device.clone(),
        })
    }

    /// Restrict the loader to a subset of the dataset.
    pub fn with_indices(mut self, indices: Vec<usize>) -> Result<Self> {
        if let Some(bad) = indices.iter().find(|&&i| i >= self.dataset.len()) {
            return Err(CredoError::config(format!(
                "index {bad} out of range for dataset of {} examples",
                self.dataset.len()
            )));
        }
        self.indices = indices;
        Ok(self)
    }

    /// Reshuffle every epoch from `seed + epoch`.
    pub fn shuffled(mut self, seed: u64) -> Self {
        self.shuffle_seed = Some(seed);
        self
    }

    pub fn num_examples(&self) -> usize {
        self.indices.len()
    }

    pub fn num_batches(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }

    fn epoch_order(&self, epoch: usize) -> Vec<usize> {
        let mut order = self.indices.clone();
        if let Some(seed) = self.shuffle_seed {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        order
    }
}

impl<D: Dataset + ?Sized> DataSource for DataLoader<'_, D> {
    fn batches(&self, epoch: usize) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        let chunks: Vec<Vec<usize>> = self
            .epoch_order(epoch)
            .chunks(self.batch_size)
            .map(<[usize]>::to_vec)
            .collect();
        Box::new(
            chunks
                .into_iter()
                .map(move |chunk| self.dataset.collate(&chunk, &self.device)),
        )
    }
}

/// A fixed view of some examples of another dataset, in the given order.
pub struct Subset<'a, D: Dataset + ?Sized> {
    dataset: &'a D,
    indices: Vec<usize>,
}

impl<'a, D: Dataset + ?Sized> Subset<'a, D> {
    pub fn new(dataset: &'a D, indices: Vec<usize>) -> Result<Self> {
        if let Some(bad) = indices.iter().find(|&&i| i >= dataset.len()) {
            return Err(CredoError::config(format!(
                "index {bad} out of range for dataset of {} examples",
                dataset.len()
            )));
        }
        Ok(Self { dataset, indices })
    }

    /// The whole dataset.
    pub fn all(dataset: &'a D) -> Self {
        Self {
            dataset,
            indices: (0..dataset.len()).collect(),
        }
    }
}

impl<D: Dataset + ?Sized> Dataset for Subset<'_, D> {
    fn len(&self) -> usize {
        self.indices.len()
    }

    fn collate(&self, indices: &[usize], device: &Device) -> Result<Batch> {
        let mapped = indices
            .iter()
            .map(|&i| {
                self.indices.get(i).copied().ok_or_else(|| {
                    CredoError::batch(format!(
                        "index {i} out of range for subset of {}",
                        self.indices.len()
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.dataset.collate(&mapped, device)
    }
}

/// Partition `0..len` into disjoint `(train, validation)` index sets.
///
/// The validation share is `floor(len * fraction)`. Both sides are returned in
/// ascending order; shuffling is left to the loader.
pub fn split_indices(len: usize, fraction: f64, seed: u64) -> Result<(Vec<usize>, Vec<usize>)> {
    if !(fraction > 0.0 && fraction < 1.0) {
        return Err(CredoError::config(format!(
            "validate_size must be in (0, 1), got {fraction}"
        )));
    }
    let val_len = (len as f64 * fraction).floor() as usize;
    if val_len == 0 || val_len == len {
        return Err(CredoError::config(format!(
            "validate_size {fraction} leaves an empty split for {len} examples"
        )));
    }

    let mut order: Vec<usize> = (0..len).collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed));
    let mut validation = order.split_off(len - val_len);
    let mut train = order;
    train.sort_unstable();
    validation.sort_unstable();
    Ok((train, validation))
}
