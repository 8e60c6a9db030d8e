//! Registry entry points: build data and model from a [`RunConfig`], train,
//! then score the held-out test split.

use crate::graph::{GraphMean, GraphMeanConfig};
use crate::synthetic::{GraphDataset, TextDataset};
use crate::text::{TextMlp, TextMlpConfig};
use candle_core::Device;
use candle_nn::{AdamW, ParamsAdamW};
use credo_core::{
    BatchProtocol, CancellationToken, Dataset, Result, RunConfig, RunStatus, RunSummary,
    SeedManager, Subset, TrainableModel, Trainer, split_indices,
};
use tracing::info;

/// Seed component for synthetic data generation.
const DATA: &str = "data";
/// Seed component for the train/test partition.
const TEST_SPLIT: &str = "test_split";
/// Padded sequence length of the synthetic text data.
const MAX_LEN: usize = 12;

pub fn run_text_mlp(config: &RunConfig, cancel: &CancellationToken) -> Result<RunSummary> {
    let device = config.device()?;
    let seeds = SeedManager::new(config.seed);
    let model_config = TextMlpConfig::default();
    let data = TextDataset::generate(
        config.dataset.examples,
        model_config.vocab_size,
        MAX_LEN,
        seeds.seed_for(DATA),
    );
    let mut model = TextMlp::new(model_config, &seeds, &device)?;
    let protocol = model.protocol().clone();
    train_and_test(&mut model, &data, protocol, config, cancel, &device)
}

pub fn run_graph_mean(config: &RunConfig, cancel: &CancellationToken) -> Result<RunSummary> {
    let device = config.device()?;
    let seeds = SeedManager::new(config.seed);
    let model_config = GraphMeanConfig::default();
    let data = GraphDataset::generate(
        config.dataset.examples,
        model_config.num_features,
        seeds.seed_for(DATA),
    );
    let mut model = GraphMean::new(model_config, &seeds, &device)?;
    let protocol = model.protocol().clone();
    train_and_test(&mut model, &data, protocol, config, cancel, &device)
}

fn train_and_test<M: TrainableModel, D: Dataset>(
    model: &mut M,
    data: &D,
    protocol: BatchProtocol,
    config: &RunConfig,
    cancel: &CancellationToken,
    device: &Device,
) -> Result<RunSummary> {
    let name = model.name().to_string();
    let seeds = SeedManager::new(config.seed);

    let (train, test) = if config.dataset.test_fraction > 0.0 {
        let (train_idx, test_idx) =
            split_indices(data.len(), config.dataset.test_fraction, seeds.seed_for(TEST_SPLIT))?;
        (
            Subset::new(data, train_idx)?,
            Some(Subset::new(data, test_idx)?),
        )
    } else {
        (Subset::all(data), None)
    };
    info!(
        model = %name,
        train = train.len(),
        test = test.as_ref().map_or(0, Dataset::len),
        "prepared synthetic data"
    );

    let params = ParamsAdamW {
        lr: config.lr,
        weight_decay: config.weight_decay,
        ..ParamsAdamW::default()
    };
    let mut trainer = Trainer::<_, AdamW>::with_optimizer_config(
        model,
        config.evaluator()?,
        params,
        protocol,
        device,
    )?
    .with_cancellation(cancel.clone());
    let fit = trainer.fit_dataset(&train, None, &config.fit_options())?;

    let test = match (&test, fit.status) {
        (Some(test), RunStatus::Completed) => {
            Some(trainer.evaluate_dataset(test, config.batch_size)?)
        }
        _ => None,
    };
    Ok(RunSummary {
        model: name,
        fit,
        test,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use credo_core::{CheckpointRecord, DatasetConfig, EntryPoint};
    use tempfile::TempDir;

    fn go(run: EntryPoint, config: &RunConfig) -> RunSummary {
        run(config, &CancellationToken::new()).unwrap()
    }

    fn small(epochs: usize) -> RunConfig {
        RunConfig {
            epochs,
            batch_size: 16,
            lr: 0.05,
            dataset: DatasetConfig {
                examples: 80,
                test_fraction: 0.25,
            },
            ..RunConfig::default()
        }
    }

    #[test]
    fn test_text_run_reports_every_epoch() {
        let summary = go(run_text_mlp, &small(2));
        assert_eq!(summary.model, "text_mlp");
        assert_eq!(summary.fit.status, RunStatus::Completed);
        assert_eq!(summary.fit.history.len(), 2);
        // 80 examples, 20 for test, 12 of the rest for validation.
        assert!(summary.fit.history.iter().all(|r| r.examples == 48));
        assert!(summary.fit.history.iter().all(|r| r.metrics.is_some()));
        let test = summary.test.unwrap();
        assert_eq!(test.len(), 4);
    }

    #[test]
    fn test_graph_run_writes_checkpoint() {
        let dir = TempDir::new().unwrap();
        let config = RunConfig {
            saved: true,
            save_dir: dir.path().to_path_buf(),
            save_name: Some("graph".into()),
            ..small(2)
        };
        let summary = go(run_graph_mean, &config);
        let best = summary.fit.best.unwrap();
        assert_eq!(best.model, "graph_mean");
        assert_eq!(best.seed, 42);

        let manifest = CheckpointRecord::load_manifest(&dir.path().join("graph.json"))
            .unwrap()
            .unwrap();
        assert_eq!(manifest.sha256, best.sha256);
    }

    #[test]
    fn test_runs_are_reproducible() {
        let a = go(run_graph_mean, &small(1));
        let b = go(run_graph_mean, &small(1));
        assert_eq!(a.fit.history, b.fit.history);
        assert_eq!(a.test, b.test);
    }

    #[test]
    fn test_without_test_split() {
        let mut config = small(1);
        config.dataset.test_fraction = 0.0;
        let summary = go(run_text_mlp, &config);
        assert!(summary.test.is_none());
        assert_eq!(summary.fit.history[0].examples, 64);
    }

    #[test]
    fn test_cancelled_run_skips_test_split() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = run_graph_mean(&small(3), &cancel).unwrap();
        assert_eq!(summary.fit.status, RunStatus::Cancelled);
        assert_eq!(summary.fit.epochs_completed, 0);
        assert!(summary.fit.history.is_empty());
        assert!(summary.test.is_none());
    }
}
