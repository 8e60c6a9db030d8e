//! Property-based tests for evaluation and data splitting using proptest.

mod common;

use candle_core::{Device, Tensor};
use candle_nn::SGD;
use common::{Scripted, scored_batches};
use credo_core::{BatchProtocol, Evaluator, Trainer, split_indices};
use proptest::prelude::*;

fn evaluate_in_batches(preds: &[f32], labels: &[u32], batch_size: usize) -> credo_core::MetricReport {
    let mut model = Scripted::new();
    let mut trainer = Trainer::<_, SGD>::with_optimizer_config(
        &mut model,
        Evaluator::new(&["accuracy", "precision", "recall", "f1", "auc"]).unwrap(),
        0.1,
        BatchProtocol::keyed(),
        &Device::Cpu,
    )
    .unwrap();
    trainer
        .evaluate(&scored_batches(preds, labels, batch_size))
        .unwrap()
}

/// `n` scored examples; the first two labels are fixed so both classes occur.
fn examples(n: usize) -> impl Strategy<Value = (Vec<f32>, Vec<u32>)> {
    (
        prop::collection::vec(0.0f32..1.0, n),
        prop::collection::vec(0u32..2, n),
    )
        .prop_map(|(preds, mut labels)| {
            labels[0] = 0;
            labels[1] = 1;
            (preds, labels)
        })
}

// --- Concatenation invariance ---

#[test]
fn batch_sizes_four_and_seven_agree() {
    let preds: Vec<f32> = (0..20).map(|i| ((i * 13) % 20) as f32 / 20.0).collect();
    let labels: Vec<u32> = (0..20).map(|i| u32::from(i % 3 == 0)).collect();
    assert_eq!(
        evaluate_in_batches(&preds, &labels, 4),
        evaluate_in_batches(&preds, &labels, 7)
    );
}

proptest! {
    #[test]
    fn metrics_do_not_depend_on_batch_size(
        (preds, labels) in examples(20),
        batch_size in 1usize..=20,
    ) {
        let whole = evaluate_in_batches(&preds, &labels, 20);
        let batched = evaluate_in_batches(&preds, &labels, batch_size);
        prop_assert_eq!(whole, batched);
    }

    #[test]
    fn metrics_stay_in_unit_interval((preds, labels) in examples(12)) {
        let report = evaluate_in_batches(&preds, &labels, 5);
        for (name, value) in report.iter() {
            prop_assert!((0.0..=1.0).contains(&value), "{} = {}", name, value);
        }
    }

    #[test]
    fn direct_evaluation_matches_trainer((preds, labels) in examples(9)) {
        let evaluator = Evaluator::new(&["accuracy", "f1", "auc"]).unwrap();
        let direct = evaluator
            .evaluate(
                &Tensor::new(preds.as_slice(), &Device::Cpu).unwrap(),
                &Tensor::new(labels.as_slice(), &Device::Cpu).unwrap(),
            )
            .unwrap();
        let via_trainer = evaluate_in_batches(&preds, &labels, 4);
        for (name, value) in direct.iter() {
            prop_assert_eq!(via_trainer.get(name), Some(value));
        }
    }
}

// --- Split properties ---

proptest! {
    #[test]
    fn split_is_a_disjoint_partition(
        len in 10usize..200,
        fraction in 0.1f64..0.9,
        seed in any::<u64>(),
    ) {
        let (train, val) = split_indices(len, fraction, seed).unwrap();
        prop_assert_eq!(val.len(), (len as f64 * fraction).floor() as usize);
        let mut all: Vec<usize> = train.iter().chain(&val).copied().collect();
        all.sort_unstable();
        prop_assert_eq!(all, (0..len).collect::<Vec<_>>());
    }

    #[test]
    fn split_is_reproducible(len in 4usize..100, seed in any::<u64>()) {
        prop_assert_eq!(
            split_indices(len, 0.3, seed).unwrap(),
            split_indices(len, 0.3, seed).unwrap()
        );
    }
}
