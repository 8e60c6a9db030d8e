//! Bag-of-embeddings text classifier over keyed batches.
//!
//! Expects `input_ids` (`N x L`, u32), `mask` (`N x L`, f32, 1 for real
//! tokens) and `label` (`N`, u32). Token embeddings are mean-pooled under the
//! mask, passed through dropout in training mode, then projected to class
//! logits.

use crate::init::{glorot_bound, uniform};
use candle_core::{D, DType, Device, Tensor};
use candle_nn::{Embedding, Linear, Module, VarMap};
use credo_core::reproducibility::{DROPOUT, INIT};
use credo_core::{
    Batch, BatchProtocol, CredoError, Mode, ModelInput, Result, SeedManager, TrainableModel,
};
use rand::Rng;
use rand::rngs::StdRng;
use std::cell::RefCell;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextMlpConfig {
    pub vocab_size: usize,
    pub embed_dim: usize,
    pub num_classes: usize,
    pub dropout: f32,
}

impl Default for TextMlpConfig {
    fn default() -> Self {
        Self {
            vocab_size: 64,
            embed_dim: 16,
            num_classes: 2,
            dropout: 0.1,
        }
    }
}

pub struct TextMlp {
    config: TextMlpConfig,
    vars: VarMap,
    embedding: Embedding,
    proj: Linear,
    dropout_rng: RefCell<StdRng>,
    mode: Mode,
    protocol: BatchProtocol,
    device: Device,
}

impl TextMlp {
    pub fn new(config: TextMlpConfig, seeds: &SeedManager, device: &Device) -> Result<Self> {
        if !(0.0..1.0).contains(&config.dropout) {
            return Err(CredoError::config(format!(
                "dropout must be in [0, 1), got {}",
                config.dropout
            )));
        }
        let mut vars = VarMap::new();
        let mut rng = seeds.rng_for(INIT);
        let TextMlpConfig {
            vocab_size,
            embed_dim,
            num_classes,
            ..
        } = config;

        let table = uniform(
            &mut vars,
            "embedding.weight",
            &[vocab_size, embed_dim],
            glorot_bound(vocab_size, embed_dim),
            &mut rng,
            device,
        )?;
        let weight = uniform(
            &mut vars,
            "proj.weight",
            &[num_classes, embed_dim],
            glorot_bound(embed_dim, num_classes),
            &mut rng,
            device,
        )?;
        let bias = uniform(&mut vars, "proj.bias", &[num_classes], 0.0, &mut rng, device)?;

        Ok(Self {
            config,
            vars,
            embedding: Embedding::new(table, embed_dim),
            proj: Linear::new(weight, Some(bias)),
            dropout_rng: RefCell::new(seeds.rng_for(DROPOUT)),
            mode: Mode::Eval,
            protocol: BatchProtocol::keyed(),
            device: device.clone(),
        })
    }

    pub fn config(&self) -> &TextMlpConfig {
        &self.config
    }

    /// How this model splits a batch into inputs and labels.
    pub fn protocol(&self) -> &BatchProtocol {
        &self.protocol
    }

    fn forward(&self, batch: &Batch) -> Result<Tensor> {
        let fields = match self.protocol.inputs(batch)? {
            ModelInput::Fields(fields) => fields,
            ModelInput::Graph(_) => {
                return Err(CredoError::batch("text_mlp expects keyed fields, got a graph"));
            }
        };
        let ids = field(&fields, "input_ids")?;
        let mask = field(&fields, "mask")?.to_dtype(DType::F32)?;

        let embedded = self.embedding.forward(ids)?;
        let summed = embedded.broadcast_mul(&mask.unsqueeze(2)?)?.sum(1)?;
        let counts = mask.sum_keepdim(1)?.clamp(1f32, f32::MAX)?;
        let pooled = summed.broadcast_div(&counts)?;

        let pooled = match self.mode {
            Mode::Train if self.config.dropout > 0.0 => self.dropout(&pooled)?,
            _ => pooled,
        };
        Ok(self.proj.forward(&pooled)?)
    }

    /// Inverted dropout with a mask drawn from the model's own seeded stream.
    fn dropout(&self, x: &Tensor) -> Result<Tensor> {
        let p = self.config.dropout;
        let keep = 1.0 / (1.0 - p);
        let count = x.elem_count();
        let mut rng = self.dropout_rng.borrow_mut();
        let mask: Vec<f32> = (0..count)
            .map(|_| if rng.gen_range(0.0f32..1.0) < p { 0.0 } else { keep })
            .collect();
        Ok(x.mul(&Tensor::from_vec(mask, x.shape(), x.device())?)?)
    }
}

fn field<'b>(fields: &BTreeMap<&str, &'b Tensor>, name: &str) -> Result<&'b Tensor> {
    fields
        .get(name)
        .copied()
        .ok_or_else(|| CredoError::batch(format!("text_mlp batch has no '{name}' field")))
}

impl TrainableModel for TextMlp {
    fn name(&self) -> &str {
        "text_mlp"
    }

    fn compute_loss(&self, batch: &Batch) -> Result<Tensor> {
        let logits = self.forward(batch)?;
        let labels = self.protocol.labels(batch)?;
        Ok(candle_nn::loss::cross_entropy(&logits, &labels)?)
    }

    fn predict(&self, batch: &Batch) -> Result<Tensor> {
        let logits = self.forward(batch)?;
        Ok(candle_nn::ops::softmax(&logits, D::Minus1)?)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::TextDataset;
    use credo_core::Dataset;

    fn model(seed: u64) -> TextMlp {
        TextMlp::new(
            TextMlpConfig::default(),
            &SeedManager::new(seed),
            &Device::Cpu,
        )
        .unwrap()
    }

    fn batch() -> Batch {
        TextDataset::generate(6, 64, 8, 3)
            .collate(&[0, 1, 2, 3, 4, 5], &Device::Cpu)
            .unwrap()
    }

    #[test]
    fn test_predictions_are_probabilities() {
        let m = model(1);
        let probs = m.predict(&batch()).unwrap();
        assert_eq!(probs.dims(), &[6, 2]);
        for row in probs.to_vec2::<f32>().unwrap() {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_same_seed_same_parameters() {
        let a = model(9).predict(&batch()).unwrap().to_vec2::<f32>().unwrap();
        let b = model(9).predict(&batch()).unwrap().to_vec2::<f32>().unwrap();
        let c = model(10).predict(&batch()).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_dropout_only_in_train_mode() {
        let mut m = model(2);
        let batch = batch();
        let eval_a = m.compute_loss(&batch).unwrap().to_scalar::<f32>().unwrap();
        let eval_b = m.compute_loss(&batch).unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(eval_a, eval_b);

        m.set_mode(Mode::Train);
        let train = m.compute_loss(&batch).unwrap().to_scalar::<f32>().unwrap();
        assert!(train.is_finite());
        assert_eq!(m.parameters().len(), 3);
    }

    #[test]
    fn test_rejects_graph_batches() {
        let graphs = crate::synthetic::GraphDataset::generate(2, 3, 0);
        let batch = graphs.collate(&[0, 1], &Device::Cpu).unwrap();
        assert!(matches!(
            model(0).predict(&batch).unwrap_err(),
            CredoError::Batch(_)
        ));
    }

    #[test]
    fn test_label_field_is_not_an_input() {
        let m = model(3);
        let full = batch();
        let keyed = full.as_keyed().unwrap();
        // Shuffling only the labels must leave the logits untouched.
        let relabelled: Batch = credo_core::KeyedBatch::from_pairs(keyed.fields().iter().map(
            |(k, v)| {
                let v = if k == "label" {
                    Tensor::new(&[1u32, 1, 1, 0, 0, 0], &Device::Cpu).unwrap()
                } else {
                    v.clone()
                };
                (k.clone(), v)
            },
        ))
        .unwrap()
        .into();
        let a = m.predict(&full).unwrap().to_vec2::<f32>().unwrap();
        let b = m.predict(&relabelled).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(a, b);

        let missing_label: Batch = credo_core::KeyedBatch::from_pairs(
            keyed.fields().iter().filter(|(k, _)| *k != "label").map(|(k, v)| (k.clone(), v.clone())),
        )
        .unwrap()
        .into();
        assert!(m.predict(&missing_label).is_ok());
        let err = m.compute_loss(&missing_label).unwrap_err();
        assert!(err.to_string().contains("no label field 'label'"));
    }

    #[test]
    fn test_invalid_dropout() {
        let config = TextMlpConfig {
            dropout: 1.0,
            ..TextMlpConfig::default()
        };
        let err = TextMlp::new(config, &SeedManager::new(0), &Device::Cpu)
            .err()
            .unwrap();
        assert!(err.is_config());
    }
}
