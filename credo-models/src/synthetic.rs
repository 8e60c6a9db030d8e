//! Seeded synthetic datasets for the reference models.
//!
//! Both datasets are learnable but noisy: the label shifts the distribution
//! the inputs are drawn from without determining them.

use candle_core::{Device, Tensor};
use credo_core::{Batch, CredoError, Dataset, Graph, GraphBatch, KeyedBatch, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Token id reserved for padding.
pub const PAD: u32 = 0;

/// Variable-length token sequences. Positive examples draw most tokens from
/// the upper half of the vocabulary.
#[derive(Debug, Clone)]
pub struct TextDataset {
    sequences: Vec<Vec<u32>>,
    labels: Vec<u32>,
    max_len: usize,
}

impl TextDataset {
    pub fn generate(n: usize, vocab_size: usize, max_len: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let vocab = vocab_size.max(4) as u32;
        let max_len = max_len.max(1);
        let half = vocab / 2;

        let mut sequences = Vec::with_capacity(n);
        let mut labels = Vec::with_capacity(n);
        for _ in 0..n {
            let label = rng.gen_range(0..2u32);
            let len = rng.gen_range(max_len.div_ceil(2)..=max_len);
            let tokens = (0..len)
                .map(|_| {
                    let biased = rng.gen_bool(0.8);
                    match (label, biased) {
                        (1, true) => rng.gen_range(half..vocab),
                        (0, true) => rng.gen_range(1..half),
                        _ => rng.gen_range(1..vocab),
                    }
                })
                .collect();
            sequences.push(tokens);
            labels.push(label);
        }
        Self {
            sequences,
            labels,
            max_len,
        }
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }
}

impl Dataset for TextDataset {
    fn len(&self) -> usize {
        self.labels.len()
    }

    fn collate(&self, indices: &[usize], device: &Device) -> Result<Batch> {
        let rows = indices.len();
        let mut ids = vec![PAD; rows * self.max_len];
        let mut mask = vec![0f32; rows * self.max_len];
        let mut labels = Vec::with_capacity(rows);
        for (row, &i) in indices.iter().enumerate() {
            let seq = self
                .sequences
                .get(i)
                .ok_or_else(|| CredoError::batch(format!("example {i} out of range")))?;
            let start = row * self.max_len;
            ids[start..start + seq.len()].copy_from_slice(seq);
            mask[start..start + seq.len()].fill(1.0);
            labels.push(self.labels[i]);
        }
        Ok(KeyedBatch::from_pairs([
            ("input_ids", Tensor::from_vec(ids, (rows, self.max_len), device)?),
            ("mask", Tensor::from_vec(mask, (rows, self.max_len), device)?),
            ("label", Tensor::from_vec(labels, rows, device)?),
        ])?
        .into())
    }
}

/// Small random graphs whose node features lean negative for class 0 and
/// positive for class 1. Class-1 graphs are also denser.
#[derive(Debug, Clone)]
pub struct GraphDataset {
    graphs: Vec<Graph>,
}

impl GraphDataset {
    pub fn generate(n: usize, num_features: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let num_features = num_features.max(1);
        let graphs = (0..n)
            .map(|_| {
                let label = rng.gen_range(0..2u32);
                let num_nodes = rng.gen_range(3..=8usize);
                let centre = if label == 1 { 0.5 } else { -0.5 };
                let features = (0..num_nodes * num_features)
                    .map(|_| centre + rng.gen_range(-1.0f32..1.0))
                    .collect();

                // A ring keeps every graph connected; extra chords for class 1.
                let ring = num_nodes as u32;
                let mut edges: Vec<(u32, u32)> = (0..ring)
                    .flat_map(|i| [(i, (i + 1) % ring), ((i + 1) % ring, i)])
                    .collect();
                if label == 1 {
                    for _ in 0..num_nodes {
                        let s = rng.gen_range(0..ring);
                        let t = rng.gen_range(0..ring);
                        if s != t {
                            edges.push((s, t));
                        }
                    }
                }
                Graph {
                    num_nodes,
                    num_features,
                    features,
                    edges,
                    label,
                }
            })
            .collect();
        Self { graphs }
    }

    pub fn graphs(&self) -> &[Graph] {
        &self.graphs
    }
}

impl Dataset for GraphDataset {
    fn len(&self) -> usize {
        self.graphs.len()
    }

    fn collate(&self, indices: &[usize], device: &Device) -> Result<Batch> {
        let selected = indices
            .iter()
            .map(|&i| {
                self.graphs
                    .get(i)
                    .cloned()
                    .ok_or_else(|| CredoError::batch(format!("graph {i} out of range")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(GraphBatch::collate(&selected, device)?.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_text_generation_is_seeded() {
        let a = TextDataset::generate(20, 32, 6, 1);
        let b = TextDataset::generate(20, 32, 6, 1);
        assert_eq!(a.sequences, b.sequences);
        assert_eq!(a.labels(), b.labels());
        assert!(a.sequences.iter().all(|s| (3..=6).contains(&s.len())));
        assert!(a.sequences.iter().flatten().all(|&t| t != PAD && t < 32));
    }

    #[test]
    fn test_text_collate_pads_and_masks() {
        let data = TextDataset::generate(4, 16, 5, 7);
        let batch = data.collate(&[2, 0], &Device::Cpu).unwrap();
        let keyed = batch.as_keyed().unwrap();
        assert_eq!(keyed.len(), 2);

        let ids = keyed.get("input_ids").unwrap().to_vec2::<u32>().unwrap();
        let mask = keyed.get("mask").unwrap().to_vec2::<f32>().unwrap();
        for (row, &i) in [2usize, 0].iter().enumerate() {
            let len = data.sequences[i].len();
            assert_eq!(&ids[row][..len], data.sequences[i].as_slice());
            assert!(ids[row][len..].iter().all(|&t| t == PAD));
            assert_eq!(mask[row].iter().sum::<f32>(), len as f32);
        }
        let labels = keyed.get("label").unwrap().to_vec1::<u32>().unwrap();
        assert_eq!(labels, vec![data.labels()[2], data.labels()[0]]);
    }

    #[test]
    fn test_graph_collate() {
        let data = GraphDataset::generate(5, 3, 11);
        let batch = data.collate(&[4, 1, 3], &Device::Cpu).unwrap();
        let graphs = batch.as_graph().unwrap();
        assert_eq!(graphs.num_graphs, 3);
        let expected_nodes: usize = [4, 1, 3].iter().map(|&i| data.graphs()[i].num_nodes).sum();
        assert_eq!(graphs.num_nodes(), expected_nodes);
        assert_eq!(graphs.x.dims(), &[expected_nodes, 3]);
    }

    #[test]
    fn test_out_of_range_index() {
        let data = GraphDataset::generate(2, 3, 0);
        assert!(data.collate(&[5], &Device::Cpu).is_err());
        let text = TextDataset::generate(2, 8, 4, 0);
        assert!(text.collate(&[2], &Device::Cpu).is_err());
    }
}
