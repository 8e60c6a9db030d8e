//! Mean-aggregation graph classifier.
//!
//! One message-passing layer (`h = relu(x W_self + mean_neigh(x) W_neigh + b)`),
//! a global mean pool per graph, and a linear readout.

use crate::init::{glorot_bound, uniform};
use candle_core::{D, DType, Device, Tensor};
use candle_nn::{Linear, Module, VarMap};
use credo_core::reproducibility::INIT;
use credo_core::{
    Batch, BatchProtocol, CredoError, GraphBatch, Mode, ModelInput, Result, SeedManager,
    TrainableModel,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphMeanConfig {
    pub num_features: usize,
    pub hidden_dim: usize,
    pub num_classes: usize,
}

impl Default for GraphMeanConfig {
    fn default() -> Self {
        Self {
            num_features: 4,
            hidden_dim: 16,
            num_classes: 2,
        }
    }
}

pub struct GraphMean {
    config: GraphMeanConfig,
    vars: VarMap,
    self_weight: Tensor,
    neigh_weight: Tensor,
    bias: Tensor,
    readout: Linear,
    protocol: BatchProtocol,
    device: Device,
}

impl GraphMean {
    pub fn new(config: GraphMeanConfig, seeds: &SeedManager, device: &Device) -> Result<Self> {
        let GraphMeanConfig {
            num_features,
            hidden_dim,
            num_classes,
        } = config;
        let mut vars = VarMap::new();
        let mut rng = seeds.rng_for(INIT);
        let bound = glorot_bound(num_features, hidden_dim);

        let shape = [num_features, hidden_dim];
        let self_weight = uniform(&mut vars, "conv.self_weight", &shape, bound, &mut rng, device)?;
        let neigh_weight = uniform(&mut vars, "conv.neigh_weight", &shape, bound, &mut rng, device)?;
        let bias = uniform(&mut vars, "conv.bias", &[hidden_dim], 0.0, &mut rng, device)?;
        let out_weight = uniform(
            &mut vars,
            "readout.weight",
            &[num_classes, hidden_dim],
            glorot_bound(hidden_dim, num_classes),
            &mut rng,
            device,
        )?;
        let out_bias = uniform(&mut vars, "readout.bias", &[num_classes], 0.0, &mut rng, device)?;

        Ok(Self {
            config,
            vars,
            self_weight,
            neigh_weight,
            bias,
            readout: Linear::new(out_weight, Some(out_bias)),
            protocol: BatchProtocol::graph(),
            device: device.clone(),
        })
    }

    pub fn config(&self) -> &GraphMeanConfig {
        &self.config
    }

    pub fn protocol(&self) -> &BatchProtocol {
        &self.protocol
    }

    fn forward(&self, batch: &Batch) -> Result<Tensor> {
        match self.protocol.inputs(batch)? {
            ModelInput::Graph(graph) => self.forward_graph(graph),
            ModelInput::Fields(_) => Err(CredoError::batch(
                "graph_mean expects a graph, got keyed fields",
            )),
        }
    }

    fn forward_graph(&self, graph: &GraphBatch) -> Result<Tensor> {
        let x = &graph.x;
        if x.dim(1)? != self.config.num_features {
            return Err(CredoError::batch(format!(
                "graph_mean expects {} node features, got {}",
                self.config.num_features,
                x.dim(1)?
            )));
        }
        let neighbours = mean_neighbours(x, &graph.edge_index)?;
        let hidden = x
            .matmul(&self.self_weight)?
            .add(&neighbours.matmul(&self.neigh_weight)?)?
            .broadcast_add(&self.bias)?
            .relu()?;
        let pooled = mean_pool(&hidden, &graph.batch, graph.num_graphs)?;
        Ok(self.readout.forward(&pooled)?)
    }
}

/// Mean of incoming neighbour features per node; nodes without incoming
/// edges get zeros.
fn mean_neighbours(x: &Tensor, edge_index: &Tensor) -> Result<Tensor> {
    let num_edges = edge_index.dim(1)?;
    if num_edges == 0 {
        return Ok(x.zeros_like()?);
    }
    let sources = edge_index.get(0)?.contiguous()?;
    let targets = edge_index.get(1)?.contiguous()?;
    let messages = x.index_select(&sources, 0)?;
    let summed = x.zeros_like()?.index_add(&targets, &messages, 0)?;
    let degree = Tensor::zeros((x.dim(0)?, 1), DType::F32, x.device())?.index_add(
        &targets,
        &Tensor::ones((num_edges, 1), DType::F32, x.device())?,
        0,
    )?;
    Ok(summed.broadcast_div(&degree.clamp(1f32, f32::MAX)?)?)
}

/// Average node states per graph, `(num_graphs, hidden)`.
fn mean_pool(hidden: &Tensor, assignment: &Tensor, num_graphs: usize) -> Result<Tensor> {
    let (num_nodes, width) = hidden.dims2()?;
    let device = hidden.device();
    let summed =
        Tensor::zeros((num_graphs, width), DType::F32, device)?.index_add(assignment, hidden, 0)?;
    let counts = Tensor::zeros((num_graphs, 1), DType::F32, device)?.index_add(
        assignment,
        &Tensor::ones((num_nodes, 1), DType::F32, device)?,
        0,
    )?;
    Ok(summed.broadcast_div(&counts.clamp(1f32, f32::MAX)?)?)
}

impl TrainableModel for GraphMean {
    fn name(&self) -> &str {
        "graph_mean"
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

    // No dropout or normalization, so both modes behave the same.
    fn set_mode(&mut self, _mode: Mode) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use credo_core::Graph;

    fn line(label: u32, features: Vec<f32>) -> Graph {
        let num_nodes = features.len();
        Graph {
            num_nodes,
            num_features: 1,
            features,
            edges: (1..num_nodes as u32).map(|i| (i - 1, i)).collect(),
            label,
        }
    }

    #[test]
    fn test_mean_neighbours_averages_incoming_edges() {
        let x = Tensor::new(&[[1f32], [3.], [5.]], &Device::Cpu).unwrap();
        // 0 -> 2, 1 -> 2, 2 -> 0
        let edges = Tensor::new(&[[0u32, 1, 2], [2, 2, 0]], &Device::Cpu).unwrap();
        let mean = mean_neighbours(&x, &edges).unwrap();
        assert_eq!(mean.to_vec2::<f32>().unwrap(), vec![vec![5.0], vec![0.0], vec![2.0]]);
    }

    #[test]
    fn test_mean_pool_per_graph() {
        let batch = GraphBatch::collate(
            &[line(0, vec![1.0, 3.0]), line(1, vec![10.0])],
            &Device::Cpu,
        )
        .unwrap();
        let pooled = mean_pool(&batch.x, &batch.batch, batch.num_graphs).unwrap();
        assert_eq!(pooled.to_vec2::<f32>().unwrap(), vec![vec![2.0], vec![10.0]]);
    }

    #[test]
    fn test_one_prediction_row_per_graph() {
        let config = GraphMeanConfig {
            num_features: 1,
            ..GraphMeanConfig::default()
        };
        let model = GraphMean::new(config, &SeedManager::new(5), &Device::Cpu).unwrap();
        let batch: Batch = GraphBatch::collate(
            &[line(0, vec![1.0, 2.0, 3.0]), line(1, vec![4.0]), line(0, vec![0.5, 0.5])],
            &Device::Cpu,
        )
        .unwrap()
        .into();

        assert_eq!(model.predict(&batch).unwrap().dims(), &[3, 2]);
        let loss = model.compute_loss(&batch).unwrap();
        let grads = loss.backward().unwrap();
        assert!(
            model
                .parameters()
                .iter()
                .all(|v| grads.get(v.as_tensor()).is_some())
        );
    }

    #[test]
    fn test_feature_width_mismatch() {
        let model = GraphMean::new(GraphMeanConfig::default(), &SeedManager::new(0), &Device::Cpu)
            .unwrap();
        let batch: Batch = GraphBatch::collate(&[line(0, vec![1.0])], &Device::Cpu)
            .unwrap()
            .into();
        assert!(matches!(model.predict(&batch).unwrap_err(), CredoError::Batch(_)));
    }

    #[test]
    fn test_rejects_keyed_batches() {
        let model = GraphMean::new(GraphMeanConfig::default(), &SeedManager::new(0), &Device::Cpu)
            .unwrap();
        let batch: Batch = credo_core::KeyedBatch::from_pairs([(
            "label",
            Tensor::new(&[0u32, 1], &Device::Cpu).unwrap(),
        )])
        .unwrap()
        .into();
        let err = model.compute_loss(&batch).unwrap_err();
        assert!(err.to_string().contains("graph protocol received a keyed batch"));
    }
}
