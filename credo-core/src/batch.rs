//! Batch shapes and the protocol that pulls labels out of them.
//!
//! Two shapes are recognized: keyed-tensor batches (a map of named tensors that
//! share a leading batch dimension) and structured-graph batches (a disjoint
//! union of graphs). [`BatchProtocol`] is the only place that knows how each
//! shape stores its labels; everything downstream of it is family-agnostic.

use crate::error::{CredoError, Result};
use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A named collection of tensors sharing a leading batch dimension.
#[derive(Debug, Clone)]
pub struct KeyedBatch {
    fields: BTreeMap<String, Tensor>,
    len: usize,
}

impl KeyedBatch {
    pub fn new(fields: BTreeMap<String, Tensor>) -> Result<Self> {
        let mut len = None;
        for (name, tensor) in &fields {
            let rows = tensor.dims().first().copied().ok_or_else(|| {
                CredoError::batch(format!("field '{name}' is a scalar, expected a batch dimension"))
            })?;
            match len {
                None => len = Some(rows),
                Some(expected) if expected != rows => {
                    return Err(CredoError::batch(format!(
                        "field '{name}' has {rows} rows, expected {expected}"
                    )));
                }
                Some(_) => {}
            }
        }
        let len = len.ok_or_else(|| CredoError::batch("keyed batch has no fields"))?;
        Ok(Self { fields, len })
    }

    /// Build from `(name, tensor)` pairs.
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, Tensor)>,
        S: Into<String>,
    {
        Self::new(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> &BTreeMap<String, Tensor> {
        &self.fields
    }

    /// Number of rows shared by every field.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// One graph before collation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub num_nodes: usize,
    pub num_features: usize,
    /// Row-major `num_nodes x num_features` node features.
    pub features: Vec<f32>,
    /// Directed edges as `(source, target)` local node indices.
    pub edges: Vec<(u32, u32)>,
    pub label: u32,
}

impl Graph {
    fn validate(&self, index: usize) -> Result<()> {
        if self.features.len() != self.num_nodes * self.num_features {
            return Err(CredoError::batch(format!(
                "graph {index}: {} feature values for {} nodes x {} features",
                self.features.len(),
                self.num_nodes,
                self.num_features
            )));
        }
        if let Some((s, t)) = self
            .edges
            .iter()
            .find(|(s, t)| *s as usize >= self.num_nodes || *t as usize >= self.num_nodes)
        {
            return Err(CredoError::batch(format!(
                "graph {index}: edge ({s}, {t}) out of range for {} nodes",
                self.num_nodes
            )));
        }
        Ok(())
    }
}

/// Several graphs packed into one indexed structure.
#[derive(Debug, Clone)]
pub struct GraphBatch {
    /// Node features, `(total_nodes, num_features)`.
    pub x: Tensor,
    /// Edge list with global node indices, `(2, total_edges)`, `u32`.
    pub edge_index: Tensor,
    /// Graph id of each node, `(total_nodes,)`, `u32`.
    pub batch: Tensor,
    /// Per-graph labels, `(num_graphs,)`, `u32`.
    pub y: Tensor,
    pub num_graphs: usize,
    attrs: BTreeMap<String, Tensor>,
}

impl GraphBatch {
    /// Collate graphs into a disjoint union, offsetting edge endpoints by the
    /// running node count.
    pub fn collate(graphs: &[Graph], device: &Device) -> Result<Self> {
        let first = graphs
            .first()
            .ok_or_else(|| CredoError::batch("cannot collate an empty list of graphs"))?;
        let num_features = first.num_features;

        let mut features = Vec::new();
        let mut sources = Vec::new();
        let mut targets = Vec::new();
        let mut assignment = Vec::new();
        let mut labels = Vec::with_capacity(graphs.len());
        let mut offset = 0u32;

        for (i, graph) in graphs.iter().enumerate() {
            graph.validate(i)?;
            if graph.num_features != num_features {
                return Err(CredoError::batch(format!(
                    "graph {i} has {} features, expected {num_features}",
                    graph.num_features
                )));
            }
            features.extend_from_slice(&graph.features);
            for &(s, t) in &graph.edges {
                sources.push(s + offset);
                targets.push(t + offset);
            }
            assignment.extend(std::iter::repeat_n(i as u32, graph.num_nodes));
            labels.push(graph.label);
            offset += graph.num_nodes as u32;
        }

        let total_nodes = offset as usize;
        let total_edges = sources.len();
        sources.extend(targets);

        Ok(Self {
            x: Tensor::from_vec(features, (total_nodes, num_features), device)?,
            edge_index: Tensor::from_vec(sources, (2, total_edges), device)?,
            batch: Tensor::from_vec(assignment, total_nodes, device)?,
            y: Tensor::from_vec(labels, graphs.len(), device)?,
            num_graphs: graphs.len(),
            attrs: BTreeMap::new(),
        })
    }

    /// Attach an extra attribute (e.g. soft labels, per-graph weights).
    pub fn with_attr(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.attrs.insert(name.into(), tensor);
        self
    }

    /// Look up an attribute by name. The structural fields are addressable as
    /// `x`, `edge_index`, `batch` and `y`.
    pub fn attr(&self, name: &str) -> Option<&Tensor> {
        match name {
            "x" => Some(&self.x),
            "edge_index" => Some(&self.edge_index),
            "batch" => Some(&self.batch),
            "y" => Some(&self.y),
            other => self.attrs.get(other),
        }
    }

    /// Every tensor of the batch by name: the structural fields first, then
    /// the extra attributes in name order.
    pub fn tensors(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        [
            ("x", &self.x),
            ("edge_index", &self.edge_index),
            ("batch", &self.batch),
            ("y", &self.y),
        ]
        .into_iter()
        .chain(self.attrs.iter().map(|(k, v)| (k.as_str(), v)))
    }

    pub fn num_nodes(&self) -> usize {
        self.x.dims().first().copied().unwrap_or(0)
    }
}

/// A unit of training or evaluation data.
#[derive(Debug, Clone)]
pub enum Batch {
    Keyed(KeyedBatch),
    Graph(GraphBatch),
}

impl Batch {
    pub fn kind(&self) -> &'static str {
        match self {
            Batch::Keyed(_) => "keyed",
            Batch::Graph(_) => "graph",
        }
    }

    pub fn as_keyed(&self) -> Option<&KeyedBatch> {
        match self {
            Batch::Keyed(b) => Some(b),
            Batch::Graph(_) => None,
        }
    }

    pub fn as_graph(&self) -> Option<&GraphBatch> {
        match self {
            Batch::Graph(b) => Some(b),
            Batch::Keyed(_) => None,
        }
    }
}

impl From<KeyedBatch> for Batch {
    fn from(b: KeyedBatch) -> Self {
        Batch::Keyed(b)
    }
}

impl From<GraphBatch> for Batch {
    fn from(b: GraphBatch) -> Self {
        Batch::Graph(b)
    }
}

/// The model-facing view of a batch after the label has been set aside.
#[derive(Debug)]
pub enum ModelInput<'b> {
    /// Every field except the label key, forwarded verbatim.
    Fields(BTreeMap<&'b str, &'b Tensor>),
    /// Graph models receive the whole structure.
    Graph(&'b GraphBatch),
}

/// How labels and inputs are pulled out of a batch for one model family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchProtocol {
    Keyed { label_key: String },
    Graph { label_attr: String },
}

impl Default for BatchProtocol {
    fn default() -> Self {
        Self::keyed()
    }
}

impl BatchProtocol {
    /// Keyed-tensor protocol reading labels from `"label"`.
    pub fn keyed() -> Self {
        Self::Keyed {
            label_key: "label".into(),
        }
    }

    /// Structured-graph protocol reading labels from the `y` attribute.
    pub fn graph() -> Self {
        Self::Graph {
            label_attr: "y".into(),
        }
    }

    /// The single label tensor of `batch`. Its leading dimension is the
    /// example count.
    pub fn labels(&self, batch: &Batch) -> Result<Tensor> {
        match (self, batch) {
            (Self::Keyed { label_key }, Batch::Keyed(b)) => b.get(label_key).cloned().ok_or_else(
                || CredoError::batch(format!("keyed batch has no label field '{label_key}'")),
            ),
            (Self::Graph { label_attr }, Batch::Graph(b)) => {
                let labels = b.attr(label_attr).ok_or_else(|| {
                    CredoError::batch(format!("graph batch has no label attribute '{label_attr}'"))
                })?;
                let rows = labels.dims().first().copied().unwrap_or(0);
                if rows != b.num_graphs {
                    return Err(CredoError::batch(format!(
                        "label attribute '{label_attr}' has {rows} rows for {} graphs",
                        b.num_graphs
                    )));
                }
                Ok(labels.clone())
            }
            _ => Err(self.mismatch(batch)),
        }
    }

    /// The fields a model consumes as input.
    pub fn inputs<'b>(&self, batch: &'b Batch) -> Result<ModelInput<'b>> {
        match (self, batch) {
            (Self::Keyed { label_key }, Batch::Keyed(b)) => Ok(ModelInput::Fields(
                b.fields()
                    .iter()
                    .filter(|(k, _)| *k != label_key)
                    .map(|(k, v)| (k.as_str(), v))
                    .collect(),
            )),
            (Self::Graph { .. }, Batch::Graph(b)) => Ok(ModelInput::Graph(b)),
            _ => Err(self.mismatch(batch)),
        }
    }

    pub fn example_count(&self, batch: &Batch) -> Result<usize> {
        Ok(self.labels(batch)?.dim(0)?)
    }

    /// Fail if any tensor of `batch` lives on a device other than `device`.
    pub fn check_device(&self, batch: &Batch, device: &Device) -> Result<()> {
        let misplaced = match batch {
            Batch::Keyed(b) => b
                .fields()
                .iter()
                .find(|(_, t)| !t.device().same_device(device))
                .map(|(k, t)| (k.clone(), t.device().clone())),
            Batch::Graph(b) => b
                .tensors()
                .find(|(_, t)| !t.device().same_device(device))
                .map(|(k, t)| (k.to_string(), t.device().clone())),
        };
        match misplaced {
            Some((field, found)) => Err(CredoError::device(format!(
                "batch field '{field}' is on {found:?}, expected {device:?}"
            ))),
            None => Ok(()),
        }
    }

    fn mismatch(&self, batch: &Batch) -> CredoError {
        let expected = match self {
            Self::Keyed { .. } => "keyed",
            Self::Graph { .. } => "graph",
        };
        CredoError::batch(format!(
            "{expected} protocol received a {} batch",
            batch.kind()
        ))
    }
}

/// Convert a label tensor to per-example class indices on the host.
pub(crate) fn labels_to_classes(labels: &Tensor) -> Result<Vec<usize>> {
    let flat = labels.flatten_all()?.to_dtype(DType::F64)?.to_vec1::<f64>()?;
    flat.into_iter()
        .map(|v| {
            if v.is_finite() && v >= 0.0 {
                Ok(v.round() as usize)
            } else {
                Err(CredoError::evaluation(format!(
                    "label value {v} is not a class index"
                )))
            }
        })
        .collect()
}
