//! Error types for the credo-core crate.

use thiserror::Error;

/// Result alias used throughout the harness.
pub type Result<T> = std::result::Result<T, CredoError>;

/// Top-level error type for training and evaluation.
#[derive(Debug, Error)]
pub enum CredoError {
    /// Bad option, unknown metric name, or inconsistent run setup. Raised
    /// before any training work begins.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Empty data: {0}")]
    EmptyData(String),

    #[error("Non-finite loss {value} at epoch {epoch}, batch {batch}")]
    NonFiniteLoss { epoch: usize, batch: usize, value: f64 },

    #[error("Device error: {0}")]
    Device(String),

    #[error("Batch error: {0}")]
    Batch(String),

    #[error("Evaluation error: {0}")]
    Evaluation(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Unknown model '{name}' (known: {known})")]
    UnknownModel { name: String, known: String },

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl CredoError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn empty_data(msg: impl Into<String>) -> Self {
        Self::EmptyData(msg.into())
    }

    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }

    pub fn batch(msg: impl Into<String>) -> Self {
        Self::Batch(msg.into())
    }

    pub fn evaluation(msg: impl Into<String>) -> Self {
        Self::Evaluation(msg.into())
    }

    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Whether this error belongs to the fail-fast configuration class.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

impl From<Box<figment::Error>> for CredoError {
    fn from(err: Box<figment::Error>) -> Self {
        Self::Config(err.to_string())
    }
}
