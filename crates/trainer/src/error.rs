use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("Dataset not found: {path:?} is missing")]
    DatasetNotFound { path: PathBuf },

    #[error("Corrupt dataset file {path:?}: {reason}")]
    CorruptDataset { path: PathBuf, reason: String },

    #[error("Dataset download failed: {0}")]
    Download(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Loss diverged (non-finite) at epoch {epoch}, batch {batch}")]
    Divergence { epoch: usize, batch: usize },

    #[error("Feed contains no examples")]
    EmptyFeed,

    #[error("Data worker failed: {0}")]
    Worker(String),

    #[error("Torch error: {0}")]
    Torch(#[from] tch::TchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Weights error: {0}")]
    Weights(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TrainError>;
