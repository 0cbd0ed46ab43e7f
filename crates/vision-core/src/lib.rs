pub mod config;
pub mod densenet;
pub mod mode;
pub mod weights;

pub use config::{DenseNetConfig, Variant};
pub use densenet::DenseNet;
pub use mode::{Classifier, Mode};
