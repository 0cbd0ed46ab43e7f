pub mod dataset;
pub mod error;
pub mod evaluate;
pub mod loader;
pub mod metrics;
pub mod schedule;
pub mod snapshot;
pub mod train;
pub mod transforms;

#[cfg(test)]
mod testing;

pub use dataset::make_dataloaders;
pub use error::{Result, TrainError};
pub use evaluate::test_model;
pub use loader::{Batch, Feed, ImageFeed};
pub use train::{TrainSummary, Trainer};

use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};
use tch::{Cuda, Device};
use vision_core::{DenseNetConfig, Variant};

/// Where the dataset lives and how the feeds batch it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub root: String,
    pub batch_size: usize,
    pub num_workers: usize,
    /// Fetch the binary archive into `root` when it is not there yet.
    pub download: bool,
    /// Seed for shuffling and augmentation; entropy when absent.
    pub seed: Option<u64>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            root: "./data".to_string(),
            batch_size: 128,
            num_workers: 2,
            download: true,
            seed: None,
        }
    }
}

impl DataConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(TrainError::InvalidConfig("dataset.batch_size must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub description: String,
    /// `auto`, `cpu`, `cuda` or `cuda:N`.
    pub device: String,
    pub epochs: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    /// Epochs at which the learning rate is multiplied by 0.1.
    pub milestones: Vec<usize>,
    /// Write the best weights every this many epochs; 0 writes only at the end.
    pub checkpoint_every: usize,
    /// Prefix of the checkpoint file; the description and `.pt` are appended.
    pub state_dict_path: String,
    pub log_dir: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            description: "densenet121_cifar10".to_string(),
            device: "auto".to_string(),
            epochs: 30,
            learning_rate: 0.01,
            weight_decay: 5e-4,
            milestones: vec![15, 25],
            checkpoint_every: 5,
            state_dict_path: "./checkpoints/".to_string(),
            log_dir: "./runs".to_string(),
        }
    }
}

impl RunConfig {
    pub fn checkpoint_path(&self) -> PathBuf {
        PathBuf::from(format!("{}{}.pt", self.state_dict_path, self.description))
    }

    pub fn is_checkpoint_epoch(&self, epoch: usize) -> bool {
        let periodic = self.checkpoint_every != 0 && epoch % self.checkpoint_every == 0;
        periodic || epoch + 1 == self.epochs
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    pub variant: Variant,
    pub num_classes: i64,
    pub drop_rate: f64,
    /// Torchvision-named weights (`.safetensors`, `.pt` or `.ot`).
    pub pretrained: Option<String>,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            variant: Variant::Densenet121,
            num_classes: 10,
            drop_rate: 0.0,
            pretrained: Some("./weights/densenet121.safetensors".to_string()),
        }
    }
}

impl ModelSection {
    pub fn densenet_config(&self) -> DenseNetConfig {
        DenseNetConfig::for_variant(self.variant, self.num_classes).with_drop_rate(self.drop_rate)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub dataset: DataConfig,
    pub run: RunConfig,
    pub model: ModelSection,
}

impl ExperimentConfig {
    /// Reads the YAML file if it exists, otherwise falls back to defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            info!("Loading experiment config from {:?}", path);
            let content = fs::read_to_string(path)?;
            let config: Self = serde_yaml::from_str(&content)?;
            config.dataset.validate()?;
            Ok(config)
        } else {
            info!("No config at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }
}

/// Resolves a device string once at startup.
pub fn resolve_device(spec: &str) -> Result<Device> {
    let spec = spec.trim().to_ascii_lowercase();
    match spec.as_str() {
        "auto" => Ok(Device::cuda_if_available()),
        "cpu" => Ok(Device::Cpu),
        _ => {
            let index = match spec.strip_prefix("cuda") {
                Some("") => 0,
                Some(rest) => rest
                    .strip_prefix(':')
                    .and_then(|n| n.parse::<usize>().ok())
                    .ok_or_else(|| TrainError::DeviceUnavailable(format!("unrecognized device {spec:?}")))?,
                None => return Err(TrainError::DeviceUnavailable(format!("unrecognized device {spec:?}"))),
            };
            if !Cuda::is_available() {
                return Err(TrainError::DeviceUnavailable(format!("{spec} requested but CUDA is not available")));
            }
            let count = Cuda::device_count() as usize;
            if index >= count {
                return Err(TrainError::DeviceUnavailable(format!(
                    "{spec} requested but only {count} CUDA device(s) present"
                )));
            }
            Ok(Device::Cuda(index))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_path_appends_description() {
        let run = RunConfig {
            description: "dn121_lr01".to_string(),
            state_dict_path: "/tmp/weights_".to_string(),
            ..Default::default()
        };
        assert_eq!(run.checkpoint_path(), PathBuf::from("/tmp/weights_dn121_lr01.pt"));
    }

    #[test]
    fn checkpoint_epochs_are_multiples_plus_final() {
        let run = RunConfig {
            epochs: 7,
            checkpoint_every: 3,
            ..Default::default()
        };
        let epochs: Vec<usize> = (0..run.epochs).filter(|&e| run.is_checkpoint_epoch(e)).collect();
        assert_eq!(epochs, vec![0, 3, 6]);

        let run = RunConfig {
            epochs: 5,
            checkpoint_every: 0,
            ..Default::default()
        };
        let epochs: Vec<usize> = (0..run.epochs).filter(|&e| run.is_checkpoint_epoch(e)).collect();
        assert_eq!(epochs, vec![4]);
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let yaml = "run:\n  epochs: 3\n  milestones: [1]\nmodel:\n  variant: densenet169\n";
        let config: ExperimentConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.run.epochs, 3);
        assert_eq!(config.run.milestones, vec![1]);
        assert_eq!(config.run.description, RunConfig::default().description);
        assert_eq!(config.model.variant, Variant::Densenet169);
        assert_eq!(config.dataset.batch_size, 128);
    }

    #[test]
    fn zero_batch_size_is_rejected_on_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "dataset:\n  batch_size: 0\n").unwrap();
        assert!(matches!(ExperimentConfig::load(&path), Err(TrainError::InvalidConfig(_))));
    }

    #[test]
    fn shipped_config_matches_defaults() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../configs/training_config.yaml");
        let config = ExperimentConfig::load(path).unwrap();
        let defaults = ExperimentConfig::default();
        assert_eq!(config.run.description, defaults.run.description);
        assert_eq!(config.run.milestones, defaults.run.milestones);
        assert_eq!(config.dataset.batch_size, defaults.dataset.batch_size);
        assert_eq!(config.model.pretrained, defaults.model.pretrained);
    }

    #[test]
    fn cpu_and_garbage_devices() {
        assert_eq!(resolve_device("cpu").unwrap(), Device::Cpu);
        assert!(matches!(resolve_device("tpu"), Err(TrainError::DeviceUnavailable(_))));
        assert!(matches!(resolve_device("cuda:x"), Err(TrainError::DeviceUnavailable(_))));
    }
}
