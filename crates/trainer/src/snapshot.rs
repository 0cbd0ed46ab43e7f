use std::fs;
use std::path::Path;

use tch::{nn, Device, Tensor};
use vision_core::weights::{self, NamedTensors};

use crate::error::Result;

/// A detached CPU copy of every variable in a VarStore.
///
/// Nothing hands out mutable access to the copied tensors; later captures
/// replace a snapshot wholesale.
pub struct WeightSnapshot {
    tensors: NamedTensors,
    accuracy: Option<f64>,
}

impl WeightSnapshot {
    pub fn capture(vs: &nn::VarStore, accuracy: f64) -> Self {
        let mut tensors: NamedTensors = tch::no_grad(|| {
            vs.variables()
                .into_iter()
                .map(|(name, t)| (name, t.detach().to_device(Device::Cpu).copy()))
                .collect()
        });
        tensors.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            tensors,
            accuracy: Some(accuracy),
        }
    }

    /// Validation accuracy at capture time; `None` for snapshots read from disk.
    pub fn accuracy(&self) -> Option<f64> {
        self.accuracy
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    /// Overwrites `path`; the format follows the extension (`.safetensors`,
    /// anything else is a libtorch archive).
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        weights::save_named(&self.tensors, path)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut tensors = weights::load_named(path)?;
        tensors.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(Self {
            tensors,
            accuracy: None,
        })
    }

    /// Copies the snapshot into `vs`; every variable must be present with the
    /// same shape.
    pub fn restore(&self, vs: &mut nn::VarStore) -> Result<()> {
        weights::copy_into(vs, &self.tensors, true)?;
        Ok(())
    }
}
