use std::borrow::Cow;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;

use anyhow::{bail, Result};
use log::{info, warn};
use memmap2::MmapOptions;
use safetensors::tensor::{serialize_to_file, View};
use safetensors::{Dtype, SafeTensors};
use tch::{nn, Device, Kind, Tensor};

/// Named tensors in the order they were read or captured.
pub type NamedTensors = Vec<(String, Tensor)>;

/// Outcome of copying a weight file into a VarStore.
#[derive(Debug, Default, Clone)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub skipped: Vec<String>,
}

pub fn is_safetensors(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == "safetensors")
}

pub fn load_safetensors<P: AsRef<Path>>(path: P) -> Result<NamedTensors> {
    let file = File::open(path)?;
    let buffer = unsafe { MmapOptions::new().map(&file)? };
    let tensors = SafeTensors::deserialize(&buffer)?;

    let mut named = Vec::new();
    for (name, view) in tensors.tensors() {
        let shape: Vec<i64> = view.shape().iter().map(|&x| x as i64).collect();
        let kind = match view.dtype() {
            Dtype::F32 => Kind::Float,
            Dtype::F64 => Kind::Double,
            Dtype::F16 => Kind::Half,
            Dtype::BF16 => Kind::BFloat16,
            Dtype::I64 => Kind::Int64,
            other => bail!("Unsupported dtype {:?} for tensor {}", other, name),
        };
        named.push((name, Tensor::from_data_size(view.data(), &shape, kind)));
    }
    Ok(named)
}

/// Host copy of a tensor in the little-endian layout safetensors stores.
struct HostTensor {
    dtype: Dtype,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl HostTensor {
    fn from_tensor(name: &str, tensor: &Tensor) -> Result<Self> {
        let tensor = tensor.to_device(Device::Cpu).contiguous();
        let shape = tensor.size().iter().map(|&d| d as usize).collect();
        let flat = tensor.flatten(0, -1);
        let (dtype, data) = match tensor.kind() {
            Kind::Float => (
                Dtype::F32,
                Vec::<f32>::try_from(&flat)?.iter().flat_map(|v| v.to_le_bytes()).collect(),
            ),
            Kind::Double => (
                Dtype::F64,
                Vec::<f64>::try_from(&flat)?.iter().flat_map(|v| v.to_le_bytes()).collect(),
            ),
            Kind::Int64 => (
                Dtype::I64,
                Vec::<i64>::try_from(&flat)?.iter().flat_map(|v| v.to_le_bytes()).collect(),
            ),
            other => bail!("Cannot serialize tensor {} of kind {:?}", name, other),
        };
        Ok(Self { dtype, shape, data })
    }
}

impl View for &HostTensor {
    fn dtype(&self) -> Dtype {
        self.dtype
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<[u8]> {
        Cow::Borrowed(&self.data)
    }

    fn data_len(&self) -> usize {
        self.data.len()
    }
}

pub fn save_safetensors<P: AsRef<Path>>(named: &[(String, Tensor)], path: P) -> Result<()> {
    let host = named
        .iter()
        .map(|(name, tensor)| Ok((name.as_str(), HostTensor::from_tensor(name, tensor)?)))
        .collect::<Result<Vec<_>>>()?;
    serialize_to_file(host.iter().map(|(name, t)| (*name, t)), &None, path.as_ref())?;
    Ok(())
}

/// Reads a weight file, picking the format from the extension: `.safetensors`
/// or anything else as a libtorch multi-tensor archive (`.pt`, `.ot`).
pub fn load_named<P: AsRef<Path>>(path: P) -> Result<NamedTensors> {
    let path = path.as_ref();
    if is_safetensors(path) {
        load_safetensors(path)
    } else {
        Ok(Tensor::load_multi(path)?)
    }
}

pub fn save_named<P: AsRef<Path>>(named: &[(String, Tensor)], path: P) -> Result<()> {
    let path = path.as_ref();
    if is_safetensors(path) {
        save_safetensors(named, path)
    } else {
        Ok(Tensor::save_multi(named, path)?)
    }
}

/// Copies named tensors into the matching variables of `vs`.
///
/// Non-strict mode skips names the store lacks and shape mismatches (the
/// 1000-way ImageNet classifier when fine-tuning on fewer classes). Strict
/// mode requires an exact one-to-one match.
pub fn copy_into(vs: &mut nn::VarStore, named: &[(String, Tensor)], strict: bool) -> Result<LoadReport> {
    let mut variables = vs.variables();
    let device = vs.device();
    let mut report = LoadReport::default();

    for (name, tensor) in named {
        match variables.get_mut(name) {
            Some(var) if var.size() == tensor.size() => {
                let src = tensor.to_device(device);
                tch::no_grad(|| {
                    var.copy_(&src);
                });
                report.loaded.push(name.clone());
            }
            Some(var) => {
                if strict {
                    bail!("Shape mismatch for {}: model {:?}, file {:?}", name, var.size(), tensor.size());
                }
                warn!("Skipping {}: model {:?}, file {:?}", name, var.size(), tensor.size());
                report.skipped.push(name.clone());
            }
            None => {
                if strict {
                    bail!("Tensor {} found in weights but not in model", name);
                }
                warn!("Tensor {} found in weights but not in model", name);
                report.skipped.push(name.clone());
            }
        }
    }

    if strict {
        let loaded: HashSet<&str> = report.loaded.iter().map(String::as_str).collect();
        let mut missing: Vec<&String> = variables.keys().filter(|k| !loaded.contains(k.as_str())).collect();
        if !missing.is_empty() {
            missing.sort();
            bail!("Weights are missing {} model variables, first: {}", missing.len(), missing[0]);
        }
    }

    Ok(report)
}

/// Loads pretrained weights, keeping whatever fits the current model.
pub fn load_pretrained<P: AsRef<Path>>(vs: &mut nn::VarStore, path: P) -> Result<LoadReport> {
    let path = path.as_ref();
    let named = load_named(path)?;
    let report = copy_into(vs, &named, false)?;
    info!(
        "Loaded {} pretrained tensors from {:?} ({} skipped)",
        report.loaded.len(),
        path,
        report.skipped.len()
    );
    Ok(report)
}
