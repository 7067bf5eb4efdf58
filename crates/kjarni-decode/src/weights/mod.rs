//! Weight loading infrastructure for model files.
//!
//! All tensors are decoded to `f32` on access. Half-precision checkpoints
//! (`F16`, `BF16`) are upcast with the `half` crate.

mod safetensors_loader;

pub use safetensors_loader::SafeTensorsLoader;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use half::{bf16, f16};
use ndarray::{Array1, Array2, ArrayD, IxDyn};

/// Element types a checkpoint may store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F32,
    F16,
    BF16,
}

impl DType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 | DType::BF16 => 2,
        }
    }
}

impl TryFrom<safetensors::Dtype> for DType {
    type Error = anyhow::Error;

    fn try_from(dtype: safetensors::Dtype) -> Result<Self> {
        match dtype {
            safetensors::Dtype::F32 => Ok(DType::F32),
            safetensors::Dtype::F16 => Ok(DType::F16),
            safetensors::Dtype::BF16 => Ok(DType::BF16),
            other => Err(anyhow!("unsupported tensor dtype: {:?}", other)),
        }
    }
}

/// Decodes little-endian raw bytes into an `f32` tensor of the given shape.
pub fn raw_to_f32(dtype: DType, shape: &[usize], bytes: &[u8]) -> Result<ArrayD<f32>> {
    let expected: usize = shape.iter().product::<usize>() * dtype.size_in_bytes();
    if bytes.len() != expected {
        return Err(anyhow!(
            "tensor byte length {} does not match shape {:?} ({:?}, expected {} bytes)",
            bytes.len(),
            shape,
            dtype,
            expected
        ));
    }

    let data: Vec<f32> = match dtype {
        DType::F32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        DType::F16 => bytes
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        DType::BF16 => bytes
            .chunks_exact(2)
            .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
    };

    Ok(ArrayD::from_shape_vec(IxDyn(shape), data)?)
}

/// Source of named tensors.
///
/// Implementations handle format-specific details while providing a
/// uniform `f32` view of the weights.
pub trait WeightLoader: Send + Sync {
    /// Loads a tensor by name, decoded to `f32`.
    fn get_array(&self, name: &str) -> Result<ArrayD<f32>>;

    /// Checks if a tensor with the given name exists.
    fn contains(&self, name: &str) -> bool;

    /// Names of every stored tensor.
    fn tensor_names(&self) -> Vec<String>;
}

/// Tensors held directly in memory.
#[derive(Debug, Default, Clone)]
pub struct InMemoryWeights {
    tensors: HashMap<String, ArrayD<f32>>,
}

impl InMemoryWeights {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: ArrayD<f32>) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn remove(&mut self, name: &str) -> Option<ArrayD<f32>> {
        self.tensors.remove(name)
    }
}

impl FromIterator<(String, ArrayD<f32>)> for InMemoryWeights {
    fn from_iter<I: IntoIterator<Item = (String, ArrayD<f32>)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

impl WeightLoader for InMemoryWeights {
    fn get_array(&self, name: &str) -> Result<ArrayD<f32>> {
        self.tensors
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("tensor '{}' not found", name))
    }

    fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    fn tensor_names(&self) -> Vec<String> {
        self.tensors.keys().cloned().collect()
    }
}

/// Shared handle over a weight source.
#[derive(Clone)]
pub struct ModelWeights {
    loader: Arc<dyn WeightLoader>,
}

impl ModelWeights {
    /// Opens safetensors weights from a file or model directory.
    pub fn from_safetensors(path: &Path) -> Result<Self> {
        let loader = SafeTensorsLoader::new(path)
            .with_context(|| format!("failed to open weights at {:?}", path))?;
        Ok(Self::from_loader(loader))
    }

    pub fn from_loader(loader: impl WeightLoader + 'static) -> Self {
        Self {
            loader: Arc::new(loader),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.loader.contains(name)
    }

    pub fn tensor_names(&self) -> Vec<String> {
        self.loader.tensor_names()
    }

    pub fn get_array_dyn(&self, name: &str) -> Result<ArrayD<f32>> {
        self.loader.get_array(name)
    }

    pub fn get_array1(&self, name: &str) -> Result<Array1<f32>> {
        self.get_array_dyn(name)?
            .into_dimensionality()
            .with_context(|| format!("tensor '{}' is not 1-dimensional", name))
    }

    pub fn get_array2(&self, name: &str) -> Result<Array2<f32>> {
        self.get_array_dyn(name)?
            .into_dimensionality()
            .with_context(|| format!("tensor '{}' is not 2-dimensional", name))
    }
}

impl std::fmt::Debug for ModelWeights {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelWeights")
            .field("tensors", &self.loader.tensor_names().len())
            .finish()
    }
}
