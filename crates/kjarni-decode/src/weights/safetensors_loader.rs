//! SafeTensors format loader backed by memory maps.

use std::collections::HashMap;
use std::fs::{self, File};
use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use memmap2::Mmap;
use ndarray::ArrayD;
use safetensors::{Dtype, SafeTensors};

use super::{raw_to_f32, DType, WeightLoader};

/// A loader for `.safetensors` files.
///
/// Accepts a single file, a directory containing `model.safetensors`, or a
/// directory with `model.safetensors.index.json` and its shards. Each
/// header is parsed once when its shard is mapped.
#[derive(Debug)]
pub struct SafeTensorsLoader {
    shards: Vec<Shard>,
    tensors: HashMap<String, TensorEntry>,
}

#[derive(Debug)]
struct Shard {
    path: PathBuf,
    mmap: Mmap,
}

/// Location of one tensor inside a mapped shard.
#[derive(Debug, Clone)]
struct TensorEntry {
    shard: usize,
    dtype: Dtype,
    shape: Vec<usize>,
    bytes: Range<usize>,
}

impl SafeTensorsLoader {
    pub fn new(path: &Path) -> Result<Self> {
        if path.is_file() {
            return Self::load_single(path);
        }
        if !path.is_dir() {
            return Err(anyhow!("path {:?} is neither a file nor a directory", path));
        }

        let index_file = path.join("model.safetensors.index.json");
        if index_file.exists() {
            Self::load_sharded(path, &index_file)
        } else {
            Self::load_single(&path.join("model.safetensors"))
        }
    }

    fn load_single(path: &Path) -> Result<Self> {
        let (shard, tensors) = Self::map_shard(path, 0)?;

        log::info!(
            "loaded safetensors file: {} tensors from {:?}",
            tensors.len(),
            path.file_name().unwrap_or_default()
        );

        Ok(Self {
            shards: vec![shard],
            tensors,
        })
    }

    fn load_sharded(dir: &Path, index_path: &Path) -> Result<Self> {
        let index_content = fs::read_to_string(index_path)
            .with_context(|| format!("failed to read index file: {:?}", index_path))?;
        let index: serde_json::Value =
            serde_json::from_str(&index_content).context("failed to parse index.json")?;
        let weight_map = index["weight_map"]
            .as_object()
            .ok_or_else(|| anyhow!("invalid index.json: missing 'weight_map' object"))?;

        let mut files: Vec<&str> = weight_map.values().filter_map(|v| v.as_str()).collect();
        files.sort_unstable();
        files.dedup();

        let mut shards = Vec::with_capacity(files.len());
        let mut shard_tensors = Vec::with_capacity(files.len());
        let mut file_to_shard = HashMap::new();
        for (idx, filename) in files.iter().enumerate() {
            let (shard, entries) = Self::map_shard(&dir.join(filename), idx)?;
            shards.push(shard);
            shard_tensors.push(entries);
            file_to_shard.insert(*filename, idx);
            log::debug!("mapped shard {}/{}: {}", idx + 1, files.len(), filename);
        }

        let mut tensors = HashMap::with_capacity(weight_map.len());
        for (name, file) in weight_map {
            let file = file
                .as_str()
                .ok_or_else(|| anyhow!("invalid shard entry for tensor '{}'", name))?;
            let idx = file_to_shard
                .get(file)
                .copied()
                .ok_or_else(|| anyhow!("shard '{}' missing for tensor '{}'", file, name))?;
            let entry = shard_tensors[idx]
                .remove(name)
                .ok_or_else(|| anyhow!("tensor '{}' not present in shard '{}'", name, file))?;
            tensors.insert(name.clone(), entry);
        }

        log::info!(
            "loaded sharded safetensors: {} shards, {} tensors",
            shards.len(),
            tensors.len()
        );

        Ok(Self { shards, tensors })
    }

    fn map_shard(path: &Path, shard: usize) -> Result<(Shard, HashMap<String, TensorEntry>)> {
        let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
        // SAFETY: the file is opened read-only and the map is never mutated.
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("failed to mmap {:?}", path))?;

        let (header_len, metadata) = SafeTensors::read_metadata(&mmap)
            .with_context(|| format!("failed to parse safetensors header in {:?}", path))?;
        let data_start = 8 + header_len;
        let entries = metadata
            .tensors()
            .into_iter()
            .map(|(name, info)| {
                let (begin, end) = info.data_offsets;
                let entry = TensorEntry {
                    shard,
                    dtype: info.dtype,
                    shape: info.shape.clone(),
                    bytes: data_start + begin..data_start + end,
                };
                (name, entry)
            })
            .collect();

        let shard = Shard {
            path: path.to_path_buf(),
            mmap,
        };
        Ok((shard, entries))
    }
}

impl WeightLoader for SafeTensorsLoader {
    fn get_array(&self, name: &str) -> Result<ArrayD<f32>> {
        let entry = self
            .tensors
            .get(name)
            .ok_or_else(|| anyhow!("tensor '{}' not found", name))?;
        let shard = &self.shards[entry.shard];
        let bytes = shard.mmap.get(entry.bytes.clone()).ok_or_else(|| {
            anyhow!("tensor '{}' extends past the end of {:?}", name, shard.path)
        })?;
        let dtype = DType::try_from(entry.dtype).with_context(|| format!("tensor '{}'", name))?;
        raw_to_f32(dtype, &entry.shape, bytes)
    }

    fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    fn tensor_names(&self) -> Vec<String> {
        self.tensors.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::bf16;
    use safetensors::tensor::TensorView as StTensorView;

    fn write_file(path: &Path, name: &str, dtype: Dtype, shape: Vec<usize>, bytes: &[u8]) {
        let view = StTensorView::new(dtype, shape, bytes).unwrap();
        safetensors::serialize_to_file(vec![(name, view)], &None, path).unwrap();
    }

    #[test]
    fn test_single_file_roundtrip_bf16() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let bytes: Vec<u8> = [0.5f32, 1.0, -3.0, 8.0]
            .iter()
            .flat_map(|v| bf16::from_f32(*v).to_le_bytes())
            .collect();
        write_file(&path, "layer.weight", Dtype::BF16, vec![2, 2], &bytes);

        let loader = SafeTensorsLoader::new(dir.path()).unwrap();
        assert!(loader.contains("layer.weight"));
        let tensor = loader.get_array("layer.weight").unwrap();
        assert_eq!(tensor.shape(), &[2, 2]);
        assert_eq!(tensor[[1, 0]], -3.0);
        assert!(loader.get_array("missing").is_err());
    }

    #[test]
    fn test_sharded_index() {
        let dir = tempfile::tempdir().unwrap();
        let a: Vec<u8> = [1.0f32, 2.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let b: Vec<u8> = [3.0f32].iter().flat_map(|v| v.to_le_bytes()).collect();
        write_file(&dir.path().join("part-1.safetensors"), "a", Dtype::F32, vec![2], &a);
        write_file(&dir.path().join("part-2.safetensors"), "b", Dtype::F32, vec![1], &b);
        let index = serde_json::json!({
            "weight_map": { "a": "part-1.safetensors", "b": "part-2.safetensors" }
        });
        fs::write(
            dir.path().join("model.safetensors.index.json"),
            index.to_string(),
        )
        .unwrap();

        let loader = SafeTensorsLoader::new(dir.path()).unwrap();
        let mut names = loader.tensor_names();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(loader.get_array("b").unwrap()[[0]], 3.0);
    }

    #[test]
    fn test_multiple_tensors_read_from_their_own_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let a: Vec<u8> = [1.0f32, 2.0, 3.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let b: Vec<u8> = [-1.0f32, -2.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let c: Vec<u8> = [7.0f32; 4].iter().flat_map(|v| v.to_le_bytes()).collect();
        let tensors = vec![
            ("a", StTensorView::new(Dtype::F32, vec![3], &a).unwrap()),
            ("b", StTensorView::new(Dtype::F32, vec![2], &b).unwrap()),
            ("c", StTensorView::new(Dtype::F32, vec![2, 2], &c).unwrap()),
        ];
        safetensors::serialize_to_file(tensors, &None, &path).unwrap();

        let loader = SafeTensorsLoader::new(&path).unwrap();
        let values = |name: &str| loader.get_array(name).unwrap().iter().copied().collect::<Vec<f32>>();
        for _ in 0..2 {
            assert_eq!(values("a"), vec![1.0, 2.0, 3.0]);
            assert_eq!(values("b"), vec![-1.0, -2.0]);
            let c = loader.get_array("c").unwrap();
            assert_eq!(c.shape(), &[2, 2]);
            assert!(c.iter().all(|&v| v == 7.0));
        }
    }

    #[test]
    fn test_index_entry_missing_from_shard_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let a: Vec<u8> = 1.0f32.to_le_bytes().to_vec();
        write_file(&dir.path().join("part-1.safetensors"), "a", Dtype::F32, vec![1], &a);
        let index = serde_json::json!({
            "weight_map": { "a": "part-1.safetensors", "ghost": "part-1.safetensors" }
        });
        fs::write(
            dir.path().join("model.safetensors.index.json"),
            index.to_string(),
        )
        .unwrap();

        assert!(SafeTensorsLoader::new(dir.path()).is_err());
    }
}
