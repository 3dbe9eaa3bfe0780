//! Attention-weight artifacts over the KB span
//!
//! During a captured generation call the generator hands one artifact per
//! KB-bearing layer to an [`AttentionStore`], keyed by a configuration name
//! and the layer index. Scoring reads them back with the same key.
//!
//! Artifact layout: `[batch, heads_or_steps, kb_len]`. `kb_len` may exceed
//! the active KB size when the generator pads the KB axis.

use anyhow::{Context, Result};
use candle_core::{DType, Tensor, D};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use crate::EvalError;

/// Layers that carry KB key/value pairs: `0, f, 2f, ...` below `n_layers`
pub fn kb_layers(n_layers: usize, layer_frequency: usize) -> Result<Vec<usize>> {
    if layer_frequency == 0 {
        return Err(EvalError::InvalidLayerFrequency.into());
    }
    Ok((0..n_layers).step_by(layer_frequency).collect())
}

/// Storage for attention artifacts keyed by `(config name, layer)`
pub trait AttentionStore {
    fn save(&self, config_name: &str, layer: usize, weights: &Tensor) -> Result<()>;
    fn load(&self, config_name: &str, layer: usize) -> Result<Tensor>;
}

/// Artifacts as `{dir}/{config}_{layer}.npy` files
#[derive(Debug, Clone)]
pub struct NpyAttentionStore {
    dir: PathBuf,
}

impl NpyAttentionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn artifact_path(&self, config_name: &str, layer: usize) -> PathBuf {
        self.dir.join(format!("{config_name}_{layer}.npy"))
    }
}

impl AttentionStore for NpyAttentionStore {
    fn save(&self, config_name: &str, layer: usize, weights: &Tensor) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let path = self.artifact_path(config_name, layer);
        debug!("Saving attention artifact {}", path.display());
        weights
            .to_dtype(DType::F32)?
            .write_npy(&path)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    fn load(&self, config_name: &str, layer: usize) -> Result<Tensor> {
        let path = self.artifact_path(config_name, layer);
        if !path.exists() {
            return Err(EvalError::MissingArtifact {
                config: config_name.to_string(),
                layer,
            }
            .into());
        }
        Tensor::read_npy(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?
            .to_dtype(DType::F32)
            .map_err(Into::into)
    }
}

/// Artifacts kept in memory; same key scheme as the file store
#[derive(Debug, Default)]
pub struct MemoryAttentionStore {
    artifacts: Mutex<HashMap<(String, usize), Tensor>>,
}

impl MemoryAttentionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.artifacts.lock().map(|a| a.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AttentionStore for MemoryAttentionStore {
    fn save(&self, config_name: &str, layer: usize, weights: &Tensor) -> Result<()> {
        let mut artifacts = self
            .artifacts
            .lock()
            .map_err(|_| anyhow::anyhow!("attention store lock poisoned"))?;
        artifacts.insert((config_name.to_string(), layer), weights.to_dtype(DType::F32)?);
        Ok(())
    }

    fn load(&self, config_name: &str, layer: usize) -> Result<Tensor> {
        let artifacts = self
            .artifacts
            .lock()
            .map_err(|_| anyhow::anyhow!("attention store lock poisoned"))?;
        artifacts
            .get(&(config_name.to_string(), layer))
            .cloned()
            .ok_or_else(|| {
                EvalError::MissingArtifact {
                    config: config_name.to_string(),
                    layer,
                }
                .into()
            })
    }
}

/// Where a captured generation call writes its artifacts
#[derive(Clone, Copy)]
pub struct AttentionCapture<'a> {
    pub store: &'a dyn AttentionStore,
    /// Base name of every artifact written by this call
    pub config_name: &'a str,
}

impl<'a> AttentionCapture<'a> {
    pub fn new(store: &'a dyn AttentionStore, config_name: &'a str) -> Self {
        Self { store, config_name }
    }

    /// Record the KB attention of one layer
    pub fn record(&self, layer: usize, weights: &Tensor) -> Result<()> {
        self.store.save(self.config_name, layer, weights)
    }
}

/// Load one artifact restricted to the active KB, viewed as
/// `[batch_size, heads_or_steps, kb_size]`.
///
/// Columns past `kb_size` are padding and are dropped first.
pub fn load_kb_view(
    store: &dyn AttentionStore,
    config_name: &str,
    layer: usize,
    kb_size: usize,
    batch_size: usize,
) -> Result<Tensor> {
    let raw = store.load(config_name, layer)?;
    let shape_error = || EvalError::ArtifactShape {
        layer,
        shape: raw.dims().to_vec(),
        batch_size,
        kb_size,
    };

    let kb_len = raw.dim(D::Minus1)?;
    if kb_len < kb_size || kb_size == 0 || batch_size == 0 {
        return Err(shape_error().into());
    }
    let truncated = raw.narrow(D::Minus1, 0, kb_size)?.contiguous()?;

    let total = truncated.elem_count();
    if total % (batch_size * kb_size) != 0 {
        return Err(shape_error().into());
    }
    let middle = total / (batch_size * kb_size);
    Ok(truncated.reshape((batch_size, middle, kb_size))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_kb_layers_stride() {
        assert_eq!(kb_layers(32, 3).unwrap(), vec![0, 3, 6, 9, 12, 15, 18, 21, 24, 27, 30]);
        assert_eq!(kb_layers(4, 1).unwrap(), vec![0, 1, 2, 3]);
        assert!(kb_layers(32, 0).is_err());
    }

    #[test]
    fn test_memory_store_roundtrip_and_missing() {
        let store = MemoryAttentionStore::new();
        let t = Tensor::ones((2, 1, 3), DType::F32, &Device::Cpu).unwrap();
        store.save("cfg", 3, &t).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.load("cfg", 3).unwrap().dims(), &[2, 1, 3]);

        let err = store.load("cfg", 6).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EvalError>(),
            Some(EvalError::MissingArtifact { layer: 6, .. })
        ));
    }

    #[test]
    fn test_npy_store_key_scheme() {
        let dir = tempfile::tempdir().unwrap();
        let store = NpyAttentionStore::new(dir.path());
        let t = Tensor::zeros((1, 2, 2), DType::F32, &Device::Cpu).unwrap();
        store.save("acc_run", 9, &t).unwrap();
        assert!(dir.path().join("acc_run_9.npy").exists());
        assert_eq!(store.load("acc_run", 9).unwrap().dims(), &[1, 2, 2]);
        assert!(store.load("acc_run", 12).is_err());
    }

    #[test]
    fn test_kb_view_truncates_padding() {
        let store = MemoryAttentionStore::new();
        // batch 2, 3 steps, 4 KB columns + 2 padding columns
        let t = Tensor::arange(0f32, 36., &Device::Cpu)
            .unwrap()
            .reshape((2, 3, 6))
            .unwrap();
        store.save("cfg", 0, &t).unwrap();

        let view = load_kb_view(&store, "cfg", 0, 4, 2).unwrap();
        assert_eq!(view.dims(), &[2, 3, 4]);
        let first: Vec<f32> = view.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(&first[..4], &[0., 1., 2., 3.]);
        assert_eq!(&first[4..8], &[6., 7., 8., 9.]);
    }

    #[test]
    fn test_kb_view_rejects_short_axis() {
        let store = MemoryAttentionStore::new();
        let t = Tensor::zeros((2, 1, 3), DType::F32, &Device::Cpu).unwrap();
        store.save("cfg", 0, &t).unwrap();
        assert!(load_kb_view(&store, "cfg", 0, 4, 2).is_err());
        assert!(load_kb_view(&store, "cfg", 0, 3, 4).is_err());
    }
}
