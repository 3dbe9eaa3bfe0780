//! KB key/value embedding retrieval
//!
//! Embeddings come either from a precomputed table (sliced by row index) or
//! from an encoder invoked on the raw rows. Both paths return rows in the
//! order the indices were requested, so callers never need to know which
//! one is active.

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use tracing::{debug, info};

use crate::dataset::{DatasetSpec, KbEntry, KnowledgeBase};
use crate::EvalError;

/// Key/value embeddings of a KB subset.
///
/// Row `i` of both tensors belongs to the `i`-th requested KB row.
/// Shapes are `[rows, features]` or `[rows, layers, features]`.
#[derive(Debug, Clone)]
pub struct KbEmbeddingPair {
    pub key: Tensor,
    pub value: Tensor,
}

impl KbEmbeddingPair {
    pub fn new(key: Tensor, value: Tensor) -> Result<Self> {
        let (k_rows, v_rows) = (key.dim(0)?, value.dim(0)?);
        anyhow::ensure!(
            k_rows == v_rows,
            "key/value row mismatch: {k_rows} keys, {v_rows} values"
        );
        Ok(Self { key, value })
    }

    /// Number of KB rows
    pub fn n_rows(&self) -> usize {
        self.key.dims().first().copied().unwrap_or(0)
    }

    /// Key and value vectors of one row
    pub fn row(&self, index: usize) -> Result<(Tensor, Tensor)> {
        Ok((self.key.i(index)?, self.value.i(index)?))
    }

    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            key: self.key.to_device(device)?,
            value: self.value.to_device(device)?,
        })
    }
}

/// Encodes raw KB rows into key/value embeddings
pub trait KbEncoder {
    /// Embed `entries`, returning one key and one value row per entry in order
    fn encode(&self, entries: &[&KbEntry]) -> Result<KbEmbeddingPair>;
}

/// Precomputed embeddings, row-aligned with the dataset's evaluation part
#[derive(Debug, Clone)]
pub struct PrecomputedEmbeddings {
    key: Tensor,
    value: Tensor,
}

impl PrecomputedEmbeddings {
    pub fn new(key: Tensor, value: Tensor) -> Result<Self> {
        let pair = KbEmbeddingPair::new(key, value)?;
        Ok(Self {
            key: pair.key,
            value: pair.value,
        })
    }

    /// Load the `.npy` pair named by `spec`, dropping rows before the
    /// evaluation part.
    pub fn load(spec: &DatasetSpec) -> Result<Self> {
        let start = spec.validation_start();
        let key = read_embedding_table(&spec.key_embedding_path(), start)?;
        let value = read_embedding_table(&spec.value_embedding_path(), start)?;
        info!(
            "Loaded precomputed embeddings: key {:?}, value {:?}",
            key.dims(),
            value.dims()
        );
        Self::new(key, value)
    }

    pub fn n_rows(&self) -> usize {
        self.key.dims().first().copied().unwrap_or(0)
    }

    /// Fail unless there is exactly one embedding row per dataset entry
    pub fn ensure_aligned(&self, kb: &KnowledgeBase) -> Result<()> {
        if self.n_rows() != kb.len() {
            return Err(EvalError::EmbeddingMisaligned {
                embeddings: self.n_rows(),
                entries: kb.len(),
            }
            .into());
        }
        Ok(())
    }

    fn slice(&self, indices: &[usize]) -> Result<KbEmbeddingPair> {
        let len = self.n_rows();
        if let Some(&index) = indices.iter().find(|&&i| i >= len) {
            return Err(EvalError::IndexOutOfRange { index, len }.into());
        }
        let ids: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
        let ids = Tensor::new(ids.as_slice(), self.key.device())?;
        KbEmbeddingPair::new(
            self.key.index_select(&ids, 0)?,
            self.value.index_select(&ids, 0)?,
        )
    }
}

fn read_embedding_table(path: &std::path::Path, start: usize) -> Result<Tensor> {
    let table = Tensor::read_npy(path)
        .with_context(|| format!("Failed to read embeddings: {}", path.display()))?
        .to_dtype(DType::F32)?;
    let rows = table.dim(0)?;
    let start = start.min(rows);
    Ok(table.narrow(0, start, rows - start)?)
}

/// Where embeddings come from; fixed for a retriever's lifetime
pub enum EmbeddingSource {
    Cached(PrecomputedEmbeddings),
    OnDemand(Box<dyn KbEncoder>),
}

/// Maps KB row indices to their key/value embeddings
pub struct KbRetriever<'a> {
    dataset: &'a KnowledgeBase,
    source: EmbeddingSource,
}

impl<'a> KbRetriever<'a> {
    pub fn cached(dataset: &'a KnowledgeBase, embeddings: PrecomputedEmbeddings) -> Self {
        Self {
            dataset,
            source: EmbeddingSource::Cached(embeddings),
        }
    }

    pub fn on_demand(dataset: &'a KnowledgeBase, encoder: Box<dyn KbEncoder>) -> Self {
        Self {
            dataset,
            source: EmbeddingSource::OnDemand(encoder),
        }
    }

    pub fn dataset(&self) -> &'a KnowledgeBase {
        self.dataset
    }

    pub fn uses_cache(&self) -> bool {
        matches!(self.source, EmbeddingSource::Cached(_))
    }

    /// Embeddings of the rows at `indices`, in request order
    pub fn get_embeddings(&self, indices: &[usize]) -> Result<KbEmbeddingPair> {
        debug!(
            "Retrieving {} KB embeddings ({})",
            indices.len(),
            if self.uses_cache() { "cached" } else { "encoder" }
        );
        match &self.source {
            EmbeddingSource::Cached(table) => table.slice(indices),
            EmbeddingSource::OnDemand(encoder) => {
                let rows = self.dataset.select(indices)?;
                let pair = encoder.encode(&rows)?;
                anyhow::ensure!(
                    pair.n_rows() == indices.len(),
                    "encoder returned {} rows for {} entries",
                    pair.n_rows(),
                    indices.len()
                );
                Ok(pair)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(rows: usize, dim: usize) -> PrecomputedEmbeddings {
        let device = Device::Cpu;
        let key: Vec<f32> = (0..rows * dim).map(|x| x as f32).collect();
        let value: Vec<f32> = (0..rows * dim).map(|x| -(x as f32)).collect();
        PrecomputedEmbeddings::new(
            Tensor::from_vec(key, (rows, dim), &device).unwrap(),
            Tensor::from_vec(value, (rows, dim), &device).unwrap(),
        )
        .unwrap()
    }

    fn entry(name: &str) -> KbEntry {
        KbEntry {
            name: name.into(),
            description_type: "color".into(),
            description: "red".into(),
            key_string: String::new(),
            question: String::new(),
            answer: String::new(),
        }
    }

    /// Embeds an entry as a constant row equal to its name length
    struct LengthEncoder;

    impl KbEncoder for LengthEncoder {
        fn encode(&self, entries: &[&KbEntry]) -> Result<KbEmbeddingPair> {
            let data: Vec<f32> = entries
                .iter()
                .flat_map(|e| std::iter::repeat(e.name.len() as f32).take(3))
                .collect();
            let t = Tensor::from_vec(data, (entries.len(), 3), &Device::Cpu)?;
            KbEmbeddingPair::new(t.clone(), t)
        }
    }

    #[test]
    fn test_cached_row_order_is_stable() {
        let kb = KnowledgeBase::new((0..6).map(|i| entry(&i.to_string())).collect());
        let retriever = KbRetriever::cached(&kb, table(6, 4));

        for i in 0..6 {
            for j in 0..6 {
                let single = retriever.get_embeddings(&[i]).unwrap();
                let pair = retriever.get_embeddings(&[i, j]).unwrap();
                let a: Vec<f32> = single.key.i(0).unwrap().to_vec1().unwrap();
                let b: Vec<f32> = pair.key.i(0).unwrap().to_vec1().unwrap();
                assert_eq!(a, b);
            }
        }
    }

    #[test]
    fn test_cached_out_of_bounds() {
        let kb = KnowledgeBase::new(vec![entry("a")]);
        let retriever = KbRetriever::cached(&kb, table(3, 2));
        let err = retriever.get_embeddings(&[0, 3]).unwrap_err();
        assert_eq!(
            err.downcast_ref::<EvalError>(),
            Some(&EvalError::IndexOutOfRange { index: 3, len: 3 })
        );
    }

    #[test]
    fn test_on_demand_matches_request_order() {
        let kb = KnowledgeBase::new(vec![entry("a"), entry("bb"), entry("ccc")]);
        let retriever = KbRetriever::on_demand(&kb, Box::new(LengthEncoder));
        assert!(!retriever.uses_cache());

        let pair = retriever.get_embeddings(&[2, 0, 2]).unwrap();
        assert_eq!(pair.n_rows(), 3);
        let firsts: Vec<f32> = pair.key.i((.., 0)).unwrap().to_vec1().unwrap();
        assert_eq!(firsts, vec![3.0, 1.0, 3.0]);
    }

    #[test]
    fn test_ensure_aligned() {
        let kb = KnowledgeBase::new(vec![entry("a"), entry("b")]);
        assert!(table(2, 2).ensure_aligned(&kb).is_ok());
        assert!(table(3, 2).ensure_aligned(&kb).is_err());
    }

    #[test]
    fn test_load_npy_with_offset() {
        let dir = tempfile::tempdir().unwrap();
        let spec = DatasetSpec::new(dir.path(), "synthetic", "OAI");
        let t = table(5, 2);
        t.key.write_npy(spec.key_embedding_path()).unwrap();
        t.value.write_npy(spec.value_embedding_path()).unwrap();

        let loaded = PrecomputedEmbeddings::load(&spec).unwrap();
        assert_eq!(loaded.n_rows(), 5);
        let row: Vec<f32> = loaded.key.i(4).unwrap().to_vec1().unwrap();
        assert_eq!(row, vec![8.0, 9.0]);
    }
}
