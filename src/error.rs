//! Typed failures raised by the evaluation core
//!
//! Library functions return `anyhow::Result`; these variants are the ones
//! callers may want to `downcast_ref` and match on.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EvalError {
    /// Requested KB is larger than the dataset it is drawn from
    #[error("the KB size {kb_size} is greater than the dataset size {dataset_len}")]
    KbSizeExceeded { kb_size: usize, dataset_len: usize },

    /// A KB row index outside the precomputed embedding table
    #[error("KB row index {index} out of range for {len} embedded rows")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("{what}: expected {expected} items, got {actual}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("no attention artifact for config '{config}' at layer {layer}")]
    MissingArtifact { config: String, layer: usize },

    #[error("attention artifact for layer {layer} has shape {shape:?}, cannot view as [{batch_size}, -1, {kb_size}]")]
    ArtifactShape {
        layer: usize,
        shape: Vec<usize>,
        batch_size: usize,
        kb_size: usize,
    },

    #[error("KB layer frequency must be positive")]
    InvalidLayerFrequency,

    /// Precomputed embeddings not row-aligned with the dataset
    #[error("{embeddings} embedding rows do not match {entries} dataset entries")]
    EmbeddingMisaligned { embeddings: usize, entries: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kb_size_message() {
        let err = EvalError::KbSizeExceeded {
            kb_size: 10,
            dataset_len: 4,
        };
        assert_eq!(
            err.to_string(),
            "the KB size 10 is greater than the dataset size 4"
        );
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = EvalError::IndexOutOfRange { index: 7, len: 3 }.into();
        assert_eq!(
            err.downcast_ref::<EvalError>(),
            Some(&EvalError::IndexOutOfRange { index: 7, len: 3 })
        );
    }
}
