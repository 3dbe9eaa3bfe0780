//! Prompt tokenization for batched generation
//!
//! Prompts in a batch are left-padded to a common length so generation
//! continues from the same position for every row.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use hf_hub::{api::sync::Api, Repo, RepoType};
use std::path::Path;
use tokenizers::Tokenizer;
use tracing::info;

/// Pad character used for batched prompts
pub const PAD_TOKEN: &str = "^";

/// Left-padded token ids and mask for a prompt batch, both `[batch, seq]` u32
#[derive(Debug, Clone)]
pub struct TokenizedBatch {
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
}

impl TokenizedBatch {
    /// Left-pad `rows` with `pad_id` into a rectangular batch
    pub fn left_padded(rows: &[Vec<u32>], pad_id: u32, device: &Device) -> Result<Self> {
        let batch = rows.len();
        let seq_len = rows.iter().map(Vec::len).max().unwrap_or(0);

        let mut ids = Vec::with_capacity(batch * seq_len);
        let mut mask = Vec::with_capacity(batch * seq_len);
        for row in rows {
            let pad = seq_len - row.len();
            ids.extend(std::iter::repeat(pad_id).take(pad));
            ids.extend_from_slice(row);
            mask.extend(std::iter::repeat(0u32).take(pad));
            mask.extend(std::iter::repeat(1u32).take(row.len()));
        }

        Ok(Self {
            input_ids: Tensor::from_vec(ids, (batch, seq_len), device)?,
            attention_mask: Tensor::from_vec(mask, (batch, seq_len), device)?,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.input_ids.dims().first().copied().unwrap_or(0)
    }
}

/// Text ⇄ token id conversion used by the generation driver
pub trait PromptTokenizer {
    /// Token ids of one prompt, special tokens included
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Text of `ids`, special tokens kept so templates can be pruned
    fn decode(&self, ids: &[u32]) -> Result<String>;

    /// Id of [`PAD_TOKEN`]
    fn pad_id(&self) -> u32;

    fn encode_batch(&self, prompts: &[String], device: &Device) -> Result<TokenizedBatch> {
        let rows = prompts
            .iter()
            .map(|p| self.encode(p))
            .collect::<Result<Vec<_>>>()?;
        TokenizedBatch::left_padded(&rows, self.pad_id(), device)
    }
}

/// HuggingFace `tokenizers` backend
pub struct HfTokenizer {
    inner: Tokenizer,
    pad_id: u32,
}

impl HfTokenizer {
    pub fn new(inner: Tokenizer) -> Result<Self> {
        let pad_id = inner
            .token_to_id(PAD_TOKEN)
            .or_else(|| {
                inner
                    .encode(PAD_TOKEN, false)
                    .ok()
                    .and_then(|e| e.get_ids().first().copied())
            })
            .context("Tokenizer cannot represent the pad token")?;
        Ok(Self { inner, pad_id })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let inner = Tokenizer::from_file(path)
            .map_err(|e| anyhow::anyhow!("Tokenizer error ({}): {e}", path.display()))?;
        Self::new(inner)
    }

    /// Download `tokenizer.json` of a HuggingFace model
    pub fn from_pretrained(model_id: &str) -> Result<Self> {
        info!("Loading tokenizer: {}", model_id);
        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
        let tokenizer_path = repo
            .get("tokenizer.json")
            .context("Failed to download tokenizer.json")?;
        Self::from_file(tokenizer_path)
    }
}

impl PromptTokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, false)
            .map_err(|e| anyhow::anyhow!("Decode error: {e}"))
    }

    fn pad_id(&self) -> u32 {
        self.pad_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_left_padding() {
        let rows = vec![vec![5, 6, 7], vec![8]];
        let batch = TokenizedBatch::left_padded(&rows, 0, &Device::Cpu).unwrap();
        assert_eq!(batch.batch_size(), 2);

        let ids: Vec<Vec<u32>> = batch.input_ids.to_vec2().unwrap();
        assert_eq!(ids, vec![vec![5, 6, 7], vec![0, 0, 8]]);

        let mask: Vec<Vec<u32>> = batch.attention_mask.to_vec2().unwrap();
        assert_eq!(mask, vec![vec![1, 1, 1], vec![0, 0, 1]]);
    }
}
