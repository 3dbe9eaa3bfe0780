//! Generation driver
//!
//! Formats questions for the model family, tokenizes them as one
//! left-padded batch and makes a single blocking call to the generator
//! with the KB embeddings (or none, for textual baselines).
//!
//! The generator is an external collaborator: anything implementing
//! [`KbGenerator`] can be evaluated. Its failures are returned unchanged;
//! nothing here retries.

use anyhow::Result;
use candle_core::{Device, Tensor};
use serde::Serialize;
use tracing::debug;

use crate::attention::{kb_layers, AttentionCapture};
use crate::prompt::ModelFamily;
use crate::retriever::KbEmbeddingPair;
use crate::tokenizer::{PromptTokenizer, PAD_TOKEN};

/// Default distance between KB-bearing layers
pub const DEFAULT_KB_LAYER_FREQUENCY: usize = 3;

/// Knobs forwarded to the generator with every call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationConfig {
    /// Every `kb_layer_frequency`-th layer attends over the KB
    pub kb_layer_frequency: usize,
    /// Keep only this many KB rows per KB layer; `None` attends to all
    pub topk_size: Option<usize>,
    /// Rescale KB attention logits before softmax; `None` leaves them as is
    pub kb_scale_factor: Option<f32>,
    pub max_new_tokens: usize,
    pub output_attentions: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            kb_layer_frequency: DEFAULT_KB_LAYER_FREQUENCY,
            topk_size: None,
            kb_scale_factor: None,
            max_new_tokens: 150,
            output_attentions: true,
        }
    }
}

impl GenerationConfig {
    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    /// Whether KB attention is sparsified to the top-k rows
    pub fn dynamic_sparsify(&self) -> bool {
        self.topk_size.is_some()
    }
}

/// One batched generation call
pub struct GenerateRequest<'a> {
    /// `[batch, seq]` left-padded prompt ids
    pub input_ids: &'a Tensor,
    /// `[batch, seq]`, 0 on padding
    pub attention_mask: &'a Tensor,
    /// KB injected at every KB layer; `None` for non-KB baselines
    pub kb: Option<&'a KbEmbeddingPair>,
    pub config: &'a GenerationConfig,
    /// When set, the generator records one artifact per KB layer
    pub capture: Option<AttentionCapture<'a>>,
}

/// A language model that can attend over injected KB key/value pairs
pub trait KbGenerator {
    /// Total transformer layers
    fn n_layers(&self) -> usize;

    /// Generate continuations; each returned row holds the prompt ids
    /// followed by the generated ids.
    fn generate(&self, request: GenerateRequest<'_>) -> Result<Vec<Vec<u32>>>;
}

/// Drives one model/tokenizer pair through formatted generation calls
pub struct GenerationDriver<'a> {
    generator: &'a dyn KbGenerator,
    tokenizer: &'a dyn PromptTokenizer,
    family: ModelFamily,
    device: Device,
}

impl<'a> GenerationDriver<'a> {
    pub fn new(
        generator: &'a dyn KbGenerator,
        tokenizer: &'a dyn PromptTokenizer,
        family: ModelFamily,
    ) -> Self {
        Self {
            generator,
            tokenizer,
            family,
            device: Device::Cpu,
        }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn family(&self) -> ModelFamily {
        self.family
    }

    pub fn n_layers(&self) -> usize {
        self.generator.n_layers()
    }

    /// Layers at which the KB is injected under `config`
    pub fn kb_layers(&self, config: &GenerationConfig) -> Result<Vec<usize>> {
        kb_layers(self.generator.n_layers(), config.kb_layer_frequency)
    }

    /// Generate for a batch of raw questions; decoded text keeps the
    /// template markers.
    pub fn generate_raw(
        &self,
        questions: &[String],
        kb: Option<&KbEmbeddingPair>,
        config: &GenerationConfig,
        capture: Option<AttentionCapture<'_>>,
    ) -> Result<Vec<String>> {
        let prompts: Vec<String> = questions
            .iter()
            .map(|q| self.family.format_question(q))
            .collect();
        let batch = self.tokenizer.encode_batch(&prompts, &self.device)?;

        debug!(
            "Generating batch of {} (kb rows: {}, layer frequency: {}, top-k: {:?}, scale: {:?})",
            batch.batch_size(),
            kb.map_or(0, KbEmbeddingPair::n_rows),
            config.kb_layer_frequency,
            config.topk_size,
            config.kb_scale_factor,
        );

        let kb = match kb {
            Some(pair) => Some(pair.to_device(&self.device)?),
            None => None,
        };
        let outputs = self.generator.generate(GenerateRequest {
            input_ids: &batch.input_ids,
            attention_mask: &batch.attention_mask,
            kb: kb.as_ref(),
            config,
            capture,
        })?;

        anyhow::ensure!(
            outputs.len() == questions.len(),
            "generator returned {} sequences for {} prompts",
            outputs.len(),
            questions.len()
        );
        outputs
            .iter()
            .map(|ids| self.tokenizer.decode(ids))
            .collect()
    }

    /// Generate for a batch and prune the family's template markers
    pub fn generate_answers(
        &self,
        questions: &[String],
        kb: Option<&KbEmbeddingPair>,
        config: &GenerationConfig,
        capture: Option<AttentionCapture<'_>>,
    ) -> Result<Vec<String>> {
        Ok(self
            .generate_raw(questions, kb, config, capture)?
            .iter()
            .map(|text| self.family.prune_output(text))
            .collect())
    }

    /// Single question, pruned output
    pub fn answer_question(
        &self,
        question: &str,
        kb: Option<&KbEmbeddingPair>,
        config: &GenerationConfig,
    ) -> Result<String> {
        let mut answers = self.generate_answers(&[question.to_string()], kb, config, None)?;
        answers
            .pop()
            .ok_or_else(|| anyhow::anyhow!("generator returned no output"))
    }
}

/// Remove batch padding characters from both ends of decoded text
pub fn strip_padding(text: &str) -> &str {
    text.trim_matches(|c: char| PAD_TOKEN.contains(c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Byte-level tokenizer: one id per byte
    struct ByteTokenizer;

    impl PromptTokenizer for ByteTokenizer {
        fn encode(&self, text: &str) -> Result<Vec<u32>> {
            Ok(text.bytes().map(u32::from).collect())
        }

        fn decode(&self, ids: &[u32]) -> Result<String> {
            let bytes: Vec<u8> = ids.iter().map(|&i| i as u8).collect();
            Ok(String::from_utf8(bytes)?)
        }

        fn pad_id(&self) -> u32 {
            u32::from(b'^')
        }
    }

    /// Appends a fixed suffix and records what it was asked
    struct EchoGenerator {
        suffix: &'static str,
        seen: RefCell<Vec<(usize, Option<usize>, Option<usize>, Option<f32>)>>,
    }

    impl KbGenerator for EchoGenerator {
        fn n_layers(&self) -> usize {
            8
        }

        fn generate(&self, request: GenerateRequest<'_>) -> Result<Vec<Vec<u32>>> {
            let rows: Vec<Vec<u32>> = request.input_ids.to_vec2()?;
            self.seen.borrow_mut().push((
                rows.len(),
                request.kb.map(KbEmbeddingPair::n_rows),
                request.config.topk_size,
                request.config.kb_scale_factor,
            ));
            Ok(rows
                .into_iter()
                .map(|mut r| {
                    r.extend(self.suffix.bytes().map(u32::from));
                    r
                })
                .collect())
        }
    }

    struct FailingGenerator;

    impl KbGenerator for FailingGenerator {
        fn n_layers(&self) -> usize {
            4
        }

        fn generate(&self, _request: GenerateRequest<'_>) -> Result<Vec<Vec<u32>>> {
            anyhow::bail!("CUDA out of memory")
        }
    }

    #[test]
    fn test_config_forwarded() {
        let generator = EchoGenerator {
            suffix: "<|end|>",
            seen: RefCell::new(Vec::new()),
        };
        let driver = GenerationDriver::new(&generator, &ByteTokenizer, ModelFamily::Phi3);
        let config = GenerationConfig {
            topk_size: Some(5),
            kb_scale_factor: Some(100.0),
            ..Default::default()
        };
        assert!(config.dynamic_sparsify());

        let kb = KbEmbeddingPair::new(
            Tensor::zeros((3, 2), candle_core::DType::F32, &Device::Cpu).unwrap(),
            Tensor::zeros((3, 2), candle_core::DType::F32, &Device::Cpu).unwrap(),
        )
        .unwrap();
        let questions = vec!["Q one?".to_string(), "Q2?".to_string()];
        let answers = driver
            .generate_answers(&questions, Some(&kb), &config, None)
            .unwrap();

        assert_eq!(
            generator.seen.borrow().clone(),
            vec![(2usize, Some(3usize), Some(5usize), Some(100.0f32))]
        );
        assert_eq!(answers[0], "\nQ one?\n\n");
        // shorter prompt is left padded
        assert!(answers[1].starts_with("^^^"));
        assert_eq!(strip_padding(&answers[1]), "\nQ2?\n\n");
    }

    #[test]
    fn test_generator_error_propagates() {
        let driver = GenerationDriver::new(&FailingGenerator, &ByteTokenizer, ModelFamily::Llama3);
        let err = driver
            .answer_question("Q?", None, &GenerationConfig::default())
            .unwrap_err();
        assert_eq!(err.to_string(), "CUDA out of memory");
    }

    #[test]
    fn test_kb_layers_from_generator() {
        let driver = GenerationDriver::new(&FailingGenerator, &ByteTokenizer, ModelFamily::Llama3);
        let config = GenerationConfig::default();
        assert_eq!(driver.kb_layers(&config).unwrap(), vec![0, 3]);
    }
}
