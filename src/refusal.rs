//! Refusal protocol
//!
//! Mixes questions about the active KB with questions about rows outside
//! it and checks whether the model declines exactly the latter.

use anyhow::Result;
use candle_core::{Device, Tensor};
use serde::Serialize;
use tracing::{debug, info};

use crate::dataset::icl_context;
use crate::extract::continuation;
use crate::generation::{GenerationConfig, GenerationDriver};
use crate::prompt::{compose_prompt, EvalMode, PromptStyle};
use crate::report::TranscriptEntry;
use crate::retriever::KbRetriever;
use crate::sampler::{KbSampler, OutlierSplit};
use crate::scoring::ClassificationScores;

/// Substring whose presence marks an output as a refusal (case-sensitive)
pub const REFUSAL_MARKER: &str = "sorry";

/// Reference text listed for outlier questions
pub const OUTLIER_REFERENCE: &str = "Cannot find relevant information in the KB";

pub fn is_refusal(output: &str) -> bool {
    output.contains(REFUSAL_MARKER)
}

/// Shape of one refusal trial
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RefusalProtocol {
    pub mode: EvalMode,
    pub kb_size: usize,
    /// Capped at `kb_size`
    pub question_size: usize,
    pub outlier_ratio: f64,
}

/// Predictions and labels of a refusal trial, in question order
#[derive(Debug, Clone, Serialize)]
pub struct RefusalOutcome {
    pub predictions: Vec<u8>,
    pub labels: Vec<u8>,
    pub change_point: usize,
    pub transcript: Vec<TranscriptEntry>,
}

impl RefusalOutcome {
    /// `[2, N]` i64: row 0 predictions, row 1 labels
    pub fn as_matrix(&self) -> Result<Tensor> {
        let data: Vec<i64> = self
            .predictions
            .iter()
            .chain(&self.labels)
            .map(|&v| i64::from(v))
            .collect();
        Ok(Tensor::from_vec(data, (2, self.predictions.len()), &Device::Cpu)?)
    }

    pub fn scores(&self) -> Result<ClassificationScores> {
        ClassificationScores::from_pairs(&self.predictions, &self.labels)
    }
}

impl RefusalProtocol {
    /// Phase 1: the active KB and the labelled question set
    pub fn split(&self, sampler: &mut KbSampler, dataset_len: usize) -> Result<OutlierSplit> {
        sampler.sample_with_outliers(
            dataset_len,
            self.kb_size,
            self.question_size,
            self.outlier_ratio,
        )
    }

    /// Phase 2: ask every question one at a time and classify the output
    pub fn run(
        &self,
        driver: &GenerationDriver<'_>,
        retriever: &KbRetriever<'_>,
        split: &OutlierSplit,
        config: &GenerationConfig,
    ) -> Result<RefusalOutcome> {
        let dataset = retriever.dataset();
        let active = dataset.select(&split.kb_indices)?;
        let context = icl_context(&active);
        let kb = if self.mode.uses_kb_embeddings() {
            Some(retriever.get_embeddings(&split.kb_indices)?)
        } else {
            None
        };

        let labels = split.labels();
        let questions = dataset.select(&split.question_indices())?;
        info!(
            "Refusal trial: KB size {}, mode {}, {} questions ({} outliers)",
            self.kb_size,
            self.mode,
            questions.len(),
            split.outliers.len()
        );

        let mut predictions = Vec::with_capacity(questions.len());
        let mut transcript = Vec::with_capacity(questions.len());
        for (i, row) in questions.iter().enumerate() {
            let prompt = compose_prompt(self.mode, PromptStyle::Refusal, &context, &row.question);
            let generated = driver.answer_question(&prompt, kb.as_ref(), config)?;
            let output = continuation(&generated, &row.question).to_string();

            let refused = is_refusal(&output);
            debug!("Question {} (label {}): refused = {}", i, labels[i], refused);
            predictions.push(u8::from(refused));

            let reference = if i < split.change_point {
                row.description.clone()
            } else {
                OUTLIER_REFERENCE.to_string()
            };
            transcript.push(TranscriptEntry::new(output, reference));
        }

        Ok(RefusalOutcome {
            predictions,
            labels,
            change_point: split.change_point,
            transcript,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refusal_marker_is_case_sensitive() {
        assert!(is_refusal("I am sorry I cannot find relevant information in the KB"));
        assert!(!is_refusal("Sorry, no idea"));
        assert!(!is_refusal("The color of A is red"));
    }

    #[test]
    fn test_outcome_matrix() {
        let outcome = RefusalOutcome {
            predictions: vec![0, 1, 1],
            labels: vec![0, 0, 1],
            change_point: 2,
            transcript: Vec::new(),
        };
        let matrix: Vec<Vec<i64>> = outcome.as_matrix().unwrap().to_vec2().unwrap();
        assert_eq!(matrix, vec![vec![0, 1, 1], vec![0, 0, 1]]);

        let scores = outcome.scores().unwrap();
        assert_eq!(scores.true_positives, 1);
        assert_eq!(scores.false_positives, 1);
        assert_eq!(scores.true_negatives, 1);
    }
}
