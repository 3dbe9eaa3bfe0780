//! Experiment runners
//!
//! Each runner owns its configuration, draws its KB from a sampler seeded
//! per run and drives the model through an [`EvaluationTrial`]. Results
//! know how to write themselves with a [`ResultWriter`].

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use crate::attention::{AttentionCapture, AttentionStore};
use crate::dataset::{augmented_question, icl_context, multi_entity_qa, KbEntry, AUGMENTED_QUESTION_TEMPLATES};
use crate::extract::{continuation, extract_multi, extract_single, normalize_reference};
use crate::generation::{strip_padding, GenerationConfig, GenerationDriver};
use crate::metrics::{score_generation, MetricScores, Rouge, TextMetric};
use crate::prompt::{compose_prompt, EvalMode, PromptStyle};
use crate::refusal::{is_refusal, RefusalOutcome, RefusalProtocol};
use crate::report::{render_transcript, ResultWriter, RunSummary, TranscriptEntry};
use crate::retriever::KbRetriever;
use crate::sampler::KbSampler;
use crate::scoring::{score_attention, score_layer_ranges, ClassificationScores, LayerAccuracy, WindowScore};

/// Upper bound on questions asked in a generation run
pub const MAX_GENERATION_QUESTIONS: usize = 400;

/// The model, tokenizer and KB a run evaluates
#[derive(Clone, Copy)]
pub struct EvaluationTrial<'a> {
    pub driver: &'a GenerationDriver<'a>,
    pub retriever: &'a KbRetriever<'a>,
}

impl<'a> EvaluationTrial<'a> {
    pub fn new(driver: &'a GenerationDriver<'a>, retriever: &'a KbRetriever<'a>) -> Self {
        Self { driver, retriever }
    }

    fn dataset_len(&self) -> usize {
        self.retriever.dataset().len()
    }
}

// ============================================================================
// Generation
// ============================================================================

/// Configuration of a free-form generation run
#[derive(Debug, Clone, Serialize)]
pub struct GenerationExperimentConfig {
    pub config_name: String,
    pub eval_mode: EvalMode,
    pub kb_size: usize,
    pub seed: u64,
    /// Ask about this many entities per question
    pub multi_entities: Option<usize>,
    /// Drop outputs containing the refusal marker before scoring
    pub remove_sorry: bool,
    pub generation: GenerationConfig,
}

impl Default for GenerationExperimentConfig {
    fn default() -> Self {
        Self {
            config_name: "generation_results".to_string(),
            eval_mode: EvalMode::Kb,
            kb_size: 200,
            seed: 1,
            multi_entities: None,
            remove_sorry: false,
            generation: GenerationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationResults {
    /// Raw continuations next to the unnormalized answers
    pub transcript: Vec<TranscriptEntry>,
    pub predictions: Vec<String>,
    pub references: Vec<String>,
    pub scores: MetricScores,
    /// Outputs dropped by `remove_sorry`
    pub skipped: usize,
}

impl GenerationResults {
    /// Scores in metric order
    pub fn score_vector(&self) -> Vec<f64> {
        self.scores.values()
    }

    /// `{cfg}.npy`, `{cfg}.txt` and the summary
    pub fn write(&self, writer: &ResultWriter, config: &GenerationExperimentConfig) -> Result<()> {
        let name = &config.config_name;
        writer.write_scores_npy(&format!("{name}.npy"), &self.score_vector())?;
        writer.write_text(&format!("{name}.txt"), &render_transcript(&self.transcript))?;
        writer.write_summary(&RunSummary::new("generation", name, config, &self.scores)?)?;
        Ok(())
    }
}

/// Free-form answers over a KB sampled with replacement
pub struct GenerationExperiment {
    config: GenerationExperimentConfig,
}

impl GenerationExperiment {
    pub fn new(config: GenerationExperimentConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GenerationExperimentConfig {
        &self.config
    }

    /// Run with `metrics` applied in order; pass BERTScore before ROUGE to
    /// get the conventional score vector layout.
    pub fn run(&self, trial: EvaluationTrial<'_>, metrics: &[&dyn TextMetric]) -> Result<GenerationResults> {
        let cfg = &self.config;
        info!("Starting generation run: {}", cfg.config_name);
        info!("Config: {:?}", cfg);

        let dataset = trial.retriever.dataset();
        let mut sampler = KbSampler::new(cfg.seed);
        let kb_indices = sampler.sample(trial.dataset_len(), cfg.kb_size)?;
        let active = dataset.select(&kb_indices)?;
        let context = icl_context(&active);
        let kb = if cfg.eval_mode.uses_kb_embeddings() {
            Some(trial.retriever.get_embeddings(&kb_indices)?)
        } else {
            None
        };

        let style = if cfg.multi_entities.is_some() {
            PromptStyle::MultiEntity
        } else {
            PromptStyle::SingleEntity
        };
        let n_questions = active.len().min(MAX_GENERATION_QUESTIONS);
        info!("Asking {} questions (KB size {}, mode {})", n_questions, cfg.kb_size, cfg.eval_mode);

        let mut transcript = Vec::with_capacity(n_questions);
        let mut predictions = Vec::with_capacity(n_questions);
        let mut references = Vec::with_capacity(n_questions);
        let mut skipped = 0;

        for row in &active[..n_questions] {
            let (question, answer) = match cfg.multi_entities {
                None => (row.question.clone(), row.answer.clone()),
                Some(n) => {
                    let picked: Vec<&KbEntry> = sampler
                        .pick(active.len(), n)
                        .into_iter()
                        .map(|i| active[i])
                        .collect();
                    multi_entity_qa(&picked)
                }
            };

            let prompt = compose_prompt(cfg.eval_mode, style, &context, &question);
            let generated = trial
                .driver
                .answer_question(&prompt, kb.as_ref(), &cfg.generation)?;
            let output = continuation(&generated, &question).to_string();

            if cfg.remove_sorry && is_refusal(&output) {
                skipped += 1;
                continue;
            }

            match cfg.multi_entities {
                None => {
                    predictions.push(extract_single(&output));
                    references.push(row.description.clone());
                }
                Some(_) => {
                    predictions.push(extract_multi(&output));
                    references.push(normalize_reference(&answer));
                }
            }
            transcript.push(TranscriptEntry::new(output, answer));
        }

        if skipped > 0 {
            info!("Removed {} refusals before scoring", skipped);
        }
        let scores = score_generation(&predictions, &references, metrics)?;
        for (name, value) in &scores.scores {
            info!("{}: {:.4}", name, value);
        }

        Ok(GenerationResults {
            transcript,
            predictions,
            references,
            scores,
            skipped,
        })
    }
}

// ============================================================================
// Accuracy
// ============================================================================

/// Configuration of an attention-accuracy run
#[derive(Debug, Clone, Serialize)]
pub struct AccuracyExperimentConfig {
    /// Also the base name of the attention artifacts
    pub config_name: String,
    pub kb_size: usize,
    /// Capped at `kb_size`
    pub test_batch_size: usize,
    /// Rephrase questions with augmented templates
    pub fancy_question: bool,
    pub seed: u64,
    pub generation: GenerationConfig,
}

impl Default for AccuracyExperimentConfig {
    fn default() -> Self {
        Self {
            config_name: "accuracy_results".to_string(),
            kb_size: 200,
            test_batch_size: 50,
            fancy_question: false,
            seed: 1,
            generation: GenerationConfig::default().with_max_new_tokens(60),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AccuracyResults {
    /// Decoded outputs with batch padding stripped
    pub outputs: Vec<String>,
    pub accuracies: Vec<LayerAccuracy>,
}

impl AccuracyResults {
    /// `{cfg}_acc.npy` (`[layers, 2]`), `{cfg}_acc.txt` and the summary
    pub fn write(&self, writer: &ResultWriter, config: &AccuracyExperimentConfig) -> Result<()> {
        let name = &config.config_name;
        let rows: Vec<Vec<f64>> = self.accuracies.iter().map(|a| vec![a.top1, a.top5]).collect();
        writer.write_rows_npy(&format!("{name}_acc.npy"), &rows)?;
        let text: String = self.outputs.iter().map(|o| format!("{o}\n")).collect();
        writer.write_text(&format!("{name}_acc.txt"), &text)?;
        writer.write_summary(&RunSummary::new("accuracy", name, config, &self.accuracies)?)?;
        Ok(())
    }
}

/// One captured batch over a distinct KB, scored per KB layer
pub struct AccuracyExperiment {
    config: AccuracyExperimentConfig,
}

impl AccuracyExperiment {
    pub fn new(config: AccuracyExperimentConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AccuracyExperimentConfig {
        &self.config
    }

    pub fn run(&self, trial: EvaluationTrial<'_>, store: &dyn AttentionStore) -> Result<AccuracyResults> {
        let cfg = &self.config;
        info!("Starting accuracy run: {}", cfg.config_name);
        info!("Config: {:?}", cfg);

        let mut sampler = KbSampler::new(cfg.seed);
        let indices = sampler.sample_distinct(trial.dataset_len(), cfg.kb_size)?;
        let subset = trial.retriever.dataset().select(&indices)?;
        let kb = trial.retriever.get_embeddings(&indices)?;

        let batch_size = cfg.test_batch_size.min(cfg.kb_size);
        let questions: Vec<String> = subset[..batch_size]
            .iter()
            .map(|row| {
                if cfg.fancy_question {
                    augmented_question(row, sampler.choose_template(AUGMENTED_QUESTION_TEMPLATES.len()))
                } else {
                    row.question.clone()
                }
            })
            .collect();

        let capture = AttentionCapture::new(store, &cfg.config_name);
        let raw = trial
            .driver
            .generate_raw(&questions, Some(&kb), &cfg.generation, Some(capture))?;
        let outputs: Vec<String> = raw.iter().map(|o| strip_padding(o).to_string()).collect();

        let layers = trial.driver.kb_layers(&cfg.generation)?;
        let accuracies = score_attention(store, &cfg.config_name, &layers, cfg.kb_size, batch_size)?;
        for acc in &accuracies {
            info!(
                "Layer {}: top1 {:.2}%, top5 {:.2}%",
                acc.layer,
                acc.top1 * 100.0,
                acc.top5 * 100.0
            );
        }

        Ok(AccuracyResults { outputs, accuracies })
    }
}

// ============================================================================
// Refusal
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct RefusalExperimentConfig {
    pub config_name: String,
    pub eval_mode: EvalMode,
    pub kb_size: usize,
    pub question_size: usize,
    pub outlier_ratio: f64,
    pub seed: u64,
    pub generation: GenerationConfig,
}

impl Default for RefusalExperimentConfig {
    fn default() -> Self {
        Self {
            config_name: "refusal_results".to_string(),
            eval_mode: EvalMode::Kb,
            kb_size: 200,
            question_size: 100,
            outlier_ratio: 0.2,
            seed: 1,
            generation: GenerationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RefusalResults {
    pub outcome: RefusalOutcome,
    pub scores: ClassificationScores,
}

impl RefusalResults {
    /// `OutLierTest{cfg}.npy` (`[2, N]`), `OutLierTest{cfg}.txt` and the summary
    pub fn write(&self, writer: &ResultWriter, config: &RefusalExperimentConfig) -> Result<()> {
        let name = &config.config_name;
        writer.write_tensor_npy(&format!("OutLierTest{name}.npy"), &self.outcome.as_matrix()?)?;
        writer.write_text(
            &format!("OutLierTest{name}.txt"),
            &render_transcript(&self.outcome.transcript),
        )?;
        let summary = serde_json::json!({
            "scores": self.scores,
            "accuracy": self.scores.accuracy(),
            "precision": self.scores.precision(),
            "recall": self.scores.recall(),
            "f1": self.scores.f1(),
        });
        writer.write_summary(&RunSummary::new("refusal", name, config, &summary)?)?;
        Ok(())
    }
}

/// Mixed in-KB and outlier questions, scored as refusal classification
pub struct RefusalExperiment {
    config: RefusalExperimentConfig,
}

impl RefusalExperiment {
    pub fn new(config: RefusalExperimentConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RefusalExperimentConfig {
        &self.config
    }

    pub fn protocol(&self) -> RefusalProtocol {
        RefusalProtocol {
            mode: self.config.eval_mode,
            kb_size: self.config.kb_size,
            question_size: self.config.question_size,
            outlier_ratio: self.config.outlier_ratio,
        }
    }

    pub fn run(&self, trial: EvaluationTrial<'_>) -> Result<RefusalResults> {
        let cfg = &self.config;
        info!("Starting refusal run: {}", cfg.config_name);
        info!("Config: {:?}", cfg);

        let protocol = self.protocol();
        let mut sampler = KbSampler::new(cfg.seed);
        let split = protocol.split(&mut sampler, trial.dataset_len())?;
        let outcome = protocol.run(trial.driver, trial.retriever, &split, &cfg.generation)?;
        let scores = outcome.scores()?;
        info!(
            "Refusal accuracy {:.2}%, precision {:.3}, recall {:.3}, F1 {:.3}",
            scores.accuracy() * 100.0,
            scores.precision(),
            scores.recall(),
            scores.f1()
        );

        Ok(RefusalResults { outcome, scores })
    }
}

// ============================================================================
// Standard
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StandardExperimentConfig {
    /// Also the base name of the attention artifacts
    pub config_name: String,
    /// Repetitions, each over a fresh distinct subset
    pub sample_size: usize,
    pub subset_size: usize,
    pub seed: u64,
    pub generation: GenerationConfig,
}

impl Default for StandardExperimentConfig {
    fn default() -> Self {
        Self {
            config_name: "basic_results".to_string(),
            sample_size: 5,
            subset_size: 100,
            seed: 1,
            generation: GenerationConfig::default().with_max_new_tokens(40),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StandardResults {
    pub rouge: MetricScores,
    pub rouge_no_kb: MetricScores,
    /// Scored on the artifacts of the last repetition
    pub windows: Vec<WindowScore>,
    pub transcript: Vec<TranscriptEntry>,
}

impl StandardResults {
    pub fn write(&self, writer: &ResultWriter, config: &StandardExperimentConfig) -> Result<()> {
        let name = &config.config_name;
        writer.write_json(&format!("{name}_rouge.json"), &self.rouge)?;
        writer.write_json(&format!("{name}_rouge_no_kb.json"), &self.rouge_no_kb)?;
        let acc: Vec<Vec<f64>> = self.windows.iter().map(|w| vec![w.top1, w.top5]).collect();
        writer.write_rows_npy(&format!("{name}_acc.npy"), &acc)?;
        let conf: Vec<f64> = self.windows.iter().map(|w| f64::from(w.confidence)).collect();
        writer.write_scores_npy(&format!("{name}_conf.npy"), &conf)?;
        writer.write_summary(&RunSummary::new("standard", name, config, &self.windows)?)?;
        Ok(())
    }
}

/// Repeated batched generation with and without the KB, plus windowed
/// attention accuracy
pub struct StandardExperiment {
    config: StandardExperimentConfig,
}

impl StandardExperiment {
    pub fn new(config: StandardExperimentConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StandardExperimentConfig {
        &self.config
    }

    pub fn run(&self, trial: EvaluationTrial<'_>, store: &dyn AttentionStore) -> Result<StandardResults> {
        let cfg = &self.config;
        info!("Starting standard run: {}", cfg.config_name);
        info!("Config: {:?}", cfg);

        let mut sampler = KbSampler::new(cfg.seed);
        let mut predictions = Vec::new();
        let mut no_kb_predictions = Vec::new();
        let mut references = Vec::new();
        let mut transcript = Vec::new();

        for rep in 0..cfg.sample_size {
            info!("Repetition {}/{}", rep + 1, cfg.sample_size);
            let indices = sampler.sample_distinct(trial.dataset_len(), cfg.subset_size)?;
            let subset = trial.retriever.dataset().select(&indices)?;
            let kb = trial.retriever.get_embeddings(&indices)?;
            let questions: Vec<String> = subset.iter().map(|row| row.question.clone()).collect();

            let no_kb = trial
                .driver
                .generate_answers(&questions, None, &cfg.generation, None)?;
            let capture = AttentionCapture::new(store, &cfg.config_name);
            let with_kb = trial
                .driver
                .generate_answers(&questions, Some(&kb), &cfg.generation, Some(capture))?;

            for ((row, plain), kb_out) in subset.iter().zip(&no_kb).zip(&with_kb) {
                let output = continuation(kb_out, &row.question).to_string();
                no_kb_predictions.push(continuation(plain, &row.question).to_string());
                predictions.push(output.clone());
                references.push(row.answer.clone());
                transcript.push(TranscriptEntry::new(output, row.answer.clone()));
            }
        }

        let rouge = score_generation(&predictions, &references, &[&Rouge])?;
        let rouge_no_kb = score_generation(&no_kb_predictions, &references, &[&Rouge])?;
        info!("ROUGE with KB: {:?}", rouge.scores);
        info!("ROUGE without KB: {:?}", rouge_no_kb.scores);

        let windows = if cfg.sample_size == 0 {
            warn!("No repetitions ran, skipping attention scoring");
            Vec::new()
        } else {
            score_layer_ranges(
                store,
                &cfg.config_name,
                trial.driver.n_layers(),
                cfg.generation.kb_layer_frequency,
                cfg.subset_size,
            )?
        };
        for w in &windows {
            info!(
                "Layers [{}, {}): top1 {:.2}%, top5 {:.2}%, confidence {:.3}",
                w.start,
                w.end,
                w.top1 * 100.0,
                w.top5 * 100.0,
                w.confidence
            );
        }

        Ok(StandardResults {
            rouge,
            rouge_no_kb,
            windows,
            transcript,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let acc = AccuracyExperimentConfig::default();
        assert_eq!(acc.generation.max_new_tokens, 60);
        assert_eq!(acc.generation.kb_layer_frequency, 3);
        assert_eq!(acc.test_batch_size, 50);

        let refusal = RefusalExperimentConfig::default();
        assert_eq!(refusal.question_size, 100);
        assert!((refusal.outlier_ratio - 0.2).abs() < f64::EPSILON);
        assert_eq!(refusal.generation.topk_size, None);
        assert_eq!(refusal.generation.kb_scale_factor, None);

        let standard = StandardExperimentConfig::default();
        assert_eq!(standard.generation.max_new_tokens, 40);
        assert_eq!(standard.subset_size, 100);

        let generation = GenerationExperimentConfig::default();
        assert_eq!(generation.kb_size, 200);
        assert_eq!(generation.generation.max_new_tokens, 150);
    }
}
