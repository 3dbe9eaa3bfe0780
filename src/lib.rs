// Pedantic clippy configuration for ML/eval code
#![allow(clippy::cast_precision_loss)] // usize→f64 for mean scores
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive
#![allow(clippy::module_name_repetitions)] // KbSampler in sampler.rs is fine
#![allow(clippy::similar_names)] // related variables like `pred`/`preds`
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// Method style pedantic:
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_pass_by_value)]

//! kblam-eval: evaluation harness for knowledge-base augmented language models
//!
//! Measures how well a model that attends over injected KB key/value
//! embeddings answers questions about the KB, retrieves the right KB row
//! in its attention, and refuses questions the KB cannot answer.
//!
//! ## Architecture
//!
//! - `dataset`: KB entries, dataset locations, question composition
//! - `sampler`: Seeded per-trial KB selection and outlier splits
//! - `retriever`: KB key/value embeddings, precomputed or encoded on demand
//! - `prompt`: Model-family chat templates and instruction prompts
//! - `tokenizer`: Left-padded prompt batches over HuggingFace tokenizers
//! - `generation`: Generation driver around a [`KbGenerator`] collaborator
//! - `attention`: Attention artifact storage keyed by config name and layer
//! - `extract`: Answer extraction from free-form generations
//! - `metrics`: ROUGE and BERTScore
//! - `scoring`: Attention retrieval accuracy, confidence, refusal classification
//! - `refusal`: Refusal protocol over in-KB and outlier questions
//! - `experiment`: Generation, accuracy, refusal and standard runners
//! - `report`: Transcripts, `.npy` arrays and JSON summaries
//! - `error`: Typed failures callers may match on

pub mod attention;
pub mod dataset;
pub mod error;
pub mod experiment;
pub mod extract;
pub mod generation;
pub mod metrics;
pub mod prompt;
pub mod refusal;
pub mod report;
pub mod retriever;
pub mod sampler;
pub mod scoring;
pub mod tokenizer;

pub use attention::{
    kb_layers, load_kb_view, AttentionCapture, AttentionStore, MemoryAttentionStore,
    NpyAttentionStore,
};
pub use dataset::{icl_context, multi_entity_qa, DatasetSpec, KbEntry, KnowledgeBase};
pub use error::EvalError;
pub use experiment::{
    AccuracyExperiment, AccuracyExperimentConfig, AccuracyResults, EvaluationTrial,
    GenerationExperiment, GenerationExperimentConfig, GenerationResults, RefusalExperiment,
    RefusalExperimentConfig, RefusalResults, StandardExperiment, StandardExperimentConfig,
    StandardResults,
};
pub use extract::{continuation, extract, extract_multi, extract_single, normalize_reference};
pub use generation::{GenerateRequest, GenerationConfig, GenerationDriver, KbGenerator};
pub use metrics::{score_generation, BertScore, MetricScores, Rouge, TextMetric, TokenEmbedder};
pub use prompt::{compose_prompt, EvalMode, ModelFamily, PromptStyle};
pub use refusal::{RefusalOutcome, RefusalProtocol, REFUSAL_MARKER};
pub use report::{render_transcript, ResultWriter, RunSummary, TranscriptEntry};
pub use retriever::{EmbeddingSource, KbEmbeddingPair, KbEncoder, KbRetriever, PrecomputedEmbeddings};
pub use sampler::{KbSampler, OutlierSplit};
pub use scoring::{
    confidence, score_attention, score_layer_ranges, ClassificationScores, LayerAccuracy,
    WindowScore,
};
pub use tokenizer::{HfTokenizer, PromptTokenizer, TokenizedBatch};
