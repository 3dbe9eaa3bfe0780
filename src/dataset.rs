//! Knowledge-base dataset loading
//!
//! A dataset is a JSON array of KB facts. Each fact carries the entity name,
//! the attribute (`description_type`, sometimes serialized as `property`),
//! the attribute value and a ready-made question/answer pair.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Datasets generated with this marker in their name keep their training
/// part in the first rows; evaluation starts after it.
const GPT_VALIDATION_START: usize = 120_000;

/// A single knowledge-base fact
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KbEntry {
    pub name: String,
    #[serde(alias = "property")]
    pub description_type: String,
    pub description: String,
    #[serde(default)]
    pub key_string: String,
    #[serde(rename = "Q")]
    pub question: String,
    #[serde(rename = "A")]
    pub answer: String,
}

impl KbEntry {
    /// The "name + property" phrase used by textual baselines
    pub fn key_phrase(&self) -> String {
        if self.key_string.is_empty() {
            format!("the {} of {}", self.description_type, self.name)
        } else {
            self.key_string.clone()
        }
    }

    /// One line of the in-context KB listing
    pub fn as_context_line(&self) -> String {
        format!("{} is {}; ", self.key_phrase(), self.description)
    }
}

/// Question phrasings used when the accuracy run asks "fancy" questions
pub const AUGMENTED_QUESTION_TEMPLATES: [&str; 8] = [
    "What is the {property} of {name}?",
    "Tell me about the {property} of {name}.",
    "Can you let me know the {property} of {name}?",
    "Can you inform me about the {property} of {name}?",
    "Describe the {property} of {name}.",
    "What details can you share about the {property} of {name}?",
    "What kind of {property} does {name} have?",
    "Provide details on the {property} of {name}.",
];

/// Render `entry` with one of [`AUGMENTED_QUESTION_TEMPLATES`]
pub fn augmented_question(entry: &KbEntry, template: usize) -> String {
    AUGMENTED_QUESTION_TEMPLATES[template % AUGMENTED_QUESTION_TEMPLATES.len()]
        .replace("{property}", &entry.description_type)
        .replace("{name}", &entry.name)
}

/// Compose one question asking about several entities at once.
///
/// The answer lists one `The <property> of <name> is <value>;` clause per
/// entity so it can be normalized with the same pattern as predictions.
pub fn multi_entity_qa(entries: &[&KbEntry]) -> (String, String) {
    let clauses: Vec<String> = entries
        .iter()
        .map(|e| format!("the {} of {}", e.description_type, e.name))
        .collect();

    let question = match clauses.as_slice() {
        [] => String::new(),
        [only] => format!("What is {only}?"),
        [init @ .., last] => format!("What is {} and {last}?", init.join(", ")),
    };

    let answer = entries
        .iter()
        .map(|e| {
            format!(
                "The {} of {} is {};",
                e.description_type, e.name, e.description
            )
        })
        .collect::<Vec<_>>()
        .join(" ");

    (question, answer)
}

/// Location of a dataset and its optional precomputed embeddings
#[derive(Debug, Clone, Serialize)]
pub struct DatasetSpec {
    /// Directory holding `{name}.json` and the embedding files
    pub dir: PathBuf,
    /// Dataset name without extension
    pub name: String,
    /// Encoder identifier used in the embedding file names
    pub encoder_spec: String,
    /// Select the shift-matched (`_sm`) embedding variant
    pub shift_matched: bool,
}

impl DatasetSpec {
    pub fn new(dir: impl Into<PathBuf>, name: &str, encoder_spec: &str) -> Self {
        Self {
            dir: dir.into(),
            name: name.to_string(),
            encoder_spec: encoder_spec.to_string(),
            shift_matched: false,
        }
    }

    pub fn with_shift_match(mut self, shift_matched: bool) -> Self {
        self.shift_matched = shift_matched;
        self
    }

    /// First row of the evaluation part
    pub fn validation_start(&self) -> usize {
        if self.name.contains("gpt") {
            GPT_VALIDATION_START
        } else {
            0
        }
    }

    pub fn json_path(&self) -> PathBuf {
        self.dir.join(format!("{}.json", self.name))
    }

    fn embedding_path(&self, kind: &str) -> PathBuf {
        let sm = if self.shift_matched { "_sm" } else { "" };
        self.dir.join(format!(
            "{}_{}_embd_{kind}{sm}.npy",
            self.name, self.encoder_spec
        ))
    }

    pub fn key_embedding_path(&self) -> PathBuf {
        self.embedding_path("key")
    }

    pub fn value_embedding_path(&self) -> PathBuf {
        self.embedding_path("value")
    }
}

/// The full set of KB facts for one evaluation run
#[derive(Debug, Clone)]
pub struct KnowledgeBase {
    entries: Vec<KbEntry>,
}

impl KnowledgeBase {
    pub fn new(entries: Vec<KbEntry>) -> Self {
        Self { entries }
    }

    /// Load a KB from a JSON array file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read dataset: {}", path.display()))?;
        let entries: Vec<KbEntry> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse dataset: {}", path.display()))?;
        Ok(Self { entries })
    }

    /// Load the evaluation part of the dataset named by `spec`
    pub fn load_spec(spec: &DatasetSpec) -> Result<Self> {
        let mut kb = Self::load(spec.json_path())?;
        let start = spec.validation_start().min(kb.entries.len());
        kb.entries.drain(..start);
        Ok(kb)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[KbEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&KbEntry> {
        self.entries.get(index)
    }

    /// Rows at `indices`, in request order
    pub fn select(&self, indices: &[usize]) -> Result<Vec<&KbEntry>> {
        indices
            .iter()
            .map(|&i| {
                self.entries.get(i).ok_or_else(|| {
                    crate::EvalError::IndexOutOfRange {
                        index: i,
                        len: self.entries.len(),
                    }
                    .into()
                })
            })
            .collect()
    }
}

/// In-context listing of `entries`: `"{key} is {value}; "` per row
pub fn icl_context(entries: &[&KbEntry]) -> String {
    entries.iter().map(|e| e.as_context_line()).collect()
}
