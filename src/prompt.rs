//! Prompt templates per model family
//!
//! Every family supplies a forward template (question → chat prompt) and
//! the matching pruning step that strips exactly the control markers the
//! template introduced from generated text.

use serde::{Deserialize, Serialize};

/// Instruction for in-context runs asking about one entity
pub const INSTRUCTION_PROMPT: &str = "\nPlease answer questions based on the given text with format: \"The {property} of {name} is {description}\"\n";

/// Instruction for in-context runs asking about several entities
pub const INSTRUCTION_PROMPT_MULTI_ENTITY: &str = "\nPlease answer questions based on the given text with format: \"The {property} of {name1} is {description}; The {property} of {name2} is {description}; ...\"\n";

pub const ZERO_SHOT_PROMPT: &str = "\nPlease answer the question in a very compact manner with format: The {property} of {name} is {description}\n";

pub const ZERO_SHOT_PROMPT_MULTI_ENTITY: &str = "\nPlease answer the question in a very compact manner with format: \"The {property} of {name1} is {description}; The {property} of {name2} is {description}; ...\n";

/// In-context instruction that also asks for a refusal when the KB is silent
pub const REFUSAL_INSTRUCTION_PROMPT: &str = "Please answer questions based on the given text with format: \"The {property} of {name} is {description}\", if relevant information cannot be found in the text, please respond \"I am sorry I cannot find relevant information in the KB\".";

/// Supported model families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    /// LLaMA 3 instruct (header/eot markers)
    Llama3,
    /// Phi-3 instruct (`<|user|>` / `<|assistant|>` turns)
    Phi3,
}

const LLAMA3_USER_HEADER: &str = "<|start_header_id|>user<|end_header_id|>";
const LLAMA3_ASSISTANT_HEADER: &str = "<|start_header_id|>assistant<|end_header_id|>";
const LLAMA3_EOT: &str = "<|eot_id|>";
const LLAMA3_END_OF_TEXT: &str = "<|end_of_text|>";

const PHI3_USER: &str = "<|user|>";
const PHI3_ASSISTANT: &str = "<|assistant|>";
const PHI3_END: &str = "<|end|>";

impl ModelFamily {
    /// Wrap a raw question in the family's chat template
    pub fn format_question(&self, question: &str) -> String {
        match self {
            Self::Llama3 => format!(
                "{LLAMA3_USER_HEADER} {question}{LLAMA3_EOT}{LLAMA3_ASSISTANT_HEADER}"
            ),
            Self::Phi3 => format!("{PHI3_USER}\n{question}{PHI3_END}\n{PHI3_ASSISTANT}\n"),
        }
    }

    /// Control markers removed from generated text
    pub fn control_markers(&self) -> &'static [&'static str] {
        match self {
            Self::Llama3 => &[
                LLAMA3_EOT,
                LLAMA3_ASSISTANT_HEADER,
                LLAMA3_USER_HEADER,
                LLAMA3_END_OF_TEXT,
            ],
            Self::Phi3 => &[PHI3_END, PHI3_ASSISTANT, PHI3_USER],
        }
    }

    /// Strip the family's control markers from decoded output
    pub fn prune_output(&self, generated: &str) -> String {
        self.control_markers()
            .iter()
            .fold(generated.to_string(), |text, marker| text.replace(marker, ""))
    }
}

/// How the KB reaches the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvalMode {
    /// KB injected as attention key/value pairs
    Kb,
    /// KB listed as text in the prompt
    Icl,
    /// No KB at all
    Zeroshot,
}

impl EvalMode {
    pub fn uses_kb_embeddings(&self) -> bool {
        matches!(self, Self::Kb)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kb => "kb",
            Self::Icl => "icl",
            Self::Zeroshot => "zeroshot",
        }
    }
}

impl std::fmt::Display for EvalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which instruction set a prompt is composed with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptStyle {
    SingleEntity,
    MultiEntity,
    /// Single entity, with an explicit refusal option
    Refusal,
}

/// Compose the raw question sent for `mode`.
///
/// `icl_context` is the textual KB listing and is only used in ICL mode.
pub fn compose_prompt(mode: EvalMode, style: PromptStyle, icl_context: &str, question: &str) -> String {
    match mode {
        EvalMode::Kb => question.to_string(),
        EvalMode::Icl => {
            let instruction = match style {
                PromptStyle::SingleEntity => INSTRUCTION_PROMPT,
                PromptStyle::MultiEntity => INSTRUCTION_PROMPT_MULTI_ENTITY,
                PromptStyle::Refusal => REFUSAL_INSTRUCTION_PROMPT,
            };
            format!("{instruction}{icl_context}{question}")
        }
        EvalMode::Zeroshot => {
            let instruction = match style {
                PromptStyle::MultiEntity => ZERO_SHOT_PROMPT_MULTI_ENTITY,
                PromptStyle::SingleEntity | PromptStyle::Refusal => ZERO_SHOT_PROMPT,
            };
            format!("{instruction}{question}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAMILIES: [ModelFamily; 2] = [ModelFamily::Llama3, ModelFamily::Phi3];

    #[test]
    fn test_round_trip_keeps_question() {
        let questions = [
            "What is the color of A?",
            "What is the size of <b>?",
            "",
            "Multi\nline question",
        ];
        for family in FAMILIES {
            for q in questions {
                let pruned = family.prune_output(&family.format_question(q));
                assert!(pruned.contains(q), "{family:?} lost {q:?}: {pruned:?}");
            }
        }
    }

    #[test]
    fn test_prune_leaves_content_alone() {
        let text = "The capital of France is Paris <|im_end|>";
        for family in FAMILIES {
            assert_eq!(family.prune_output(text), text);
        }
    }

    #[test]
    fn test_llama3_template() {
        let prompt = ModelFamily::Llama3.format_question("Q?");
        assert_eq!(
            prompt,
            "<|start_header_id|>user<|end_header_id|> Q?<|eot_id|><|start_header_id|>assistant<|end_header_id|>"
        );
        let generated = format!("{prompt}The answer is 4<|eot_id|><|end_of_text|>");
        assert_eq!(
            ModelFamily::Llama3.prune_output(&generated),
            " Q?The answer is 4"
        );
    }

    #[test]
    fn test_phi3_template() {
        let prompt = ModelFamily::Phi3.format_question("Q?");
        assert_eq!(prompt, "<|user|>\nQ?<|end|>\n<|assistant|>\n");
        assert_eq!(ModelFamily::Phi3.prune_output(&prompt), "\nQ?\n\n");
    }

    #[test]
    fn test_compose_prompt_modes() {
        let ctx = "the color of A is red; ";
        let q = "What is the color of A?";
        assert_eq!(compose_prompt(EvalMode::Kb, PromptStyle::SingleEntity, ctx, q), q);

        let icl = compose_prompt(EvalMode::Icl, PromptStyle::SingleEntity, ctx, q);
        assert!(icl.starts_with(INSTRUCTION_PROMPT));
        assert!(icl.ends_with(&format!("{ctx}{q}")));

        let zs = compose_prompt(EvalMode::Zeroshot, PromptStyle::MultiEntity, ctx, q);
        assert_eq!(zs, format!("{ZERO_SHOT_PROMPT_MULTI_ENTITY}{q}"));

        let refusal = compose_prompt(EvalMode::Icl, PromptStyle::Refusal, ctx, q);
        assert!(refusal.contains("I am sorry"));
    }
}
