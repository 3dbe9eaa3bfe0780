//! Generation-quality metrics
//!
//! `score_generation` only checks alignment and hands the pairs to each
//! [`TextMetric`]. Two metrics are provided: ROUGE (n-gram and LCS overlap)
//! and BERTScore (greedy cosine matching of contextual token embeddings,
//! with the embedding model supplied as a [`TokenEmbedder`]).

use anyhow::Result;
use candle_core::{Tensor, D};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::EvalError;

/// A corpus-level text similarity metric
pub trait TextMetric {
    fn name(&self) -> &str;

    /// Named scores averaged over all (prediction, reference) pairs
    fn compute(&self, predictions: &[String], references: &[String]) -> Result<Vec<(String, f64)>>;
}

/// Ordered named scores of one run
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricScores {
    pub scores: Vec<(String, f64)>,
}

impl MetricScores {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.scores.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    /// Scores in insertion order
    pub fn values(&self) -> Vec<f64> {
        self.scores.iter().map(|(_, v)| *v).collect()
    }

    pub fn extend(&mut self, other: MetricScores) {
        self.scores.extend(other.scores);
    }
}

/// Run every metric over aligned predictions and references
pub fn score_generation(
    predictions: &[String],
    references: &[String],
    metrics: &[&dyn TextMetric],
) -> Result<MetricScores> {
    if predictions.len() != references.len() {
        return Err(EvalError::LengthMismatch {
            what: "predictions vs references",
            expected: references.len(),
            actual: predictions.len(),
        }
        .into());
    }

    let mut scores = MetricScores::default();
    for metric in metrics {
        let values = metric.compute(predictions, references)?;
        debug!("{}: {:?}", metric.name(), values);
        scores.scores.extend(values);
    }
    Ok(scores)
}

// ============================================================================
// ROUGE
// ============================================================================

/// Lowercase alphanumeric tokens
fn rouge_tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn f_measure(precision: f64, recall: f64) -> f64 {
    if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    }
}

fn ngram_counts(tokens: &[String], n: usize) -> HashMap<&[String], usize> {
    let mut counts = HashMap::new();
    if tokens.len() >= n {
        for gram in tokens.windows(n) {
            *counts.entry(gram).or_insert(0) += 1;
        }
    }
    counts
}

fn rouge_n(prediction: &[String], reference: &[String], n: usize) -> f64 {
    let pred = ngram_counts(prediction, n);
    let refs = ngram_counts(reference, n);
    let pred_total: usize = pred.values().sum();
    let ref_total: usize = refs.values().sum();
    if pred_total == 0 || ref_total == 0 {
        return 0.0;
    }
    let overlap: usize = refs
        .iter()
        .map(|(gram, &c)| c.min(pred.get(gram).copied().unwrap_or(0)))
        .sum();
    f_measure(
        overlap as f64 / pred_total as f64,
        overlap as f64 / ref_total as f64,
    )
}

fn lcs_table(a: &[String], b: &[String]) -> Vec<Vec<usize>> {
    let mut table = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for i in 1..=a.len() {
        for j in 1..=b.len() {
            table[i][j] = if a[i - 1] == b[j - 1] {
                table[i - 1][j - 1] + 1
            } else {
                table[i - 1][j].max(table[i][j - 1])
            };
        }
    }
    table
}

/// Positions in `reference` covered by one LCS with `prediction`
fn lcs_reference_positions(reference: &[String], prediction: &[String]) -> Vec<usize> {
    let table = lcs_table(reference, prediction);
    let (mut i, mut j) = (reference.len(), prediction.len());
    let mut positions = Vec::new();
    while i > 0 && j > 0 {
        if reference[i - 1] == prediction[j - 1] {
            positions.push(i - 1);
            i -= 1;
            j -= 1;
        } else if table[i - 1][j] >= table[i][j - 1] {
            i -= 1;
        } else {
            j -= 1;
        }
    }
    positions
}

fn rouge_l(prediction: &[String], reference: &[String]) -> f64 {
    if prediction.is_empty() || reference.is_empty() {
        return 0.0;
    }
    let lcs = lcs_table(reference, prediction)[reference.len()][prediction.len()];
    f_measure(
        lcs as f64 / prediction.len() as f64,
        lcs as f64 / reference.len() as f64,
    )
}

/// Summary-level LCS: sentences are newline separated
fn rouge_lsum(prediction: &str, reference: &str) -> f64 {
    let split = |text: &str| -> Vec<Vec<String>> {
        text.lines()
            .map(rouge_tokens)
            .filter(|s| !s.is_empty())
            .collect()
    };
    let pred_sents = split(prediction);
    let ref_sents = split(reference);
    let pred_total: usize = pred_sents.iter().map(Vec::len).sum();
    let ref_total: usize = ref_sents.iter().map(Vec::len).sum();
    if pred_total == 0 || ref_total == 0 {
        return 0.0;
    }

    let mut pred_counts: HashMap<&str, usize> = HashMap::new();
    for tok in pred_sents.iter().flatten() {
        *pred_counts.entry(tok.as_str()).or_insert(0) += 1;
    }
    let mut ref_counts: HashMap<&str, usize> = HashMap::new();
    for tok in ref_sents.iter().flatten() {
        *ref_counts.entry(tok.as_str()).or_insert(0) += 1;
    }

    let mut hits = 0usize;
    for ref_sent in &ref_sents {
        let union: BTreeSet<usize> = pred_sents
            .iter()
            .flat_map(|p| lcs_reference_positions(ref_sent, p))
            .collect();
        for pos in union {
            let tok = ref_sent[pos].as_str();
            let (Some(r), Some(p)) = (ref_counts.get(tok).copied(), pred_counts.get(tok).copied())
            else {
                continue;
            };
            if r > 0 && p > 0 {
                hits += 1;
                ref_counts.insert(tok, r - 1);
                pred_counts.insert(tok, p - 1);
            }
        }
    }

    f_measure(
        hits as f64 / pred_total as f64,
        hits as f64 / ref_total as f64,
    )
}

/// Per-pair ROUGE F-measures
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RougeScore {
    pub rouge1: f64,
    pub rouge2: f64,
    pub rouge_l: f64,
    pub rouge_lsum: f64,
}

/// ROUGE-1/2/L/Lsum F-measure, averaged over pairs
#[derive(Debug, Clone, Copy, Default)]
pub struct Rouge;

impl Rouge {
    pub fn score_pair(&self, prediction: &str, reference: &str) -> RougeScore {
        let p = rouge_tokens(prediction);
        let r = rouge_tokens(reference);
        RougeScore {
            rouge1: rouge_n(&p, &r, 1),
            rouge2: rouge_n(&p, &r, 2),
            rouge_l: rouge_l(&p, &r),
            rouge_lsum: rouge_lsum(prediction, reference),
        }
    }
}

impl TextMetric for Rouge {
    fn name(&self) -> &str {
        "rouge"
    }

    fn compute(&self, predictions: &[String], references: &[String]) -> Result<Vec<(String, f64)>> {
        let n = predictions.len().max(1) as f64;
        let mut sums = [0.0f64; 4];
        for (p, r) in predictions.iter().zip(references) {
            let s = self.score_pair(p, r);
            sums[0] += s.rouge1;
            sums[1] += s.rouge2;
            sums[2] += s.rouge_l;
            sums[3] += s.rouge_lsum;
        }
        Ok(["rouge1", "rouge2", "rougeL", "rougeLsum"]
            .iter()
            .zip(sums)
            .map(|(name, sum)| (name.to_string(), sum / n))
            .collect())
    }
}

// ============================================================================
// BERTScore
// ============================================================================

/// Contextual token embeddings of a sentence: `[tokens, dim]`
pub trait TokenEmbedder {
    fn embed(&self, text: &str) -> Result<Tensor>;
}

/// Greedy-matching BERTScore (no idf weighting, no baseline rescale)
pub struct BertScore<E: TokenEmbedder> {
    embedder: E,
}

/// Per-pair BERTScore
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BertScorePair {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

fn l2_normalize(t: &Tensor) -> Result<Tensor> {
    let norm = t.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?.affine(1.0, 1e-12)?;
    Ok(t.broadcast_div(&norm)?)
}

impl<E: TokenEmbedder> BertScore<E> {
    pub fn new(embedder: E) -> Self {
        Self { embedder }
    }

    pub fn score_pair(&self, prediction: &str, reference: &str) -> Result<BertScorePair> {
        let pred = self.embedder.embed(prediction)?;
        let refs = self.embedder.embed(reference)?;
        if pred.dim(0)? == 0 || refs.dim(0)? == 0 {
            return Ok(BertScorePair {
                precision: 0.0,
                recall: 0.0,
                f1: 0.0,
            });
        }
        let pred = l2_normalize(&pred.to_dtype(candle_core::DType::F32)?)?;
        let refs = l2_normalize(&refs.to_dtype(candle_core::DType::F32)?)?;

        // [ref_tokens, pred_tokens]
        let sim = refs.matmul(&pred.t()?)?;
        let precision = f64::from(sim.max(0)?.mean_all()?.to_scalar::<f32>()?);
        let recall = f64::from(sim.max(1)?.mean_all()?.to_scalar::<f32>()?);
        Ok(BertScorePair {
            precision,
            recall,
            f1: f_measure(precision, recall),
        })
    }
}

impl<E: TokenEmbedder> TextMetric for BertScore<E> {
    fn name(&self) -> &str {
        "bertscore"
    }

    fn compute(&self, predictions: &[String], references: &[String]) -> Result<Vec<(String, f64)>> {
        let n = predictions.len().max(1) as f64;
        let (mut p, mut r, mut f) = (0.0, 0.0, 0.0);
        for (pred, reference) in predictions.iter().zip(references) {
            let s = self.score_pair(pred, reference)?;
            p += s.precision;
            r += s.recall;
            f += s.f1;
        }
        Ok(vec![
            ("precision".to_string(), p / n),
            ("recall".to_string(), r / n),
            ("f1".to_string(), f / n),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn s(v: &[&str]) -> Vec<String> {
        v.iter().map(|x| x.to_string()).collect()
    }

    #[test]
    fn test_rouge_identical() {
        let score = Rouge.score_pair("The color of A is red", "the color of a is red");
        assert_eq!(score.rouge1, 1.0);
        assert_eq!(score.rouge2, 1.0);
        assert_eq!(score.rouge_l, 1.0);
        assert_eq!(score.rouge_lsum, 1.0);
    }

    #[test]
    fn test_rouge_partial() {
        // prediction tokens: [red, car]; reference: [red, bus, stop]
        let score = Rouge.score_pair("red car", "red bus stop");
        let p = 1.0 / 2.0;
        let r = 1.0 / 3.0;
        assert!((score.rouge1 - 2.0 * p * r / (p + r)).abs() < 1e-12);
        assert_eq!(score.rouge2, 0.0);
        assert!((score.rouge_l - score.rouge1).abs() < 1e-12);
    }

    #[test]
    fn test_rouge_lcs_order() {
        // LCS of [a b c d] and [a c b d] has length 3
        let score = Rouge.score_pair("a c b d", "a b c d");
        assert!((score.rouge_l - 0.75).abs() < 1e-12);
        assert_eq!(score.rouge1, 1.0);
    }

    #[test]
    fn test_rouge_empty() {
        let score = Rouge.score_pair("", "something");
        assert_eq!(score.rouge1, 0.0);
        assert_eq!(score.rouge_lsum, 0.0);
    }

    #[test]
    fn test_score_generation_length_mismatch() {
        let err = score_generation(&s(&["a"]), &s(&["a", "b"]), &[&Rouge]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EvalError>(),
            Some(EvalError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_score_generation_order() {
        let scores = score_generation(&s(&["red", "blue"]), &s(&["red", "green"]), &[&Rouge]).unwrap();
        let names: Vec<&str> = scores.scores.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["rouge1", "rouge2", "rougeL", "rougeLsum"]);
        assert!((scores.get("rouge1").unwrap() - 0.5).abs() < 1e-12);
    }

    /// One-hot embedding per lowercase word over a tiny vocabulary
    struct OneHot;

    impl TokenEmbedder for OneHot {
        fn embed(&self, text: &str) -> Result<Tensor> {
            let vocab = ["red", "blue", "green", "car"];
            let rows: Vec<f32> = text
                .split_whitespace()
                .flat_map(|w| vocab.iter().map(move |v| if *v == w { 1.0 } else { 0.0 }))
                .collect();
            let n = rows.len() / vocab.len();
            Ok(Tensor::from_vec(rows, (n, vocab.len()), &Device::Cpu)?)
        }
    }

    #[test]
    fn test_bertscore_greedy_matching() {
        let metric = BertScore::new(OneHot);
        let exact = metric.score_pair("red car", "car red").unwrap();
        assert!((exact.f1 - 1.0).abs() < 1e-5);

        // prediction [red, blue] vs reference [red]: precision 0.5, recall 1
        let partial = metric.score_pair("red blue", "red").unwrap();
        assert!((partial.precision - 0.5).abs() < 1e-5);
        assert!((partial.recall - 1.0).abs() < 1e-5);

        let empty = metric.score_pair("", "red").unwrap();
        assert_eq!(empty.f1, 0.0);
    }
}
