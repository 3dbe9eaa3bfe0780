//! Attention-based retrieval scoring
//!
//! A question at batch row `i` was built from KB row `i`, so the column a
//! question attends to most should be its own row index. Scores are mean
//! hit rates over the batch; a layer with no usable artifact is an error,
//! never a zero.

use anyhow::Result;
use candle_core::{Tensor, D};
use serde::Serialize;
use tracing::{debug, warn};

use crate::attention::{load_kb_view, AttentionStore};
use crate::EvalError;

/// Layers per window when scoring the standard run
pub const LAYER_WINDOW: usize = 6;

/// Retrieval accuracy of one KB layer (or layer window)
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LayerAccuracy {
    /// First layer of the window, or the layer itself
    pub layer: usize,
    pub top1: f64,
    pub top5: f64,
}

/// Fraction of rows whose own index is the argmax, and fraction whose own
/// index ranks within the top `min(5, kb_size)` columns.
///
/// `scores` is `[batch, kb_size]`. Ties rank the lower column first, as
/// `argmax` does, so exactly `k` columns are in the top-k.
fn identity_hits(scores: &Tensor) -> Result<(f64, f64)> {
    let (batch, kb_size) = scores.dims2()?;
    if batch > kb_size {
        return Err(EvalError::LengthMismatch {
            what: "batch rows vs KB columns",
            expected: kb_size,
            actual: batch,
        }
        .into());
    }
    let k = kb_size.min(5);

    let argmax: Vec<u32> = scores.argmax(D::Minus1)?.to_vec1()?;
    let rows: Vec<Vec<f32>> = scores.to_vec2()?;

    let mut top1 = 0usize;
    let mut top5 = 0usize;
    for (i, row) in rows.iter().enumerate() {
        if argmax[i] as usize == i {
            top1 += 1;
        }
        let own = row[i];
        let rank = row
            .iter()
            .enumerate()
            .filter(|&(j, &v)| v > own || (v == own && j < i))
            .count();
        if rank < k {
            top5 += 1;
        }
    }
    let n = batch.max(1) as f64;
    Ok((top1 as f64 / n, top5 as f64 / n))
}

/// Per-layer top-1 / top-5 accuracy from saved attention artifacts
pub fn score_attention(
    store: &dyn AttentionStore,
    config_name: &str,
    layers: &[usize],
    kb_size: usize,
    batch_size: usize,
) -> Result<Vec<LayerAccuracy>> {
    layers
        .iter()
        .map(|&layer| {
            let view = load_kb_view(store, config_name, layer, kb_size, batch_size)?;
            let (top1, top5) = identity_hits(&view.sum(1)?)?;
            debug!("Layer {}: top1 {:.3}, top5 {:.3}", layer, top1, top5);
            Ok(LayerAccuracy { layer, top1, top5 })
        })
        .collect()
}

/// Peak probability after averaging over the middle axis and taking a
/// softmax over KB columns. `weights` is `[batch, steps, kb]`.
pub fn confidence(weights: &Tensor) -> Result<f32> {
    let mean = weights.mean(1)?;
    let probs = candle_nn::ops::softmax_last_dim(&mean.contiguous()?)?;
    Ok(probs.flatten_all()?.max(0)?.to_scalar::<f32>()?)
}

/// Scores of one layer window in the standard run
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WindowScore {
    /// Half-open layer range `[start, end)`
    pub start: usize,
    pub end: usize,
    pub top1: f64,
    pub top5: f64,
    pub confidence: f32,
}

/// `[0, w), [w, 2w), ...` up to `n_layers`; the last window may be short
pub fn layer_windows(n_layers: usize, width: usize) -> Vec<(usize, usize)> {
    (0..n_layers)
        .step_by(width.max(1))
        .map(|start| (start, (start + width).min(n_layers)))
        .collect()
}

/// Accuracy and confidence per layer window.
///
/// Each window stacks the artifacts of its KB layers (`[L, kb, X, kb]`),
/// moves the question axis first and flattens to `[kb, L*X, kb]`; the batch
/// is the whole KB subset. Windows without a KB layer are skipped.
pub fn score_layer_ranges(
    store: &dyn AttentionStore,
    config_name: &str,
    n_layers: usize,
    layer_frequency: usize,
    kb_size: usize,
) -> Result<Vec<WindowScore>> {
    let kb = crate::attention::kb_layers(n_layers, layer_frequency)?;
    let mut scores = Vec::new();

    for (start, end) in layer_windows(n_layers, LAYER_WINDOW) {
        let views = kb
            .iter()
            .filter(|&&l| l >= start && l < end)
            .map(|&l| load_kb_view(store, config_name, l, kb_size, kb_size))
            .collect::<Result<Vec<_>>>()?;
        if views.is_empty() {
            warn!("No KB layer in window [{}, {}), skipping", start, end);
            continue;
        }

        let stacked = Tensor::stack(&views, 0)?.transpose(0, 1)?.contiguous()?;
        let weights = stacked.reshape((kb_size, (), kb_size))?;
        let (top1, top5) = identity_hits(&weights.sum(1)?)?;
        let confidence = confidence(&weights)?;
        debug!(
            "Window [{}, {}): top1 {:.3}, top5 {:.3}, confidence {:.3}",
            start, end, top1, top5, confidence
        );
        scores.push(WindowScore {
            start,
            end,
            top1,
            top5,
            confidence,
        });
    }
    Ok(scores)
}

/// Binary classification results, refusal (`1`) as the positive class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ClassificationScores {
    pub true_positives: usize,
    pub true_negatives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
}

impl ClassificationScores {
    /// Tally `(prediction, label)` pairs; values other than 0/1 are ignored
    pub fn from_pairs(predictions: &[u8], labels: &[u8]) -> Result<Self> {
        if predictions.len() != labels.len() {
            return Err(EvalError::LengthMismatch {
                what: "predictions vs labels",
                expected: labels.len(),
                actual: predictions.len(),
            }
            .into());
        }

        let mut scores = Self::default();
        for (pred, label) in predictions.iter().zip(labels) {
            match (*pred, *label) {
                (1, 1) => scores.true_positives += 1,
                (0, 0) => scores.true_negatives += 1,
                (1, 0) => scores.false_positives += 1,
                (0, 1) => scores.false_negatives += 1,
                _ => {}
            }
        }
        Ok(scores)
    }

    pub fn total(&self) -> usize {
        self.true_positives + self.true_negatives + self.false_positives + self.false_negatives
    }

    pub fn accuracy(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            (self.true_positives + self.true_negatives) as f64 / total as f64
        }
    }

    pub fn precision(&self) -> f64 {
        let denom = self.true_positives + self.false_positives;
        if denom == 0 {
            0.0
        } else {
            self.true_positives as f64 / denom as f64
        }
    }

    pub fn recall(&self) -> f64 {
        let denom = self.true_positives + self.false_negatives;
        if denom == 0 {
            0.0
        } else {
            self.true_positives as f64 / denom as f64
        }
    }

    pub fn f1(&self) -> f64 {
        let p = self.precision();
        let r = self.recall();
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }
}
