//! kblam-eval CLI: offline KB sampling and re-scoring of saved runs

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};
use clap::{Parser, Subcommand, ValueEnum};
use kblam_eval::{
    kb_layers, score_attention, score_generation, score_layer_ranges, ClassificationScores,
    KbSampler, NpyAttentionStore, ResultWriter, Rouge,
};
use serde::Deserialize;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "kblam-eval")]
#[command(about = "Evaluation harness for knowledge-base augmented language models")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum SampleKind {
    /// With replacement (generation runs)
    Replacement,
    /// Without replacement (accuracy and standard runs)
    Distinct,
    /// Active KB plus outlier questions (refusal runs)
    Outliers,
}

#[derive(Subcommand)]
enum Command {
    /// Print the KB sample a seed selects
    Sample {
        #[arg(long)]
        dataset_len: usize,

        #[arg(long, default_value_t = 200)]
        kb_size: usize,

        #[arg(long, default_value_t = 1)]
        seed: u64,

        #[arg(long, value_enum, default_value = "replacement")]
        kind: SampleKind,

        #[arg(long, default_value_t = 100)]
        question_size: usize,

        #[arg(long, default_value_t = 0.2)]
        outlier_ratio: f64,
    },

    /// Per-layer top-1/top-5 accuracy from saved attention artifacts
    ScoreAttention {
        /// Directory holding `{config}_{layer}.npy`
        #[arg(long)]
        attn_dir: PathBuf,

        #[arg(long, default_value = "accuracy_results")]
        config_name: String,

        #[arg(long, default_value_t = 200)]
        kb_size: usize,

        /// Capped at `kb_size`
        #[arg(long, default_value_t = 50)]
        test_batch_size: usize,

        #[arg(long, default_value_t = 32)]
        n_layers: usize,

        #[arg(long, default_value_t = 3)]
        kb_layer_frequency: usize,

        /// Write `{config}_acc.npy` here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Accuracy and confidence per six-layer window
    ScoreWindows {
        #[arg(long)]
        attn_dir: PathBuf,

        #[arg(long, default_value = "basic_results")]
        config_name: String,

        #[arg(long, default_value_t = 100)]
        subset_size: usize,

        #[arg(long, default_value_t = 32)]
        n_layers: usize,

        #[arg(long, default_value_t = 3)]
        kb_layer_frequency: usize,

        /// Write `{config}_acc.npy` and `{config}_conf.npy` here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Classification scores from a saved `[2, N]` refusal array
    ScoreRefusal {
        #[arg(long)]
        input: PathBuf,
    },

    /// ROUGE over a JSON list of `{prediction, reference}` pairs
    Rouge {
        #[arg(long)]
        input: PathBuf,
    },
}

#[derive(Deserialize)]
struct ScoredPair {
    prediction: String,
    reference: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Command::Sample {
            dataset_len,
            kb_size,
            seed,
            kind,
            question_size,
            outlier_ratio,
        } => {
            let mut sampler = KbSampler::new(seed);
            let json = match kind {
                SampleKind::Replacement => {
                    serde_json::to_string_pretty(&sampler.sample(dataset_len, kb_size)?)?
                }
                SampleKind::Distinct => {
                    serde_json::to_string_pretty(&sampler.sample_distinct(dataset_len, kb_size)?)?
                }
                SampleKind::Outliers => serde_json::to_string_pretty(&sampler.sample_with_outliers(
                    dataset_len,
                    kb_size,
                    question_size,
                    outlier_ratio,
                )?)?,
            };
            println!("{json}");
        }

        Command::ScoreAttention {
            attn_dir,
            config_name,
            kb_size,
            test_batch_size,
            n_layers,
            kb_layer_frequency,
            output,
        } => {
            println!("=== Attention accuracy: {} ===", config_name);
            let store = NpyAttentionStore::new(attn_dir);
            let layers = kb_layers(n_layers, kb_layer_frequency)?;
            let batch_size = test_batch_size.min(kb_size);
            let accuracies = score_attention(&store, &config_name, &layers, kb_size, batch_size)?;

            for acc in &accuracies {
                println!(
                    "Layer {:2}: top1 {:5.1}%  top5 {:5.1}%",
                    acc.layer,
                    acc.top1 * 100.0,
                    acc.top5 * 100.0
                );
            }

            if let Some(dir) = output {
                let writer = ResultWriter::new(dir)?;
                let rows: Vec<Vec<f64>> = accuracies.iter().map(|a| vec![a.top1, a.top5]).collect();
                writer.write_rows_npy(&format!("{config_name}_acc.npy"), &rows)?;
            }
        }

        Command::ScoreWindows {
            attn_dir,
            config_name,
            subset_size,
            n_layers,
            kb_layer_frequency,
            output,
        } => {
            println!("=== Windowed attention accuracy: {} ===", config_name);
            let store = NpyAttentionStore::new(attn_dir);
            let windows =
                score_layer_ranges(&store, &config_name, n_layers, kb_layer_frequency, subset_size)?;

            for w in &windows {
                println!(
                    "Layers [{:2}, {:2}): top1 {:5.1}%  top5 {:5.1}%  confidence {:.3}",
                    w.start,
                    w.end,
                    w.top1 * 100.0,
                    w.top5 * 100.0,
                    w.confidence
                );
            }

            if let Some(dir) = output {
                let writer = ResultWriter::new(dir)?;
                let acc: Vec<Vec<f64>> = windows.iter().map(|w| vec![w.top1, w.top5]).collect();
                writer.write_rows_npy(&format!("{config_name}_acc.npy"), &acc)?;
                let conf: Vec<f64> = windows.iter().map(|w| f64::from(w.confidence)).collect();
                writer.write_scores_npy(&format!("{config_name}_conf.npy"), &conf)?;
            }
        }

        Command::ScoreRefusal { input } => {
            let matrix = Tensor::read_npy(&input)
                .with_context(|| format!("Failed to read {}", input.display()))?
                .to_dtype(DType::I64)?;
            let rows: Vec<Vec<i64>> = matrix.to_vec2()?;
            anyhow::ensure!(rows.len() == 2, "expected a [2, N] array, got {:?}", matrix.dims());

            let as_binary = |row: &[i64]| -> Vec<u8> { row.iter().map(|&v| u8::from(v != 0)).collect() };
            let scores = ClassificationScores::from_pairs(&as_binary(&rows[0]), &as_binary(&rows[1]))?;
            info!("Scored {} questions", scores.total());

            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "counts": scores,
                    "accuracy": scores.accuracy(),
                    "precision": scores.precision(),
                    "recall": scores.recall(),
                    "f1": scores.f1(),
                }))?
            );
        }

        Command::Rouge { input } => {
            let text = std::fs::read_to_string(&input)
                .with_context(|| format!("Failed to read {}", input.display()))?;
            let pairs: Vec<ScoredPair> =
                serde_json::from_str(&text).context("Failed to parse prediction/reference pairs")?;
            info!("Scoring {} pairs", pairs.len());

            let (predictions, references): (Vec<String>, Vec<String>) = pairs
                .into_iter()
                .map(|p| (p.prediction, p.reference))
                .unzip();
            let scores = score_generation(&predictions, &references, &[&Rouge])?;
            println!("{}", serde_json::to_string_pretty(&scores)?);
        }
    }

    Ok(())
}
