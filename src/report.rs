//! Result files of an evaluation run
//!
//! Every run writes a human-readable transcript, its numeric arrays as
//! `.npy` and a JSON summary echoing the configuration it ran with.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// One generated answer next to its ground truth
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptEntry {
    pub output: String,
    pub reference: String,
}

impl TranscriptEntry {
    pub fn new(output: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            reference: reference.into(),
        }
    }
}

/// `Model output: ...` / `True answer: ...` blocks separated by dashes
pub fn render_transcript(entries: &[TranscriptEntry]) -> String {
    entries
        .iter()
        .map(|e| {
            format!(
                "Model output: {}\nTrue answer: {}\n-------\n",
                e.output, e.reference
            )
        })
        .collect()
}

/// Summary of one run, written as `{config}_summary.json`
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// `generation`, `accuracy`, `refusal` or `standard`
    pub command: String,
    pub config_name: String,
    pub config: serde_json::Value,
    pub results: serde_json::Value,
}

impl RunSummary {
    pub fn new(
        command: &str,
        config_name: &str,
        config: &impl Serialize,
        results: &impl Serialize,
    ) -> Result<Self> {
        Ok(Self {
            command: command.to_string(),
            config_name: config_name.to_string(),
            config: serde_json::to_value(config)?,
            results: serde_json::to_value(results)?,
        })
    }
}

/// Writes result files under one output directory
#[derive(Debug, Clone)]
pub struct ResultWriter {
    dir: PathBuf,
}

impl ResultWriter {
    /// Creates `dir` if needed
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    pub fn write_text(&self, file_name: &str, contents: &str) -> Result<PathBuf> {
        let path = self.path(file_name);
        std::fs::write(&path, contents)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Wrote {}", path.display());
        Ok(path)
    }

    /// 1-D `f64` array
    pub fn write_scores_npy(&self, file_name: &str, scores: &[f64]) -> Result<PathBuf> {
        let tensor = Tensor::from_slice(scores, scores.len(), &Device::Cpu)?;
        self.write_tensor_npy(file_name, &tensor)
    }

    /// Row-major `f64` matrix from equally long rows
    pub fn write_rows_npy(&self, file_name: &str, rows: &[Vec<f64>]) -> Result<PathBuf> {
        let n_cols = rows.first().map_or(0, Vec::len);
        anyhow::ensure!(
            rows.iter().all(|r| r.len() == n_cols),
            "ragged rows cannot be written to {file_name}"
        );
        let flat: Vec<f64> = rows.iter().flatten().copied().collect();
        let tensor = Tensor::from_vec(flat, (rows.len(), n_cols), &Device::Cpu)?;
        self.write_tensor_npy(file_name, &tensor)
    }

    pub fn write_tensor_npy(&self, file_name: &str, tensor: &Tensor) -> Result<PathBuf> {
        let path = self.path(file_name);
        tensor
            .write_npy(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Wrote {}", path.display());
        Ok(path)
    }

    pub fn write_json(&self, file_name: &str, value: &impl Serialize) -> Result<PathBuf> {
        let path = self.path(file_name);
        std::fs::write(&path, serde_json::to_string_pretty(value)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Wrote {}", path.display());
        Ok(path)
    }

    pub fn write_summary(&self, summary: &RunSummary) -> Result<PathBuf> {
        self.write_json(&format!("{}_summary.json", summary.config_name), summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_transcript() {
        let entries = vec![
            TranscriptEntry::new(" The color of A is red", "red"),
            TranscriptEntry::new("I am sorry", "Cannot find relevant information in the KB"),
        ];
        assert_eq!(
            render_transcript(&entries),
            "Model output:  The color of A is red\nTrue answer: red\n-------\n\
             Model output: I am sorry\nTrue answer: Cannot find relevant information in the KB\n-------\n"
        );
    }

    #[test]
    fn test_writer_files() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ResultWriter::new(dir.path().join("nested")).unwrap();

        let path = writer.write_rows_npy("acc.npy", &[vec![1.0, 0.5], vec![0.0, 0.25]]).unwrap();
        let loaded = Tensor::read_npy(&path).unwrap();
        assert_eq!(loaded.dims(), &[2, 2]);
        let values: Vec<Vec<f64>> = loaded.to_vec2().unwrap();
        assert_eq!(values[1], vec![0.0, 0.25]);

        assert!(writer.write_rows_npy("bad.npy", &[vec![1.0], vec![]]).is_err());

        let summary = RunSummary::new("accuracy", "acc_run", &vec![1, 2], &0.5).unwrap();
        let path = writer.write_summary(&summary).unwrap();
        assert!(path.ends_with("acc_run_summary.json"));
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("\"command\": \"accuracy\""));
    }
}
