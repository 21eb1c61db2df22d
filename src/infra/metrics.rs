// ============================================================
// Layer 6 — Metrics
// ============================================================
// Two pieces:
//
//   SplitMetrics / MetricsRegistry
//     Running sums of the loss terms and accuracy counts for
//     each split (train, val, test, train_last_layer). All
//     splits are reset together at the start of every training
//     epoch and averaged at the end of the split's epoch.
//
//   MetricsLogger
//     Appends every logged scalar to `metrics.csv` in the model
//     directory, one row per value:
//
//       epoch,step,key,value
//       0,12,train_loss_step,1.734512
//       0,12,lr,0.000300
//       0,12,val/accuracy,0.412000
//       ...

use anyhow::{Context, Result};
use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use crate::domain::split::Split;
use crate::domain::step::StepSummary;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SplitMetrics {
    pub n_examples: usize,
    pub n_correct: usize,
    pub n_batches: usize,
    pub cross_entropy: f64,
    pub cluster_cost: f64,
    pub loss: f64,
    pub separation_cost: f64,
    pub avg_separation_cost: f64,
}

impl SplitMetrics {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn record(&mut self, step: &StepSummary) {
        self.n_examples += step.n_examples;
        self.n_correct += step.n_correct;
        self.n_batches += 1;
        self.cross_entropy += step.cross_entropy;
        self.cluster_cost += step.cluster_cost;
        self.loss += step.loss;
        self.separation_cost += step.separation_cost;
        self.avg_separation_cost += step.avg_separation_cost;
    }

    /// Fraction of correctly classified examples, 0 before any example
    pub fn accuracy(&self) -> f64 {
        if self.n_examples > 0 {
            self.n_correct as f64 / self.n_examples as f64
        } else {
            0.0
        }
    }

    fn per_batch(&self, sum: f64) -> f64 {
        if self.n_batches > 0 {
            sum / self.n_batches as f64
        } else {
            0.0
        }
    }

    pub fn mean_loss(&self) -> f64 {
        self.per_batch(self.loss)
    }

    /// Batch-averaged terms in logging order
    pub fn averages(&self) -> [(&'static str, f64); 5] {
        [
            ("loss", self.per_batch(self.loss)),
            ("cross_entropy", self.per_batch(self.cross_entropy)),
            ("cluster_cost", self.per_batch(self.cluster_cost)),
            ("separation_cost", self.per_batch(self.separation_cost)),
            ("avg_separation_cost", self.per_batch(self.avg_separation_cost)),
        ]
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetricsRegistry {
    splits: [SplitMetrics; 4],
}

impl MetricsRegistry {
    pub fn get(&self, split: Split) -> &SplitMetrics {
        &self.splits[split.index()]
    }

    pub fn get_mut(&mut self, split: Split) -> &mut SplitMetrics {
        &mut self.splits[split.index()]
    }

    pub fn reset_all(&mut self) {
        for m in &mut self.splits {
            m.reset();
        }
    }
}

/// Appends `(epoch, step, key, value)` rows to a CSV file kept
/// open for the whole run. Each row is flushed as it is written.
pub struct MetricsLogger {
    csv_path: PathBuf,
    writer: BufWriter<File>,
}

impl MetricsLogger {
    /// Writes the CSV header if the file doesn't exist yet, so
    /// a last-layer run appends to the log of the run it resumes.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("Cannot create metrics directory '{}'", dir.display()))?;

        let csv_path = dir.join("metrics.csv");
        let is_new = !csv_path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&csv_path)
            .with_context(|| format!("Cannot open '{}'", csv_path.display()))?;
        let mut writer = BufWriter::new(file);
        if is_new {
            writeln!(writer, "epoch,step,key,value")?;
            writer.flush()?;
            tracing::debug!("Created metrics CSV: '{}'", csv_path.display());
        }

        Ok(Self { csv_path, writer })
    }

    pub fn log(&mut self, epoch: usize, step: usize, key: &str, value: f64) -> Result<()> {
        writeln!(self.writer, "{epoch},{step},{key},{value:.6}")
            .and_then(|_| self.writer.flush())
            .with_context(|| format!("Cannot write to '{}'", self.csv_path.display()))?;
        tracing::debug!(epoch, step, key, value, "metric");
        Ok(())
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }
}
