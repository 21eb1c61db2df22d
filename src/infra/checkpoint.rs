// ============================================================
// Layer 6 — Checkpoint Manager
// ============================================================
// Saves and restores PPNet weights with Burn's CompactRecorder.
//
//   {model_dir}/checkpoints/
//     warmup_best.mpk.gz   ← best validation accuracy during warm-up
//     warmup_best.json     ← { "accuracy": .., "epoch": .. }
//     nopush_last.mpk.gz   ← latest joint epoch
//     push.mpk.gz          ← prototypes projected onto training patches
//     push_best.mpk.gz     ← best last-layer-only epoch
//     ...
//     train_config.json    ← hyper-parameters the weights were trained with
//
// A model is only written when its accuracy is above the
// target accuracy; `{stage}_best` / `{stage}_last` files are
// overwritten in place.

use anyhow::{Context, Result};
use burn::{
    prelude::*,
    record::{CompactRecorder, Recorder},
};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::application::train_use_case::TrainConfig;
use crate::ml::model::PPNet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub name: String,
    pub accuracy: f64,
    pub epoch: usize,
}

pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    /// Creates the directory if it doesn't already exist.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Cannot create checkpoint directory '{}'", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Save `model` as `{name}` if `accuracy > target_accuracy`.
    /// Returns whether anything was written.
    pub fn save_model_w_condition<B: Backend>(
        &self,
        model: &PPNet<B>,
        name: &str,
        accuracy: f64,
        target_accuracy: f64,
        epoch: usize,
    ) -> Result<bool> {
        if accuracy <= target_accuracy {
            tracing::debug!(
                "Not saving '{}': accuracy {:.4} <= target {:.4}",
                name,
                accuracy,
                target_accuracy
            );
            return Ok(false);
        }

        tracing::info!("\tabove {:.2}%", target_accuracy * 100.0);
        self.save_model(model, name)?;

        let meta = CheckpointMeta { name: name.to_string(), accuracy, epoch };
        let meta_path = self.dir.join(format!("{name}.json"));
        fs::write(&meta_path, serde_json::to_string_pretty(&meta)?)
            .with_context(|| format!("Cannot write '{}'", meta_path.display()))?;
        Ok(true)
    }

    /// Unconditionally write `{name}.mpk.gz`
    pub fn save_model<B: Backend>(&self, model: &PPNet<B>, name: &str) -> Result<()> {
        // The recorder appends the extension
        let path = self.dir.join(name);
        CompactRecorder::new()
            .record(model.clone().into_record(), path.clone())
            .with_context(|| format!("Failed to save checkpoint to '{}'", path.display()))?;
        tracing::debug!("Saved checkpoint '{}'", path.display());
        Ok(())
    }

    /// Load weights saved under `name` into a model of the same shape.
    pub fn load_model<B: Backend>(
        &self,
        model: PPNet<B>,
        name: &str,
        device: &B::Device,
    ) -> Result<PPNet<B>> {
        let path = self.dir.join(name);
        tracing::info!("Loading checkpoint '{}'", path.display());
        let record = CompactRecorder::new().load(path.clone(), device).with_context(|| {
            format!(
                "Cannot load checkpoint '{}'. Has this stage been trained yet?",
                path.display()
            )
        })?;
        Ok(model.load_record(record))
    }

    pub fn load_meta(&self, name: &str) -> Result<CheckpointMeta> {
        let path = self.dir.join(format!("{name}.json"));
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Cannot read '{}'", path.display()))?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn save_config(&self, cfg: &TrainConfig) -> Result<()> {
        cfg.save(self.dir.join("train_config.json"))
    }

    pub fn load_config(&self) -> Result<TrainConfig> {
        let path = self.dir.join("train_config.json");
        TrainConfig::load(&path).with_context(|| {
            format!(
                "Cannot read config from '{}'. Make sure you have run 'train' first.",
                path.display()
            )
        })
    }
}
