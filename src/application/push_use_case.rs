// ============================================================
// Layer 2 — Push Use Case
// ============================================================
// Replaces every prototype with its nearest training patch:
//
//   Step 1: Load the run's config and checkpoint  (Layer 6)
//   Step 2: Build the push loader                 (Layer 4)
//   Step 3: Project prototypes                    (Layer 5)
//   Step 4: Save the `push` checkpoint + summary  (Layer 6)
//
// A last-layer-only run is then started with `--resume push`.

use anyhow::Result;
use std::path::PathBuf;

use crate::data::data_module::PatchClassificationDataModule;
use crate::infra::checkpoint::CheckpointManager;
use crate::ml::{
    push::{push_prototypes, save_push_summary, PrototypeProjection},
    trainer::EvalBackend,
};

/// Name the pushed model is saved under
pub const PUSH_CHECKPOINT: &str = "push";

pub struct PushUseCase {
    checkpoints: CheckpointManager,
    checkpoint: String,
}

impl PushUseCase {
    pub fn new(model_dir: impl Into<PathBuf>, checkpoint: impl Into<String>) -> Result<Self> {
        let checkpoints = CheckpointManager::new(model_dir.into().join("checkpoints"))?;
        Ok(Self { checkpoints, checkpoint: checkpoint.into() })
    }

    pub fn execute(&self) -> Result<Vec<PrototypeProjection>> {
        // ── Step 1: Model ────────────────────────────────────────────────────
        let cfg = self.checkpoints.load_config()?;
        let device = burn::backend::wgpu::WgpuDevice::default();
        let model = cfg.to_model_config().init::<EvalBackend>(&device);
        let model = self.checkpoints.load_model(model, &self.checkpoint, &device)?;

        // ── Step 2: Push loader ──────────────────────────────────────────────
        let datamodule = PatchClassificationDataModule::new(&cfg);
        datamodule.prepare_data()?;
        let loader = datamodule.train_push_dataloader::<EvalBackend>(&device)?;

        // ── Step 3: Project ──────────────────────────────────────────────────
        tracing::info!("Pushing prototypes of '{}'", self.checkpoint);
        let (model, projections) = push_prototypes(model, &loader)?;

        // ── Step 4: Save ─────────────────────────────────────────────────────
        self.checkpoints.save_model(&model, PUSH_CHECKPOINT)?;
        let summary = save_push_summary(&cfg.prototypes_dir(), &projections)?;
        tracing::info!("Push summary written to '{}'", summary.display());
        Ok(projections)
    }
}
