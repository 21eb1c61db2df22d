// ============================================================
// Layer 2 — Test Use Case
// ============================================================
// Evaluates a saved checkpoint on the test loader with the
// config it was trained with. Nothing is optimised; only the
// test split metrics are logged.

use anyhow::Result;
use std::path::PathBuf;

use crate::data::data_module::PatchClassificationDataModule;
use crate::infra::{checkpoint::CheckpointManager, metrics::SplitMetrics};
use crate::ml::trainer::{PrototypeModule, TrainBackend};

pub struct TestUseCase {
    checkpoints: CheckpointManager,
    checkpoint: String,
}

impl TestUseCase {
    pub fn new(model_dir: impl Into<PathBuf>, checkpoint: impl Into<String>) -> Result<Self> {
        let checkpoints = CheckpointManager::new(model_dir.into().join("checkpoints"))?;
        Ok(Self { checkpoints, checkpoint: checkpoint.into() })
    }

    pub fn execute(&self) -> Result<SplitMetrics> {
        let cfg = self.checkpoints.load_config()?;
        let device = burn::backend::wgpu::WgpuDevice::default();
        let model = cfg.to_model_config().init::<TrainBackend>(&device);
        let model = self.checkpoints.load_model(model, &self.checkpoint, &device)?;

        let datamodule = PatchClassificationDataModule::new(&cfg);
        datamodule.prepare_data()?;

        let mut module = PrototypeModule::new(cfg, model, false)?;
        module.test(&datamodule, &device)
    }
}
