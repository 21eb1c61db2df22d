// ============================================================
// Layer 2 — TrainUseCase
// ============================================================
// Orchestrates a training run in order:
//
//   Step 1: Validate the config                  (Layer 2)
//   Step 2: Build the network, optionally resume (Layer 5 / 6)
//   Step 3: Save config next to the checkpoints  (Layer 6)
//   Step 4: Check the dataset is in place        (Layer 4)
//   Step 5: Fit: warm-up → joint, or last layer  (Layer 5)
//   Step 6: Evaluate on the test loader          (Layer 5)
//
// A last-layer-only run must resume from an existing
// checkpoint (usually `push`).

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf};

use crate::data::data_module::PatchClassificationDataModule;
use crate::infra::{checkpoint::CheckpointManager, metrics::SplitMetrics};
use crate::ml::{
    loss::LossWeights,
    model::PPNetConfig,
    scheduler::PlateauConfig,
    trainer::{PrototypeModule, TrainBackend},
};

// ─── Training Configuration ──────────────────────────────────────────────────
// Every hyper-parameter of a run. Missing JSON fields fall back
// to the defaults below, so a config file only lists overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub data_dir: String,
    pub model_dir: String,
    pub model_image_size: usize,

    pub num_classes: usize,
    pub prototypes_per_class: usize,
    pub prototype_dim: usize,
    pub feature_channels: usize,
    pub class_specific: bool,

    pub num_warm_epochs: usize,
    pub num_epochs: usize,
    pub batch_size: usize,
    /// -1 means one worker per CPU
    pub dataloader_n_jobs: i64,
    pub push_length_multiplier: usize,
    pub seed: u64,

    pub loss_weight_crs_ent: f64,
    pub loss_weight_clst: f64,
    pub loss_weight_sep: f64,
    pub loss_weight_l1: f64,

    pub joint_optimizer_lr_features: f64,
    pub joint_optimizer_lr_add_on_layers: f64,
    pub joint_optimizer_lr_prototype_vectors: f64,
    pub joint_optimizer_weight_decay: f64,

    pub warm_optimizer_lr_add_on_layers: f64,
    pub warm_optimizer_lr_prototype_vectors: f64,
    pub warm_optimizer_weight_decay: f64,

    pub last_layer_optimizer_lr: f64,

    /// Linear lr warm-up length in optimiser steps, 0 disables it
    pub warmup_batches: usize,
    pub gradient_clipping: Option<f64>,
    pub plateau: PlateauConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            data_dir: "data/cityscapes".to_string(),
            model_dir: "runs/cityscapes".to_string(),
            model_image_size: 64,

            // 19 evaluated Cityscapes classes + void
            num_classes: 20,
            prototypes_per_class: 10,
            prototype_dim: 64,
            feature_channels: 32,
            class_specific: true,

            num_warm_epochs: 5,
            num_epochs: 20,
            batch_size: 16,
            dataloader_n_jobs: -1,
            push_length_multiplier: 1,
            seed: 42,

            loss_weight_crs_ent: 1.0,
            loss_weight_clst: 0.8,
            loss_weight_sep: -0.08,
            loss_weight_l1: 1e-4,

            joint_optimizer_lr_features: 1e-4,
            joint_optimizer_lr_add_on_layers: 3e-3,
            joint_optimizer_lr_prototype_vectors: 3e-3,
            joint_optimizer_weight_decay: 1e-3,

            warm_optimizer_lr_add_on_layers: 3e-3,
            warm_optimizer_lr_prototype_vectors: 3e-3,
            warm_optimizer_weight_decay: 1e-3,

            last_layer_optimizer_lr: 1e-4,

            warmup_batches: 0,
            gradient_clipping: None,
            plateau: PlateauConfig::default(),
        }
    }
}

impl TrainConfig {
    /// Read a JSON config; absent fields keep their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("Cannot read config '{}'", path.display()))?;
        let cfg: Self = serde_json::from_str(&json)
            .with_context(|| format!("Malformed config '{}'", path.display()))?;
        Ok(cfg)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Cannot write config '{}'", path.display()))?;
        tracing::info!("Config saved to '{}'", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.num_classes > 0, "num_classes must be positive");
        ensure!(self.prototypes_per_class > 0, "prototypes_per_class must be positive");
        ensure!(self.prototype_dim > 0, "prototype_dim must be positive");
        ensure!(self.batch_size > 0, "batch_size must be positive");
        // three 2x2 poolings in the backbone
        ensure!(
            self.model_image_size >= 8,
            "model_image_size must be at least 8, got {}",
            self.model_image_size
        );
        for (name, lr) in [
            ("joint_optimizer_lr_features", self.joint_optimizer_lr_features),
            ("joint_optimizer_lr_add_on_layers", self.joint_optimizer_lr_add_on_layers),
            ("joint_optimizer_lr_prototype_vectors", self.joint_optimizer_lr_prototype_vectors),
            ("warm_optimizer_lr_add_on_layers", self.warm_optimizer_lr_add_on_layers),
            ("warm_optimizer_lr_prototype_vectors", self.warm_optimizer_lr_prototype_vectors),
            ("last_layer_optimizer_lr", self.last_layer_optimizer_lr),
        ] {
            ensure!(lr > 0.0, "{name} must be positive, got {lr}");
        }
        if let Some(clip) = self.gradient_clipping {
            ensure!(clip > 0.0, "gradient_clipping must be positive, got {clip}");
        }
        Ok(())
    }

    pub fn loss_weights(&self) -> LossWeights {
        LossWeights {
            crs_ent: self.loss_weight_crs_ent,
            clst: self.loss_weight_clst,
            sep: self.loss_weight_sep,
            l1: self.loss_weight_l1,
        }
    }

    pub fn to_model_config(&self) -> PPNetConfig {
        PPNetConfig::new(self.num_classes, self.prototypes_per_class, self.prototype_dim)
            .with_feature_channels(self.feature_channels)
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        Path::new(&self.model_dir).join("checkpoints")
    }

    pub fn prototypes_dir(&self) -> PathBuf {
        Path::new(&self.model_dir).join("prototypes")
    }
}

// ─── TrainUseCase ─────────────────────────────────────────────────────────────
pub struct TrainUseCase {
    config: TrainConfig,
    last_layer_only: bool,
    resume: Option<String>,
}

impl TrainUseCase {
    pub fn new(config: TrainConfig, last_layer_only: bool, resume: Option<String>) -> Self {
        Self { config, last_layer_only, resume }
    }

    /// Fit, then evaluate. Returns the test split metrics.
    pub fn execute(&self) -> Result<SplitMetrics> {
        let cfg = &self.config;

        // ── Step 1: Validate ─────────────────────────────────────────────────
        cfg.validate()?;
        ensure!(
            !self.last_layer_only || self.resume.is_some(),
            "--last-layer-only needs a checkpoint to resume from (e.g. --resume push)"
        );

        // ── Step 2: Build model ──────────────────────────────────────────────
        let device = burn::backend::wgpu::WgpuDevice::default();
        tracing::info!("Using WGPU device: {:?}", device);

        let ckpt = CheckpointManager::new(cfg.checkpoints_dir())?;
        tracing::info!("Checkpoints go to '{}'", ckpt.dir().display());
        let mut model = cfg.to_model_config().init::<TrainBackend>(&device);
        if let Some(name) = &self.resume {
            model = ckpt.load_model(model, name, &device)?;
        }
        tracing::info!(
            "PPNet ready: {} classes × {} prototypes, dim {}",
            cfg.num_classes,
            cfg.prototypes_per_class,
            cfg.prototype_dim
        );

        // ── Step 3: Save config for push / test ──────────────────────────────
        ckpt.save_config(cfg)?;

        // ── Step 4: Data ─────────────────────────────────────────────────────
        let datamodule = PatchClassificationDataModule::new(cfg);
        datamodule.prepare_data()?;
        tracing::info!("Data loaders use {} workers", datamodule.num_workers());

        // ── Step 5 + 6: Fit and test ─────────────────────────────────────────
        let mut module = PrototypeModule::new(cfg.clone(), model, self.last_layer_only)?;
        module.fit(&datamodule, &device)?;
        module.test(&datamodule, &device)
    }
}
