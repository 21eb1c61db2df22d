// ============================================================
// Layer 5 — Prototype Training Module
// ============================================================
// Drives a PPNet through one run using Burn's DataLoader and
// the per-group Adam optimisers from optim.rs.
//
// Per epoch:
//   on_train_epoch_start     pick phase, reset every split's metrics
//   training_step × N        loss → backward → step one optimiser
//   validation_step × M      on model.valid() (no autodiff)
//   epoch_end(val)           log averaged val terms
//   on_validation_epoch_end  stage, plateau scheduler, checkpoints
//   epoch_end(train)         log averaged train terms
//
// Burn notes:
//   - Training uses TrainBackend (Autodiff<Wgpu>) for gradients
//   - model.valid() returns the model on the inner backend, so the
//     validation and test loaders are built for B::InnerBackend
//   - Optimiser steps consume the model and hand back a new one

use anyhow::{Context, Result};
use burn::{module::AutodiffModule, prelude::*, tensor::backend::AutodiffBackend};
use std::{fs, path::PathBuf};

use crate::application::train_use_case::TrainConfig;
use crate::data::{batcher::PatchBatch, data_module::PatchClassificationDataModule};
use crate::domain::{phase::TrainingPhase, split::Split, step::StepSummary};
use crate::infra::{
    checkpoint::CheckpointManager,
    metrics::{MetricsLogger, MetricsRegistry, SplitMetrics},
};
use crate::ml::{
    loss::{prototype_loss, LossTerms, LossWeights, PrototypeLossInput},
    model::PPNet,
    optim::{main_groups, warm_groups, warmup_scale, PhaseOptimizer},
    scheduler::PlateauScheduler,
};

pub type TrainBackend = burn::backend::Autodiff<burn::backend::Wgpu>;
pub type EvalBackend = burn::backend::Wgpu;

/// Checkpoints are written whenever accuracy is above this
const TARGET_ACCURACY: f64 = 0.0;

pub struct PrototypeModule<B: AutodiffBackend> {
    cfg: TrainConfig,
    model: PPNet<B>,
    last_layer_only: bool,
    loss_weights: LossWeights,
    warm_optim: PhaseOptimizer<B>,
    main_optim: PhaseOptimizer<B>,
    /// Follows validation accuracy, attached to the main optimiser
    scheduler: PlateauScheduler,
    metrics: MetricsRegistry,
    best_acc: f64,
    current_epoch: usize,
    global_step: usize,
    checkpoints: CheckpointManager,
    logger: MetricsLogger,
    prototypes_dir: PathBuf,
}

impl<B: AutodiffBackend> PrototypeModule<B> {
    pub fn new(cfg: TrainConfig, model: PPNet<B>, last_layer_only: bool) -> Result<Self> {
        let prototypes_dir = cfg.prototypes_dir();
        fs::create_dir_all(&prototypes_dir).with_context(|| {
            format!("Cannot create prototypes directory '{}'", prototypes_dir.display())
        })?;
        let checkpoints = CheckpointManager::new(cfg.checkpoints_dir())?;
        let logger = MetricsLogger::new(&cfg.model_dir)?;
        tracing::info!("Logging metrics to '{}'", logger.csv_path().display());

        let warm_optim = PhaseOptimizer::new("warm", warm_groups(&cfg), cfg.gradient_clipping);
        let main_optim = PhaseOptimizer::new(
            "main",
            main_groups(&cfg, last_layer_only),
            cfg.gradient_clipping,
        );

        Ok(Self {
            loss_weights: cfg.loss_weights(),
            scheduler: PlateauScheduler::new(cfg.plateau.clone()),
            cfg,
            model,
            last_layer_only,
            warm_optim,
            main_optim,
            metrics: MetricsRegistry::default(),
            best_acc: 0.0,
            current_epoch: 0,
            global_step: 0,
            checkpoints,
            logger,
            prototypes_dir,
        })
    }

    pub fn model(&self) -> &PPNet<B> {
        &self.model
    }

    pub fn metrics(&self, split: Split) -> &SplitMetrics {
        self.metrics.get(split)
    }

    pub fn best_acc(&self) -> f64 {
        self.best_acc
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn prototypes_dir(&self) -> &PathBuf {
        &self.prototypes_dir
    }

    pub fn phase(&self, epoch: usize) -> TrainingPhase {
        TrainingPhase::for_epoch(epoch, self.cfg.num_warm_epochs, self.last_layer_only)
    }

    // ─── Hooks ────────────────────────────────────────────────────────────────

    pub fn on_train_epoch_start(&mut self) {
        let epoch = self.current_epoch;
        let phase = self.phase(epoch);

        if phase != TrainingPhase::LastLayer && epoch == 0 {
            tracing::info!("WARM-UP START.");
        }
        let optim = if phase.uses_warm_optimizer() { &self.warm_optim } else { &self.main_optim };
        tracing::info!("\t{}: {} optimiser over {:?}", phase, optim.name(), optim.groups());
        if phase == TrainingPhase::Joint && epoch == self.cfg.num_warm_epochs {
            tracing::info!("WARM-UP END.");
        }

        self.metrics.reset_all();
    }

    pub fn training_step(&mut self, batch: PatchBatch<B>) -> Result<StepSummary> {
        let LossTerms { loss, summary } = self.compute_loss(&self.model, batch);
        self.metrics.get_mut(Split::Train).record(&summary);

        let optim = if self.phase(self.current_epoch).uses_warm_optimizer() {
            &mut self.warm_optim
        } else {
            &mut self.main_optim
        };
        let scale = warmup_scale(self.global_step, self.cfg.warmup_batches);

        let grads = loss.backward();
        self.model = optim.step(self.model.clone(), grads, scale);
        let lr = optim.lr(scale);

        self.logger
            .log(self.current_epoch, self.global_step, "train_loss_step", summary.loss)?;
        self.logger.log(self.current_epoch, self.global_step, "lr", lr)?;
        self.global_step += 1;
        Ok(summary)
    }

    pub fn validation_step(&mut self, model: &PPNet<B::InnerBackend>, batch: PatchBatch<B::InnerBackend>) {
        let LossTerms { summary, .. } = self.compute_loss(model, batch);
        self.metrics.get_mut(Split::Val).record(&summary);
    }

    pub fn test_step(&mut self, model: &PPNet<B::InnerBackend>, batch: PatchBatch<B::InnerBackend>) {
        let LossTerms { summary, .. } = self.compute_loss(model, batch);
        self.metrics.get_mut(Split::Test).record(&summary);
    }

    pub fn on_validation_epoch_end(&mut self) -> Result<()> {
        let val = *self.metrics.get(Split::Val);
        let val_acc = val.accuracy();
        let val_loss = val.mean_loss();

        let stage = self.phase(self.current_epoch).stage();
        self.log("training_stage", stage.value())?;

        if stage.steps_scheduler() {
            let mut lrs = self.main_optim.lrs();
            if self.scheduler.step(val_acc, &mut lrs) {
                self.main_optim.set_lrs(&lrs);
            }
            tracing::debug!("Plateau best {:.4}, lrs {:?}", self.scheduler.best(), self.main_optim.lrs());
        }

        if val_acc > self.best_acc {
            tracing::info!("Saving best model, accuracy: {}, loss: {}", val_acc, val_loss);
            self.best_acc = val_acc;
            self.checkpoints.save_model_w_condition(
                &self.model,
                &stage.best_checkpoint(),
                val_acc,
                TARGET_ACCURACY,
                self.current_epoch,
            )?;
        }
        self.checkpoints.save_model_w_condition(
            &self.model,
            &stage.last_checkpoint(),
            val_acc,
            TARGET_ACCURACY,
            self.current_epoch,
        )?;
        Ok(())
    }

    /// Log the split's batch-averaged terms, its accuracy and two
    /// model-wide diagnostics
    pub fn epoch_end(&mut self, split: Split) -> Result<()> {
        let metrics = *self.metrics.get(split);
        for (key, value) in metrics.averages() {
            self.log(&format!("{}/{}", split.key(), key), value)?;
        }
        self.log(&format!("{}/accuracy", split.key()), metrics.accuracy())?;
        let l1 = self.model.last_layer_l1();
        self.log("l1", l1)?;
        let pair_distance = self.model.mean_prototype_pair_distance();
        self.log("p dist pair", pair_distance)?;
        Ok(())
    }

    // ─── Loops ────────────────────────────────────────────────────────────────

    pub fn fit(&mut self, datamodule: &PatchClassificationDataModule, device: &B::Device) -> Result<()> {
        let train_loader = datamodule.train_dataloader::<B>(device)?;
        let val_loader = datamodule.val_dataloader::<B::InnerBackend>(device)?;

        for epoch in 0..self.cfg.num_epochs {
            self.current_epoch = epoch;
            self.on_train_epoch_start();

            for batch in train_loader.iter() {
                self.training_step(batch)?;
            }

            let model_valid = self.model.valid();
            for batch in val_loader.iter() {
                self.validation_step(&model_valid, batch);
            }
            self.epoch_end(Split::Val)?;
            self.on_validation_epoch_end()?;
            self.epoch_end(Split::Train)?;

            let train = self.metrics.get(Split::Train);
            let val = self.metrics.get(Split::Val);
            println!(
                "Epoch {:>3}/{} [{}] | train_loss={:.4} | val_loss={:.4} | train_acc={:.1}% | val_acc={:.1}%",
                epoch + 1,
                self.cfg.num_epochs,
                self.phase(epoch),
                train.mean_loss(),
                val.mean_loss(),
                train.accuracy() * 100.0,
                val.accuracy() * 100.0,
            );
        }

        tracing::info!("Training complete! Best validation accuracy: {:.4}", self.best_acc);
        Ok(())
    }

    pub fn test(&mut self, datamodule: &PatchClassificationDataModule, device: &B::Device) -> Result<SplitMetrics> {
        let test_loader = datamodule.test_dataloader::<B::InnerBackend>(device)?;
        let model_valid = self.model.valid();
        for batch in test_loader.iter() {
            self.test_step(&model_valid, batch);
        }
        self.epoch_end(Split::Test)?;

        let test = *self.metrics.get(Split::Test);
        println!(
            "Test | loss={:.4} | accuracy={:.1}% | {} patches",
            test.mean_loss(),
            test.accuracy() * 100.0,
            test.n_examples
        );
        Ok(test)
    }

    // ─── Helpers ──────────────────────────────────────────────────────────────

    fn compute_loss<BB: Backend>(&self, model: &PPNet<BB>, batch: PatchBatch<BB>) -> LossTerms<BB> {
        compute_loss(model, batch, self.cfg.class_specific, &self.loss_weights)
    }

    fn log(&mut self, key: &str, value: f64) -> Result<()> {
        self.logger.log(self.current_epoch, self.global_step, key, value)
    }
}

/// Forward one batch and evaluate the prototype loss on it
pub fn compute_loss<B: Backend>(
    model: &PPNet<B>,
    batch: PatchBatch<B>,
    class_specific: bool,
    weights: &LossWeights,
) -> LossTerms<B> {
    let device = batch.images.device();
    let (logits, min_distances) = model.forward(batch.images);
    prototype_loss(
        PrototypeLossInput {
            logits,
            min_distances,
            targets: batch.targets,
            class_identity: model.prototype_class_identity(&device),
            last_layer_weight: model.last_layer.weight.val(),
            max_dist: model.max_dist(),
        },
        class_specific,
        weights,
    )
}
