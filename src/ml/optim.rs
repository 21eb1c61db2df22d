// ============================================================
// Layer 5 — Parameter Groups and Phase Optimisers
// ============================================================
// The network is optimised in parameter groups, each with its
// own learning rate and weight decay:
//
//   warm optimiser   add_on_layers (warm lr, warm wd)
//                    prototype_vectors (warm lr)
//
//   main optimiser   features (joint lr, joint wd)
//                    add_on_layers (joint lr, joint wd)
//                    prototype_vectors (joint lr)
//
//   main optimiser   last_layer (last layer lr)
//   (last-layer-only run)
//
// Each group gets its own Adam (β = 0.9/0.999, ε = 1e-8) and
// only receives the gradients of its own sub-module, so groups
// not in the stepped optimiser are effectively frozen.
//
// Gradient clipping uses one L2 norm over every gradient the
// optimiser is about to apply:
//
//   total = sqrt(Σ_groups Σ_params ‖g‖²)
//   g ← g · min(1, max_norm / (total + 1e-6))

use burn::{
    module::{Module, ModuleVisitor, ParamId},
    optim::{
        adaptor::OptimizerAdaptor, decay::WeightDecayConfig, Adam, AdamConfig, GradientsParams,
        Optimizer,
    },
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use serde::{Deserialize, Serialize};

use crate::application::train_use_case::TrainConfig;
use crate::ml::model::PPNet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamGroup {
    Features,
    AddOnLayers,
    PrototypeVectors,
    LastLayer,
}

impl ParamGroup {
    /// Take this group's gradients out of the backward pass result
    pub fn gradients<B: AutodiffBackend>(
        self,
        grads: &mut B::Gradients,
        model: &PPNet<B>,
    ) -> GradientsParams {
        match self {
            ParamGroup::Features => GradientsParams::from_module(grads, &model.features),
            ParamGroup::AddOnLayers => GradientsParams::from_module(grads, &model.add_on_layers),
            ParamGroup::PrototypeVectors => {
                GradientsParams::from_module(grads, &model.prototype_vectors)
            }
            ParamGroup::LastLayer => GradientsParams::from_module(grads, &model.last_layer),
        }
    }

    fn visit<B: AutodiffBackend, V: ModuleVisitor<B>>(self, model: &PPNet<B>, visitor: &mut V) {
        match self {
            ParamGroup::Features => model.features.visit(visitor),
            ParamGroup::AddOnLayers => model.add_on_layers.visit(visitor),
            ParamGroup::PrototypeVectors => model.prototype_vectors.visit(visitor),
            ParamGroup::LastLayer => model.last_layer.visit(visitor),
        }
    }
}

// ─── Global-norm gradient clipping ───────────────────────────────────────────

struct SquaredNorm<'a> {
    grads: &'a GradientsParams,
    total: f64,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for SquaredNorm<'_> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(id) {
            self.total += grad.powf_scalar(2.0).sum().into_scalar().elem::<f64>();
        }
    }
}

struct Rescale<'a> {
    grads: &'a mut GradientsParams,
    factor: f64,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for Rescale<'_> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) {
            self.grads.register(id, grad.mul_scalar(self.factor));
        }
    }
}

/// Squared L2 norm of one group's gradients
pub fn group_squared_norm<B: AutodiffBackend>(
    group: ParamGroup,
    model: &PPNet<B>,
    grads: &GradientsParams,
) -> f64 {
    let mut visitor = SquaredNorm { grads, total: 0.0 };
    group.visit(model, &mut visitor);
    visitor.total
}

/// Factor that brings `total_norm` down to `max_norm`; never above 1
pub fn clip_factor(total_norm: f64, max_norm: f64) -> f64 {
    (max_norm / (total_norm + 1e-6)).min(1.0)
}

/// Scale every group's gradients by the same factor so that their
/// joint L2 norm is at most `max_norm`. Returns the norm before
/// clipping.
pub fn clip_global_norm<B: AutodiffBackend>(
    model: &PPNet<B>,
    groups: &mut [(ParamGroup, GradientsParams)],
    max_norm: f64,
) -> f64 {
    let total = groups
        .iter()
        .map(|(group, grads)| group_squared_norm(*group, model, grads))
        .sum::<f64>()
        .sqrt();
    let factor = clip_factor(total, max_norm);
    if factor < 1.0 {
        for (group, grads) in groups.iter_mut() {
            group.visit(model, &mut Rescale { grads, factor });
        }
    }
    total
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupSpec {
    pub group: ParamGroup,
    pub lr: f64,
    pub weight_decay: Option<f64>,
}

impl GroupSpec {
    pub fn new(group: ParamGroup, lr: f64) -> Self {
        Self { group, lr, weight_decay: None }
    }

    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = (weight_decay > 0.0).then_some(weight_decay);
        self
    }
}

pub fn warm_groups(cfg: &TrainConfig) -> Vec<GroupSpec> {
    vec![
        GroupSpec::new(ParamGroup::AddOnLayers, cfg.warm_optimizer_lr_add_on_layers)
            .with_weight_decay(cfg.warm_optimizer_weight_decay),
        GroupSpec::new(ParamGroup::PrototypeVectors, cfg.warm_optimizer_lr_prototype_vectors),
    ]
}

pub fn main_groups(cfg: &TrainConfig, last_layer_only: bool) -> Vec<GroupSpec> {
    if last_layer_only {
        return vec![GroupSpec::new(ParamGroup::LastLayer, cfg.last_layer_optimizer_lr)];
    }
    vec![
        GroupSpec::new(ParamGroup::Features, cfg.joint_optimizer_lr_features)
            .with_weight_decay(cfg.joint_optimizer_weight_decay),
        // biases are regularised too
        GroupSpec::new(ParamGroup::AddOnLayers, cfg.joint_optimizer_lr_add_on_layers)
            .with_weight_decay(cfg.joint_optimizer_weight_decay),
        GroupSpec::new(ParamGroup::PrototypeVectors, cfg.joint_optimizer_lr_prototype_vectors),
    ]
}

/// Linear learning-rate warm-up over the first `warmup_batches`
/// optimiser steps; 1.0 afterwards or when disabled.
pub fn warmup_scale(step: usize, warmup_batches: usize) -> f64 {
    if warmup_batches > 0 && step < warmup_batches {
        ((step + 1) as f64 / warmup_batches as f64).min(1.0)
    } else {
        1.0
    }
}

struct GroupOptimizer<B: AutodiffBackend> {
    spec: GroupSpec,
    /// Current base lr; the plateau scheduler lowers it
    lr: f64,
    optim: OptimizerAdaptor<Adam, PPNet<B>, B>,
}

pub struct PhaseOptimizer<B: AutodiffBackend> {
    name: &'static str,
    groups: Vec<GroupOptimizer<B>>,
    gradient_clipping: Option<f64>,
}

impl<B: AutodiffBackend> PhaseOptimizer<B> {
    pub fn new(name: &'static str, specs: Vec<GroupSpec>, gradient_clipping: Option<f64>) -> Self {
        let groups = specs
            .into_iter()
            .map(|spec| {
                let optim = AdamConfig::new()
                    .with_epsilon(1e-8)
                    .with_weight_decay(spec.weight_decay.map(|wd| WeightDecayConfig::new(wd as f32)))
                    .init::<B, PPNet<B>>();
                GroupOptimizer { spec, lr: spec.lr, optim }
            })
            .collect();
        Self { name, groups, gradient_clipping }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn groups(&self) -> Vec<ParamGroup> {
        self.groups.iter().map(|g| g.spec.group).collect()
    }

    /// Step every group with its own gradients at `lr * scale`.
    /// Gradients of groups this optimiser does not own are dropped.
    pub fn step(&mut self, mut model: PPNet<B>, mut grads: B::Gradients, scale: f64) -> PPNet<B> {
        let mut params: Vec<(ParamGroup, GradientsParams)> = self
            .groups
            .iter()
            .map(|g| (g.spec.group, g.spec.group.gradients(&mut grads, &model)))
            .collect();
        if let Some(max_norm) = self.gradient_clipping {
            let norm = clip_global_norm(&model, &mut params, max_norm);
            tracing::trace!("{} grad norm {:.4} (max {})", self.name, norm, max_norm);
        }
        for (group, (_, group_grads)) in self.groups.iter_mut().zip(params) {
            model = group.optim.step(group.lr * scale, model, group_grads);
        }
        model
    }

    /// Effective lr of the first group, the one reported as `lr`
    pub fn lr(&self, scale: f64) -> f64 {
        self.groups.first().map(|g| g.lr * scale).unwrap_or(0.0)
    }

    pub fn lrs(&self) -> Vec<f64> {
        self.groups.iter().map(|g| g.lr).collect()
    }

    pub fn set_lrs(&mut self, lrs: &[f64]) {
        for (group, lr) in self.groups.iter_mut().zip(lrs) {
            group.lr = *lr;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::model::PPNetConfig;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray>;

    #[test]
    fn test_warmup_scale_is_linear() {
        assert_eq!(warmup_scale(0, 4), 0.25);
        assert_eq!(warmup_scale(1, 4), 0.5);
        assert_eq!(warmup_scale(3, 4), 1.0);
        assert_eq!(warmup_scale(10, 4), 1.0);
    }

    #[test]
    fn test_warmup_disabled() {
        assert_eq!(warmup_scale(0, 0), 1.0);
    }

    #[test]
    fn test_group_layout() {
        let cfg = TrainConfig::default();
        let warm: Vec<_> = warm_groups(&cfg).iter().map(|g| g.group).collect();
        assert_eq!(warm, vec![ParamGroup::AddOnLayers, ParamGroup::PrototypeVectors]);

        let joint: Vec<_> = main_groups(&cfg, false).iter().map(|g| g.group).collect();
        assert_eq!(
            joint,
            vec![ParamGroup::Features, ParamGroup::AddOnLayers, ParamGroup::PrototypeVectors]
        );

        let last = main_groups(&cfg, true);
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].group, ParamGroup::LastLayer);
        assert_eq!(last[0].lr, cfg.last_layer_optimizer_lr);
        assert_eq!(last[0].weight_decay, None);
    }

    #[test]
    fn test_zero_weight_decay_is_disabled() {
        let spec = GroupSpec::new(ParamGroup::Features, 1e-4).with_weight_decay(0.0);
        assert_eq!(spec.weight_decay, None);
        let spec = GroupSpec::new(ParamGroup::Features, 1e-4).with_weight_decay(1e-3);
        assert_eq!(spec.weight_decay, Some(1e-3));
    }

    #[test]
    fn test_step_only_updates_owned_groups() {
        let device = Default::default();
        let model = PPNetConfig::new(2, 1, 4)
            .with_feature_channels(2)
            .init::<TestBackend>(&device);
        let before_last = model.last_layer.weight.val().into_data();
        let before_protos = model.prototype_vectors.val().into_data();

        let mut optim = PhaseOptimizer::<TestBackend>::new(
            "warm",
            vec![GroupSpec::new(ParamGroup::PrototypeVectors, 0.1)],
            None,
        );

        let images = Tensor::<TestBackend, 4>::ones([2, 3, 8, 8], &device);
        let (logits, _) = model.forward(images);
        let grads = logits.sum().backward();
        let model = optim.step(model, grads, 1.0);

        assert_eq!(model.last_layer.weight.val().into_data(), before_last);
        assert_ne!(model.prototype_vectors.val().into_data(), before_protos);
    }

    #[test]
    fn test_clip_factor() {
        assert_eq!(clip_factor(0.5, 1.0), 1.0);
        assert!((clip_factor(4.0, 1.0) - 0.25).abs() < 1e-6);
    }

    fn group_grads(
        model: &PPNet<TestBackend>,
        groups: &[ParamGroup],
    ) -> Vec<(ParamGroup, GradientsParams)> {
        let images = Tensor::<TestBackend, 4>::ones([2, 3, 8, 8], &Default::default());
        let (logits, min_distances) = model.forward(images);
        // uneven weighting so the groups end up with different norms
        let mut grads = (logits.sum().mul_scalar(50.0) + min_distances.sum()).backward();
        groups.iter().map(|&g| (g, g.gradients(&mut grads, model))).collect()
    }

    #[test]
    fn test_clipping_uses_one_norm_across_groups() {
        let model = PPNetConfig::new(2, 1, 4)
            .with_feature_channels(2)
            .init::<TestBackend>(&Default::default());
        let mut grads =
            group_grads(&model, &[ParamGroup::LastLayer, ParamGroup::PrototypeVectors]);

        let before: Vec<f64> = grads
            .iter()
            .map(|(g, p)| group_squared_norm(*g, &model, p).sqrt())
            .collect();
        let total = before.iter().map(|n| n * n).sum::<f64>().sqrt();
        assert!(before[0] > 0.0 && before[1] > 0.0);
        assert!((before[0] - before[1]).abs() > 1e-6);

        let max_norm = total / 4.0;
        let reported = clip_global_norm(&model, &mut grads, max_norm);
        assert!((reported - total).abs() < 1e-3 * total);

        let after: Vec<f64> = grads
            .iter()
            .map(|(g, p)| group_squared_norm(*g, &model, p).sqrt())
            .collect();
        let clipped_total = after.iter().map(|n| n * n).sum::<f64>().sqrt();
        assert!((clipped_total - max_norm).abs() < 1e-3 * max_norm);
        // every gradient shrinks by the same factor
        for (b, a) in before.iter().zip(&after) {
            assert!((a / b - 0.25).abs() < 1e-3, "ratio {}", a / b);
        }
    }

    #[test]
    fn test_clipping_below_threshold_is_a_no_op() {
        let model = PPNetConfig::new(2, 1, 4)
            .with_feature_channels(2)
            .init::<TestBackend>(&Default::default());
        let mut grads = group_grads(&model, &[ParamGroup::LastLayer]);
        let before = group_squared_norm(ParamGroup::LastLayer, &model, &grads[0].1);

        clip_global_norm(&model, &mut grads, 1e9);
        let after = group_squared_norm(ParamGroup::LastLayer, &model, &grads[0].1);
        assert_eq!(before, after);
    }

    #[test]
    fn test_set_lrs() {
        let mut optim = PhaseOptimizer::<TestBackend>::new(
            "main",
            main_groups(&TrainConfig::default(), false),
            Some(1.0),
        );
        optim.set_lrs(&[1.0, 2.0, 3.0]);
        assert_eq!(optim.lrs(), vec![1.0, 2.0, 3.0]);
        assert_eq!(optim.lr(0.5), 0.5);
        assert_eq!(optim.name(), "main");
    }
}
