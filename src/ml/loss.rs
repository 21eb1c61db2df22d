// ============================================================
// Layer 5 — Prototype Loss
// ============================================================
// loss = w_ce   · cross_entropy
//      + w_clst · cluster_cost
//      + w_sep  · separation_cost      (class-specific only)
//      + w_l1   · l1
//
// With `max_dist` the largest possible prototype distance and
// `correct[b, j] = 1` iff prototype j belongs to target[b]:
//
//   cluster_cost    = mean_b( max_dist - max_j((max_dist - d) · correct) )
//                     with void targets (class 0) contributing 0
//   separation_cost = mean_b( max_dist - max_j((max_dist - d) · wrong) )
//   avg_separation  = mean_b( Σ_j d · wrong / Σ_j wrong )     (metric only)
//   l1              = ‖W ⊙ (1 - identity)‖₁
//
// Class-agnostic prototypes use the plain nearest-prototype
// distance as cluster cost and the full ‖W‖₁.

use burn::{nn::loss::CrossEntropyLossConfig, prelude::*};
use serde::{Deserialize, Serialize};

use crate::domain::patch::VOID_CLASS;
use crate::domain::step::StepSummary;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossWeights {
    pub crs_ent: f64,
    pub clst: f64,
    pub sep: f64,
    pub l1: f64,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self { crs_ent: 1.0, clst: 0.8, sep: -0.08, l1: 1e-4 }
    }
}

/// Everything the loss computation needs besides the batch
pub struct PrototypeLossInput<B: Backend> {
    pub logits: Tensor<B, 2>,
    pub min_distances: Tensor<B, 2>,
    pub targets: Tensor<B, 1, Int>,
    /// [P, C]
    pub class_identity: Tensor<B, 2>,
    /// [P, C]
    pub last_layer_weight: Tensor<B, 2>,
    pub max_dist: f64,
}

pub struct LossTerms<B: Backend> {
    /// Weighted total, still attached to the autodiff graph
    pub loss: Tensor<B, 1>,
    pub summary: StepSummary,
}

pub fn prototype_loss<B: Backend>(
    input: PrototypeLossInput<B>,
    class_specific: bool,
    weights: &LossWeights,
) -> LossTerms<B> {
    let PrototypeLossInput {
        logits,
        min_distances,
        targets,
        class_identity,
        last_layer_weight,
        max_dist,
    } = input;
    let device = logits.device();
    let [batch, _] = logits.dims();

    let cross_entropy = CrossEntropyLossConfig::new()
        .init(&device)
        .forward(logits.clone(), targets.clone());

    let (n_examples, n_correct) = accuracy_counts(logits, targets.clone());

    let mut summary = StepSummary {
        n_examples,
        n_correct,
        cross_entropy: scalar(&cross_entropy),
        ..StepSummary::default()
    };

    let loss = if class_specific {
        // [P, B] → [B, P]
        let correct = class_identity.clone().select(1, targets.clone()).transpose();
        let wrong = correct.clone().neg().add_scalar(1.0);
        let inverted = min_distances.clone().neg().add_scalar(max_dist);

        let inverted_to_target = (inverted.clone() * correct)
            .max_dim(1)
            .reshape([batch])
            .mask_fill(targets.equal_elem(VOID_CLASS as i64), max_dist);
        let cluster_cost = inverted_to_target.neg().add_scalar(max_dist).mean();

        let inverted_to_nontarget = (inverted * wrong.clone()).max_dim(1).reshape([batch]);
        let separation_cost = inverted_to_nontarget.neg().add_scalar(max_dist).mean();

        let avg_separation_cost = ((min_distances * wrong.clone()).sum_dim(1) / wrong.sum_dim(1))
            .reshape([batch])
            .mean();

        let l1_mask = class_identity.neg().add_scalar(1.0);
        let l1 = (last_layer_weight * l1_mask).abs().sum();

        summary.cluster_cost = scalar(&cluster_cost);
        summary.separation_cost = scalar(&separation_cost);
        summary.avg_separation_cost = scalar(&avg_separation_cost);
        summary.l1 = scalar(&l1);

        cross_entropy * weights.crs_ent
            + cluster_cost * weights.clst
            + separation_cost * weights.sep
            + l1 * weights.l1
    } else {
        let cluster_cost = min_distances.min_dim(1).reshape([batch]).mean();
        let l1 = last_layer_weight.abs().sum();

        summary.cluster_cost = scalar(&cluster_cost);
        summary.l1 = scalar(&l1);

        cross_entropy * weights.crs_ent + cluster_cost * weights.clst + l1 * weights.l1
    };

    summary.loss = scalar(&loss);
    LossTerms { loss, summary }
}

/// (batch size, number of argmax predictions equal to the target)
pub fn accuracy_counts<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> (usize, usize) {
    let [batch, _] = logits.dims();
    let predicted = logits.argmax(1).reshape([batch]);
    let correct: i64 = predicted.equal(targets).int().sum().into_scalar().elem::<i64>();
    (batch, correct as usize)
}

fn scalar<B: Backend>(t: &Tensor<B, 1>) -> f64 {
    t.clone().detach().into_scalar().elem::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::model::class_identity;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    const EPS: f64 = 1e-5;

    fn floats(values: &[f32], shape: [usize; 2]) -> Tensor<TestBackend, 2> {
        Tensor::<TestBackend, 1>::from_floats(values, &Default::default()).reshape(shape)
    }

    fn ints(values: &[i32]) -> Tensor<TestBackend, 1, Int> {
        Tensor::<TestBackend, 1, Int>::from_ints(values, &Default::default())
    }

    /// 2 classes, 1 prototype each, max_dist 4
    fn input(targets: &[i32], distances: &[f32]) -> PrototypeLossInput<TestBackend> {
        let batch = targets.len();
        PrototypeLossInput {
            logits: floats(&vec![0.0f32; batch * 2], [batch, 2]),
            min_distances: floats(distances, [batch, 2]),
            targets: ints(targets),
            class_identity: class_identity::<TestBackend>(2, 1, &Default::default()),
            last_layer_weight: floats(&[1.0, -0.5, -0.5, 1.0], [2, 2]),
            max_dist: 4.0,
        }
    }

    fn weights() -> LossWeights {
        LossWeights { crs_ent: 1.0, clst: 0.0, sep: 0.0, l1: 0.0 }
    }

    #[test]
    fn test_cluster_and_separation_costs() {
        // sample 0 is class 1: own prototype at 1.0, other at 3.0
        let terms = prototype_loss(input(&[1], &[3.0, 1.0]), true, &weights());
        assert!((terms.summary.cluster_cost - 1.0).abs() < EPS);
        assert!((terms.summary.separation_cost - 3.0).abs() < EPS);
        assert!((terms.summary.avg_separation_cost - 3.0).abs() < EPS);
    }

    #[test]
    fn test_void_targets_do_not_contribute_to_cluster_cost() {
        // sample 0 is void (class 0), sample 1 is class 1 at distance 2
        let terms = prototype_loss(input(&[0, 1], &[3.0, 1.0, 4.0, 2.0]), true, &weights());
        // (0 + 2) / 2
        assert!((terms.summary.cluster_cost - 1.0).abs() < EPS);
        // void still counts for separation: (1 + 4) / 2
        assert!((terms.summary.separation_cost - 2.5).abs() < EPS);
    }

    #[test]
    fn test_l1_masks_own_class_connections() {
        let terms = prototype_loss(input(&[1], &[3.0, 1.0]), true, &weights());
        assert!((terms.summary.l1 - 1.0).abs() < EPS);

        let terms = prototype_loss(input(&[1], &[3.0, 1.0]), false, &weights());
        assert!((terms.summary.l1 - 3.0).abs() < EPS);
    }

    #[test]
    fn test_class_agnostic_cluster_cost_is_nearest_prototype() {
        let terms = prototype_loss(input(&[0, 1], &[3.0, 1.0, 0.5, 2.0]), false, &weights());
        assert!((terms.summary.cluster_cost - 0.75).abs() < EPS);
        assert_eq!(terms.summary.separation_cost, 0.0);
        assert_eq!(terms.summary.avg_separation_cost, 0.0);
    }

    #[test]
    fn test_weighted_total() {
        let w = LossWeights { crs_ent: 1.0, clst: 0.5, sep: -0.25, l1: 2.0 };
        let terms = prototype_loss(input(&[1], &[3.0, 1.0]), true, &w);
        // uniform logits over 2 classes → CE = ln 2
        let expected = 2f64.ln() + 0.5 * 1.0 - 0.25 * 3.0 + 2.0 * 1.0;
        assert!((terms.summary.cross_entropy - 2f64.ln()).abs() < EPS);
        assert!((terms.summary.loss - expected).abs() < 1e-4);
    }

    #[test]
    fn test_class_agnostic_total_weights_l1_by_l1_weight() {
        let w = LossWeights { crs_ent: 1.0, clst: 0.5, sep: -0.25, l1: 2.0 };
        let terms = prototype_loss(input(&[1], &[3.0, 1.0]), false, &w);
        // nearest prototype 1.0, ‖W‖₁ = 3.0, separation ignored
        let expected = 2f64.ln() + 0.5 * 1.0 + 2.0 * 3.0;
        assert!((terms.summary.loss - expected).abs() < 1e-4);
    }

    #[test]
    fn test_accuracy_counts() {
        let logits = floats(&[2.0, 1.0, 0.0, 3.0, 5.0, 1.0], [3, 2]);
        let (n, correct) = accuracy_counts(logits, ints(&[0, 1, 1]));
        assert_eq!(n, 3);
        assert_eq!(correct, 2);
    }
}
