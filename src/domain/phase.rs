// ============================================================
// Layer 3 — Training Phases
// ============================================================
// A run is either a regular run (warm-up epochs followed by
// joint epochs) or a last-layer-only run that fine-tunes the
// classification layer of an already pushed model.
//
//   epoch:   0 .. num_warm_epochs-1 | num_warm_epochs ..
//   phase:   Warm                   | Joint
//   stage:   warmup (0.0)           | nopush (1.0)
//
//   last-layer-only run:  LastLayer / push (2.0) for every epoch
//
// The stage names prefix the checkpoint files
// (`warmup_best`, `nopush_last`, `push_best`, ...).

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingPhase {
    /// Backbone frozen; add-on layers and prototypes train
    Warm,
    /// Backbone, add-on layers and prototypes train together
    Joint,
    /// Only the last (prototype → class) layer trains
    LastLayer,
}

impl TrainingPhase {
    pub fn for_epoch(epoch: usize, num_warm_epochs: usize, last_layer_only: bool) -> Self {
        if last_layer_only {
            TrainingPhase::LastLayer
        } else if epoch < num_warm_epochs {
            TrainingPhase::Warm
        } else {
            TrainingPhase::Joint
        }
    }

    /// Warm epochs step the warm optimiser; everything else steps the main one
    pub fn uses_warm_optimizer(self) -> bool {
        self == TrainingPhase::Warm
    }

    pub fn stage(self) -> Stage {
        match self {
            TrainingPhase::Warm => Stage::Warmup,
            TrainingPhase::Joint => Stage::NoPush,
            TrainingPhase::LastLayer => Stage::Push,
        }
    }
}

impl fmt::Display for TrainingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrainingPhase::Warm => "warm",
            TrainingPhase::Joint => "joint",
            TrainingPhase::LastLayer => "last layer",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Warmup,
    NoPush,
    Push,
}

impl Stage {
    pub fn key(self) -> &'static str {
        match self {
            Stage::Warmup => "warmup",
            Stage::NoPush => "nopush",
            Stage::Push => "push",
        }
    }

    /// Value logged under `training_stage`
    pub fn value(self) -> f64 {
        match self {
            Stage::Warmup => 0.0,
            Stage::NoPush => 1.0,
            Stage::Push => 2.0,
        }
    }

    /// The plateau scheduler only follows validation accuracy after warm-up
    pub fn steps_scheduler(self) -> bool {
        self != Stage::Warmup
    }

    pub fn best_checkpoint(self) -> String {
        format!("{}_best", self.key())
    }

    pub fn last_checkpoint(self) -> String {
        format!("{}_last", self.key())
    }
}
