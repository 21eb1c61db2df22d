// ============================================================
// Layer 5 — Reduce-on-Plateau Scheduler
// ============================================================
// Lowers the learning rates of the main optimiser when the
// validation metric stops improving.
//
//   better?     rel/max: metric > best · (1 + threshold)
//               rel/min: metric < best · (1 - threshold)
//               abs/max: metric > best + threshold
//               abs/min: metric < best - threshold
//
//   after more than `patience` epochs without improvement every
//   lr becomes max(lr · factor, min_lr), unless the change is
//   smaller than `eps`; then `cooldown` epochs are not counted.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlateauMode {
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdMode {
    Rel,
    Abs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlateauConfig {
    /// `max` because the scheduler follows validation accuracy
    pub mode: PlateauMode,
    pub factor: f64,
    pub patience: usize,
    pub threshold: f64,
    pub threshold_mode: ThresholdMode,
    pub cooldown: usize,
    pub min_lr: f64,
    pub eps: f64,
}

impl Default for PlateauConfig {
    fn default() -> Self {
        Self {
            mode: PlateauMode::Max,
            factor: 0.1,
            patience: 10,
            threshold: 1e-4,
            threshold_mode: ThresholdMode::Rel,
            cooldown: 0,
            min_lr: 0.0,
            eps: 1e-8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlateauScheduler {
    cfg: PlateauConfig,
    best: f64,
    num_bad_epochs: usize,
    cooldown_counter: usize,
}

impl PlateauScheduler {
    pub fn new(cfg: PlateauConfig) -> Self {
        let best = match cfg.mode {
            PlateauMode::Min => f64::INFINITY,
            PlateauMode::Max => f64::NEG_INFINITY,
        };
        Self { cfg, best, num_bad_epochs: 0, cooldown_counter: 0 }
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    fn is_better(&self, metric: f64) -> bool {
        let t = self.cfg.threshold;
        match (self.cfg.mode, self.cfg.threshold_mode) {
            (PlateauMode::Min, ThresholdMode::Rel) => metric < self.best * (1.0 - t),
            (PlateauMode::Min, ThresholdMode::Abs) => metric < self.best - t,
            (PlateauMode::Max, ThresholdMode::Rel) => metric > self.best * (1.0 + t),
            (PlateauMode::Max, ThresholdMode::Abs) => metric > self.best + t,
        }
    }

    /// Feed one epoch's metric; returns true when `lrs` were reduced
    pub fn step(&mut self, metric: f64, lrs: &mut [f64]) -> bool {
        if self.is_better(metric) {
            self.best = metric;
            self.num_bad_epochs = 0;
        } else {
            self.num_bad_epochs += 1;
        }

        if self.cooldown_counter > 0 {
            self.cooldown_counter -= 1;
            self.num_bad_epochs = 0;
        }

        if self.num_bad_epochs <= self.cfg.patience {
            return false;
        }

        let mut reduced = false;
        for lr in lrs.iter_mut() {
            let new_lr = (*lr * self.cfg.factor).max(self.cfg.min_lr);
            if *lr - new_lr > self.cfg.eps {
                tracing::info!("Reducing learning rate {:.3e} -> {:.3e}", *lr, new_lr);
                *lr = new_lr;
                reduced = true;
            }
        }
        self.cooldown_counter = self.cfg.cooldown;
        self.num_bad_epochs = 0;
        reduced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(patience: usize, cooldown: usize) -> PlateauScheduler {
        PlateauScheduler::new(PlateauConfig { patience, cooldown, ..PlateauConfig::default() })
    }

    #[test]
    fn test_reduces_after_patience_exceeded() {
        let mut s = scheduler(2, 0);
        let mut lrs = vec![1.0, 0.5];
        assert!(!s.step(0.5, &mut lrs)); // best
        assert!(!s.step(0.5, &mut lrs)); // bad 1
        assert!(!s.step(0.4, &mut lrs)); // bad 2
        assert!(s.step(0.4, &mut lrs)); // bad 3 > patience
        assert!((lrs[0] - 0.1).abs() < 1e-12);
        assert!((lrs[1] - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_improvement_resets_counter() {
        let mut s = scheduler(1, 0);
        let mut lrs = vec![1.0];
        s.step(0.5, &mut lrs);
        s.step(0.5, &mut lrs); // bad 1
        s.step(0.6, &mut lrs); // better
        assert!(!s.step(0.6, &mut lrs)); // bad 1
        assert_eq!(lrs[0], 1.0);
        assert_eq!(s.best(), 0.6);
    }

    #[test]
    fn test_cooldown_suppresses_bad_epochs() {
        let mut s = scheduler(0, 2);
        let mut lrs = vec![1.0];
        s.step(0.5, &mut lrs);
        assert!(s.step(0.5, &mut lrs)); // reduce, cooldown 2
        assert!(!s.step(0.5, &mut lrs)); // cooldown
        assert!(!s.step(0.5, &mut lrs)); // cooldown
        assert!(s.step(0.5, &mut lrs));
        assert!((lrs[0] - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_min_lr_floor() {
        let mut s = PlateauScheduler::new(PlateauConfig {
            patience: 0,
            min_lr: 0.05,
            ..PlateauConfig::default()
        });
        let mut lrs = vec![0.1, 0.05];
        s.step(1.0, &mut lrs);
        assert!(s.step(1.0, &mut lrs));
        assert_eq!(lrs, vec![0.05, 0.05]);
        // already at the floor: nothing left to reduce
        assert!(!s.step(1.0, &mut lrs));
    }

    #[test]
    fn test_relative_threshold_in_max_mode() {
        let mut s = scheduler(0, 0);
        let mut lrs = vec![1.0];
        s.step(0.5, &mut lrs);
        // 0.50001 is not above 0.5 * (1 + 1e-4)
        assert!(s.step(0.50001, &mut lrs));
    }

    #[test]
    fn test_config_from_json_uses_defaults() {
        let cfg: PlateauConfig = serde_json::from_str(r#"{ "mode": "min", "patience": 3 }"#).unwrap();
        assert_eq!(cfg.mode, PlateauMode::Min);
        assert_eq!(cfg.patience, 3);
        assert_eq!(cfg.factor, 0.1);
    }
}
