// ============================================================
// Layer 3 — StepSummary
// ============================================================
// The scalar outcome of one forward pass over a batch.
// Produced by the loss layer (which owns the tensors) and
// consumed by the metric accumulators (which only see f64s).

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepSummary {
    pub n_examples: usize,
    pub n_correct: usize,
    pub cross_entropy: f64,
    pub cluster_cost: f64,
    /// Zero when prototypes are not class specific
    pub separation_cost: f64,
    /// Zero when prototypes are not class specific
    pub avg_separation_cost: f64,
    pub l1: f64,
    pub loss: f64,
}
