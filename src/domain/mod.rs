// ============================================================
// Layer 3 — Domain Layer
// ============================================================
// Plain Rust types describing what a training run is made of:
// which data split a step belongs to, which optimisation phase
// an epoch is in, what an annotated patch looks like, and the
// scalar outcome of one forward pass.
//
// Rules for this layer:
//   - NO Burn framework types
//   - NO file I/O
//   - Only plain structs, enums and their behaviour

/// Data splits that accumulate metrics independently
pub mod split;

/// Warm-up / joint / last-layer phases and their checkpoint stages
pub mod phase;

/// One annotated image patch from a split manifest
pub mod patch;

/// Scalar summary of one forward pass (loss terms + accuracy counts)
pub mod step;
