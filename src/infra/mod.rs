// ============================================================
// Layer 6 — Infrastructure Layer
// ============================================================
// Cross-cutting concerns used by several layers:
//
//   checkpoint.rs — Saving and loading PPNet weights with
//                   Burn's CompactRecorder, the accuracy each
//                   checkpoint reached, and the TrainConfig the
//                   run used so push / test can rebuild the model.
//
//   metrics.rs    — Per-split metric accumulation and the
//                   metrics.csv logger.
//
// Reference: Rust Book §9 (Error Handling with anyhow)
//            Burn Book §5 (Checkpointing)

/// Model checkpoint saving and loading
pub mod checkpoint;

/// Split metrics and CSV logging
pub mod metrics;
