// ============================================================
// Layer 2 — Application / Use Cases
// ============================================================
// Orchestrates the other layers for each command:
//
//   train  fit a PPNet (warm-up → joint, or last layer only),
//          then evaluate it
//   push   project prototypes onto training patches
//   test   evaluate a saved checkpoint
//
// Rules for this layer:
//   - No ML math or model code here
//   - No argument parsing here (that's Layer 1)
//   - Only workflow coordination

/// Training configuration and the training workflow
pub mod train_use_case;

/// Prototype projection workflow
pub mod push_use_case;

/// Checkpoint evaluation workflow
pub mod test_use_case;
