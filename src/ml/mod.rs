// ============================================================
// Layer 5 — ML / Model Layer (Burn)
// ============================================================
// Everything that builds, differentiates or optimises tensors:
//
//   model.rs      — PPNet: backbone, add-on layers, prototype
//                   vectors and the prototype → class layer
//
//   loss.rs       — cross entropy + cluster + separation + L1
//
//   optim.rs      — parameter groups, warm / main optimisers,
//                   linear lr warm-up
//
//   scheduler.rs  — reduce-on-plateau over validation accuracy
//
//   trainer.rs    — the training module: phases, steps, epoch
//                   hooks, checkpoints and the fit / test loops
//
//   push.rs       — projection of prototypes onto training patches
//
// Reference: Burn Book §3 (Building Blocks), §5 (Training)
//            Chen et al. (2019) This Looks Like That

/// Prototypical part network
pub mod model;

/// Multi-term prototype loss
pub mod loss;

/// Group-wise Adam optimisers and lr warm-up
pub mod optim;

/// Reduce-on-plateau learning rate scheduler
pub mod scheduler;

/// Training orchestration
pub mod trainer;

/// Prototype projection
pub mod push;
