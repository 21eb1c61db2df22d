// ============================================================
// Layer 4 — Data Pipeline
// ============================================================
// From preprocessed patch files to tensor batches:
//
//   annotations/{split}.json + patch images
//       │
//       ▼
//   loader            → reads manifests, decodes and resizes images
//       │
//       ▼
//   PatchClassificationDataset → Burn Dataset (flip, normalise)
//       │
//       ▼
//   PatchBatcher      → stacks samples into [B,3,S,S] / [B]
//       │
//       ▼
//   PatchClassificationDataModule → train / val / test / push loaders
//
// Reference: Burn Book §4 (Datasets and Dataloaders)

/// Split manifests and image decoding
pub mod loader;

/// Implements Burn's Dataset trait for image patches
pub mod dataset;

/// Implements Burn's Batcher trait to create tensor batches
pub mod batcher;

/// Builds the loaders a run needs
pub mod data_module;
