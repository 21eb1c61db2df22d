// ============================================================
// Layer 3 — PatchAnnotation
// ============================================================
// One entry of `annotations/{split}.json`:
//
//   [
//     { "image": "img_with_margin_224/train/000123.png", "label": 7 },
//     ...
//   ]
//
// `image` is relative to the dataset root. Label 0 is the
// `void` class: it is classified like any other class but
// ignored by the cluster cost.

use serde::{Deserialize, Serialize};

/// Class id reserved for unlabelled / void pixels
pub const VOID_CLASS: usize = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchAnnotation {
    pub image: String,
    pub label: usize,
}

impl PatchAnnotation {
    pub fn new(image: impl Into<String>, label: usize) -> Self {
        Self { image: image.into(), label }
    }

    pub fn is_void(&self) -> bool {
        self.label == VOID_CLASS
    }
}
