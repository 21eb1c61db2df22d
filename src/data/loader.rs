// ============================================================
// Layer 4 — Annotation and Image Loader
// ============================================================
// Reads the per-split patch manifests and decodes patch images.
//
//   {data_dir}/
//     annotations/
//       train.json     [ { "image": "...", "label": 3 }, ... ]
//       val.json
//     <images referenced by the manifests>
//
// Images are decoded with the `image` crate, resized to the
// model input size and returned as CHW floats in [0, 1].

use anyhow::{Context, Result};
use image::imageops::FilterType;
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::domain::patch::PatchAnnotation;

pub const ANNOTATIONS_DIR: &str = "annotations";

pub fn annotations_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(ANNOTATIONS_DIR)
}

/// Load `annotations/{split_key}.json`
pub fn load_annotations(data_dir: &Path, split_key: &str) -> Result<Vec<PatchAnnotation>> {
    let path = annotations_dir(data_dir).join(format!("{split_key}.json"));
    let json = fs::read_to_string(&path)
        .with_context(|| format!("Cannot read annotations '{}'", path.display()))?;
    let annotations: Vec<PatchAnnotation> = serde_json::from_str(&json)
        .with_context(|| format!("Malformed annotations '{}'", path.display()))?;
    tracing::debug!("Loaded {} annotations from '{}'", annotations.len(), path.display());
    Ok(annotations)
}

/// Decode an image and resize it to `size x size`.
/// Returns channel-major RGB values in [0, 1], length 3·size².
pub fn load_patch_image(path: &Path, size: usize) -> Result<Vec<f32>> {
    let img = image::open(path)
        .with_context(|| format!("Cannot decode image '{}'", path.display()))?
        .resize_exact(size as u32, size as u32, FilterType::Triangle)
        .to_rgb8();

    let plane = size * size;
    let mut chw = vec![0.0f32; 3 * plane];
    for (i, pixel) in img.pixels().enumerate() {
        for c in 0..3 {
            chw[c * plane + i] = pixel[c] as f32 / 255.0;
        }
    }
    Ok(chw)
}
