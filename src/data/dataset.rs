use anyhow::{ensure, Context, Result};
use burn::data::dataset::Dataset;
use rand::Rng;
use std::path::PathBuf;

use crate::data::loader::{load_annotations, load_patch_image};
use crate::domain::patch::PatchAnnotation;

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// One decoded patch: CHW pixels, class label and the index of its
/// annotation in the split manifest.
#[derive(Debug, Clone)]
pub struct PatchSample {
    pub pixels: Vec<f32>,
    pub label: usize,
    pub index: usize,
}

#[derive(Debug, Clone)]
pub struct DatasetOptions {
    pub split_key: String,
    /// Evaluation mode: no shuffling, no augmentation
    pub is_eval: bool,
    /// Push mode: pixels stay in [0, 1] (no normalisation)
    pub push_prototypes: bool,
    /// The manifest is repeated this many times
    pub length_multiplier: usize,
    pub model_image_size: usize,
}

impl DatasetOptions {
    pub fn new(split_key: impl Into<String>, is_eval: bool, model_image_size: usize) -> Self {
        Self {
            split_key: split_key.into(),
            is_eval,
            push_prototypes: false,
            length_multiplier: 1,
            model_image_size,
        }
    }

    pub fn for_push(mut self, length_multiplier: usize) -> Self {
        self.push_prototypes = true;
        self.length_multiplier = length_multiplier.max(1);
        self
    }
}

/// Patch classification split backed by `annotations/{split}.json`.
///
/// Images are decoded lazily in `get`. A patch that fails to decode
/// is logged and yields `None`, which ends the loader's epoch early,
/// so every referenced file is checked for existence up front.
#[derive(Debug)]
pub struct PatchClassificationDataset {
    data_dir: PathBuf,
    options: DatasetOptions,
    annotations: Vec<PatchAnnotation>,
}

impl PatchClassificationDataset {
    pub fn new(data_dir: impl Into<PathBuf>, options: DatasetOptions) -> Result<Self> {
        let data_dir = data_dir.into();
        let annotations = load_annotations(&data_dir, &options.split_key)?;
        Self::from_annotations(data_dir, options, annotations)
    }

    pub fn from_annotations(
        data_dir: PathBuf,
        options: DatasetOptions,
        annotations: Vec<PatchAnnotation>,
    ) -> Result<Self> {
        // header-only read: catches missing and undecodable files
        for a in &annotations {
            let path = data_dir.join(&a.image);
            image::image_dimensions(&path).with_context(|| {
                format!(
                    "Split '{}' references a missing or unreadable image '{}'",
                    options.split_key,
                    path.display()
                )
            })?;
        }
        ensure!(options.model_image_size > 0, "model_image_size must be positive");

        tracing::info!(
            "Split '{}': {} patches (eval={}, push={}, x{})",
            options.split_key,
            annotations.len(),
            options.is_eval,
            options.push_prototypes,
            options.length_multiplier
        );
        Ok(Self { data_dir, options, annotations })
    }

    pub fn is_eval(&self) -> bool {
        self.options.is_eval
    }

    pub fn options(&self) -> &DatasetOptions {
        &self.options
    }

    fn load(&self, index: usize) -> Result<PatchSample> {
        let annotation = &self.annotations[index];
        let size = self.options.model_image_size;
        let mut pixels = load_patch_image(&self.data_dir.join(&annotation.image), size)?;

        if !self.options.is_eval && rand::thread_rng().gen_bool(0.5) {
            flip_horizontal(&mut pixels, size);
        }
        if !self.options.push_prototypes {
            normalize(&mut pixels, size);
        }

        Ok(PatchSample { pixels, label: annotation.label, index })
    }
}

impl Dataset<PatchSample> for PatchClassificationDataset {
    fn get(&self, index: usize) -> Option<PatchSample> {
        if index >= self.len() {
            return None;
        }
        let index = index % self.annotations.len();
        match self.load(index) {
            Ok(sample) => Some(sample),
            Err(e) => {
                tracing::warn!("Skipping patch {}: {:#}", index, e);
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.annotations.len() * self.options.length_multiplier
    }
}

fn flip_horizontal(chw: &mut [f32], size: usize) {
    for row in chw.chunks_mut(size) {
        row.reverse();
    }
}

fn normalize(chw: &mut [f32], size: usize) {
    let plane = size * size;
    for (c, channel) in chw.chunks_mut(plane).enumerate() {
        for v in channel {
            *v = (*v - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }
}
