// ============================================================
// Layer 5 — Prototype Push
// ============================================================
// Projects every prototype onto the closest latent patch of a
// training image of its own class:
//
//   for each batch of the push loader (raw pixels, eval mode)
//     latent   = add_on_layers(features(normalize(x)))  [N, D, H, W]
//     dist     = ‖latent[n, :, h, w] - p_j‖²      [N, HW, P]
//     keep the closest (n, h, w) for each j whose class == target[n]
//
//   p_j ← latent[n*, :, h*, w*]
//
// Prototypes whose class never shows up in the loader keep
// their current vector.

use anyhow::{Context, Result};
use burn::prelude::*;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf};

use crate::data::{batcher::normalize_images, data_module::PatchLoader};
use crate::ml::model::PPNet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrototypeProjection {
    pub prototype: usize,
    pub class: usize,
    /// Manifest index of the patch the prototype now comes from
    pub sample_index: Option<usize>,
    /// Squared distance between the old prototype and its projection
    pub distance: Option<f64>,
}

struct Nearest {
    distance: f32,
    sample_index: usize,
    vector: Vec<f32>,
}

pub fn push_prototypes<B: Backend>(
    model: PPNet<B>,
    loader: &PatchLoader<B>,
) -> Result<(PPNet<B>, Vec<PrototypeProjection>)> {
    let num_prototypes = model.num_prototypes();
    let dim = model.prototype_dim;
    let mut nearest: Vec<Option<Nearest>> = (0..num_prototypes).map(|_| None).collect();
    let mut n_batches = 0usize;

    for batch in loader.iter() {
        let latent = model.latent(normalize_images(batch.images)).detach();
        let [n, _, height, width] = latent.dims();
        let positions = height * width;

        let distances: Vec<f32> = model
            .prototype_distances(latent.clone())
            .into_data()
            .iter::<f32>()
            .collect();
        let latent: Vec<f32> = latent.into_data().iter::<f32>().collect();
        let targets: Vec<i64> = batch.targets.into_data().iter::<i64>().collect();

        for (sample, &target) in targets.iter().enumerate().take(n) {
            for (j, slot) in nearest.iter_mut().enumerate() {
                if model.prototype_class(j) as i64 != target {
                    continue;
                }
                for h in 0..positions {
                    let d = distances[(sample * positions + h) * num_prototypes + j];
                    if slot.as_ref().map_or(true, |s| d < s.distance) {
                        let base = sample * dim * positions;
                        let vector = (0..dim).map(|c| latent[base + c * positions + h]).collect();
                        *slot = Some(Nearest {
                            distance: d,
                            sample_index: batch.indices[sample],
                            vector,
                        });
                    }
                }
            }
        }
        n_batches += 1;
    }
    tracing::info!("Pushed prototypes over {} batches", n_batches);

    let device = model.prototype_vectors.val().device();
    let mut values: Vec<f32> = model.flat_prototypes().into_data().iter::<f32>().collect();
    let mut projections = Vec::with_capacity(num_prototypes);
    for (j, slot) in nearest.into_iter().enumerate() {
        let class = model.prototype_class(j);
        match slot {
            Some(found) => {
                values[j * dim..(j + 1) * dim].copy_from_slice(&found.vector);
                projections.push(PrototypeProjection {
                    prototype: j,
                    class,
                    sample_index: Some(found.sample_index),
                    distance: Some(found.distance as f64),
                });
            }
            None => {
                tracing::warn!("No training patch of class {} for prototype {}", class, j);
                projections.push(PrototypeProjection {
                    prototype: j,
                    class,
                    sample_index: None,
                    distance: None,
                });
            }
        }
    }

    let vectors = Tensor::<B, 1>::from_floats(values.as_slice(), &device).reshape([
        num_prototypes,
        dim,
        1,
        1,
    ]);
    Ok((model.with_prototype_vectors(vectors), projections))
}

/// Write `push_summary.json` into the prototypes directory
pub fn save_push_summary(dir: &Path, projections: &[PrototypeProjection]) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Cannot create prototypes directory '{}'", dir.display()))?;
    let path = dir.join("push_summary.json");
    fs::write(&path, serde_json::to_string_pretty(projections)?)
        .with_context(|| format!("Cannot write '{}'", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::batcher::PatchBatcher;
    use crate::data::dataset::PatchSample;
    use crate::ml::model::PPNetConfig;
    use burn::backend::NdArray;
    use burn::data::{dataloader::DataLoaderBuilder, dataset::InMemDataset};

    type TestBackend = NdArray;

    fn loader(labels: &[usize]) -> PatchLoader<TestBackend> {
        let samples: Vec<PatchSample> = labels
            .iter()
            .enumerate()
            .map(|(i, &label)| PatchSample {
                pixels: vec![i as f32 / 4.0; 3 * 8 * 8],
                label,
                index: i,
            })
            .collect();
        DataLoaderBuilder::new(PatchBatcher::<TestBackend>::new(Default::default(), 8))
            .batch_size(2)
            .build(InMemDataset::new(samples))
    }

    fn model() -> PPNet<TestBackend> {
        PPNetConfig::new(3, 1, 4)
            .with_feature_channels(2)
            .init::<TestBackend>(&Default::default())
    }

    #[test]
    fn test_prototypes_move_onto_own_class_patches() -> Result<()> {
        let model = model();
        let loader = loader(&[0, 1, 1]);
        let (pushed, projections) = push_prototypes(model, &loader)?;

        assert_eq!(projections.len(), 3);
        assert_eq!(projections[0].sample_index, Some(0));
        assert!(matches!(projections[1].sample_index, Some(1) | Some(2)));
        // class 2 never appears
        assert_eq!(projections[2].sample_index, None);

        // a pushed prototype is a latent vector, so its distance to
        // that patch is now ~0
        let images = Tensor::<TestBackend, 4>::zeros([1, 3, 8, 8], &Default::default());
        let (_, min_distances) = pushed.forward(normalize_images(images));
        let d0: f32 = min_distances.slice([0..1, 0..1]).into_scalar().elem();
        assert!(d0 < 1e-4, "distance {d0}");
        Ok(())
    }

    #[test]
    fn test_pushed_prototype_matches_patch_seen_at_validation() -> Result<()> {
        use crate::application::train_use_case::TrainConfig;
        use crate::data::{data_module::PatchClassificationDataModule, loader::annotations_dir};
        use image::{Rgb, RgbImage};

        let dir = tempfile::tempdir()?;
        let root = dir.path();
        fs::create_dir_all(annotations_dir(root))?;
        RgbImage::from_fn(8, 8, |x, y| Rgb([(x * 30) as u8, (y * 30) as u8, 200]))
            .save(root.join("patch.png"))?;
        for split in ["train", "val"] {
            fs::write(
                annotations_dir(root).join(format!("{split}.json")),
                r#"[{ "image": "patch.png", "label": 1 }]"#,
            )?;
        }
        let cfg = TrainConfig {
            data_dir: root.display().to_string(),
            model_image_size: 8,
            batch_size: 1,
            dataloader_n_jobs: 0,
            ..TrainConfig::default()
        };
        let dm = PatchClassificationDataModule::new(&cfg);
        let device = Default::default();

        let model = PPNetConfig::new(2, 1, 4)
            .with_feature_channels(2)
            .init::<TestBackend>(&device);
        let push_loader = dm.train_push_dataloader::<TestBackend>(&device)?;
        let (pushed, projections) = push_prototypes(model, &push_loader)?;
        assert_eq!(projections[1].sample_index, Some(0));

        let val_loader = dm.val_dataloader::<TestBackend>(&device)?;
        let batch = val_loader.iter().next().context("empty val loader")?;
        let (_, min_distances) = pushed.forward(batch.images);
        let d: f32 = min_distances.slice([0..1, 1..2]).into_scalar().elem();
        assert!(d < 1e-4, "distance {d}");
        Ok(())
    }

    #[test]
    fn test_unseen_class_keeps_its_vector() -> Result<()> {
        let model = model();
        let before: Vec<f32> = model.flat_prototypes().into_data().iter::<f32>().collect();
        let (pushed, _) = push_prototypes(model, &loader(&[0]))?;
        let after: Vec<f32> = pushed.flat_prototypes().into_data().iter::<f32>().collect();
        assert_eq!(before[4..], after[4..]);
        Ok(())
    }

    #[test]
    fn test_summary_is_written() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let projections = vec![PrototypeProjection {
            prototype: 0,
            class: 0,
            sample_index: Some(3),
            distance: Some(0.5),
        }];
        let path = save_push_summary(&dir.path().join("prototypes"), &projections)?;
        let read: Vec<PrototypeProjection> = serde_json::from_str(&fs::read_to_string(path)?)?;
        assert_eq!(read, projections);
        Ok(())
    }
}
