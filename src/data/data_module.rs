// ============================================================
// Layer 4 — Patch Classification Data Module
// ============================================================
// Builds the four loaders a run needs:
//
//   train       split `train`, shuffled, augmented
//   val         split `val`, evaluation mode
//   test        split `val` (Cityscapes ships no labelled test set)
//   train_push  split `train`, evaluation mode, un-normalised,
//               manifest repeated `push_length_multiplier` times
//
// Loaders shuffle exactly when their dataset is not in
// evaluation mode.

use anyhow::{bail, Result};
use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    prelude::*,
};
use std::{path::PathBuf, sync::Arc};

use crate::application::train_use_case::TrainConfig;
use crate::data::{
    batcher::{PatchBatch, PatchBatcher},
    dataset::{DatasetOptions, PatchClassificationDataset},
    loader::annotations_dir,
};

pub type PatchLoader<B> = Arc<dyn DataLoader<PatchBatch<B>>>;

#[derive(Debug, Clone)]
pub struct PatchClassificationDataModule {
    data_dir: PathBuf,
    model_image_size: usize,
    batch_size: usize,
    num_workers: usize,
    push_length_multiplier: usize,
    seed: u64,
}

impl PatchClassificationDataModule {
    pub fn new(cfg: &TrainConfig) -> Self {
        Self {
            data_dir: PathBuf::from(&cfg.data_dir),
            model_image_size: cfg.model_image_size,
            batch_size: cfg.batch_size,
            num_workers: resolve_n_jobs(cfg.dataloader_n_jobs),
            push_length_multiplier: cfg.push_length_multiplier,
            seed: cfg.seed,
        }
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Fails when the preprocessed dataset is not where the config says
    pub fn prepare_data(&self) -> Result<()> {
        if !annotations_dir(&self.data_dir).exists() {
            bail!(
                "No annotations under '{}'. Please download the dataset and preprocess it \
                 with the preprocessing script first.",
                self.data_dir.display()
            );
        }
        Ok(())
    }

    pub fn train_dataset(&self) -> Result<PatchClassificationDataset> {
        PatchClassificationDataset::new(
            &self.data_dir,
            DatasetOptions::new("train", false, self.model_image_size),
        )
    }

    pub fn val_dataset(&self) -> Result<PatchClassificationDataset> {
        PatchClassificationDataset::new(
            &self.data_dir,
            DatasetOptions::new("val", true, self.model_image_size),
        )
    }

    pub fn test_dataset(&self) -> Result<PatchClassificationDataset> {
        // no test split for cityscapes
        PatchClassificationDataset::new(
            &self.data_dir,
            DatasetOptions::new("val", true, self.model_image_size),
        )
    }

    pub fn train_push_dataset(&self) -> Result<PatchClassificationDataset> {
        PatchClassificationDataset::new(
            &self.data_dir,
            DatasetOptions::new("train", true, self.model_image_size)
                .for_push(self.push_length_multiplier),
        )
    }

    pub fn train_dataloader<B: Backend>(&self, device: &B::Device) -> Result<PatchLoader<B>> {
        Ok(self.get_data_loader(self.train_dataset()?, device))
    }

    pub fn val_dataloader<B: Backend>(&self, device: &B::Device) -> Result<PatchLoader<B>> {
        Ok(self.get_data_loader(self.val_dataset()?, device))
    }

    pub fn test_dataloader<B: Backend>(&self, device: &B::Device) -> Result<PatchLoader<B>> {
        Ok(self.get_data_loader(self.test_dataset()?, device))
    }

    pub fn train_push_dataloader<B: Backend>(&self, device: &B::Device) -> Result<PatchLoader<B>> {
        Ok(self.get_data_loader(self.train_push_dataset()?, device))
    }

    fn get_data_loader<B: Backend>(
        &self,
        dataset: PatchClassificationDataset,
        device: &B::Device,
    ) -> PatchLoader<B> {
        let batcher = PatchBatcher::<B>::new(device.clone(), self.model_image_size);
        let builder = DataLoaderBuilder::new(batcher).batch_size(self.batch_size);
        // 0 workers: batches are loaded on the calling thread
        let builder = if self.num_workers > 0 {
            builder.num_workers(self.num_workers)
        } else {
            builder
        };
        let builder = if dataset.is_eval() {
            builder
        } else {
            builder.shuffle(self.seed)
        };
        builder.build(dataset)
    }
}

/// `-1` (or any negative value) means one worker per CPU
pub fn resolve_n_jobs(n_jobs: i64) -> usize {
    if n_jobs < 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        n_jobs as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use image::{Rgb, RgbImage};
    use std::fs;

    type TestBackend = NdArray;

    fn config(data_dir: &std::path::Path) -> TrainConfig {
        TrainConfig {
            data_dir: data_dir.display().to_string(),
            model_image_size: 4,
            batch_size: 2,
            dataloader_n_jobs: 0,
            push_length_multiplier: 3,
            ..TrainConfig::default()
        }
    }

    fn write_dataset(root: &std::path::Path) {
        fs::create_dir_all(annotations_dir(root)).unwrap();
        for split in ["train", "val"] {
            let mut entries = Vec::new();
            for i in 0..3 {
                let name = format!("{split}_{i}.png");
                RgbImage::from_pixel(4, 4, Rgb([10, 20, 30])).save(root.join(&name)).unwrap();
                entries.push(serde_json::json!({ "image": name, "label": i }));
            }
            fs::write(
                annotations_dir(root).join(format!("{split}.json")),
                serde_json::to_string(&entries).unwrap(),
            )
            .unwrap();
        }
    }

    #[test]
    fn test_prepare_data_requires_annotations() {
        let dir = tempfile::tempdir().unwrap();
        let dm = PatchClassificationDataModule::new(&config(dir.path()));
        let err = dm.prepare_data().unwrap_err();
        assert!(err.to_string().contains("preprocess"));

        write_dataset(dir.path());
        assert!(dm.prepare_data().is_ok());
    }

    #[test]
    fn test_splits() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path());
        let dm = PatchClassificationDataModule::new(&config(dir.path()));

        assert!(!dm.train_dataset().unwrap().is_eval());
        assert!(dm.val_dataset().unwrap().is_eval());
        // test reads the val split
        assert_eq!(dm.test_dataset().unwrap().options().split_key, "val");

        let push = dm.train_push_dataset().unwrap();
        assert!(push.is_eval());
        assert!(push.options().push_prototypes);
        assert_eq!(burn::data::dataset::Dataset::len(&push), 9);
    }

    #[test]
    fn test_val_loader_yields_all_patches() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path());
        let dm = PatchClassificationDataModule::new(&config(dir.path()));

        let loader = dm.val_dataloader::<TestBackend>(&Default::default()).unwrap();
        let sizes: Vec<usize> = loader.iter().map(|b| b.indices.len()).collect();
        assert_eq!(sizes, vec![2, 1]);
    }

    #[test]
    fn test_zero_jobs_loads_on_calling_thread() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path());
        let cfg = TrainConfig { dataloader_n_jobs: 0, ..config(dir.path()) };
        let dm = PatchClassificationDataModule::new(&cfg);
        assert_eq!(dm.num_workers(), 0);

        let train = dm.train_dataloader::<TestBackend>(&Default::default()).unwrap();
        let total: usize = train.iter().map(|b| b.indices.len()).sum();
        assert_eq!(total, 3);

        let push = dm.train_push_dataloader::<TestBackend>(&Default::default()).unwrap();
        let total: usize = push.iter().map(|b| b.indices.len()).sum();
        assert_eq!(total, 9);
    }

    #[test]
    fn test_resolve_n_jobs() {
        assert_eq!(resolve_n_jobs(3), 3);
        assert!(resolve_n_jobs(-1) >= 1);
    }
}
