// ============================================================
// Layer 4 — Patch Batcher
// ============================================================
// Implements Burn's Batcher trait to stack PatchSamples into
// device tensors.
//
//   Input:  Vec of N PatchSamples, each 3·S·S floats
//   Output: images [N, 3, S, S], targets [N]
//
// Every sample has already been resized to the model input
// size, so flattening and reshaping is enough.

use burn::{data::dataloader::batcher::Batcher, prelude::*};

use crate::data::dataset::{PatchSample, IMAGENET_MEAN, IMAGENET_STD};

#[derive(Debug, Clone)]
pub struct PatchBatch<B: Backend> {
    /// [batch_size, 3, S, S]
    pub images: Tensor<B, 4>,
    /// [batch_size] class ids
    pub targets: Tensor<B, 1, Int>,
    /// Manifest index of every sample, in batch order
    pub indices: Vec<usize>,
}

#[derive(Clone, Debug)]
pub struct PatchBatcher<B: Backend> {
    pub device: B::Device,
    pub image_size: usize,
}

impl<B: Backend> PatchBatcher<B> {
    pub fn new(device: B::Device, image_size: usize) -> Self {
        Self { device, image_size }
    }
}

impl<B: Backend> Batcher<PatchSample, PatchBatch<B>> for PatchBatcher<B> {
    fn batch(&self, items: Vec<PatchSample>) -> PatchBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;

        let pixels: Vec<f32> = items
            .iter()
            .flat_map(|s| s.pixels.iter().copied())
            .collect();
        let labels: Vec<i32> = items.iter().map(|s| s.label as i32).collect();
        let indices: Vec<usize> = items.iter().map(|s| s.index).collect();

        let images = Tensor::<B, 1>::from_floats(pixels.as_slice(), &self.device)
            .reshape([batch_size, 3, size, size]);
        let targets = Tensor::<B, 1, Int>::from_ints(labels.as_slice(), &self.device);

        PatchBatch { images, targets, indices }
    }
}

/// ImageNet mean/std normalisation of a [N, 3, S, S] batch of [0, 1]
/// pixels. Push batches are loaded raw and normalised with this
/// before they reach the network.
pub fn normalize_images<B: Backend>(images: Tensor<B, 4>) -> Tensor<B, 4> {
    let device = images.device();
    let mean = Tensor::<B, 1>::from_floats(IMAGENET_MEAN, &device).reshape([1, 3, 1, 1]);
    let std = Tensor::<B, 1>::from_floats(IMAGENET_STD, &device).reshape([1, 3, 1, 1]);
    (images - mean) / std
}
