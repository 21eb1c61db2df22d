// ============================================================
// Layer 5 — Prototype Network (PPNet)
// ============================================================
// A compact "this looks like that" classifier:
//
//   image [B,3,S,S]
//     │ features        conv → relu → pool (x3)
//     │ add_on_layers   1x1 conv → relu → 1x1 conv → sigmoid
//     ▼
//   latent [B,D,H,W]
//     │ squared L2 distance of every latent patch to every
//     │ prototype vector, min-pooled over positions
//     ▼
//   min_distances [B,P]
//     │ log((d + 1) / (d + eps)) similarity
//     │ last_layer (P → C, no bias)
//     ▼
//   logits [B,C]
//
// Prototype j belongs to class j / prototypes_per_class.
// The training schedule addresses the four parameter groups
// (features, add_on_layers, prototype_vectors, last_layer)
// separately, so each is its own field.

use burn::{
    module::Param,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        Linear, LinearConfig, PaddingConfig2d,
    },
    prelude::*,
    tensor::{activation, Distribution},
};

const SIMILARITY_EPSILON: f64 = 1e-4;
const INCORRECT_CLASS_CONNECTION: f32 = -0.5;

#[derive(Config, Debug)]
pub struct PPNetConfig {
    pub num_classes: usize,
    pub prototypes_per_class: usize,
    pub prototype_dim: usize,
    #[config(default = 32)]
    pub feature_channels: usize,
}

impl PPNetConfig {
    pub fn num_prototypes(&self) -> usize {
        self.num_classes * self.prototypes_per_class
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> PPNet<B> {
        let c = self.feature_channels;
        let features = FeatureBackbone {
            conv1: conv3x3(3, c, device),
            conv2: conv3x3(c, c * 2, device),
            conv3: conv3x3(c * 2, c * 2, device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        };
        let add_on_layers = AddOnLayers {
            conv1: Conv2dConfig::new([c * 2, self.prototype_dim], [1, 1]).init(device),
            conv2: Conv2dConfig::new([self.prototype_dim, self.prototype_dim], [1, 1]).init(device),
        };

        let num_prototypes = self.num_prototypes();
        let prototype_vectors = Tensor::random(
            [num_prototypes, self.prototype_dim, 1, 1],
            Distribution::Uniform(0.0, 1.0),
            device,
        );

        let mut last_layer = LinearConfig::new(num_prototypes, self.num_classes)
            .with_bias(false)
            .init(device);
        last_layer.weight = Param::from_tensor(initial_last_layer_weight(
            self.num_classes,
            self.prototypes_per_class,
            device,
        ));

        PPNet {
            features,
            add_on_layers,
            prototype_vectors: Param::from_tensor(prototype_vectors),
            last_layer,
            num_classes: self.num_classes,
            prototypes_per_class: self.prototypes_per_class,
            prototype_dim: self.prototype_dim,
        }
    }
}

fn conv3x3<B: Backend>(channels_in: usize, channels_out: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([channels_in, channels_out], [3, 3])
        .with_padding(PaddingConfig2d::Same)
        .init(device)
}

#[derive(Module, Debug)]
pub struct FeatureBackbone<B: Backend> {
    pub conv1: Conv2d<B>,
    pub conv2: Conv2d<B>,
    pub conv3: Conv2d<B>,
    pub pool: MaxPool2d,
}

impl<B: Backend> FeatureBackbone<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.pool.forward(activation::relu(self.conv1.forward(x)));
        let x = self.pool.forward(activation::relu(self.conv2.forward(x)));
        self.pool.forward(activation::relu(self.conv3.forward(x)))
    }
}

#[derive(Module, Debug)]
pub struct AddOnLayers<B: Backend> {
    pub conv1: Conv2d<B>,
    pub conv2: Conv2d<B>,
}

impl<B: Backend> AddOnLayers<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = activation::relu(self.conv1.forward(x));
        activation::sigmoid(self.conv2.forward(x))
    }
}

#[derive(Module, Debug)]
pub struct PPNet<B: Backend> {
    pub features: FeatureBackbone<B>,
    pub add_on_layers: AddOnLayers<B>,
    /// Shape [P, D, 1, 1]
    pub prototype_vectors: Param<Tensor<B, 4>>,
    /// Weight shape [P, C]
    pub last_layer: Linear<B>,
    pub num_classes: usize,
    pub prototypes_per_class: usize,
    pub prototype_dim: usize,
}

impl<B: Backend> PPNet<B> {
    /// image [B,3,S,S] → (logits [B,C], min_distances [B,P])
    pub fn forward(&self, images: Tensor<B, 4>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let latent = self.latent(images);
        let [batch, _, _, _] = latent.dims();
        let num_prototypes = self.num_prototypes();

        // [B, HW, P] → min over positions → [B, P]
        let min_distances = self
            .prototype_distances(latent)
            .min_dim(1)
            .reshape([batch, num_prototypes]);

        let activations = ((min_distances.clone() + 1.0) / (min_distances.clone() + SIMILARITY_EPSILON)).log();
        let logits = self.last_layer.forward(activations);
        (logits, min_distances)
    }

    /// Add-on feature map the prototypes live in: [B, D, H, W]
    pub fn latent(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        self.add_on_layers.forward(self.features.forward(images))
    }

    /// Squared L2 distance of every latent position to every prototype,
    /// clamped at zero: [B, H*W, P]
    pub fn prototype_distances(&self, latent: Tensor<B, 4>) -> Tensor<B, 3> {
        let [batch, dim, height, width] = latent.dims();
        let positions = height * width;
        let num_prototypes = self.num_prototypes();

        // [B, D, HW] → [B, HW, D] → [B*HW, D]
        let z = latent
            .reshape([batch, dim, positions])
            .swap_dims(1, 2)
            .reshape([batch * positions, dim]);
        let p = self.prototype_vectors.val().reshape([num_prototypes, dim]);

        let z2 = z.clone().powf_scalar(2.0).sum_dim(1); // [B*HW, 1]
        let p2 = p.clone().powf_scalar(2.0).sum_dim(1).reshape([1, num_prototypes]);
        let zp = z.matmul(p.transpose()); // [B*HW, P]

        (z2 - zp * 2.0 + p2)
            .clamp_min(0.0)
            .reshape([batch, positions, num_prototypes])
    }

    pub fn num_prototypes(&self) -> usize {
        self.num_classes * self.prototypes_per_class
    }

    /// Class a prototype was allocated to
    pub fn prototype_class(&self, prototype: usize) -> usize {
        prototype / self.prototypes_per_class
    }

    /// One-hot [P, C] matrix: entry (j, c) is 1 iff prototype j belongs to class c
    pub fn prototype_class_identity(&self, device: &B::Device) -> Tensor<B, 2> {
        class_identity(self.num_classes, self.prototypes_per_class, device)
    }

    /// Largest possible squared distance in the unit hypercube the sigmoid
    /// add-on output lives in
    pub fn max_dist(&self) -> f64 {
        self.prototype_dim as f64
    }

    /// Prototypes flattened to [P, D]
    pub fn flat_prototypes(&self) -> Tensor<B, 2> {
        self.prototype_vectors
            .val()
            .reshape([self.num_prototypes(), self.prototype_dim])
    }

    /// Replace the prototype vectors, keeping the parameter identity so
    /// records and optimiser state stay attached to it
    pub fn with_prototype_vectors(mut self, vectors: Tensor<B, 4>) -> Self {
        let id = self.prototype_vectors.id.clone();
        self.prototype_vectors = Param::initialized(id, vectors.require_grad());
        self
    }

    /// ‖W‖₁ of the last layer
    pub fn last_layer_l1(&self) -> f64 {
        self.last_layer
            .weight
            .val()
            .detach()
            .abs()
            .sum()
            .into_scalar()
            .elem::<f64>()
    }

    /// Mean squared distance over all ordered prototype pairs
    /// (the diagonal included)
    pub fn mean_prototype_pair_distance(&self) -> f64 {
        let p = self.flat_prototypes().detach();
        list_of_distances(p.clone(), p).mean().into_scalar().elem::<f64>()
    }
}

/// Pairwise squared L2 distances: x [N,D], y [M,D] → [N,M]
pub fn list_of_distances<B: Backend>(x: Tensor<B, 2>, y: Tensor<B, 2>) -> Tensor<B, 2> {
    let [n, dim] = x.dims();
    let [m, _] = y.dims();
    let diff = x.reshape([n, 1, dim]) - y.reshape([1, m, dim]);
    diff.powf_scalar(2.0).sum_dim(2).reshape([n, m])
}

pub fn class_identity<B: Backend>(
    num_classes: usize,
    prototypes_per_class: usize,
    device: &B::Device,
) -> Tensor<B, 2> {
    let num_prototypes = num_classes * prototypes_per_class;
    let mut values = vec![0.0f32; num_prototypes * num_classes];
    for j in 0..num_prototypes {
        values[j * num_classes + j / prototypes_per_class] = 1.0;
    }
    Tensor::<B, 1>::from_floats(values.as_slice(), device).reshape([num_prototypes, num_classes])
}

/// 1 on own-class connections, -0.5 everywhere else
fn initial_last_layer_weight<B: Backend>(
    num_classes: usize,
    prototypes_per_class: usize,
    device: &B::Device,
) -> Tensor<B, 2> {
    let identity = class_identity::<B>(num_classes, prototypes_per_class, device);
    let incorrect = identity.clone().neg().add_scalar(1.0);
    identity + incorrect * INCORRECT_CLASS_CONNECTION
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn tiny_config() -> PPNetConfig {
        PPNetConfig::new(3, 2, 4).with_feature_channels(4)
    }

    #[test]
    fn test_forward_shapes() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::random([2, 3, 16, 16], Distribution::Default, &device);

        let (logits, min_distances) = model.forward(images);
        assert_eq!(logits.dims(), [2, 3]);
        assert_eq!(min_distances.dims(), [2, 6]);

        let min: f32 = min_distances.min().into_scalar().elem();
        assert!(min >= 0.0);
    }

    #[test]
    fn test_class_identity_layout() {
        let device = Default::default();
        let identity = class_identity::<TestBackend>(3, 2, &device);
        let values: Vec<f32> = identity.into_data().iter::<f32>().collect();
        // prototypes 0,1 → class 0; 2,3 → class 1; 4,5 → class 2
        assert_eq!(
            values,
            vec![
                1.0, 0.0, 0.0, //
                1.0, 0.0, 0.0, //
                0.0, 1.0, 0.0, //
                0.0, 1.0, 0.0, //
                0.0, 0.0, 1.0, //
                0.0, 0.0, 1.0,
            ]
        );
    }

    #[test]
    fn test_last_layer_initialisation() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device);
        let weight: Vec<f32> = model.last_layer.weight.val().into_data().iter::<f32>().collect();
        assert_eq!(&weight[0..3], &[1.0, -0.5, -0.5]);
        assert_eq!(&weight[15..18], &[-0.5, -0.5, 1.0]);
        // 6 own-class connections of 1 and 12 cross-class of 0.5
        assert!((model.last_layer_l1() - 12.0).abs() < 1e-6);
    }

    #[test]
    fn test_prototype_distance_to_itself_is_zero() {
        let device = Default::default();
        let model = PPNetConfig::new(1, 1, 2).init::<TestBackend>(&device);
        let model = model.with_prototype_vectors(
            Tensor::<TestBackend, 1>::from_floats([0.25, 0.75], &device).reshape([1, 2, 1, 1]),
        );
        // latent [1, 2, 1, 2]: position 0 equals the prototype, position 1 is off by (1, 1)
        let latent = Tensor::<TestBackend, 1>::from_floats([0.25, 1.25, 0.75, 1.75], &device)
            .reshape([1, 2, 1, 2]);
        let distances: Vec<f32> = model
            .prototype_distances(latent)
            .into_data()
            .iter::<f32>()
            .collect();
        assert!(distances[0].abs() < 1e-6);
        assert!((distances[1] - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_list_of_distances() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats([0.0, 0.0, 1.0, 2.0], &device).reshape([2, 2]);
        let d: Vec<f32> = list_of_distances(x.clone(), x).into_data().iter::<f32>().collect();
        assert_eq!(d, vec![0.0, 5.0, 5.0, 0.0]);
    }

    #[test]
    fn test_with_prototype_vectors_keeps_param_id() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device);
        let id = model.prototype_vectors.id.clone();
        let model = model.with_prototype_vectors(Tensor::zeros([6, 4, 1, 1], &device));
        assert_eq!(model.prototype_vectors.id, id);
        assert_eq!(model.mean_prototype_pair_distance(), 0.0);
    }
}
