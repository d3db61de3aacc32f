/*!
# Example
Train a step on a batch, then classify it.
```no_run
# use mnist_cnn::{error::Result, learn::neural_network::Network};
# use ndarray::{Array, Array1};
# fn main() -> Result<()> {
let mut network = Network::new();
let images = Array::zeros([2, 1, 28, 28]);
let classes = Array1::from(vec![3u8, 7]);
let loss = network.forward(images.view(), classes.view())?;
network.backward(0.01)?;
let predictions = network.predict(images.view())?;
# Ok(())
# }
```
*/
use super::{criterion::argmax, Infer};
use crate::error::{Error, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayView4, ArrayViewD, ArrayViewMutD, Ix2};
use rand::Rng;
use tracing::debug;

/// Loss functions.
pub mod criterion;
use criterion::SoftmaxCrossEntropy;

/// Layers.
pub mod layer;
use layer::{Backward, Conv2, Dense, Flatten, Forward, Layer, MaxPool2, Relu};

/// Checkpoints.
pub mod saved;


/// The height and width of an image.
pub const IMAGE_SIZE: usize = 28;
/// The number of classes.
pub const CLASSES: usize = 10;

const KERNEL: usize = 3;
const CONV1_OUTPUTS: usize = 32;
const CONV2_OUTPUTS: usize = 64;
const HIDDEN: usize = 128;

const fn conv_size(size: usize) -> usize {
    size - KERNEL + 1
}

const fn pool_size(size: usize) -> usize {
    size / 2
}

/// 28 -> 26 -> 13 -> 11 -> 5.
const FEATURE_SIZE: usize = pool_size(conv_size(pool_size(conv_size(IMAGE_SIZE))));

/// The number of features into the first dense layer.
pub const FEATURES: usize = CONV2_OUTPUTS * FEATURE_SIZE * FEATURE_SIZE;

/// The names of the parameters, in order.
pub const PARAMETER_NAMES: [&str; 8] = [
    "c1_w", "c1_b", "c2_w", "c2_b", "fc1_w", "fc1_b", "fc2_w", "fc2_b",
];

/// A convolutional neural network for 28 x 28 single channel images.
///
/// Conv2(1, 32, 3) -> Relu -> MaxPool2 -> Conv2(32, 64, 3) -> Relu -> MaxPool2 -> Flatten ->
/// Dense(1600, 128) -> Relu -> Dense(128, 10) -> SoftmaxCrossEntropy.
///
/// [`.forward()`](Network::forward()) must precede each [`.backward()`](Network::backward()).
/// [`.predict()`](Network::predict()) may be called at any time, it does not disturb a pending
/// backward pass.
#[derive(Clone, Debug)]
pub struct Network {
    layers: Vec<Layer>,
    criterion: SoftmaxCrossEntropy,
    logits: Option<Array2<f32>>,
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

impl Network {
    /// Creates a new [`Network`], initialized with [`thread_rng()`](rand::thread_rng()).
    pub fn new() -> Self {
        Self::from_rng(&mut rand::thread_rng())
    }
    /// Creates a new [`Network`], initialized with `rng`.
    pub fn from_rng<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let layers = vec![
            Conv2::from_inputs_outputs_kernel(1, CONV1_OUTPUTS, KERNEL, rng).into(),
            Relu::new().into(),
            MaxPool2::new().into(),
            Conv2::from_inputs_outputs_kernel(CONV1_OUTPUTS, CONV2_OUTPUTS, KERNEL, rng).into(),
            Relu::new().into(),
            MaxPool2::new().into(),
            Flatten::new().into(),
            Dense::from_inputs_outputs(FEATURES, HIDDEN, rng).into(),
            Relu::new().into(),
            Dense::from_inputs_outputs(HIDDEN, CLASSES, rng).into(),
        ];
        Self {
            layers,
            criterion: SoftmaxCrossEntropy::new(),
            logits: None,
        }
    }
    /// The layers, in order.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }
    /// The logits of the last forward pass.
    pub fn logits(&self) -> Option<ArrayView2<f32>> {
        self.logits.as_ref().map(Array2::view)
    }
    /// The parameters paired with their names, see [`PARAMETER_NAMES`].
    pub fn parameters(&self) -> Vec<(&'static str, ArrayViewD<f32>)> {
        PARAMETER_NAMES
            .into_iter()
            .zip(self.layers.iter().flat_map(Layer::parameters))
            .collect()
    }
    pub(crate) fn parameters_mut(&mut self) -> Vec<(&'static str, ArrayViewMutD<f32>)> {
        PARAMETER_NAMES
            .into_iter()
            .zip(self.layers.iter_mut().flat_map(Layer::parameters_mut))
            .collect()
    }
    /// The total number of parameter elements.
    pub fn parameter_count(&self) -> usize {
        self.parameters().iter().map(|(_, x)| x.len()).sum()
    }
    /// Computes the loss of `images` `[batch_size, 1, 28, 28]` given `classes`.
    ///
    /// Caches the activations of every layer and the logits for [`.backward()`](Network::backward()).
    ///
    /// **Errors**
    /// - [`Error::EmptyBatch`] if the batch is empty.
    /// - [`Error::DimensionMismatch`] if the images do not have the expected shape or the number
    ///   of classes differs from the batch size.
    /// - [`Error::InvalidClass`] if a class is not less than 10.
    pub fn forward(&mut self, images: ArrayView4<f32>, classes: ArrayView1<u8>) -> Result<f32> {
        // A failed forward must not leave a loss from a previous one to backpropagate.
        self.criterion = SoftmaxCrossEntropy::new();
        self.logits = None;
        let batch_size = images.dim().0;
        if batch_size == 0 {
            return Err(Error::EmptyBatch);
        }
        if classes.len() != batch_size {
            return Err(Error::dimension_mismatch(
                "Network",
                format!("{batch_size} classes"),
                classes.len(),
            ));
        }
        let mut x = images.to_owned().into_dyn();
        for layer in self.layers.iter_mut() {
            x = layer.forward(x)?;
        }
        let logits = x.into_dimensionality::<Ix2>()?;
        let loss = self.criterion.forward(logits.clone(), classes)?;
        self.logits.replace(logits);
        debug!(batch_size, loss, "forward");
        Ok(loss)
    }
    /// Backpropagates the loss of the last forward pass through every layer in reverse,
    /// updating the parameters with `learning_rate`.
    ///
    /// **Errors**
    ///
    /// [`Error::InvalidSequence`] if there was no forward since the last backward.
    pub fn backward(&mut self, learning_rate: f32) -> Result<()> {
        let mut grad = self.criterion.backward()?.into_dyn();
        for layer in self.layers.iter_mut().rev() {
            grad = layer.backward(grad, learning_rate)?;
        }
        debug!(learning_rate, "backward");
        Ok(())
    }
    /// Predicts the class of each image.
    ///
    /// Does not modify the network.
    ///
    /// **Errors**
    ///
    /// See [`.forward()`](Network::forward()).
    pub fn predict(&self, images: ArrayView4<f32>) -> Result<Array1<u8>> {
        Ok(argmax(self.infer(images)?.view()))
    }
}

impl Infer<ArrayView4<'_, f32>> for Network {
    type Output = Array2<f32>;
    /// Computes the logits of `images`.
    fn infer(&self, images: ArrayView4<f32>) -> Result<Array2<f32>> {
        if images.dim().0 == 0 {
            return Err(Error::EmptyBatch);
        }
        let mut x = images.to_owned().into_dyn();
        for layer in self.layers.iter() {
            x = layer.infer(x)?;
        }
        Ok(x.into_dimensionality()?)
    }
}
