/*!
# mnist-cnn
A small convolutional neural network for MNIST, trained with hand written backpropagation on
[ndarray](https://docs.rs/ndarray) arrays.

- [`learn::neural_network`]: layers, loss, the [`Network`](learn::neural_network::Network)
  and checkpoints.
- [`learn`]: the [`Trainer`](learn::Trainer), statistics and metrics history.
- [`dataset`]: the pickled MNIST archive, class balancing, and csv export.

# Features
- plotters: Enables [`plot`], rendering of the training metrics.
*/
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Errors.
pub mod error;
/// Datasets.
pub mod dataset;
/// Machine learning.
pub mod learn;
/// Plotting.
#[cfg(feature = "plotters")]
pub mod plot;

pub use error::{Error, Result};
pub use ndarray;
