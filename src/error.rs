use ndarray::ShapeError;
use std::io;
use thiserror::Error;

/// Errors of the network core.
#[derive(Debug, Error)]
pub enum Error {
    /// An ndarray reshape or dimensionality conversion failed.
    #[error(transparent)]
    Shape(#[from] ShapeError),
    /// The input does not agree with the layer.
    #[error("{layer}: expected {expected}, found {found}!")]
    DimensionMismatch {
        /// The layer or operation.
        layer: &'static str,
        /// What the layer expected.
        expected: String,
        /// What it received.
        found: String,
    },
    /// Backward was called without a preceding forward.
    #[error("{layer}: backward called without forward!")]
    InvalidSequence {
        /// The layer or operation.
        layer: &'static str,
    },
    /// The batch is empty.
    #[error("batch is empty!")]
    EmptyBatch,
    /// A label is not a valid class.
    #[error("class {class} out of range 0..{classes}!")]
    InvalidClass {
        /// The label.
        class: usize,
        /// The number of classes.
        classes: usize,
    },
    /// A checkpoint is missing a parameter.
    #[error("missing parameter {0:?}!")]
    MissingParameter(String),
    /// A checkpoint parameter has the wrong shape.
    #[error("parameter {name:?}: expected shape {expected:?}, found {found:?}!")]
    ParameterShape {
        /// The parameter name.
        name: String,
        /// The shape of the layer's parameter.
        expected: Vec<usize>,
        /// The shape stored in the checkpoint.
        found: Vec<usize>,
    },
    /// File I/O failed.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Checkpoint (de)serialization failed.
    #[error(transparent)]
    Serialization(#[from] bincode::Error),
}

impl Error {
    pub(crate) fn dimension_mismatch(
        layer: &'static str,
        expected: impl ToString,
        found: impl ToString,
    ) -> Self {
        Self::DimensionMismatch {
            layer,
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }
}

/// Result type of the network core.
pub type Result<T, E = Error> = std::result::Result<T, E>;
