use super::{Network, PARAMETER_NAMES};
use crate::error::{Error, Result};
use ndarray::{ArrayView, ArrayViewD, IxDyn};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};
use tracing::info;

/// A saved tensor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SavedTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl SavedTensor {
    /// The tensor as an array.
    ///
    /// **Errors**
    ///
    /// The length of the data does not match the shape.
    pub fn view(&self) -> Result<ArrayViewD<f32>> {
        Ok(ArrayView::from_shape(IxDyn(&self.shape), &self.data)?)
    }
}

impl From<ArrayViewD<'_, f32>> for SavedTensor {
    fn from(array: ArrayViewD<f32>) -> Self {
        Self {
            shape: array.shape().to_vec(),
            data: array.iter().copied().collect(),
        }
    }
}

/// Saved model parameters.
///
/// Named tensors only, no hyperparameters. The [`Network`] topology is fixed so the names
/// and shapes are enough to restore it.
///
/// Saving:
///```no_run
/// # use mnist_cnn::{error::Result, learn::neural_network::Network};
/// # fn main() -> Result<()> {
/// # let network = Network::new();
/// network.to_saved().save("model.bin")?;
/// # Ok(())
/// # }
///```
/// Loading:
///```no_run
/// # use mnist_cnn::{error::Result, learn::neural_network::{Network, saved::SavedModel}};
/// # fn main() -> Result<()> {
/// let mut network = Network::new();
/// network.load_saved(&SavedModel::load("model.bin")?)?;
/// # Ok(())
/// # }
///```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SavedModel {
    parameters: BTreeMap<String, SavedTensor>,
}

impl SavedModel {
    /// Prepares a collection of named parameters for serialization.
    pub fn new<'a, N, I>(parameters: I) -> Self
    where
        N: Into<String>,
        I: IntoIterator<Item = (N, ArrayViewD<'a, f32>)>,
    {
        let parameters = parameters
            .into_iter()
            .map(|(name, parameter)| (name.into(), parameter.into()))
            .collect();
        Self { parameters }
    }
    /// The names of the parameters, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.parameters.keys().map(String::as_str)
    }
    /// The parameter `name`.
    ///
    /// **Errors**
    /// - [`Error::MissingParameter`] if there is no parameter `name`.
    /// - [`Error::Shape`] if the saved data does not match its shape.
    pub fn parameter(&self, name: &str) -> Result<ArrayViewD<f32>> {
        self.parameters
            .get(name)
            .ok_or_else(|| Error::MissingParameter(name.to_string()))?
            .view()
    }
    /// Removes the parameter `name`, returning it.
    pub fn remove(&mut self, name: &str) -> Option<SavedTensor> {
        self.parameters.remove(name)
    }
    /// Saves to `path`, overwriting it.
    ///
    /// **Errors**
    ///
    /// The file could not be created or written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(&mut writer, self)?;
        writer.flush()?;
        info!(path = %path.display(), "saved model");
        Ok(())
    }
    /// Loads from `path`.
    ///
    /// **Errors**
    ///
    /// The file could not be opened or deserialized.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(bincode::deserialize_from(reader)?)
    }
}

impl Network {
    /// The parameters as a [`SavedModel`].
    pub fn to_saved(&self) -> SavedModel {
        SavedModel::new(self.parameters())
    }
    /// Loads the parameters of `saved`.
    ///
    /// Every parameter is checked before any is assigned, so on error the network is unchanged.
    /// Extra parameters are ignored.
    ///
    /// **Errors**
    /// - [`Error::MissingParameter`] if a parameter is missing.
    /// - [`Error::ParameterShape`] if a parameter has a different shape.
    pub fn load_saved(&mut self, saved: &SavedModel) -> Result<()> {
        let mut parameters = Vec::with_capacity(PARAMETER_NAMES.len());
        for (name, parameter) in self.parameters() {
            let saved = saved.parameter(name)?;
            if saved.shape() != parameter.shape() {
                return Err(Error::ParameterShape {
                    name: name.to_string(),
                    expected: parameter.shape().to_vec(),
                    found: saved.shape().to_vec(),
                });
            }
            parameters.push(saved);
        }
        for ((_, mut parameter), saved) in self.parameters_mut().into_iter().zip(parameters) {
            parameter.assign(&saved);
        }
        Ok(())
    }
}
