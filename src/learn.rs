use crate::error::Result;
use ndarray::{s, ArrayView1, ArrayView4, Axis};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use tracing::{debug, info};

/// Criterions.
pub mod criterion;
use criterion::accuracy;

/// Neural networks.
pub mod neural_network;
use neural_network::Network;

#[cfg(test)]
mod tests;

/// Inference.
pub trait Infer<X> {
    /// The output.
    type Output;
    /// Computes the output without modifying the model.
    ///
    /// **Errors**
    ///
    /// Returns an error if the input is not valid for the model.
    fn infer(&self, input: X) -> Result<Self::Output>;
}

/// Training / Testing statistics.
#[derive(Default, Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Stats {
    count: usize,
    loss: Option<f32>,
    correct: Option<usize>,
}

impl Stats {
    /// The number of examples.
    pub fn count(&self) -> usize {
        self.count
    }
    /// The mean of the batch losses, if computed.
    pub fn loss(&self) -> Option<f32> {
        self.loss
    }
    /// The number of correct predictions, if computed.
    pub fn correct(&self) -> Option<usize> {
        self.correct
    }
    /// The fraction of correct predictions, if computed.
    pub fn accuracy(&self) -> Option<f32> {
        let correct = self.correct?;
        if self.count == 0 {
            return Some(0.);
        }
        Some(correct as f32 / self.count as f32)
    }
}

/// Summary of training.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct Summary {
    epoch: usize,
    epoch_time: Duration,
    total_time: Duration,
    train: Stats,
}

impl Summary {
    /// The number of completed epochs.
    pub fn epoch(&self) -> usize {
        self.epoch
    }
    /// The duration of the last epoch.
    pub fn epoch_time(&self) -> Duration {
        self.epoch_time
    }
    /// The duration of all epochs.
    pub fn total_time(&self) -> Duration {
        self.total_time
    }
    /// The training stats of the last epoch.
    pub fn train(&self) -> Stats {
        self.train
    }
    /// Runs an epoch with `f`.
    ///
    /// Times `f`. If `f` returns `Ok`, updates the epoch time and accumulates the total time and the epoch. Otherwise returns the error.
    pub fn run_epoch<F>(&mut self, mut f: F) -> Result<Stats>
    where
        F: FnMut(&Self) -> Result<Stats>,
    {
        let start = Instant::now();
        let train = f(self)?;
        self.epoch_time = start.elapsed();
        self.total_time += self.epoch_time;
        self.epoch += 1;
        self.train = train;
        Ok(train)
    }
}

/// Per epoch training loss and accuracy.
///
/// Missing or non-finite values are `None`, saved as json `null`.
#[derive(Default, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct History {
    /// The mean loss of each epoch.
    pub loss: Vec<Option<f32>>,
    /// The accuracy of each epoch.
    pub accuracy: Vec<Option<f32>>,
}

impl History {
    /// Appends the loss and accuracy of `stats`.
    pub fn push(&mut self, stats: &Stats) {
        self.loss.push(stats.loss().filter(|x| x.is_finite()));
        self.accuracy.push(stats.accuracy().filter(|x| x.is_finite()));
    }
    /// Saves as json to `path`, overwriting it.
    ///
    /// **Errors**
    ///
    /// The file could not be created or written.
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }
    /// Loads json from `path`.
    ///
    /// **Errors**
    ///
    /// The file could not be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Ok(serde_json::from_reader(File::open(path)?)?)
    }
}

/// Training configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// The number of passes over the training set.
    pub epochs: usize,
    /// The number of examples per step. The last batch of an epoch may be smaller.
    pub batch_size: usize,
    /// The gradient descent step size.
    pub learning_rate: f32,
    /// The number of training examples of each class.
    pub train_per_class: usize,
    /// The number of testing examples of each class.
    pub test_per_class: usize,
    /// Seeds initialization and shuffling. Random if not set.
    pub seed: Option<u64>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 5,
            batch_size: 64,
            learning_rate: 0.01,
            train_per_class: 500,
            test_per_class: 10,
            seed: None,
        }
    }
}

/// The file name of the model checkpoint.
pub const MODEL_FILE: &str = "model.bin";
/// The file name of the metrics history.
pub const METRICS_FILE: &str = "metrics.json";
/// The file name of the configuration.
pub const CONFIG_FILE: &str = "config.json";

/// Trains a [`Network`] with mini-batch gradient descent.
#[derive(Debug)]
pub struct Trainer {
    network: Network,
    config: TrainConfig,
    rng: StdRng,
    summary: Summary,
    history: History,
}

impl Trainer {
    /// Creates a new [`Trainer`] with a new [`Network`].
    ///
    /// The network and the shuffling are seeded with `config.seed`, if set.
    pub fn new(config: TrainConfig) -> Self {
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let network = Network::from_rng(&mut rng);
        Self::from_network_rng(network, config, rng)
    }
    /// Creates a new [`Trainer`] for `network`.
    pub fn from_network_rng(network: Network, config: TrainConfig, rng: StdRng) -> Self {
        Self {
            network,
            config,
            rng,
            summary: Summary::default(),
            history: History::default(),
        }
    }
    /// The network.
    pub fn network(&self) -> &Network {
        &self.network
    }
    /// Returns the network.
    pub fn into_network(self) -> Network {
        self.network
    }
    /// The configuration.
    pub fn config(&self) -> &TrainConfig {
        &self.config
    }
    /// The summary of the last epoch.
    pub fn summary(&self) -> &Summary {
        &self.summary
    }
    /// The history of all epochs.
    pub fn history(&self) -> &History {
        &self.history
    }
    /// Trains one epoch on `images` and `classes`.
    ///
    /// Shuffles the examples, then for each batch runs forward and backward, and counts the
    /// correct predictions of the updated network on that batch. `on_batch` is called after each
    /// batch with the number of examples processed so far.
    ///
    /// Returns the training stats, which are also appended to the history.
    ///
    /// **Errors**
    ///
    /// Returns an error if a forward or backward pass failed. The network may have been
    /// partially trained.
    pub fn train_epoch<F>(
        &mut self,
        images: ArrayView4<f32>,
        classes: ArrayView1<u8>,
        mut on_batch: F,
    ) -> Result<Stats>
    where
        F: FnMut(usize),
    {
        let count = images.dim().0;
        if count != classes.len() {
            return Err(crate::error::Error::dimension_mismatch(
                "Trainer",
                format!("{count} classes"),
                classes.len(),
            ));
        }
        let Self {
            network,
            config,
            rng,
            summary,
            history,
        } = self;
        let batch_size = config.batch_size.max(1);
        let learning_rate = config.learning_rate;
        let train = summary.run_epoch(|summary| {
            let mut indices: Vec<usize> = (0..count).collect();
            indices.shuffle(rng);
            let mut total_loss = 0.;
            let mut batches = 0;
            let mut correct = 0;
            let mut seen = 0;
            for batch in indices.chunks(batch_size) {
                let x = images.select(Axis(0), batch);
                let t = classes.select(Axis(0), batch);
                let loss = network.forward(x.view(), t.view())?;
                network.backward(learning_rate)?;
                let predictions = network.predict(x.view())?;
                total_loss += loss;
                batches += 1;
                correct += accuracy(predictions.view(), t.view());
                seen += batch.len();
                on_batch(seen);
                debug!(epoch = summary.epoch() + 1, batch = batches, loss, "train");
            }
            let loss = if batches > 0 {
                Some(total_loss / batches as f32)
            } else {
                None
            };
            let train = Stats {
                count,
                loss,
                correct: Some(correct),
            };
            Ok(train)
        })?;
        history.push(&train);
        info!(
            epoch = summary.epoch(),
            loss = train.loss().unwrap_or(f32::NAN),
            accuracy = train.accuracy().unwrap_or(f32::NAN),
            "epoch"
        );
        Ok(train)
    }
    /// Tests the network on `images` and `classes`, in batches of the configured batch size.
    ///
    /// **Errors**
    ///
    /// Returns an error if prediction failed.
    pub fn test(&self, images: ArrayView4<f32>, classes: ArrayView1<u8>) -> Result<Stats> {
        test(&self.network, images, classes, self.config.batch_size)
    }
    /// Saves the model, the history and the configuration to `dir`, overwriting previous files.
    ///
    /// **Errors**
    ///
    /// The directory or the files could not be created or written.
    pub fn save_checkpoint(&self, dir: impl AsRef<Path>) -> anyhow::Result<PathBuf> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let model_path = dir.join(MODEL_FILE);
        self.network.to_saved().save(&model_path)?;
        self.history.save(dir.join(METRICS_FILE))?;
        let mut writer = BufWriter::new(File::create(dir.join(CONFIG_FILE))?);
        serde_json::to_writer_pretty(&mut writer, &self.config)?;
        writer.flush()?;
        Ok(model_path)
    }
}

/// Tests `network` on `images` and `classes` in batches of `batch_size`.
///
/// The returned stats have no loss.
///
/// **Errors**
///
/// Returns an error if prediction failed.
pub fn test(
    network: &Network,
    images: ArrayView4<f32>,
    classes: ArrayView1<u8>,
    batch_size: usize,
) -> Result<Stats> {
    let count = images.dim().0;
    if count != classes.len() {
        return Err(crate::error::Error::dimension_mismatch(
            "test",
            format!("{count} classes"),
            classes.len(),
        ));
    }
    let batch_size = batch_size.max(1);
    let mut correct = 0;
    let mut start = 0;
    while start < count {
        let end = (start + batch_size).min(count);
        let predictions = network.predict(images.slice(s![start..end, .., .., ..]))?;
        correct += accuracy(predictions.view(), classes.slice(s![start..end]));
        start = end;
    }
    Ok(Stats {
        count,
        loss: None,
        correct: Some(correct),
    })
}
