use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use mnist_cnn::{
    dataset::mnist::{Mnist, DEFAULT_PATH},
    learn::{TrainConfig, Trainer},
};
use std::{fs::File, path::PathBuf};
use tracing_subscriber::EnvFilter;

/// Trains the network on a class balanced subset of MNIST.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// The gzip compressed pickle archive.
    #[arg(long, default_value = DEFAULT_PATH)]
    data: PathBuf,
    /// The directory for the checkpoint, metrics and plot.
    #[arg(long, default_value = ".")]
    output: PathBuf,
    /// Loads the configuration from a json file instead of the options below.
    #[arg(long)]
    config: Option<PathBuf>,
    /// The number of epochs.
    #[arg(long, default_value_t = TrainConfig::default().epochs)]
    epochs: usize,
    /// The batch size.
    #[arg(long, default_value_t = TrainConfig::default().batch_size)]
    batch_size: usize,
    /// The learning rate.
    #[arg(long, default_value_t = TrainConfig::default().learning_rate)]
    learning_rate: f32,
    /// The number of training examples per class.
    #[arg(long, default_value_t = TrainConfig::default().train_per_class)]
    train_per_class: usize,
    /// The number of test examples per class.
    #[arg(long, default_value_t = TrainConfig::default().test_per_class)]
    test_per_class: usize,
    /// Seeds initialization and shuffling.
    #[arg(long)]
    seed: Option<u64>,
}

impl Args {
    fn train_config(&self) -> Result<TrainConfig> {
        if let Some(path) = self.config.as_ref() {
            let file = File::open(path)
                .with_context(|| format!("Unable to open config {:?}!", path.display()))?;
            return Ok(serde_json::from_reader(file)?);
        }
        Ok(TrainConfig {
            epochs: self.epochs,
            batch_size: self.batch_size,
            learning_rate: self.learning_rate,
            train_per_class: self.train_per_class,
            test_per_class: self.test_per_class,
            seed: self.seed,
        })
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mnist_cnn=info")),
        )
        .with_target(false)
        .init();
    let args = Args::parse();
    let config = args.train_config()?;
    let mnist = Mnist::builder().path(&args.data).build()?;
    let data = mnist.balanced(config.train_per_class, config.test_per_class)?;
    println!(
        "train: {} images, test: {} images",
        data.train_classes.len(),
        data.test_classes.len()
    );
    let epochs = config.epochs;
    let mut trainer = Trainer::new(config);
    println!(
        "network: {} parameters",
        trainer.network().parameter_count()
    );
    let count = data.train_classes.len() as u64;
    for epoch in 1..=epochs {
        let style = ProgressStyle::default_bar()
            .template(&format!(
                "epoch {epoch}/{epochs} [{{bar:40}}] {{pos:>6}}/{{len:6}} [eta: {{eta}}]"
            ))?
            .progress_chars("=> ");
        let bar = ProgressBar::new(count).with_style(style);
        let stats = trainer.train_epoch(
            data.train_images.view(),
            data.train_classes.view(),
            |seen| bar.set_position(seen as u64),
        )?;
        bar.finish_and_clear();
        let summary = trainer.summary();
        println!(
            "epoch: {} elapsed: {:.2?} loss: {:.5} accuracy: {:.2}%",
            summary.epoch(),
            summary.epoch_time(),
            stats.loss().unwrap_or(f32::NAN),
            100. * stats.accuracy().unwrap_or(0.),
        );
        trainer.save_checkpoint(&args.output)?;
    }
    println!("total time: {:.2?}", trainer.summary().total_time());
    let test = trainer.test(data.test_images.view(), data.test_classes.view())?;
    println!("test accuracy: {:.2}%", 100. * test.accuracy().unwrap_or(0.));
    #[cfg(feature = "plotters")]
    {
        let path = args.output.join("metrics.png");
        mnist_cnn::plot::plot_metrics(&path, trainer.history(), "Training")?;
        println!("Plot saved to {:?}.", path);
    }
    if !cfg!(feature = "plotters") {
        println!("Feature plotters not enabled, plot not generated. Try running with:\n\tcargo run --bin train --features plotters");
    }
    Ok(())
}
