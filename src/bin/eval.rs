use anyhow::Result;
use clap::Parser;
use mnist_cnn::{
    dataset::mnist::{balance, Mnist, DEFAULT_PATH},
    learn::{
        self,
        neural_network::{saved::SavedModel, Network},
        TrainConfig, MODEL_FILE,
    },
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Evaluates a saved model on the class balanced MNIST test set.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// The gzip compressed pickle archive.
    #[arg(long, default_value = DEFAULT_PATH)]
    data: PathBuf,
    /// The saved model.
    #[arg(long, default_value = MODEL_FILE)]
    model: PathBuf,
    /// The number of test examples per class.
    #[arg(long, default_value_t = TrainConfig::default().test_per_class)]
    test_per_class: usize,
    /// The batch size.
    #[arg(long, default_value_t = TrainConfig::default().batch_size)]
    batch_size: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mnist_cnn=info")),
        )
        .with_target(false)
        .init();
    let args = Args::parse();
    let mut network = Network::new();
    network.load_saved(&SavedModel::load(&args.model)?)?;
    let mnist = Mnist::builder().path(&args.data).build()?;
    let (images, classes) = balance(
        mnist.test().images(),
        mnist.test().classes(),
        args.test_per_class,
    )?;
    let stats = learn::test(&network, images.view(), classes.view(), args.batch_size)?;
    println!(
        "test accuracy: {:.2}% ({}/{})",
        100. * stats.accuracy().unwrap_or(0.),
        stats.correct().unwrap_or(0),
        stats.count()
    );
    Ok(())
}
