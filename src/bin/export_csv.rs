use anyhow::Result;
use clap::Parser;
use mnist_cnn::{
    dataset::{
        csv,
        mnist::{Mnist, DEFAULT_PATH},
    },
    learn::TrainConfig,
};
use std::{fs, path::PathBuf};
use tracing_subscriber::EnvFilter;

/// Exports the class balanced MNIST subsets to csv, without normalization.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// The gzip compressed pickle archive.
    #[arg(long, default_value = DEFAULT_PATH)]
    data: PathBuf,
    /// The directory to write the csv files to.
    #[arg(long, default_value = ".")]
    output: PathBuf,
    /// The number of training examples per class.
    #[arg(long, default_value_t = TrainConfig::default().train_per_class)]
    train_per_class: usize,
    /// The number of test examples per class.
    #[arg(long, default_value_t = TrainConfig::default().test_per_class)]
    test_per_class: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mnist_cnn=info")),
        )
        .with_target(false)
        .init();
    let args = Args::parse();
    let mnist = Mnist::builder().path(&args.data).build()?;
    let data = mnist.balanced(args.train_per_class, args.test_per_class)?;
    fs::create_dir_all(&args.output)?;
    csv::write_images(args.output.join("train_images.csv"), &data.train_images)?;
    csv::write_classes(args.output.join("train_labels.csv"), data.train_classes.view())?;
    csv::write_images(args.output.join("test_images.csv"), &data.test_images)?;
    csv::write_classes(args.output.join("test_labels.csv"), data.test_classes.view())?;
    println!(
        "Exported {} training and {} test images to {:?}.",
        data.train_classes.len(),
        data.test_classes.len(),
        args.output
    );
    Ok(())
}
