use super::*;
use approx::assert_relative_eq;
use crate::error::Error;
use ndarray::{arr1, Array, Array1, Array4};
use rand::Rng;

fn trainer(batch_size: usize) -> Trainer {
    let config = TrainConfig {
        batch_size,
        seed: Some(0),
        ..TrainConfig::default()
    };
    let mut rng = StdRng::seed_from_u64(0);
    let network = Network::from_rng(&mut rng);
    Trainer::from_network_rng(network, config, rng)
}

#[test]
fn train_config_default() {
    let config = TrainConfig::default();
    assert_eq!(config.epochs, 5);
    assert_eq!(config.batch_size, 64);
    assert_eq!(config.learning_rate, 0.01);
    assert_eq!(config.train_per_class, 500);
    assert_eq!(config.test_per_class, 10);
    assert_eq!(config.seed, None);
}

#[test]
fn train_config_partial_json() -> anyhow::Result<()> {
    let config: TrainConfig = serde_json::from_str(r#"{ "epochs": 2, "seed": 3 }"#)?;
    assert_eq!(config.epochs, 2);
    assert_eq!(config.seed, Some(3));
    assert_eq!(config.batch_size, TrainConfig::default().batch_size);
    Ok(())
}

#[test]
fn stats_accuracy() {
    let stats = Stats {
        count: 8,
        loss: None,
        correct: Some(6),
    };
    assert_eq!(stats.accuracy(), Some(0.75));
    assert_eq!(Stats::default().accuracy(), None);
    let empty = Stats {
        count: 0,
        loss: None,
        correct: Some(0),
    };
    assert_eq!(empty.accuracy(), Some(0.));
}

#[test]
fn summary_run_epoch() -> Result<()> {
    let mut summary = Summary::default();
    let train = Stats {
        count: 4,
        loss: Some(1.),
        correct: Some(2),
    };
    summary.run_epoch(|summary| {
        assert_eq!(summary.epoch(), 0);
        Ok(train)
    })?;
    assert_eq!(summary.epoch(), 1);
    assert_eq!(summary.train().correct(), Some(2));
    let result = summary.run_epoch(|_| Err(Error::EmptyBatch));
    assert!(matches!(result, Err(Error::EmptyBatch)));
    assert_eq!(summary.epoch(), 1);
    assert!(summary.total_time() >= summary.epoch_time());
    Ok(())
}

#[test]
fn history_save_load() -> anyhow::Result<()> {
    let mut history = History::default();
    history.push(&Stats {
        count: 10,
        loss: Some(2.25),
        correct: Some(3),
    });
    history.push(&Stats {
        count: 10,
        loss: Some(1.125),
        correct: Some(7),
    });
    assert_eq!(history.loss, vec![Some(2.25), Some(1.125)]);
    assert_eq!(history.accuracy, vec![Some(0.3), Some(0.7)]);
    let dir = tempfile::tempdir()?;
    let path = dir.path().join(METRICS_FILE);
    history.save(&path)?;
    assert_eq!(History::load(&path)?, history);
    Ok(())
}

#[test]
fn history_non_finite() -> anyhow::Result<()> {
    let mut history = History::default();
    history.push(&Stats {
        count: 10,
        loss: Some(1.),
        correct: Some(5),
    });
    history.push(&Stats {
        count: 10,
        loss: Some(f32::NAN),
        correct: Some(5),
    });
    history.push(&Stats {
        count: 0,
        loss: None,
        correct: None,
    });
    history.push(&Stats {
        count: 10,
        loss: Some(f32::INFINITY),
        correct: Some(0),
    });
    assert_eq!(history.loss, vec![Some(1.), None, None, None]);
    assert_eq!(history.accuracy, vec![Some(0.5), Some(0.5), None, Some(0.)]);
    let dir = tempfile::tempdir()?;
    let path = dir.path().join(METRICS_FILE);
    history.save(&path)?;
    assert_eq!(History::load(&path)?, history);
    Ok(())
}

#[test]
fn train_epoch_without_examples() -> anyhow::Result<()> {
    let images = Array4::<f32>::zeros([0, 1, 28, 28]);
    let mut trainer = trainer(4);
    let stats = trainer.train_epoch(images.view(), arr1(&[]).view(), |_| {})?;
    assert_eq!(stats.loss(), None);
    assert_eq!(trainer.history().loss, vec![None]);
    let dir = tempfile::tempdir()?;
    trainer.save_checkpoint(dir.path())?;
    assert_eq!(&History::load(dir.path().join(METRICS_FILE))?, trainer.history());
    Ok(())
}

fn test_train_epoch() -> Result<()> {
    // Blank images only reach the bias of the last layer, so a full batch step always lowers
    // the loss.
    let images = Array4::<f32>::zeros([3, 1, 28, 28]);
    let classes = arr1(&[0u8, 1, 2]);
    let mut trainer = trainer(4);
    let mut seen = Vec::new();
    let first = trainer.train_epoch(images.view(), classes.view(), |n| seen.push(n))?;
    assert_eq!(seen, vec![3]);
    assert_eq!(first.count(), 3);
    assert_relative_eq!(first.loss().unwrap(), 10f32.ln(), epsilon = 1e-5);
    assert!(first.correct().unwrap() <= 3);
    let second = trainer.train_epoch(images.view(), classes.view(), |_| {})?;
    assert!(second.loss().unwrap() < first.loss().unwrap());
    assert_eq!(trainer.summary().epoch(), 2);
    assert_eq!(trainer.history().loss.len(), 2);
    assert_eq!(trainer.history().accuracy.len(), 2);
    Ok(())
}

#[test]
fn train_epoch() -> Result<()> {
    test_train_epoch()
}

#[test]
fn train_epoch_batches() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(9);
    let images = Array::from_shape_simple_fn([5, 1, 28, 28], || rng.gen_range(0f32..1.));
    let classes: Array1<u8> = (0..5).map(|_| rng.gen_range(0..10)).collect();
    let mut trainer = trainer(2);
    let mut seen = Vec::new();
    let stats = trainer.train_epoch(images.view(), classes.view(), |n| seen.push(n))?;
    assert_eq!(seen, vec![2, 4, 5]);
    assert!(stats.loss().unwrap().is_finite());
    Ok(())
}

#[test]
fn train_epoch_class_count_mismatch() {
    let images = Array4::<f32>::zeros([3, 1, 28, 28]);
    let mut trainer = trainer(4);
    assert!(matches!(
        trainer.train_epoch(images.view(), arr1(&[0, 1]).view(), |_| {}),
        Err(Error::DimensionMismatch { .. })
    ));
    assert_eq!(trainer.summary().epoch(), 0);
}

#[test]
fn test_batches() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(10);
    let network = Network::from_rng(&mut rng);
    let images = Array::from_shape_simple_fn([7, 1, 28, 28], || rng.gen_range(0f32..1.));
    let predictions = network.predict(images.view())?;
    let stats = test(&network, images.view(), predictions.view(), 3)?;
    assert_eq!(stats.count(), 7);
    assert_eq!(stats.correct(), Some(7));
    assert_eq!(stats.loss(), None);
    let wrong = predictions.mapv(|x| (x + 1) % 10);
    let stats = test(&network, images.view(), wrong.view(), 3)?;
    assert_eq!(stats.correct(), Some(0));
    Ok(())
}

#[test]
fn save_checkpoint() -> anyhow::Result<()> {
    let images = Array4::<f32>::zeros([2, 1, 28, 28]);
    let classes = arr1(&[4u8, 5]);
    let mut trainer = trainer(2);
    trainer.train_epoch(images.view(), classes.view(), |_| {})?;
    let dir = tempfile::tempdir()?;
    let model_path = trainer.save_checkpoint(dir.path().join("run"))?;
    assert_eq!(model_path, dir.path().join("run").join(MODEL_FILE));
    let history = History::load(dir.path().join("run").join(METRICS_FILE))?;
    assert_eq!(&history, trainer.history());
    let config: TrainConfig =
        serde_json::from_reader(File::open(dir.path().join("run").join(CONFIG_FILE))?)?;
    assert_eq!(config.batch_size, 2);
    assert_eq!(config.seed, Some(0));
    let mut network = Network::from_rng(&mut StdRng::seed_from_u64(1));
    network.load_saved(&neural_network::saved::SavedModel::load(&model_path)?)?;
    assert_eq!(network.to_saved(), trainer.network().to_saved());
    Ok(())
}
