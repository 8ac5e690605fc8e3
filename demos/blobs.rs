//! Trains a small classifier on three noisy point clouds.
//!
//! ```text
//! cargo run --example blobs
//! ```

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tapegrad::data::Dataset;
use tapegrad::model::Sequential;
use tapegrad::train::{TrainConfig, Trainer};
use tapegrad::Graph;

const CENTERS: [[f64; 2]; 3] = [[2.0, 0.0], [-1.0, 1.7], [-1.0, -1.7]];
const PER_CLASS: usize = 100;

fn make_blobs(seed: u64) -> tapegrad::Result<Dataset> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut inputs = Vec::with_capacity(CENTERS.len() * PER_CLASS * 2);
    let mut labels = Vec::with_capacity(CENTERS.len() * PER_CLASS);
    for _ in 0..PER_CLASS {
        for (class, center) in CENTERS.iter().enumerate() {
            inputs.push(center[0] + rng.random_range(-0.8..0.8));
            inputs.push(center[1] + rng.random_range(-0.8..0.8));
            labels.push(class);
        }
    }
    Dataset::new(inputs, labels, 2)
}

fn main() -> tapegrad::Result<()> {
    tracing_subscriber::fmt::init();

    let dataset = make_blobs(7)?;
    let config = TrainConfig::default()
        .with_epochs(15)
        .with_learning_rate(0.05)
        .with_batch_size(32)
        .with_seed(1);

    let widths = [dataset.features(), 16, dataset.classes()];
    let mut graph = Graph::new();
    let model = Sequential::mlp(&mut graph, &widths, 42)?;
    let mut trainer = Trainer::new(graph, model, config.clone())?;
    let mut loader = config.loader(dataset.clone())?;
    let report = trainer.fit(&mut loader)?;

    println!(
        "loss {:.4} -> {:.4} over {} epochs",
        report.initial_loss().unwrap_or(f64::NAN),
        report.final_loss().unwrap_or(f64::NAN),
        report.epochs.len()
    );

    let mut correct = 0;
    for i in 0..dataset.len() {
        if let Some((sample, label)) = dataset.get(i) {
            if trainer.predict(sample)? == label {
                correct += 1;
            }
        }
    }
    println!("train accuracy {correct}/{}", dataset.len());

    let probe = [1.5, 0.3];
    let probs = trainer.probabilities(&probe)?;
    println!("p(class | {probe:?}) = {:.3?}", probs.data());

    let path = std::env::temp_dir().join("tapegrad-blobs.tgrd");
    trainer.save_checkpoint(&path)?;

    let mut graph = Graph::new();
    let model = Sequential::mlp(&mut graph, &widths, 0)?;
    let mut restored = Trainer::new(graph, model, config)?;
    restored.restore_checkpoint(&path)?;
    println!(
        "restored model predicts class {} for {probe:?}",
        restored.predict(&probe)?
    );
    std::fs::remove_file(&path)?;
    Ok(())
}
