use tapegrad::data::{Batch, Dataset};
use tapegrad::model::{Sequential, mlp_specs};
use tapegrad::optim::{Optimizer, Sgd};
use tapegrad::train::{Phase, TrainConfig, Trainer};
use tapegrad::{GradError, Graph, Tensor};

/// Deterministic weights in `[-0.45, 0.55)`, zero biases.
fn pattern_init(layer: usize, shape: &[usize], _fan_in: usize) -> Tensor {
    if shape.len() == 1 {
        return Tensor::zeros(shape).unwrap();
    }
    let (rows, cols) = (shape[0], shape[1]);
    let data = (0..rows)
        .flat_map(|i| (0..cols).map(move |j| ((layer * 5 + i * 7 + j * 3) % 11) as f64 / 11.0 - 0.45))
        .collect();
    Tensor::new(shape.to_vec(), data).unwrap()
}

fn blobs() -> Dataset {
    Dataset::new(
        vec![5.0, 0.0, 0.0, 5.0, -5.0, -5.0, -5.0, -4.0],
        vec![0, 1, 2, 2],
        2,
    )
    .unwrap()
}

fn pattern_trainer(config: TrainConfig) -> Trainer {
    let mut graph = Graph::new();
    let specs = mlp_specs(&[2, 16, 3]).unwrap();
    let model = Sequential::build_with(&mut graph, &specs, pattern_init).unwrap();
    Trainer::new(graph, model, config).unwrap()
}

fn parameter_values(trainer: &Trainer) -> Vec<Tensor> {
    trainer
        .model()
        .parameters()
        .into_iter()
        .map(|p| trainer.graph().value(p).unwrap().clone())
        .collect()
}

#[test]
fn full_batch_training_converges() {
    let config = TrainConfig::default()
        .with_epochs(100)
        .with_learning_rate(0.01)
        .with_batch_size(4)
        .with_shuffle(false);
    let mut trainer = pattern_trainer(config.clone());
    let mut loader = config.loader(blobs()).unwrap();

    let report = trainer.fit(&mut loader).unwrap();
    let initial = report.initial_loss().unwrap();
    let last = report.final_loss().unwrap();

    assert_eq!(report.epochs.len(), 100);
    assert!(!report.stopped_early);
    assert!((initial - 1.8912).abs() < 1e-3, "initial loss {initial}");
    assert!(last <= 0.1 * initial, "loss went from {initial} to {last}");
    assert!(
        report.epochs.windows(2).all(|w| w[1].loss <= w[0].loss),
        "full-batch loss should decrease monotonically"
    );

    for (i, expected) in [0, 1, 2, 2].into_iter().enumerate() {
        let (sample, _) = blobs().get(i).map(|(x, y)| (x.to_vec(), y)).unwrap();
        assert_eq!(trainer.predict(&sample).unwrap(), expected);
    }
}

#[test]
fn training_is_reproducible() {
    let config = TrainConfig::default()
        .with_epochs(3)
        .with_learning_rate(0.05)
        .with_batch_size(3)
        .with_seed(11);
    let run = || {
        let mut graph = Graph::new();
        let model = Sequential::mlp(&mut graph, &[2, 8, 3], 5).unwrap();
        let mut trainer = Trainer::new(graph, model, config.clone()).unwrap();
        let mut loader = config.loader(blobs()).unwrap();
        let report = trainer.fit(&mut loader).unwrap();
        (report, parameter_values(&trainer))
    };
    assert_eq!(run(), run());
}

#[test]
fn step_after_zero_grad_names_every_parameter() {
    let mut graph = Graph::new();
    let model = Sequential::mlp(&mut graph, &[4, 3, 2], 0).unwrap();
    let params = model.parameters();
    let mut sgd = Sgd::new(&graph, params.clone(), 0.1).unwrap();

    sgd.zero_grad(&mut graph).unwrap();
    let before: Vec<Tensor> = params.iter().map(|&p| graph.value(p).unwrap().clone()).collect();
    let err = sgd.step(&mut graph).unwrap_err();

    let expected: Vec<usize> = params.iter().map(|p| p.index()).collect();
    assert!(matches!(err, GradError::MissingGradient { params: ref missing } if *missing == expected));
    let after: Vec<Tensor> = params.iter().map(|&p| graph.value(p).unwrap().clone()).collect();
    assert_eq!(before, after);
}

#[test]
fn failed_batch_changes_nothing() {
    let mut trainer = pattern_trainer(TrainConfig::default().with_learning_rate(0.1));
    let slots = trainer.graph().len();
    let before = parameter_values(&trainer);

    let bad = Batch {
        inputs: Tensor::new(vec![2, 2], vec![1.0, 0.0, 0.0, 1.0]).unwrap(),
        labels: vec![0, 3],
    };
    let err = trainer.train_step(&bad).unwrap_err();
    assert!(matches!(err, GradError::Index { index: 3, bound: 3 }));

    assert_eq!(trainer.aborted_phase(), Some(Phase::ForwardPass));
    assert_eq!(trainer.graph().len(), slots);
    assert_eq!(trainer.graph().node_count(), 0);
    assert_eq!(parameter_values(&trainer), before);

    let wrong_width = Batch {
        inputs: Tensor::new(vec![1, 3], vec![1.0, 2.0, 3.0]).unwrap(),
        labels: vec![0],
    };
    assert!(matches!(
        trainer.train_step(&wrong_width),
        Err(GradError::Shape { op: "linear", .. })
    ));
    assert_eq!(trainer.aborted_phase(), Some(Phase::ForwardPass));
    assert_eq!(parameter_values(&trainer), before);

    let good = Batch {
        inputs: Tensor::new(vec![1, 2], vec![5.0, 0.0]).unwrap(),
        labels: vec![0],
    };
    trainer.train_step(&good).unwrap();
    assert_eq!(trainer.aborted_phase(), None);
}

#[test]
fn checkpoint_restores_predictions() {
    let path = std::env::temp_dir().join(format!("tapegrad-trainer-{}.tgrd", std::process::id()));
    let config = TrainConfig::default()
        .with_epochs(20)
        .with_learning_rate(0.05)
        .with_batch_size(2);

    let mut trained = pattern_trainer(config.clone());
    trained.fit(&mut config.loader(blobs()).unwrap()).unwrap();
    trained.save_checkpoint(&path).unwrap();

    let mut graph = Graph::new();
    let model = Sequential::mlp(&mut graph, &[2, 16, 3], 99).unwrap();
    let mut fresh = Trainer::new(graph, model, config).unwrap();
    fresh.restore_checkpoint(&path).unwrap();

    assert_eq!(parameter_values(&fresh), parameter_values(&trained));
    let sample = [0.5, 4.0];
    assert_eq!(
        fresh.probabilities(&sample).unwrap(),
        trained.probabilities(&sample).unwrap()
    );

    let mut graph = Graph::new();
    let model = Sequential::mlp(&mut graph, &[2, 8, 3], 0).unwrap();
    let mut narrow = Trainer::new(graph, model, TrainConfig::default()).unwrap();
    let before = parameter_values(&narrow);
    assert!(matches!(
        narrow.restore_checkpoint(&path),
        Err(GradError::Shape { op: "restore", .. })
    ));
    assert_eq!(parameter_values(&narrow), before);

    std::fs::remove_file(&path).ok();
}
