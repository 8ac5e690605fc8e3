//! Mini-batch training loop.
//!
//! # Phases
//!
//! Every batch walks the same cycle:
//!
//! ```text
//! Idle → ForwardPass → LossComputed → BackwardPass → Updated → Idle
//! ```
//!
//! Gradients are reset on entering `ForwardPass`. The batch's nodes are
//! recorded after a graph [`Mark`](crate::graph::Mark) and discarded on the
//! way back to `Idle`, whether the batch succeeded or not. A failing batch
//! never leaves a partial parameter update: `backward` commits nothing on
//! error, and `step` checks every gradient before writing any value. The
//! phase a batch failed in is kept in [`Trainer::aborted_phase`] and logged.
//!
//! # Design Highlights
//! - One owned [`Graph`] per trainer; parameters sit below every mark
//! - [`TrainConfig`] defaults match the classic MNIST recipe (5 epochs,
//!   learning rate 0.003, batches of 64)
//! - Running loss per epoch is logged with `tracing` at `info` level
//! - [`Trainer::fit_with`] lets a hook stop training between batches

use std::ops::ControlFlow;
use std::path::Path;

use crate::backprop::backward;
use crate::data::{Batch, DataLoader, Dataset};
use crate::error::{GradError, Result};
use crate::graph::Graph;
use crate::model::Sequential;
use crate::modelio::{load_parameters, save_parameters};
use crate::optim::{Optimizer, Sgd};
use crate::tensors::Tensor;

/// Where a trainer is within one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    ForwardPass,
    LossComputed,
    BackwardPass,
    Updated,
}

impl Phase {
    /// The phase that follows `self` in a successful batch.
    #[must_use]
    pub const fn next(self) -> Self {
        match self {
            Self::Idle => Self::ForwardPass,
            Self::ForwardPass => Self::LossComputed,
            Self::LossComputed => Self::BackwardPass,
            Self::BackwardPass => Self::Updated,
            Self::Updated => Self::Idle,
        }
    }
}

/// Hyper-parameters of a training run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainConfig {
    pub epochs: usize,
    pub learning_rate: f64,
    pub batch_size: usize,
    /// Seed of the per-epoch shuffle.
    pub seed: u64,
    pub shuffle: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 5,
            learning_rate: 0.003,
            batch_size: 64,
            seed: 0,
            shuffle: true,
        }
    }
}

impl TrainConfig {
    #[must_use]
    pub const fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    #[must_use]
    pub const fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    #[must_use]
    pub const fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// # Errors
    /// [`GradError::Config`] for zero epochs, a zero batch size, or a
    /// learning rate that is not finite and positive.
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(GradError::Config("epochs must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(GradError::Config("batch size must be positive".into()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(GradError::Config(format!(
                "learning rate must be finite and positive, got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }

    /// A loader over `dataset` with this config's batch size and shuffling.
    ///
    /// # Errors
    /// [`GradError::Config`] for a zero batch size.
    pub fn loader(&self, dataset: Dataset) -> Result<DataLoader> {
        let loader = DataLoader::new(dataset, self.batch_size)?;
        Ok(if self.shuffle {
            loader.shuffled(self.seed)
        } else {
            loader
        })
    }
}

/// Running loss of one epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochStats {
    pub epoch: usize,
    /// Sum of batch losses over the number of batches.
    pub loss: f64,
    pub batches: usize,
}

/// Summary returned by [`Trainer::fit`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainReport {
    pub epochs: Vec<EpochStats>,
    pub stopped_early: bool,
}

impl TrainReport {
    /// Running loss of the first epoch.
    #[must_use]
    pub fn initial_loss(&self) -> Option<f64> {
        self.epochs.first().map(|e| e.loss)
    }

    /// Running loss of the last epoch.
    #[must_use]
    pub fn final_loss(&self) -> Option<f64> {
        self.epochs.last().map(|e| e.loss)
    }
}

/// Passed to the [`Trainer::fit_with`] hook after every batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchEvent {
    pub epoch: usize,
    pub batch: usize,
    pub loss: f64,
}

/// Owns a graph, a model in it, and the optimizer over the model's
/// parameters.
#[derive(Debug)]
pub struct Trainer {
    graph: Graph,
    model: Sequential,
    optimizer: Sgd,
    config: TrainConfig,
    phase: Phase,
    aborted: Option<Phase>,
}

impl Trainer {
    /// # Errors
    /// Configuration errors from [`TrainConfig::validate`] or [`Sgd::new`].
    pub fn new(graph: Graph, model: Sequential, config: TrainConfig) -> Result<Self> {
        config.validate()?;
        let optimizer = Sgd::new(&graph, model.parameters(), config.learning_rate)?;
        Ok(Self {
            graph,
            model,
            optimizer,
            config,
            phase: Phase::Idle,
            aborted: None,
        })
    }

    #[must_use]
    pub const fn graph(&self) -> &Graph {
        &self.graph
    }

    #[must_use]
    pub const fn model(&self) -> &Sequential {
        &self.model
    }

    #[must_use]
    pub const fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// Phase the last [`train_step`](Self::train_step) failed in; `None`
    /// after a successful batch.
    #[must_use]
    pub const fn aborted_phase(&self) -> Option<Phase> {
        self.aborted
    }

    /// Runs one forward/backward/update cycle and returns the batch loss.
    ///
    /// # Errors
    /// Any error of the forward pass, the loss, [`backward`] or the
    /// optimizer. The batch is abandoned and no parameter has changed.
    pub fn train_step(&mut self, batch: &Batch) -> Result<f64> {
        let mark = self.graph.mark();
        let result = self.run_batch(batch);
        self.graph.rewind(mark);
        self.aborted = match &result {
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(%err, phase = ?self.phase, "batch aborted");
                Some(self.phase)
            }
        };
        self.phase = Phase::Idle;
        result
    }

    fn advance(&mut self) {
        self.phase = self.phase.next();
    }

    fn run_batch(&mut self, batch: &Batch) -> Result<f64> {
        self.optimizer.zero_grad(&mut self.graph)?;
        self.advance();

        let x = self.graph.input(batch.inputs.clone());
        let log_probs = self.model.forward(&mut self.graph, x)?;
        let loss = self.graph.nll_loss(log_probs, &batch.labels)?;
        let value = self.graph.value(loss)?.item().unwrap_or(f64::NAN);
        self.advance();

        backward(&mut self.graph, loss)?;
        self.advance();

        self.optimizer.step(&mut self.graph)?;
        self.advance();
        tracing::trace!(size = batch.len(), loss = value, "batch done");
        Ok(value)
    }

    /// Trains for every configured epoch.
    ///
    /// # Errors
    /// The first failing batch stops training; see [`train_step`](Self::train_step).
    pub fn fit(&mut self, loader: &mut DataLoader) -> Result<TrainReport> {
        self.fit_with(loader, |_| ControlFlow::Continue(()))
    }

    /// Like [`fit`](Self::fit), calling `hook` after every batch. Returning
    /// [`ControlFlow::Break`] ends training once that batch is done.
    ///
    /// # Errors
    /// See [`fit`](Self::fit).
    pub fn fit_with<F>(&mut self, loader: &mut DataLoader, mut hook: F) -> Result<TrainReport>
    where
        F: FnMut(&BatchEvent) -> ControlFlow<()>,
    {
        let mut report = TrainReport::default();
        for epoch in 0..self.config.epochs {
            let _span = tracing::debug_span!("epoch", epoch).entered();
            let mut total = 0.0;
            let mut batches = 0;
            let mut stop = false;

            for (index, batch) in loader.epoch().enumerate() {
                let loss = self.train_step(&batch)?;
                total += loss;
                batches += 1;
                let event = BatchEvent {
                    epoch,
                    batch: index,
                    loss,
                };
                tracing::debug!(batch = index, loss, "batch");
                if hook(&event).is_break() {
                    stop = true;
                    break;
                }
            }

            if batches > 0 {
                let loss = total / batches as f64;
                tracing::info!(epoch, loss, batches, "epoch finished");
                report.epochs.push(EpochStats {
                    epoch,
                    loss,
                    batches,
                });
            }
            if stop {
                report.stopped_early = true;
                break;
            }
        }
        Ok(report)
    }

    fn infer(&mut self, sample: &[f64]) -> Result<Tensor> {
        let x = self
            .graph
            .input(Tensor::new(vec![1, sample.len()], sample.to_vec())?);
        let out = self.model.forward(&mut self.graph, x)?;
        let data = self.graph.value(out)?.data().to_vec();
        Tensor::new(vec![data.len()], data)
    }

    /// Model output for one flattened example, shape `[classes]`. For a
    /// model ending in log-softmax these are log-probabilities.
    ///
    /// # Errors
    /// Shape errors when `sample` does not have [`Sequential::inputs`]
    /// values.
    pub fn log_probabilities(&mut self, sample: &[f64]) -> Result<Tensor> {
        let mark = self.graph.mark();
        let result = self.infer(sample);
        self.graph.rewind(mark);
        result
    }

    /// `exp` of [`log_probabilities`](Self::log_probabilities).
    ///
    /// # Errors
    /// See [`log_probabilities`](Self::log_probabilities).
    pub fn probabilities(&mut self, sample: &[f64]) -> Result<Tensor> {
        Ok(self.log_probabilities(sample)?.map(f64::exp))
    }

    /// Most likely class of one example.
    ///
    /// # Errors
    /// See [`log_probabilities`](Self::log_probabilities).
    pub fn predict(&mut self, sample: &[f64]) -> Result<usize> {
        Ok(self.log_probabilities(sample)?.argmax())
    }

    /// Writes the model parameters to `path`.
    ///
    /// # Errors
    /// I/O errors from [`save_parameters`].
    pub fn save_checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        let tensors = self
            .model
            .parameters()
            .into_iter()
            .map(|p| self.graph.value(p).cloned())
            .collect::<Result<Vec<_>>>()?;
        save_parameters(path, &tensors)
    }

    /// Replaces the model parameters with the ones stored at `path`.
    ///
    /// Nothing is changed unless every stored tensor matches the shape of
    /// its parameter.
    ///
    /// # Errors
    /// Errors of [`load_parameters`], [`GradError::Checkpoint`] for a
    /// different parameter count, [`GradError::Shape`] for a shape mismatch.
    pub fn restore_checkpoint(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let params = self.model.parameters();
        let tensors = load_parameters(path)?;
        if tensors.len() != params.len() {
            return Err(GradError::Checkpoint(
                "parameter count does not match the model",
            ));
        }
        for (&param, tensor) in params.iter().zip(&tensors) {
            let current = self.graph.value(param)?;
            if current.shape() != tensor.shape() {
                return Err(GradError::shape("restore", current.shape(), tensor.shape()));
            }
        }
        for (param, tensor) in params.into_iter().zip(tensors) {
            self.graph.set_value(param, tensor)?;
        }
        Ok(())
    }
}
