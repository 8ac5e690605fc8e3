//! Parameter optimizers.
//!
//! An [`Optimizer`] owns the list of parameter handles it updates and is the
//! only code that writes parameter values. Gradients are read from the
//! [`Graph`] slots filled by [`backward`](crate::backprop::backward).

use rayon::prelude::*;

use crate::error::{GradError, Result};
use crate::graph::{Graph, TensorId};

pub trait Optimizer {
    /// Parameters updated by [`step`](Self::step), in registration order.
    fn parameters(&self) -> &[TensorId];

    /// Resets every parameter's gradient to absent.
    ///
    /// # Errors
    /// [`GradError::UnknownTensor`] if a parameter is no longer in `graph`.
    fn zero_grad(&self, graph: &mut Graph) -> Result<()> {
        for &param in self.parameters() {
            graph.clear_grad(param)?;
        }
        Ok(())
    }

    /// Applies one update from the current gradients.
    ///
    /// # Errors
    /// Implementation-specific; no parameter may be modified when an error
    /// is returned.
    fn step(&mut self, graph: &mut Graph) -> Result<()>;
}

/// Plain stochastic gradient descent: `value ← value − lr · grad`.
#[derive(Debug, Clone)]
pub struct Sgd {
    params: Vec<TensorId>,
    lr: f64,
}

impl Sgd {
    /// Creates an optimizer over `params` (duplicates are dropped).
    ///
    /// # Errors
    /// [`GradError::Config`] for a learning rate that is not finite and
    /// positive, or for a parameter that does not track gradients;
    /// [`GradError::UnknownTensor`] for a foreign handle.
    pub fn new(graph: &Graph, params: Vec<TensorId>, lr: f64) -> Result<Self> {
        if !(lr.is_finite() && lr > 0.0) {
            return Err(GradError::Config(format!(
                "learning rate must be finite and positive, got {lr}"
            )));
        }
        let mut unique = Vec::with_capacity(params.len());
        for param in params {
            if !graph.requires_grad(param)? {
                return Err(GradError::Config(format!(
                    "tensor {} does not track gradients and cannot be optimized",
                    param.index()
                )));
            }
            if !unique.contains(&param) {
                unique.push(param);
            }
        }
        Ok(Self { params: unique, lr })
    }

    #[must_use]
    pub const fn learning_rate(&self) -> f64 {
        self.lr
    }
}

impl Optimizer for Sgd {
    fn parameters(&self) -> &[TensorId] {
        &self.params
    }

    /// # Errors
    /// [`GradError::MissingGradient`] naming every parameter without a
    /// gradient; nothing is updated in that case. Gradients are left in
    /// place after a successful step.
    fn step(&mut self, graph: &mut Graph) -> Result<()> {
        let mut missing = Vec::new();
        for &param in &self.params {
            let slot = graph.slot(param)?;
            match &slot.grad {
                None => missing.push(param.index()),
                Some(grad) if grad.shape() != slot.value.shape() => {
                    return Err(GradError::shape("sgd", slot.value.shape(), grad.shape()));
                }
                Some(_) => {}
            }
        }
        if !missing.is_empty() {
            return Err(GradError::MissingGradient { params: missing });
        }

        let lr = self.lr;
        for &param in &self.params {
            let slot = graph.slot_mut(param)?;
            if let Some(grad) = &slot.grad {
                slot.value
                    .data_mut()
                    .par_iter_mut()
                    .zip(grad.data().par_iter())
                    .for_each(|(v, g)| *v -= lr * g);
            }
        }
        tracing::trace!(params = self.params.len(), lr, "sgd step");
        Ok(())
    }
}
