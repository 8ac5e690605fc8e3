//! Finite-difference verification of analytic gradients.
//!
//! [`check_gradients`] differentiates any scalar loss built by a closure,
//! then perturbs each element of one tracked tensor by `±eps` and compares
//! the central difference `(L(x+eps) − L(x−eps)) / 2eps` with the analytic
//! gradient. Work happens on a clone of the graph, so the caller's values
//! and gradients are untouched.

use crate::approx::relative_error;
use crate::backprop::backward;
use crate::error::{BackwardFault, GradError, Result};
use crate::graph::{Graph, TensorId};
use crate::tensors::Tensor;

/// Outcome of a gradient check.
#[derive(Debug, Clone)]
pub struct GradCheckReport {
    pub analytic: Tensor,
    pub numeric: Tensor,
    /// Elements compared.
    pub checked: usize,
    pub max_abs_error: f64,
    /// Largest [`relative_error`] over all elements.
    pub max_rel_error: f64,
    /// Element with the largest relative error.
    pub worst_index: usize,
}

impl GradCheckReport {
    #[must_use]
    pub fn passed(&self, tolerance: f64) -> bool {
        self.max_rel_error <= tolerance
    }
}

/// Compares analytic and central-difference gradients of `build_loss` with
/// respect to `param`.
///
/// `build_loss` is called once for the analytic pass and twice per element
/// of `param`; it must record the loss from scratch each time.
///
/// # Errors
/// [`GradError::Config`] for a non-positive or non-finite `eps`, or when
/// `param` does not track gradients; any error of `build_loss` or
/// [`backward`].
pub fn check_gradients<F>(
    graph: &Graph,
    param: TensorId,
    eps: f64,
    mut build_loss: F,
) -> Result<GradCheckReport>
where
    F: FnMut(&mut Graph) -> Result<TensorId>,
{
    if !(eps.is_finite() && eps > 0.0) {
        return Err(GradError::Config(format!("eps must be finite and positive, got {eps}")));
    }
    if !graph.requires_grad(param)? {
        return Err(GradError::Config(format!(
            "tensor {} does not track gradients",
            param.index()
        )));
    }

    let mut scratch = graph.clone();
    scratch.clear_grad(param)?;
    let mark = scratch.mark();
    let original = scratch.value(param)?.clone();

    let loss = build_loss(&mut scratch)?;
    backward(&mut scratch, loss)?;
    let analytic = scratch
        .grad(param)?
        .cloned()
        .unwrap_or_else(|| original.zeros_like());
    scratch.rewind(mark);

    let mut numeric = original.zeros_like();
    for i in 0..original.numel() {
        let mut probe = |delta: f64| -> Result<f64> {
            let mut shifted = original.clone();
            shifted.data_mut()[i] += delta;
            scratch.set_value(param, shifted)?;
            let loss = build_loss(&mut scratch)?;
            let value = scratch.value(loss)?;
            let out = value.item().ok_or_else(|| {
                GradError::InvalidBackward(BackwardFault::NotScalar {
                    shape: value.shape().to_vec(),
                })
            });
            scratch.rewind(mark);
            out
        };
        let plus = probe(eps)?;
        let minus = probe(-eps)?;
        numeric.data_mut()[i] = (plus - minus) / (2.0 * eps);
    }

    let mut report = GradCheckReport {
        checked: original.numel(),
        max_abs_error: 0.0,
        max_rel_error: 0.0,
        worst_index: 0,
        analytic,
        numeric,
    };
    for (i, (&a, &n)) in report
        .analytic
        .data()
        .iter()
        .zip(report.numeric.data())
        .enumerate()
    {
        let rel = relative_error(a, n);
        report.max_abs_error = report.max_abs_error.max((a - n).abs());
        if rel > report.max_rel_error {
            report.max_rel_error = rel;
            report.worst_index = i;
        }
    }
    tracing::debug!(
        checked = report.checked,
        max_rel_error = report.max_rel_error,
        "gradient check"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor;

    #[test]
    fn sigmoid_mean_checks_out() {
        let mut g = Graph::new();
        let x = g.parameter(tensor!([-1.0, 0.5, 2.0]));
        let report = check_gradients(&g, x, 1e-5, |g| {
            let s = g.sigmoid(x)?;
            g.mean(s)
        })
        .unwrap();
        assert_eq!(report.checked, 3);
        assert!(report.passed(1e-6), "{report:?}");
    }

    #[test]
    fn caller_graph_is_untouched() {
        let mut g = Graph::new();
        let x = g.parameter(tensor!([1.0, 2.0]));
        check_gradients(&g, x, 1e-4, |g| {
            let sq = g.mul(x, x)?;
            g.mean(sq)
        })
        .unwrap();
        assert_eq!(g.node_count(), 0);
        assert!(g.grad(x).unwrap().is_none());
    }

    #[test]
    fn detects_a_wrong_gradient() {
        // The loss reads a stale copy of x, so the analytic gradient is zero
        // while the numeric one is not.
        let mut g = Graph::new();
        let x = g.parameter(tensor!([1.0]));
        let report = check_gradients(&g, x, 1e-4, |g| {
            let frozen = g.parameter(g.value(x)?.clone());
            let sq = g.mul(frozen, frozen)?;
            let _ = g.add(x, x)?;
            g.mean(sq)
        })
        .unwrap();
        assert!(!report.passed(1e-3));
    }
}
