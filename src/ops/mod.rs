//! # Differentiable primitives
//!
//! Every primitive is a method on [`Graph`] that checks its operand shapes,
//! computes the forward value with the kernels in [`cpu`] (or [`dispatch`]
//! for matrix products), and records an [`Op`] node carrying whatever the
//! backward rule needs beyond the input values.
//!
//! | primitive | forward | cached for backward |
//! |---|---|---|
//! | `add`, `mul` | element-wise, equal shapes | - |
//! | `scale` | `c · x` | `c` |
//! | `matmul` | `[m,k] · [k,n]` | - |
//! | `linear` | `x W + b` with `x:[n,i]`, `W:[i,o]`, `b:[o]` | - |
//! | `sigmoid` | `1 / (1 + e^-x)` | output |
//! | `relu` | `max(0, x)` | positive mask |
//! | `log_softmax`, `softmax` | last axis | softmax |
//! | `nll_loss` | `−mean logp[i, label_i]` | labels |
//! | `mean` | `Σx / n` | - |
//! | `binary_cross_entropy` | `−Σ y ln p + (1−y) ln(1−p)` | targets |
//!
//! ## Submodules
//!
//! - [`cpu`]: multi-threaded kernels (default backend, used by all gradients)
//! - [`wgpu`] *(opt-in)*: GPU matmul pipeline
//! - [`dispatch`]: backend selection for forward matrix products

pub mod cpu;
pub mod dispatch;
#[cfg(feature = "wgpu")]
pub mod wgpu;

use crate::error::{GradError, Result};
use crate::graph::{Graph, TensorId};
use crate::tensors::Tensor;

/// A recorded primitive and the forward intermediates its backward rule
/// reads.
#[derive(Debug, Clone)]
pub enum Op {
    Add,
    Mul,
    Scale { factor: f64 },
    MatMul,
    Linear,
    Sigmoid { output: Tensor },
    Relu { positive: Vec<bool> },
    LogSoftmax { softmax: Tensor },
    Softmax { output: Tensor },
    NllLoss { labels: Vec<usize> },
    Mean,
    BinaryCrossEntropy { targets: Tensor },
}

impl Op {
    /// Short lowercase name used in errors and log spans.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Mul => "mul",
            Self::Scale { .. } => "scale",
            Self::MatMul => "matmul",
            Self::Linear => "linear",
            Self::Sigmoid { .. } => "sigmoid",
            Self::Relu { .. } => "relu",
            Self::LogSoftmax { .. } => "log_softmax",
            Self::Softmax { .. } => "softmax",
            Self::NllLoss { .. } => "nll_loss",
            Self::Mean => "mean",
            Self::BinaryCrossEntropy { .. } => "binary_cross_entropy",
        }
    }

    /// Vector-Jacobian product.
    ///
    /// `inputs` are the current input values in operand order, `grad` the
    /// accumulated gradient of the output. Entry `i` of the result is `None`
    /// when `needs[i]` is false.
    pub(crate) fn backward(
        &self,
        inputs: &[&Tensor],
        needs: &[bool],
        grad: &Tensor,
    ) -> Result<Vec<Option<Tensor>>> {
        let want = |i: usize| needs.get(i).copied().unwrap_or(false);
        let like = |t: &Tensor, data: Vec<f64>| Tensor::from_parts(t.shape().to_vec(), data);
        let g = grad.data();

        let grads = match self {
            Self::Add => vec![
                want(0).then(|| grad.clone()),
                want(1).then(|| grad.clone()),
            ],
            Self::Mul => {
                let (a, b) = (inputs[0], inputs[1]);
                vec![
                    want(0).then(|| like(a, cpu::zip_map(g, b.data(), |d, y| d * y))),
                    want(1).then(|| like(b, cpu::zip_map(g, a.data(), |d, x| d * x))),
                ]
            }
            Self::Scale { factor } => {
                let c = *factor;
                vec![want(0).then(|| like(inputs[0], cpu::map(g, |d| d * c)))]
            }
            Self::MatMul => {
                let (a, b) = (inputs[0], inputs[1]);
                let (m, k) = a.matrix_dims("matmul")?;
                let (_, n) = b.matrix_dims("matmul")?;
                vec![
                    want(0).then(|| like(a, cpu::matmul_bt(g, b.data(), m, k, n))),
                    want(1).then(|| like(b, cpu::matmul_at(a.data(), g, m, k, n))),
                ]
            }
            Self::Linear => {
                let (x, w, b) = (inputs[0], inputs[1], inputs[2]);
                let (rows, fan_in) = x.matrix_dims("linear")?;
                let (_, fan_out) = w.matrix_dims("linear")?;
                vec![
                    want(0).then(|| like(x, cpu::matmul_bt(g, w.data(), rows, fan_in, fan_out))),
                    want(1).then(|| like(w, cpu::matmul_at(x.data(), g, rows, fan_in, fan_out))),
                    want(2).then(|| like(b, cpu::column_sum(g, fan_out))),
                ]
            }
            Self::Sigmoid { output } => {
                vec![want(0).then(|| like(output, cpu::sigmoid_backward(g, output.data())))]
            }
            Self::Relu { positive } => {
                vec![want(0).then(|| like(inputs[0], cpu::relu_backward(g, positive)))]
            }
            Self::LogSoftmax { softmax } => {
                let cols = last_axis(softmax);
                vec![want(0).then(|| {
                    like(softmax, cpu::log_softmax_backward(g, softmax.data(), cols))
                })]
            }
            Self::Softmax { output } => {
                let cols = last_axis(output);
                vec![want(0).then(|| like(output, cpu::softmax_backward(g, output.data(), cols)))]
            }
            Self::NllLoss { labels } => {
                let logp = inputs[0];
                let upstream = scalar_grad(grad);
                vec![want(0).then(|| {
                    let cols = last_axis(logp);
                    let mut out = logp.zeros_like();
                    let weight = -upstream / labels.len() as f64;
                    for (row, &label) in labels.iter().enumerate() {
                        out.data_mut()[row * cols + label] = weight;
                    }
                    out
                })]
            }
            Self::Mean => {
                let x = inputs[0];
                let share = scalar_grad(grad) / x.numel() as f64;
                vec![want(0).then(|| x.full_like(share))]
            }
            Self::BinaryCrossEntropy { targets } => {
                let p = inputs[0];
                let upstream = scalar_grad(grad);
                vec![want(0).then(|| {
                    like(
                        p,
                        cpu::zip_map(p.data(), targets.data(), |p, y| {
                            -upstream * (y / p - (1.0 - y) / (1.0 - p))
                        }),
                    )
                })]
            }
        };
        Ok(grads)
    }
}

fn last_axis(t: &Tensor) -> usize {
    t.shape().last().copied().unwrap_or(1)
}

fn scalar_grad(grad: &Tensor) -> f64 {
    grad.data().first().copied().unwrap_or(0.0)
}

fn same_shape(op: &'static str, a: &Tensor, b: &Tensor) -> Result<()> {
    if a.shape() == b.shape() {
        Ok(())
    } else {
        Err(GradError::shape(op, a.shape(), b.shape()))
    }
}

impl Graph {
    /// Element-wise `a + b`.
    ///
    /// # Errors
    /// [`GradError::Shape`] unless both operands have the same shape.
    pub fn add(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
        let (x, y) = (self.value(a)?, self.value(b)?);
        same_shape("add", x, y)?;
        let out = Tensor::from_parts(x.shape().to_vec(), cpu::zip_map(x.data(), y.data(), |p, q| p + q));
        Ok(self.record(Op::Add, vec![a, b], out))
    }

    /// Element-wise `a ⊙ b`.
    ///
    /// # Errors
    /// [`GradError::Shape`] unless both operands have the same shape.
    pub fn mul(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
        let (x, y) = (self.value(a)?, self.value(b)?);
        same_shape("mul", x, y)?;
        let out = Tensor::from_parts(x.shape().to_vec(), cpu::zip_map(x.data(), y.data(), |p, q| p * q));
        Ok(self.record(Op::Mul, vec![a, b], out))
    }

    /// `factor · x` for a constant factor.
    ///
    /// # Errors
    /// [`GradError::UnknownTensor`] for a foreign handle.
    pub fn scale(&mut self, x: TensorId, factor: f64) -> Result<TensorId> {
        let value = self.value(x)?;
        let out = Tensor::from_parts(value.shape().to_vec(), cpu::map(value.data(), |v| v * factor));
        Ok(self.record(Op::Scale { factor }, vec![x], out))
    }

    /// Matrix product `[m,k] · [k,n] → [m,n]`.
    ///
    /// # Errors
    /// [`GradError::Rank`] for non-matrices, [`GradError::Shape`] when the
    /// inner dimensions differ.
    pub fn matmul(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
        let (x, y) = (self.value(a)?, self.value(b)?);
        let (m, k) = x.matrix_dims("matmul")?;
        let (k2, n) = y.matrix_dims("matmul")?;
        if k != k2 {
            return Err(GradError::shape("matmul", x.shape(), y.shape()));
        }
        let out = Tensor::from_parts(vec![m, n], dispatch::matmul(x.data(), y.data(), m, k, n));
        Ok(self.record(Op::MatMul, vec![a, b], out))
    }

    /// Affine layer `x W + b` for `x:[n,i]`, `W:[i,o]`, `b:[o]`.
    ///
    /// # Errors
    /// [`GradError::Rank`] or [`GradError::Shape`] when the operands do not
    /// line up.
    pub fn linear(&mut self, x: TensorId, w: TensorId, b: TensorId) -> Result<TensorId> {
        let (xv, wv, bv) = (self.value(x)?, self.value(w)?, self.value(b)?);
        let (rows, fan_in) = xv.matrix_dims("linear")?;
        let (w_in, fan_out) = wv.matrix_dims("linear")?;
        if fan_in != w_in {
            return Err(GradError::shape("linear", xv.shape(), wv.shape()));
        }
        if bv.shape() != [fan_out] {
            return Err(GradError::shape("linear", wv.shape(), bv.shape()));
        }
        let mut data = dispatch::matmul(xv.data(), wv.data(), rows, fan_in, fan_out);
        cpu::add_row_bias(&mut data, bv.data());
        let out = Tensor::from_parts(vec![rows, fan_out], data);
        Ok(self.record(Op::Linear, vec![x, w, b], out))
    }

    /// Logistic sigmoid.
    ///
    /// # Errors
    /// [`GradError::UnknownTensor`] for a foreign handle.
    pub fn sigmoid(&mut self, x: TensorId) -> Result<TensorId> {
        let value = self.value(x)?;
        let out = Tensor::from_parts(value.shape().to_vec(), cpu::sigmoid(value.data()));
        Ok(self.record(Op::Sigmoid { output: out.clone() }, vec![x], out))
    }

    /// `max(0, x)`; the gradient at exactly zero is zero.
    ///
    /// # Errors
    /// [`GradError::UnknownTensor`] for a foreign handle.
    pub fn relu(&mut self, x: TensorId) -> Result<TensorId> {
        let value = self.value(x)?;
        let (data, positive) = cpu::relu(value.data());
        let out = Tensor::from_parts(value.shape().to_vec(), data);
        Ok(self.record(Op::Relu { positive }, vec![x], out))
    }

    /// Log-softmax over the last axis.
    ///
    /// # Errors
    /// [`GradError::UnknownTensor`] for a foreign handle.
    pub fn log_softmax(&mut self, x: TensorId) -> Result<TensorId> {
        let value = self.value(x)?;
        let shape = value.shape().to_vec();
        let (logp, probs) = cpu::log_softmax_rows(value.data(), last_axis(value));
        let softmax = Tensor::from_parts(shape.clone(), probs);
        let out = Tensor::from_parts(shape, logp);
        Ok(self.record(Op::LogSoftmax { softmax }, vec![x], out))
    }

    /// Softmax over the last axis.
    ///
    /// # Errors
    /// [`GradError::UnknownTensor`] for a foreign handle.
    pub fn softmax(&mut self, x: TensorId) -> Result<TensorId> {
        let value = self.value(x)?;
        let out = Tensor::from_parts(
            value.shape().to_vec(),
            cpu::softmax_rows(value.data(), last_axis(value)),
        );
        Ok(self.record(Op::Softmax { output: out.clone() }, vec![x], out))
    }

    /// Mean negative log-likelihood of `labels` under row-wise
    /// log-probabilities `[n, classes]`.
    ///
    /// # Errors
    /// [`GradError::Rank`] unless `log_probs` is a matrix,
    /// [`GradError::Shape`] when the label count differs from the row count,
    /// [`GradError::Index`] for a label outside `[0, classes)`.
    pub fn nll_loss(&mut self, log_probs: TensorId, labels: &[usize]) -> Result<TensorId> {
        let value = self.value(log_probs)?;
        let (rows, classes) = value.matrix_dims("nll_loss")?;
        if labels.len() != rows {
            return Err(GradError::shape("nll_loss", &[rows], &[labels.len()]));
        }
        if let Some(&bad) = labels.iter().find(|&&label| label >= classes) {
            return Err(GradError::Index {
                index: bad,
                bound: classes,
            });
        }
        let total: f64 = labels
            .iter()
            .enumerate()
            .map(|(row, &label)| value.data()[row * classes + label])
            .sum();
        let loss = -total / rows as f64;
        Ok(self.record(
            Op::NllLoss {
                labels: labels.to_vec(),
            },
            vec![log_probs],
            Tensor::scalar(loss),
        ))
    }

    /// Mean of all elements, as a scalar.
    ///
    /// # Errors
    /// [`GradError::UnknownTensor`] for a foreign handle.
    pub fn mean(&mut self, x: TensorId) -> Result<TensorId> {
        let value = self.value(x)?;
        let mean = value.data().iter().sum::<f64>() / value.numel() as f64;
        Ok(self.record(Op::Mean, vec![x], Tensor::scalar(mean)))
    }

    /// Sum-reduced binary cross-entropy of probabilities against same-shaped
    /// targets.
    ///
    /// # Errors
    /// [`GradError::Shape`] when the target shape differs,
    /// [`GradError::Domain`] for a probability outside the open interval
    /// `(0, 1)`.
    pub fn binary_cross_entropy(&mut self, probs: TensorId, targets: &Tensor) -> Result<TensorId> {
        let p = self.value(probs)?;
        same_shape("binary_cross_entropy", p, targets)?;
        if let Some(&bad) = p.data().iter().find(|&&v| !(v > 0.0 && v < 1.0)) {
            return Err(GradError::Domain {
                op: "binary_cross_entropy",
                value: bad,
            });
        }
        let loss: f64 = -p
            .data()
            .iter()
            .zip(targets.data())
            .map(|(&p, &y)| y * p.ln() + (1.0 - y) * (1.0 - p).ln())
            .sum::<f64>();
        Ok(self.record(
            Op::BinaryCrossEntropy {
                targets: targets.clone(),
            },
            vec![probs],
            Tensor::scalar(loss),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor;

    fn close(a: &[f64], b: &[f64]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-9)
    }

    #[test]
    fn add_rejects_mismatched_shapes() {
        let mut g = Graph::new();
        let a = g.input(tensor!([1.0, 2.0]));
        let b = g.input(tensor!([1.0, 2.0, 3.0]));
        let err = g.add(a, b).unwrap_err();
        assert!(matches!(err, GradError::Shape { op: "add", .. }));
    }

    #[test]
    fn matmul_names_both_shapes() {
        let mut g = Graph::new();
        let a = g.input(Tensor::zeros(&[2, 3]).unwrap());
        let b = g.input(Tensor::zeros(&[4, 2]).unwrap());
        let err = g.matmul(a, b).unwrap_err();
        assert_eq!(err.to_string(), "shape mismatch in matmul: [2, 3] vs [4, 2]");
    }

    #[test]
    fn linear_adds_bias_per_row() {
        let mut g = Graph::new();
        let x = g.input(tensor!([[1.0, 2.0], [3.0, 4.0]]));
        let w = g.parameter(tensor!([[1.0, 0.0, 1.0], [0.0, 1.0, 1.0]]));
        let b = g.parameter(tensor!([0.5, -0.5, 0.0]));
        let y = g.linear(x, w, b).unwrap();
        let value = g.value(y).unwrap();
        assert_eq!(value.shape(), &[2, 3]);
        assert!(close(value.data(), &[1.5, 1.5, 3.0, 3.5, 3.5, 7.0]));
    }

    #[test]
    fn linear_rejects_wrong_bias() {
        let mut g = Graph::new();
        let x = g.input(Tensor::zeros(&[1, 2]).unwrap());
        let w = g.parameter(Tensor::zeros(&[2, 3]).unwrap());
        let b = g.parameter(Tensor::zeros(&[2]).unwrap());
        assert!(matches!(g.linear(x, w, b), Err(GradError::Shape { .. })));
    }

    #[test]
    fn nll_loss_averages_selected_entries() {
        let mut g = Graph::new();
        let lp = g.input(tensor!([[-0.5, -1.0], [-2.0, -0.25]]));
        let loss = g.nll_loss(lp, &[0, 1]).unwrap();
        assert!(close(g.value(loss).unwrap().data(), &[0.375]));
    }

    #[test]
    fn nll_loss_rejects_out_of_range_label() {
        let mut g = Graph::new();
        let lp = g.input(Tensor::zeros(&[1, 10]).unwrap());
        let err = g.nll_loss(lp, &[10]).unwrap_err();
        assert!(matches!(err, GradError::Index { index: 10, bound: 10 }));
    }

    #[test]
    fn nll_loss_rejects_label_count_mismatch() {
        let mut g = Graph::new();
        let lp = g.input(Tensor::zeros(&[2, 3]).unwrap());
        assert!(matches!(g.nll_loss(lp, &[0]), Err(GradError::Shape { .. })));
    }

    #[test]
    fn binary_cross_entropy_matches_closed_form() {
        let mut g = Graph::new();
        let p = g.input(tensor!([0.8, 0.3]));
        let loss = g.binary_cross_entropy(p, &tensor!([1.0, 0.0])).unwrap();
        let expected = -(0.8f64.ln() + 0.7f64.ln());
        assert!(close(g.value(loss).unwrap().data(), &[expected]));
    }

    #[test]
    fn binary_cross_entropy_rejects_saturated_probabilities() {
        let mut g = Graph::new();
        let p = g.input(tensor!([1.0, 0.5]));
        let err = g.binary_cross_entropy(p, &tensor!([1.0, 0.0])).unwrap_err();
        assert!(matches!(err, GradError::Domain { value, .. } if value == 1.0));
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let mut g = Graph::new();
        let x = g.input(tensor!([[1.0, 2.0, 3.0], [0.0, 0.0, 0.0]]));
        let y = g.softmax(x).unwrap();
        for row in g.value(y).unwrap().data().chunks(3) {
            assert!((row.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn mul_backward_swaps_operands() {
        let a = tensor!([2.0, 3.0]);
        let b = tensor!([5.0, 7.0]);
        let grads = Op::Mul
            .backward(&[&a, &b], &[true, false], &tensor!([1.0, 1.0]))
            .unwrap();
        assert_eq!(grads[0].as_ref().unwrap().data(), &[5.0, 7.0]);
        assert!(grads[1].is_none());
    }
}
