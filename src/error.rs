//! Error types shared by every layer of the engine.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = GradError> = core::result::Result<T, E>;

/// Why a call to [`backward`](crate::backprop::backward) was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackwardFault {
    /// The loss holds more than one element.
    NotScalar { shape: Vec<usize> },
    /// The loss does not track gradients.
    Untracked,
    /// The loss is a leaf; there is nothing to differentiate through.
    NoProducer,
}

impl core::fmt::Display for BackwardFault {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotScalar { shape } => write!(f, "loss must be a scalar, got shape {shape:?}"),
            Self::Untracked => f.write_str("loss does not require gradients"),
            Self::NoProducer => f.write_str("loss was not produced by any operation"),
        }
    }
}

/// Errors raised by tensor construction, graph operations, the autograd
/// engine, the optimizer and the training loop.
#[derive(Debug, Error)]
pub enum GradError {
    /// Operand dimensions are incompatible with the primitive.
    #[error("shape mismatch in {op}: {lhs:?} vs {rhs:?}")]
    Shape {
        op: &'static str,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },

    /// The operand has the wrong number of dimensions.
    #[error("{op} expects a rank-{expected} tensor, found shape {found:?}")]
    Rank {
        op: &'static str,
        expected: usize,
        found: Vec<usize>,
    },

    /// The element count does not match the product of the shape.
    #[error("shape {shape:?} is incompatible with {len} data elements")]
    DataLength { shape: Vec<usize>, len: usize },

    /// A label or index lies outside `[0, bound)`.
    #[error("index {index} out of range for {bound} classes")]
    Index { index: usize, bound: usize },

    /// `backward` was called on something that cannot seed a reverse pass.
    #[error("invalid backward: {0}")]
    InvalidBackward(BackwardFault),

    /// `step` was called while some parameters have no gradient.
    #[error("no gradient for parameters {params:?}; call backward before step")]
    MissingGradient { params: Vec<usize> },

    /// An input lies outside the primitive's mathematical domain.
    #[error("value {value} outside the domain of {op}")]
    Domain { op: &'static str, value: f64 },

    /// A handle that does not belong to (or no longer lives in) the graph.
    #[error("unknown tensor handle {0}")]
    UnknownTensor(usize),

    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A checkpoint file failed validation.
    #[error("corrupt checkpoint: {0}")]
    Checkpoint(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GradError {
    pub(crate) fn shape(op: &'static str, lhs: &[usize], rhs: &[usize]) -> Self {
        Self::Shape {
            op,
            lhs: lhs.to_vec(),
            rhs: rhs.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_error_names_both_shapes() {
        let err = GradError::shape("matmul", &[2, 3], &[4, 2]);
        assert_eq!(
            err.to_string(),
            "shape mismatch in matmul: [2, 3] vs [4, 2]"
        );
    }

    #[test]
    fn backward_fault_is_readable() {
        let err = GradError::InvalidBackward(BackwardFault::NotScalar { shape: vec![3] });
        assert_eq!(
            err.to_string(),
            "invalid backward: loss must be a scalar, got shape [3]"
        );
    }
}
