//! Core tensor data structure.
//!
//! # Core Tensor Utilities
//!
//! A [`Tensor`] is a dense, row-major `f64` array with a runtime shape. It is
//! a plain value: gradients, gradient tracking and provenance live in the
//! [`Graph`](crate::graph::Graph) slot that owns the tensor, not in the tensor.
//!
//! ## Design Highlights
//! - Shape is stored as a `Vec<usize>` and checked against the element count
//!   on construction
//! - The empty shape `[]` denotes a one-element scalar
//! - The `tensor!` macro builds tensors from nested literal arrays
//!
//! ## Limitations
//! - Row-major only
//! - No broadcasting, slicing, or views
//!
//! ## Example
//!
//! ```rust
//! use tapegrad::tensors::Tensor;
//! let t = Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
//! assert_eq!(t.shape(), &[2, 3]);
//! ```

use crate::error::{GradError, Result};

/// An N-dimensional tensor with a shape and flat row-major data.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl Tensor {
    /// Creates a new tensor with the given shape and flat data.
    ///
    /// # Errors
    /// [`GradError::DataLength`] if the number of elements in `data` does not
    /// match the shape product, or if any dimension is zero.
    pub fn new(shape: impl Into<Vec<usize>>, data: Vec<f64>) -> Result<Self> {
        let shape = shape.into();
        if shape.contains(&0) || shape.iter().product::<usize>() != data.len() {
            return Err(GradError::DataLength {
                shape,
                len: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    /// Builds a tensor from parts the caller has already checked.
    ///
    /// # Panics
    /// If a dimension is zero or the element count does not match the shape.
    #[doc(hidden)]
    #[must_use]
    pub fn from_parts(shape: Vec<usize>, data: Vec<f64>) -> Self {
        assert!(
            !shape.contains(&0) && shape.iter().product::<usize>() == data.len(),
            "shape {shape:?} is incompatible with {} data elements",
            data.len()
        );
        Self { shape, data }
    }

    /// A tensor of the given shape filled with `value`.
    ///
    /// # Errors
    /// [`GradError::DataLength`] if any dimension is zero.
    pub fn full(shape: &[usize], value: f64) -> Result<Self> {
        Self::new(shape, vec![value; shape.iter().product()])
    }

    /// A tensor of the given shape filled with zeros.
    ///
    /// # Errors
    /// [`GradError::DataLength`] if any dimension is zero.
    pub fn zeros(shape: &[usize]) -> Result<Self> {
        Self::full(shape, 0.0)
    }

    /// A tensor with the shape of `self`, filled with `value`.
    #[must_use]
    pub fn full_like(&self, value: f64) -> Self {
        Self {
            shape: self.shape.clone(),
            data: vec![value; self.data.len()],
        }
    }

    /// A tensor with the shape of `self`, filled with zeros.
    #[must_use]
    pub fn zeros_like(&self) -> Self {
        self.full_like(0.0)
    }

    /// A one-element tensor with the empty shape.
    #[must_use]
    pub fn scalar(value: f64) -> Self {
        Self {
            shape: Vec::new(),
            data: vec![value],
        }
    }

    /// The dimensions of the tensor.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// The row-major elements.
    #[must_use]
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Consumes the tensor, returning its elements.
    #[must_use]
    pub fn into_data(self) -> Vec<f64> {
        self.data
    }

    /// Number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Number of dimensions.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// The single element of a one-element tensor.
    #[must_use]
    pub fn item(&self) -> Option<f64> {
        match self.data.as_slice() {
            [x] => Some(*x),
            _ => None,
        }
    }

    /// `(rows, cols)` of a rank-2 tensor.
    pub(crate) fn matrix_dims(&self, op: &'static str) -> Result<(usize, usize)> {
        match self.shape.as_slice() {
            &[rows, cols] => Ok((rows, cols)),
            other => Err(GradError::Rank {
                op,
                expected: 2,
                found: other.to_vec(),
            }),
        }
    }

    /// Applies `f` to every element.
    #[must_use]
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            shape: self.shape.clone(),
            data: self.data.iter().map(|&x| f(x)).collect(),
        }
    }

    /// Adds `other` into `self` element-wise.
    ///
    /// # Errors
    /// [`GradError::Shape`] if the shapes differ.
    pub fn add_assign(&mut self, other: &Self) -> Result<()> {
        if self.shape != other.shape {
            return Err(GradError::shape("accumulate", &self.shape, &other.shape));
        }
        self.data
            .iter_mut()
            .zip(&other.data)
            .for_each(|(a, b)| *a += b);
        Ok(())
    }

    /// Index of the largest element (first one on ties).
    #[must_use]
    pub fn argmax(&self) -> usize {
        let mut best = 0;
        for (i, &x) in self.data.iter().enumerate() {
            if x > self.data[best] {
                best = i;
            }
        }
        best
    }
}

/// Defines a tensor from nested literal arrays.
///
/// Supports arbitrary dimensionality as long as sublists are uniform in shape.
///
/// # Example
/// ```
/// use tapegrad::tensor;
/// let t = tensor!([[1.0, 2.0], [3.0, 4.0]]);
/// assert_eq!(t.shape(), &[2, 2]);
/// ```
#[macro_export]
macro_rules! tensor {
    ([ $( [ $($row:tt)* ] ),+ $(,)? ]) => {{
        let children = vec![ $( $crate::tensor!([ $($row)* ]) ),+ ];
        let first_shape = children[0].shape().to_vec();
        assert!(children.iter().all(|c| c.shape() == first_shape.as_slice()),
            "ragged tensor literal (rows have mismatched shapes)");
        let mut shape = vec![children.len()];
        shape.extend_from_slice(&first_shape);
        let mut data = Vec::with_capacity(children.len() * children[0].numel());
        for c in children { data.extend(c.into_data()); }
        $crate::tensors::Tensor::from_parts(shape, data)
    }};

    ([ $( $x:expr ),+ $(,)? ]) => {{
        let data: Vec<f64> = vec![ $( $x ),+ ];
        $crate::tensors::Tensor::from_parts(vec![data.len()], data)
    }};

    ($x:expr) => {
        $crate::tensors::Tensor::scalar($x)
    };
}
