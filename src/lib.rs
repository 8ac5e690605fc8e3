//! # `tapegrad`
//!
//! A minimal reverse-mode automatic differentiation engine with an SGD
//! optimizer and a mini-batch training loop, sized for small classifiers
//! such as an MLP over flattened 28×28 digits.
//!
//! ## Features
//!
//! - **Tensors**: dense row-major `f64` arrays with a runtime shape
//! - **Graph**: an arena of tensor slots and operation nodes addressed by
//!   copyable handles, with mark/rewind for per-batch reuse
//! - **Autograd**: exact vector-Jacobian products for add, mul, scale,
//!   matmul, linear, sigmoid, `ReLU`, (log-)softmax, NLL, mean and binary
//!   cross-entropy, run in reverse topological order
//! - **Training**: SGD, seeded data loading, `Sequential` models, a phased
//!   trainer, checkpoints and finite-difference gradient checks
//! - **GPU Acceleration**: optional `wgpu` compute shader for forward matrix
//!   products
//!
//! # Example
//!
//! ```rust
//! use tapegrad::{backprop::backward, graph::Graph, tensor};
//!
//! let mut graph = Graph::new();
//! let x = graph.input(tensor!([[1.0, 2.0]]));
//! let w = graph.parameter(tensor!([[0.5], [-0.25]]));
//! let b = graph.parameter(tensor!([0.1]));
//! let y = graph.linear(x, w, b).unwrap();
//! let loss = graph.mean(y).unwrap();
//! backward(&mut graph, loss).unwrap();
//!
//! assert_eq!(graph.grad(w).unwrap().unwrap().data(), &[1.0, 2.0]);
//! ```

#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::many_single_char_names,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::similar_names,
    clippy::missing_panics_doc
)]
#![deny(unsafe_code)]

pub mod approx;
pub mod backend;
pub mod backprop;
pub mod data;
pub mod error;
pub mod gradcheck;
pub mod graph;
pub mod model;
pub mod modelio;
pub mod ops;
pub mod optim;
pub mod tensors;
pub mod train;

pub use error::{GradError, Result};
pub use graph::{Graph, TensorId};
pub use tensors::Tensor;
