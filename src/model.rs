//! Layer stacks built from parameters living in a [`Graph`].
//!
//! A [`Sequential`] model is a list of layers. Only `Linear` layers own
//! parameters (a weight `[inputs, outputs]` and a bias `[outputs]`); the
//! activations are stateless and map one-to-one onto graph primitives.
//!
//! Parameters are created as leaves when the model is built, so they sit
//! below any [`Mark`](crate::graph::Mark) taken afterwards and survive every
//! per-batch rewind.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{GradError, Result};
use crate::graph::{Graph, TensorId};
use crate::tensors::Tensor;

/// Description of one layer before parameters exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerSpec {
    Linear { inputs: usize, outputs: usize },
    Relu,
    Sigmoid,
    LogSoftmax,
    Softmax,
}

/// A built layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Linear { weight: TensorId, bias: TensorId },
    Relu,
    Sigmoid,
    LogSoftmax,
    Softmax,
}

/// Layers applied in order.
#[derive(Debug, Clone)]
pub struct Sequential {
    layers: Vec<Layer>,
    inputs: usize,
    outputs: usize,
}

impl Sequential {
    /// Builds `specs` with weights and biases drawn uniformly from
    /// `[-1/√fan_in, 1/√fan_in)` using a generator seeded with `seed`.
    ///
    /// # Errors
    /// See [`build_with`](Self::build_with).
    pub fn build(graph: &mut Graph, specs: &[LayerSpec], seed: u64) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::build_with(graph, specs, |_, shape, fan_in| {
            let bound = 1.0 / (fan_in as f64).sqrt();
            let data = (0..shape.iter().product::<usize>())
                .map(|_| rng.random_range(-bound..bound))
                .collect();
            Tensor::from_parts(shape.to_vec(), data)
        })
    }

    /// Builds `specs` with caller-provided initial values.
    ///
    /// `init(layer, shape, fan_in)` is called for the weight and then the
    /// bias of every linear layer; `layer` counts linear layers from zero.
    ///
    /// # Errors
    /// - [`GradError::Config`] if there is no linear layer or one has a zero
    ///   dimension
    /// - [`GradError::Shape`] if consecutive linear layers do not chain, or
    ///   `init` returns a tensor of the wrong shape
    pub fn build_with<F>(graph: &mut Graph, specs: &[LayerSpec], mut init: F) -> Result<Self>
    where
        F: FnMut(usize, &[usize], usize) -> Tensor,
    {
        let mut layers = Vec::with_capacity(specs.len());
        let mut width: Option<(usize, usize)> = None;
        let mut ordinal = 0;

        for spec in specs {
            let layer = match *spec {
                LayerSpec::Linear { inputs, outputs } => {
                    if inputs == 0 || outputs == 0 {
                        return Err(GradError::Config(format!(
                            "linear layer {ordinal} has a zero dimension ({inputs} -> {outputs})"
                        )));
                    }
                    if let Some((_, prev)) = width {
                        if prev != inputs {
                            return Err(GradError::shape("sequential", &[prev], &[inputs]));
                        }
                    }
                    let weight = init_tensor(&mut init, ordinal, &[inputs, outputs], inputs)?;
                    let bias = init_tensor(&mut init, ordinal, &[outputs], inputs)?;
                    width = Some((width.map_or(inputs, |(first, _)| first), outputs));
                    ordinal += 1;
                    Layer::Linear {
                        weight: graph.parameter(weight),
                        bias: graph.parameter(bias),
                    }
                }
                LayerSpec::Relu => Layer::Relu,
                LayerSpec::Sigmoid => Layer::Sigmoid,
                LayerSpec::LogSoftmax => Layer::LogSoftmax,
                LayerSpec::Softmax => Layer::Softmax,
            };
            layers.push(layer);
        }

        let (inputs, outputs) = width
            .ok_or_else(|| GradError::Config("model needs at least one linear layer".into()))?;
        tracing::debug!(layers = layers.len(), inputs, outputs, "model built");
        Ok(Self {
            layers,
            inputs,
            outputs,
        })
    }

    /// A classifier MLP over `widths`: linear layers between consecutive
    /// widths, ReLU between them, log-softmax at the end.
    ///
    /// `mlp(graph, &[784, 128, 64, 10], seed)` is the usual digit classifier.
    ///
    /// # Errors
    /// [`GradError::Config`] for fewer than two widths or a zero width.
    pub fn mlp(graph: &mut Graph, widths: &[usize], seed: u64) -> Result<Self> {
        Self::build(graph, &mlp_specs(widths)?, seed)
    }

    /// Applies every layer to `x` (`[batch, inputs]`).
    ///
    /// # Errors
    /// Shape errors from the underlying primitives.
    pub fn forward(&self, graph: &mut Graph, x: TensorId) -> Result<TensorId> {
        self.layers.iter().try_fold(x, |h, layer| match *layer {
            Layer::Linear { weight, bias } => graph.linear(h, weight, bias),
            Layer::Relu => graph.relu(h),
            Layer::Sigmoid => graph.sigmoid(h),
            Layer::LogSoftmax => graph.log_softmax(h),
            Layer::Softmax => graph.softmax(h),
        })
    }

    /// Weight and bias handles, layer by layer.
    #[must_use]
    pub fn parameters(&self) -> Vec<TensorId> {
        self.layers
            .iter()
            .filter_map(|layer| match *layer {
                Layer::Linear { weight, bias } => Some([weight, bias]),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[must_use]
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Features expected per example.
    #[must_use]
    pub const fn inputs(&self) -> usize {
        self.inputs
    }

    /// Width of the last linear layer.
    #[must_use]
    pub const fn outputs(&self) -> usize {
        self.outputs
    }
}

/// Layer specs of [`Sequential::mlp`].
///
/// # Errors
/// [`GradError::Config`] for fewer than two widths or a zero width.
pub fn mlp_specs(widths: &[usize]) -> Result<Vec<LayerSpec>> {
    if widths.len() < 2 || widths.contains(&0) {
        return Err(GradError::Config(format!(
            "mlp needs at least two non-zero widths, got {widths:?}"
        )));
    }
    let mut specs = Vec::with_capacity(widths.len() * 2);
    for (i, pair) in widths.windows(2).enumerate() {
        if i > 0 {
            specs.push(LayerSpec::Relu);
        }
        specs.push(LayerSpec::Linear {
            inputs: pair[0],
            outputs: pair[1],
        });
    }
    specs.push(LayerSpec::LogSoftmax);
    Ok(specs)
}

fn init_tensor<F>(init: &mut F, layer: usize, shape: &[usize], fan_in: usize) -> Result<Tensor>
where
    F: FnMut(usize, &[usize], usize) -> Tensor,
{
    let tensor = init(layer, shape, fan_in);
    if tensor.shape() == shape {
        Ok(tensor)
    } else {
        Err(GradError::shape("init", shape, tensor.shape()))
    }
}
