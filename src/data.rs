//! In-memory datasets and mini-batch iteration.
//!
//! A [`Dataset`] holds flattened examples (`features` values each) and their
//! integer class labels. A [`DataLoader`] cuts it into [`Batch`]es, either in
//! dataset order or in a fresh permutation per epoch drawn from a seeded
//! generator, so two loaders with the same seed produce the same batches.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::error::{GradError, Result};
use crate::tensors::Tensor;

/// Flattened examples with one label each.
#[derive(Debug, Clone)]
pub struct Dataset {
    inputs: Vec<f64>,
    labels: Vec<usize>,
    features: usize,
}

impl Dataset {
    /// # Errors
    /// [`GradError::DataLength`] unless `inputs` holds exactly
    /// `labels.len() × features` values and both are non-empty.
    pub fn new(inputs: Vec<f64>, labels: Vec<usize>, features: usize) -> Result<Self> {
        if features == 0 || labels.is_empty() || inputs.len() != labels.len() * features {
            return Err(GradError::DataLength {
                shape: vec![labels.len(), features],
                len: inputs.len(),
            });
        }
        Ok(Self {
            inputs,
            labels,
            features,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    #[must_use]
    pub const fn features(&self) -> usize {
        self.features
    }

    /// Example `i` as a flat slice plus its label.
    #[must_use]
    pub fn get(&self, i: usize) -> Option<(&[f64], usize)> {
        let label = *self.labels.get(i)?;
        let start = i * self.features;
        Some((&self.inputs[start..start + self.features], label))
    }

    /// Largest label plus one.
    #[must_use]
    pub fn classes(&self) -> usize {
        self.labels.iter().max().map_or(0, |&m| m + 1)
    }

    fn gather(&self, indices: &[usize]) -> Batch {
        let mut inputs = Vec::with_capacity(indices.len() * self.features);
        let mut labels = Vec::with_capacity(indices.len());
        for &i in indices {
            let start = i * self.features;
            inputs.extend_from_slice(&self.inputs[start..start + self.features]);
            labels.push(self.labels[i]);
        }
        Batch {
            inputs: Tensor::from_parts(vec![indices.len(), self.features], inputs),
            labels,
        }
    }
}

/// One mini-batch: `[size, features]` inputs and `size` labels.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub inputs: Tensor,
    pub labels: Vec<usize>,
}

impl Batch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Splits a [`Dataset`] into mini-batches, epoch after epoch.
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: Dataset,
    batch_size: usize,
    rng: Option<StdRng>,
}

impl DataLoader {
    /// Batches in dataset order.
    ///
    /// # Errors
    /// [`GradError::Config`] for a zero batch size.
    pub fn new(dataset: Dataset, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(GradError::Config("batch size must be positive".into()));
        }
        Ok(Self {
            dataset,
            batch_size,
            rng: None,
        })
    }

    /// Draws a new permutation for every epoch from a generator seeded with
    /// `seed`.
    #[must_use]
    pub fn shuffled(mut self, seed: u64) -> Self {
        self.rng = Some(StdRng::seed_from_u64(seed));
        self
    }

    #[must_use]
    pub const fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    #[must_use]
    pub const fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of batches per epoch; the last one may be short.
    #[must_use]
    pub fn batches_per_epoch(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Starts an epoch. Can be called any number of times.
    pub fn epoch(&mut self) -> Batches<'_> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if let Some(rng) = self.rng.as_mut() {
            order.shuffle(rng);
        }
        Batches {
            dataset: &self.dataset,
            order,
            batch_size: self.batch_size,
            cursor: 0,
        }
    }
}

/// Iterator over the batches of one epoch.
#[derive(Debug)]
pub struct Batches<'a> {
    dataset: &'a Dataset,
    order: Vec<usize>,
    batch_size: usize,
    cursor: usize,
}

impl Iterator for Batches<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let batch = self.dataset.gather(&self.order[self.cursor..end]);
        self.cursor = end;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.order.len() - self.cursor).div_ceil(self.batch_size);
        (left, Some(left))
    }
}

impl ExactSizeIterator for Batches<'_> {}
