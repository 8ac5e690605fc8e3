//! Arena-backed computation graph.
//!
//! Every tensor that takes part in a computation lives in a [`Graph`] slot
//! and is addressed by a copyable [`TensorId`]. Each slot records whether the
//! tensor tracks gradients, its accumulated gradient (absent until a backward
//! pass reaches it), and the [`NodeId`] of the operation that produced it.
//!
//! Nodes only ever reference slots that existed when they were recorded, so
//! the producer links form a DAG without any reference counting.
//!
//! A training loop records one batch worth of nodes after a [`Mark`] and
//! [`rewind`](Graph::rewind)s to it once the parameters are updated; the
//! parameters themselves are created before the mark and survive. Every
//! rewind starts a new generation, and a handle into a discarded region is
//! reported as unknown even after its slot index has been reused.

use crate::error::{GradError, Result};
use crate::ops::Op;
use crate::tensors::Tensor;

/// Handle to a tensor slot in a [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId {
    index: usize,
    generation: u64,
}

impl TensorId {
    /// Position of the slot in the arena.
    #[must_use]
    pub const fn index(self) -> usize {
        self.index
    }
}

/// Handle to a recorded operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    /// Position of the node in the arena.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Slot {
    pub(crate) value: Tensor,
    generation: u64,
    pub(crate) requires_grad: bool,
    pub(crate) grad: Option<Tensor>,
    pub(crate) producer: Option<NodeId>,
}

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub(crate) op: Op,
    pub(crate) inputs: Vec<TensorId>,
    pub(crate) output: TensorId,
}

/// Arena sizes at a point in time; see [`Graph::mark`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mark {
    slots: usize,
    nodes: usize,
}

/// Owns every tensor and operation node of a computation.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    slots: Vec<Slot>,
    nodes: Vec<Node>,
    generation: u64,
}

impl Graph {
    /// An empty graph.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            nodes: Vec::new(),
            generation: 0,
        }
    }

    /// Adds a leaf tensor.
    pub fn leaf(&mut self, value: Tensor, requires_grad: bool) -> TensorId {
        self.push_slot(value, requires_grad, None)
    }

    /// Adds a leaf that does not track gradients (data, labels, constants).
    pub fn input(&mut self, value: Tensor) -> TensorId {
        self.leaf(value, false)
    }

    /// Adds a leaf that tracks gradients.
    pub fn parameter(&mut self, value: Tensor) -> TensorId {
        self.leaf(value, true)
    }

    /// Current values of a tensor.
    ///
    /// # Errors
    /// [`GradError::UnknownTensor`] if `id` is not in the graph.
    pub fn value(&self, id: TensorId) -> Result<&Tensor> {
        self.slot(id).map(|slot| &slot.value)
    }

    /// Accumulated gradient of a tensor, if a backward pass has reached it
    /// since the last reset.
    ///
    /// # Errors
    /// [`GradError::UnknownTensor`] if `id` is not in the graph.
    pub fn grad(&self, id: TensorId) -> Result<Option<&Tensor>> {
        self.slot(id).map(|slot| slot.grad.as_ref())
    }

    /// Whether the tensor tracks gradients.
    ///
    /// # Errors
    /// [`GradError::UnknownTensor`] if `id` is not in the graph.
    pub fn requires_grad(&self, id: TensorId) -> Result<bool> {
        self.slot(id).map(|slot| slot.requires_grad)
    }

    /// The node that produced the tensor; `None` for leaves.
    ///
    /// # Errors
    /// [`GradError::UnknownTensor`] if `id` is not in the graph.
    pub fn producer(&self, id: TensorId) -> Result<Option<NodeId>> {
        self.slot(id).map(|slot| slot.producer)
    }

    /// Name of the primitive recorded at `node`.
    #[must_use]
    pub fn op_name(&self, node: NodeId) -> Option<&'static str> {
        self.nodes.get(node.0).map(|n| n.op.name())
    }

    /// Inputs of the node, in operand order.
    #[must_use]
    pub fn node_inputs(&self, node: NodeId) -> Option<&[TensorId]> {
        self.nodes.get(node.0).map(|n| n.inputs.as_slice())
    }

    /// Replaces the values of a tensor with a same-shaped tensor.
    ///
    /// Forward values already recorded downstream are not recomputed, while
    /// backward rules that cache nothing (`mul`, `matmul`, `linear`) read
    /// the new values. Update parameters only between batches.
    ///
    /// # Errors
    /// [`GradError::Shape`] if the shapes differ, [`GradError::UnknownTensor`]
    /// if `id` is not in the graph.
    pub fn set_value(&mut self, id: TensorId, value: Tensor) -> Result<()> {
        let slot = self.slot_mut(id)?;
        if slot.value.shape() != value.shape() {
            return Err(GradError::shape("set_value", slot.value.shape(), value.shape()));
        }
        slot.value = value;
        Ok(())
    }

    /// Drops the accumulated gradient of a tensor.
    ///
    /// # Errors
    /// [`GradError::UnknownTensor`] if `id` is not in the graph.
    pub fn clear_grad(&mut self, id: TensorId) -> Result<()> {
        self.slot_mut(id)?.grad = None;
        Ok(())
    }

    /// Number of tensor slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the graph holds no tensors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of recorded operation nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Remembers the current arena sizes.
    #[must_use]
    pub fn mark(&self) -> Mark {
        Mark {
            slots: self.slots.len(),
            nodes: self.nodes.len(),
        }
    }

    /// Discards every tensor and node created after `mark`.
    ///
    /// Handles to discarded tensors fail with [`GradError::UnknownTensor`]
    /// from then on, even once their index belongs to a newer tensor.
    pub fn rewind(&mut self, mark: Mark) {
        self.slots.truncate(mark.slots);
        self.nodes.truncate(mark.nodes);
        self.generation += 1;
    }

    /// Whether every present gradient has the shape of its tensor and no
    /// untracked tensor holds one.
    #[must_use]
    pub fn grads_consistent(&self) -> bool {
        self.slots.iter().all(|slot| match &slot.grad {
            Some(grad) => slot.requires_grad && grad.shape() == slot.value.shape(),
            None => true,
        })
    }

    pub(crate) fn slot(&self, id: TensorId) -> Result<&Slot> {
        self.slots
            .get(id.index)
            .filter(|slot| slot.generation == id.generation)
            .ok_or(GradError::UnknownTensor(id.index))
    }

    pub(crate) fn slot_mut(&mut self, id: TensorId) -> Result<&mut Slot> {
        self.slots
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)
            .ok_or(GradError::UnknownTensor(id.index))
    }

    pub(crate) fn slots_mut(&mut self) -> &mut [Slot] {
        &mut self.slots
    }

    pub(crate) fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    /// Records `op` applied to `inputs` with the already computed forward
    /// `value`. The output tracks gradients iff any input does.
    pub(crate) fn record(&mut self, op: Op, inputs: Vec<TensorId>, value: Tensor) -> TensorId {
        let requires_grad = inputs
            .iter()
            .any(|&id| self.slot(id).is_ok_and(|slot| slot.requires_grad));
        let node = NodeId(self.nodes.len());
        let output = self.push_slot(value, requires_grad, Some(node));
        self.nodes.push(Node { op, inputs, output });
        output
    }

    fn push_slot(
        &mut self,
        value: Tensor,
        requires_grad: bool,
        producer: Option<NodeId>,
    ) -> TensorId {
        let id = TensorId {
            index: self.slots.len(),
            generation: self.generation,
        };
        self.slots.push(Slot {
            value,
            generation: self.generation,
            requires_grad,
            grad: None,
            producer,
        });
        id
    }
}
