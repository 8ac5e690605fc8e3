//! Reverse-mode differentiation over a recorded [`Graph`].
//!
//! # Backward Pass
//!
//! [`backward`] seeds the scalar loss with gradient `1.0` and walks the
//! producer links of the graph in reverse topological order, calling each
//! node's vector-Jacobian product exactly once, after every consumer of its
//! output has contributed.
//!
//! ## Autograd Pattern
//!
//! 1. **Validate** the loss: one element, tracked, produced by an op.
//! 2. **Order** the reachable nodes with an iterative depth-first search, so
//!    long chains never recurse on the call stack.
//! 3. **Propagate** into a pending buffer per tensor. Untracked inputs are
//!    skipped and the traversal stops there.
//! 4. **Commit** the pending buffers into the graph's `grad` slots, adding to
//!    whatever earlier passes left there.
//!
//! Nothing is written to the graph before step 4, so a failing pass leaves
//! every gradient as it was. Values are never mutated.

use crate::error::{BackwardFault, GradError, Result};
use crate::graph::{Graph, NodeId, TensorId};
use crate::tensors::Tensor;

/// Accumulates `d loss / d t` into every tracked tensor `t` the loss depends
/// on, including intermediates and the loss itself.
///
/// Calling it twice without clearing gradients doubles them.
///
/// # Errors
/// [`GradError::InvalidBackward`] when `loss` has more than one element, does
/// not track gradients, or is a leaf. Errors from a backward rule abort the
/// pass without touching any gradient.
///
/// # Example
/// ```rust
/// use tapegrad::{backprop::backward, graph::Graph, tensor};
///
/// let mut graph = Graph::new();
/// let x = graph.parameter(tensor!([1.0, -2.0, 3.0]));
/// let sq = graph.mul(x, x).unwrap();
/// let loss = graph.mean(sq).unwrap();
/// backward(&mut graph, loss).unwrap();
///
/// let grad = graph.grad(x).unwrap().unwrap();
/// assert!((grad.data()[1] - (-4.0 / 3.0)).abs() < 1e-12);
/// ```
pub fn backward(graph: &mut Graph, loss: TensorId) -> Result<()> {
    let root = {
        let slot = graph.slot(loss)?;
        if slot.value.numel() != 1 {
            return Err(GradError::InvalidBackward(BackwardFault::NotScalar {
                shape: slot.value.shape().to_vec(),
            }));
        }
        if !slot.requires_grad {
            return Err(GradError::InvalidBackward(BackwardFault::Untracked));
        }
        slot.producer
            .ok_or(GradError::InvalidBackward(BackwardFault::NoProducer))?
    };

    let order = topological_order(graph, root);
    tracing::debug!(nodes = order.len(), "backward pass");

    let mut pending: Vec<Option<Tensor>> = vec![None; graph.len()];
    pending[loss.index()] = Some(graph.slot(loss)?.value.full_like(1.0));

    for &id in order.iter().rev() {
        let node = graph.node(id);
        let Some(upstream) = pending[node.output.index()].clone() else {
            continue;
        };
        let _span = tracing::trace_span!("backward_node", op = node.op.name(), node = id.0).entered();

        let values = node
            .inputs
            .iter()
            .map(|&input| graph.slot(input).map(|slot| &slot.value))
            .collect::<Result<Vec<_>>>()?;
        let needs = node
            .inputs
            .iter()
            .map(|&input| graph.slot(input).map(|slot| slot.requires_grad))
            .collect::<Result<Vec<_>>>()?;

        let grads = node.op.backward(&values, &needs, &upstream)?;
        for (&input, grad) in node.inputs.iter().zip(grads) {
            let Some(grad) = grad else { continue };
            accumulate(&mut pending[input.index()], grad)?;
        }
    }

    for (slot, grad) in graph.slots_mut().iter_mut().zip(pending) {
        let Some(grad) = grad else { continue };
        match &mut slot.grad {
            Some(existing) => existing.add_assign(&grad)?,
            None => slot.grad = Some(grad),
        }
    }
    Ok(())
}

fn accumulate(buffer: &mut Option<Tensor>, grad: Tensor) -> Result<()> {
    match buffer {
        Some(existing) => existing.add_assign(&grad),
        None => {
            *buffer = Some(grad);
            Ok(())
        }
    }
}

/// Nodes reachable from `root` through tracked inputs, each listed after
/// every node that produces one of its inputs.
fn topological_order(graph: &Graph, root: NodeId) -> Vec<NodeId> {
    let mut visited = vec![false; graph.node_count()];
    let mut order = Vec::new();
    // (node, children already pushed)
    let mut stack = vec![(root, false)];

    while let Some((id, expanded)) = stack.pop() {
        if expanded {
            order.push(id);
            continue;
        }
        if visited[id.0] {
            continue;
        }
        visited[id.0] = true;
        stack.push((id, true));
        for &input in &graph.node(id).inputs {
            let Ok(slot) = graph.slot(input) else { continue };
            if !slot.requires_grad {
                continue;
            }
            if let Some(producer) = slot.producer {
                if !visited[producer.0] {
                    stack.push((producer, false));
                }
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor;

    #[test]
    fn diamond_accumulates_both_paths() {
        // y = x*x + x  =>  dy/dx = 2x + 1
        let mut g = Graph::new();
        let x = g.parameter(tensor!([3.0]));
        let sq = g.mul(x, x).unwrap();
        let y = g.add(sq, x).unwrap();
        let loss = g.mean(y).unwrap();
        backward(&mut g, loss).unwrap();
        assert_eq!(g.grad(x).unwrap().unwrap().data(), &[7.0]);
    }

    #[test]
    fn intermediates_and_loss_receive_gradients() {
        let mut g = Graph::new();
        let x = g.parameter(tensor!([1.0, 2.0]));
        let h = g.scale(x, 3.0).unwrap();
        let loss = g.mean(h).unwrap();
        backward(&mut g, loss).unwrap();
        assert_eq!(g.grad(loss).unwrap().unwrap().data(), &[1.0]);
        assert_eq!(g.grad(h).unwrap().unwrap().data(), &[0.5, 0.5]);
        assert_eq!(g.grad(x).unwrap().unwrap().data(), &[1.5, 1.5]);
    }

    #[test]
    fn untracked_inputs_stay_without_gradient() {
        let mut g = Graph::new();
        let x = g.input(tensor!([1.0, 2.0]));
        let w = g.parameter(tensor!([0.5, 0.5]));
        let y = g.mul(x, w).unwrap();
        let loss = g.mean(y).unwrap();
        backward(&mut g, loss).unwrap();
        assert!(g.grad(x).unwrap().is_none());
        assert!(g.grads_consistent());
    }

    #[test]
    fn rejects_non_scalar_loss() {
        let mut g = Graph::new();
        let w = g.parameter(tensor!([1.0, 2.0]));
        let y = g.scale(w, 2.0).unwrap();
        let err = backward(&mut g, y).unwrap_err();
        assert!(matches!(
            err,
            GradError::InvalidBackward(BackwardFault::NotScalar { .. })
        ));
    }

    #[test]
    fn rejects_leaf_and_untracked_losses() {
        let mut g = Graph::new();
        let w = g.parameter(tensor!(1.0));
        assert!(matches!(
            backward(&mut g, w),
            Err(GradError::InvalidBackward(BackwardFault::NoProducer))
        ));

        let c = g.input(tensor!([1.0, 2.0]));
        let m = g.mean(c).unwrap();
        assert!(matches!(
            backward(&mut g, m),
            Err(GradError::InvalidBackward(BackwardFault::Untracked))
        ));
    }

    #[test]
    fn long_chain_does_not_overflow() {
        let mut g = Graph::new();
        let x = g.parameter(tensor!([1.0]));
        let mut h = x;
        for _ in 0..50_000 {
            h = g.scale(h, 1.0).unwrap();
        }
        let loss = g.mean(h).unwrap();
        backward(&mut g, loss).unwrap();
        assert_eq!(g.grad(x).unwrap().unwrap().data(), &[1.0]);
    }
}
