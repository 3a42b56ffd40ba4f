// Backpropagation — reverse-mode automatic differentiation
//
//   1. Collect every tracked tensor reachable from the root through the
//      GradContext input lists.
//
//   2. Visit them in descending TensorId order. Ids come from a global
//      counter and a result is always created after its inputs, so every
//      consumer of a node is visited before the node itself; no separate
//      topological sort is needed.
//
//   3. At each node, add the gradient gathered during this pass to the
//      node's grad slot, take its context out, apply the backward rule and
//      add each input's share to that input's pending gradient. A tensor
//      that feeds several consumers therefore receives the sum of their
//      contributions (c = a * a gives grad_a = 2a).
//
// The traversal runs with recording disabled. Contexts are dropped as they
// are visited, so each forward pass builds a fresh graph.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};

use vole_core::{Error, Result};

use crate::grad_mode::no_grad;
use crate::op::TensorId;
use crate::tensor::Tensor;

fn collect(root: &Tensor) -> BTreeMap<TensorId, Tensor> {
    let mut nodes = BTreeMap::new();
    let mut stack = vec![root.clone()];
    while let Some(t) = stack.pop() {
        if !t.requires_grad() || nodes.contains_key(&t.id()) {
            continue;
        }
        stack.extend(t.ctx_inputs());
        nodes.insert(t.id(), t);
    }
    nodes
}

pub(crate) fn backward(root: &Tensor, seed: &Tensor) -> Result<()> {
    if seed.shape() != root.shape() {
        return Err(Error::GradientShape {
            op: "backward",
            expected: root.shape().clone(),
            got: seed.shape().clone(),
        });
    }
    if seed.kind() != root.kind() {
        return Err(Error::BackendMismatch {
            op: "backward",
            lhs: root.kind(),
            rhs: seed.kind(),
        });
    }

    let _guard = no_grad();
    let nodes = collect(root);
    log::trace!("backward from {:?}: {} tracked nodes", root.id(), nodes.len());

    let mut pending: HashMap<TensorId, Tensor> = HashMap::new();
    pending.insert(root.id(), seed.detach());

    for (id, node) in nodes.into_iter().rev() {
        let Some(grad) = pending.remove(&id) else {
            continue;
        };
        node.accumulate_grad(&grad)?;

        let Some(ctx) = node.take_ctx() else {
            continue; // leaf
        };
        ctx.check_unmodified(&node)?;
        let (op, inputs) = ctx.into_parts();
        let grads = op.backward(&grad, &inputs, &node)?;
        if grads.len() != inputs.len() {
            return Err(Error::msg(format!(
                "{}: backward produced {} gradients for {} inputs",
                op.name(),
                grads.len(),
                inputs.len()
            )));
        }

        for (input, g) in inputs.iter().zip(grads) {
            let Some(g) = g else { continue };
            if !input.requires_grad() {
                continue;
            }
            if g.shape() != input.shape() {
                return Err(Error::GradientShape {
                    op: op.name(),
                    expected: input.shape().clone(),
                    got: g.shape().clone(),
                });
            }
            match pending.entry(input.id()) {
                Entry::Occupied(mut slot) => {
                    let sum = slot.get().add(&g)?;
                    slot.insert(sum);
                }
                Entry::Vacant(slot) => {
                    slot.insert(g);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::{Device, GradState, Tensor};

    #[test]
    fn test_contexts_dropped_after_visit() {
        let x = Tensor::ones((2, 2), &Device::Cpu).unwrap().with_grad();
        let y = x.mul_scalar(2.0).unwrap();
        let loss = y.sum_all().unwrap();
        assert!(y.has_grad_context() && loss.has_grad_context());
        loss.backward().unwrap();
        assert!(!y.has_grad_context() && !loss.has_grad_context());
        assert_eq!(y.grad_state(), GradState::Resolved);
        assert_eq!(x.grad().unwrap().to_vec().unwrap(), vec![2.0; 4]);
    }

    #[test]
    fn test_shared_node_visited_once() {
        // a feeds b twice; c = b + b
        let a = Tensor::from_data(vec![1.0, 2.0], 2usize, &Device::Cpu)
            .unwrap()
            .with_grad();
        let b = a.mul(&a).unwrap();
        let c = b.add(&b).unwrap().sum_all().unwrap();
        c.backward().unwrap();
        // dc/da = 2 * 2a
        assert_eq!(a.grad().unwrap().to_vec().unwrap(), vec![4.0, 8.0]);
        assert_eq!(b.grad().unwrap().to_vec().unwrap(), vec![2.0, 2.0]);
    }

    #[test]
    fn test_leaf_grads_accumulate_across_passes() {
        let w = Tensor::ones(3usize, &Device::Cpu).unwrap().with_grad();
        for _ in 0..2 {
            w.mul_scalar(3.0).unwrap().sum_all().unwrap().backward().unwrap();
        }
        assert_eq!(w.grad().unwrap().to_vec().unwrap(), vec![6.0; 3]);
        w.zero_grad();
        assert_eq!(w.grad_state(), GradState::Pending);
    }
}
