//! Backward pass execution for reverse-mode differentiation.

use super::derivative::Derivative;
use crate::error::GraphError;
use crate::evaluate::EvalContext;
use crate::layout::closure;
use crate::node::{Node, NodeId};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use tracing::debug;

/// Pull `seed` back from `root`'s output to every DOF in its closure.
///
/// # Arguments
/// * `root` - The node whose output is differentiated
/// * `seed` - Output-space sensitivity; `[1.0]` for a scalar objective
///
/// # Errors
/// Returns error if:
/// - `seed` does not match the root's output length
/// - a node receiving sensitivity has no vjp (`NotDifferentiable`)
/// - a vjp returns an own gradient or child seed of the wrong length
/// - any value or vjp routine fails
pub fn backward(root: &Node, seed: &[f64]) -> Result<Derivative, GraphError> {
    let output_len = root.cached_value()?.len();
    if seed.len() != output_len {
        return Err(GraphError::dimension(
            format!("seed for '{}'", root.name()),
            output_len,
            seed.len(),
        ));
    }

    let order = topological_order(root)?;
    debug!(root = %root.name(), nodes = order.len(), "backward pass");

    let mut pending: HashMap<NodeId, Vec<f64>> = HashMap::new();
    pending.insert(root.id(), seed.to_vec());
    let mut derivative = Derivative::new();

    for node in &order {
        // No sensitivity reaches this node.
        let Some(sensitivity) = pending.remove(&node.id()) else {
            continue;
        };

        let inner = node.inner.borrow();
        let (own, child_seeds) = match &inner.evaluator {
            Some(evaluator) => {
                let ctx = EvalContext::new(&inner.name, &inner.dofs, &inner.children);
                evaluator.vjp(&ctx, &sensitivity)?.into_parts()
            }
            None => (sensitivity, Vec::new()),
        };

        if own.len() != inner.dofs.len() {
            return Err(GraphError::dimension(
                format!("dof gradient of '{}'", inner.name),
                inner.dofs.len(),
                own.len(),
            ));
        }
        if !own.is_empty() {
            derivative.accumulate(inner.id, own);
        }

        for (index, child_seed) in child_seeds {
            let child = inner
                .children
                .get(index)
                .ok_or_else(|| GraphError::UnknownChild {
                    node: inner.name.clone(),
                    index,
                    count: inner.children.len(),
                })?;
            let expected = child.cached_value()?.len();
            if child_seed.len() != expected {
                return Err(GraphError::dimension(
                    format!("seed for child '{}' of '{}'", child.name(), inner.name),
                    expected,
                    child_seed.len(),
                ));
            }
            accumulate_seed(&mut pending, child.id(), child_seed);
        }
    }

    Ok(derivative)
}

fn accumulate_seed(pending: &mut HashMap<NodeId, Vec<f64>>, id: NodeId, seed: Vec<f64>) {
    match pending.entry(id) {
        Entry::Occupied(mut entry) => {
            for (acc, s) in entry.get_mut().iter_mut().zip(seed) {
                *acc += s;
            }
        }
        Entry::Vacant(entry) => {
            entry.insert(seed);
        }
    }
}

/// Closure of `root` ordered so that every node comes after all of its
/// parents within the closure.
fn topological_order(root: &Node) -> Result<Vec<Node>, GraphError> {
    let nodes = closure(root);

    // Edges point from parent to child.
    let mut graph: DiGraph<usize, ()> = DiGraph::with_capacity(nodes.len(), nodes.len());
    let mut node_to_idx: HashMap<NodeId, NodeIndex> = HashMap::with_capacity(nodes.len());
    for (i, node) in nodes.iter().enumerate() {
        node_to_idx.insert(node.id(), graph.add_node(i));
    }
    for node in &nodes {
        let parent_idx = node_to_idx[&node.id()];
        for child in node.inner.borrow().children.iter() {
            graph.add_edge(parent_idx, node_to_idx[&child.id()], ());
        }
    }

    let sorted = toposort(&graph, None).map_err(|cycle| {
        let name = nodes[graph[cycle.node_id()]].name();
        GraphError::Cycle {
            parent: name.clone(),
            child: name,
        }
    })?;
    Ok(sorted
        .into_iter()
        .map(|idx| nodes[graph[idx]].clone())
        .collect())
}
