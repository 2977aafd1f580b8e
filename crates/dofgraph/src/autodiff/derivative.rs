//! Gradient storage container.

use crate::node::{Node, NodeId};
use std::collections::{BTreeMap, HashMap};
use std::ops::{Add, AddAssign, Mul};

/// Derivative of an output with respect to the full DOF vectors of the
/// nodes in a closure.
///
/// Gradients are stored per node over *all* of its DOFs, fixed ones
/// included, so a `Derivative` can be projected onto the `x` of any node in
/// the graph, and two derivatives over different graphs can be added.
#[derive(Debug, Clone, Default)]
pub struct Derivative {
    grads: HashMap<NodeId, Vec<f64>>,
}

impl Derivative {
    /// Create empty derivative.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate gradient for a node.
    ///
    /// If a gradient already exists, adds to it. The length of a node's
    /// registry never changes once the node exists, so entries for the same
    /// node always agree in length.
    pub(crate) fn accumulate(&mut self, id: NodeId, grad: Vec<f64>) {
        match self.grads.get_mut(&id) {
            Some(existing) => {
                debug_assert_eq!(existing.len(), grad.len());
                for (e, g) in existing.iter_mut().zip(grad) {
                    *e += g;
                }
            }
            None => {
                self.grads.insert(id, grad);
            }
        }
    }

    /// Gradient with respect to a node's full DOF vector.
    pub fn get(&self, id: NodeId) -> Option<&[f64]> {
        self.grads.get(&id).map(Vec::as_slice)
    }

    /// Check if a gradient exists for the node.
    pub fn contains(&self, id: NodeId) -> bool {
        self.grads.contains_key(&id)
    }

    /// Number of nodes with a stored gradient.
    pub fn len(&self) -> usize {
        self.grads.len()
    }

    /// Check if no gradients stored.
    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    /// Iterate over all gradients.
    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &Vec<f64>)> {
        self.grads.iter()
    }

    /// Gradient aligned with `node.x()`; DOFs without an entry contribute 0.
    pub fn project(&self, node: &Node) -> Vec<f64> {
        let layout = node.layout();
        layout
            .slots()
            .iter()
            .map(|&slot| {
                let owner = layout.owner(node, slot);
                self.grads
                    .get(&owner.id())
                    .and_then(|grad| grad.get(slot.dof))
                    .copied()
                    .unwrap_or(0.0)
            })
            .collect()
    }

    /// Gradient keyed by the qualified names of `node.dof_names()`.
    ///
    /// Assumes node names are unique within the closure.
    pub fn named(&self, node: &Node) -> BTreeMap<String, f64> {
        node.dof_names()
            .into_iter()
            .zip(self.project(node))
            .collect()
    }
}

impl AddAssign for Derivative {
    fn add_assign(&mut self, rhs: Self) {
        for (id, grad) in rhs.grads {
            self.accumulate(id, grad);
        }
    }
}

impl Add for Derivative {
    type Output = Derivative;

    fn add(mut self, rhs: Self) -> Self::Output {
        self += rhs;
        self
    }
}

impl Mul<f64> for Derivative {
    type Output = Derivative;

    fn mul(mut self, rhs: f64) -> Self::Output {
        for grad in self.grads.values_mut() {
            grad.iter_mut().for_each(|g| *g *= rhs);
        }
        self
    }
}

impl Mul<Derivative> for f64 {
    type Output = Derivative;

    fn mul(self, rhs: Derivative) -> Self::Output {
        rhs * self
    }
}
