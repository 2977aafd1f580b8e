//! Flattening of a node's transitive closure into the optimizer-visible
//! parameter vector.
//!
//! The closure is walked depth-first in child order, each node visited once
//! at its first occurrence. The free DOFs of every visited node are laid out
//! in that order, each node's DOFs in declaration order.

use crate::node::{Node, NodeId};
use std::collections::HashSet;

/// Location of one free DOF inside a closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Slot {
    /// Position in the closure; 0 is the node the layout belongs to.
    pub(crate) owner: usize,
    /// Position in the owner's registry.
    pub(crate) dof: usize,
}

/// Cached flattening of one node's closure.
///
/// The owning node itself is not stored, only its descendants, so a node
/// caching its own layout does not keep itself alive.
#[derive(Debug)]
pub(crate) struct Layout {
    descendants: Vec<Node>,
    slots: Vec<Slot>,
}

impl Layout {
    pub(crate) fn build(root: &Node) -> Self {
        let nodes = closure(root);
        let mut slots = Vec::new();
        for (owner, node) in nodes.iter().enumerate() {
            let inner = node.inner.borrow();
            slots.extend(inner.dofs.free_positions().map(|dof| Slot { owner, dof }));
        }
        Self {
            descendants: nodes.into_iter().skip(1).collect(),
            slots,
        }
    }

    /// Resolve a slot owner to its node; `root` must be the layout's owner.
    pub(crate) fn owner<'a>(&'a self, root: &'a Node, slot: Slot) -> &'a Node {
        match slot.owner {
            0 => root,
            k => &self.descendants[k - 1],
        }
    }

    pub(crate) fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Transitive closure of `root` in first-occurrence depth-first order.
pub(crate) fn closure(root: &Node) -> Vec<Node> {
    let mut order = Vec::new();
    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut stack = vec![root.clone()];

    while let Some(node) = stack.pop() {
        if !visited.insert(node.id()) {
            continue;
        }
        // Reverse so the first child is popped first.
        stack.extend(node.inner.borrow().children.iter().rev().cloned());
        order.push(node);
    }
    order
}
