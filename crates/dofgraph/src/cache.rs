//! Generation stamps and the push-invalidate / pull-validate protocol.
//!
//! Every node carries two counters: a value generation and a layout
//! generation. A successful DOF write bumps the value generation of the
//! owning node and of every transitive ancestor (push). A value query only
//! compares the stored stamp with the node's own generation and recomputes
//! on mismatch (pull), so a clean query costs one comparison per node that
//! is actually visited.
//!
//! Fixing or unfixing DOFs only changes which DOFs are visible to the
//! optimizer, so it bumps the layout generation and leaves cached values
//! alone.

use crate::error::GraphError;
use crate::evaluate::EvalContext;
use crate::layout::Layout;
use crate::node::{Node, NodeId};
use std::collections::HashSet;
use std::rc::{Rc, Weak};
use tracing::{debug, trace};

/// What a mutation makes stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Invalidation {
    /// DOF values changed.
    Value,
    /// Fixed flags changed.
    Layout,
    /// Graph structure changed.
    All,
}

impl Invalidation {
    fn value(self) -> bool {
        matches!(self, Self::Value | Self::All)
    }

    fn layout(self) -> bool {
        matches!(self, Self::Layout | Self::All)
    }
}

/// A cached output stamped with the generation it was computed at.
#[derive(Debug, Clone)]
struct CacheEntry {
    stamp: u64,
    value: Rc<[f64]>,
}

/// Per-node cache bookkeeping.
#[derive(Debug, Default)]
pub(crate) struct CacheState {
    local: u64,
    generation: u64,
    layout_generation: u64,
    value: Option<CacheEntry>,
    layout: Option<(u64, Rc<Layout>)>,
}

impl CacheState {
    /// Count a change of one of the node's own DOF values.
    pub(crate) fn note_local_change(&mut self) {
        self.local += 1;
    }

    pub(crate) fn local(&self) -> u64 {
        self.local
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    fn bump(&mut self, what: Invalidation) {
        if what.value() {
            self.generation += 1;
        }
        if what.layout() {
            self.layout_generation += 1;
        }
    }

    pub(crate) fn fresh_value(&self) -> Option<Rc<[f64]>> {
        self.value
            .as_ref()
            .filter(|entry| entry.stamp == self.generation)
            .map(|entry| Rc::clone(&entry.value))
    }

    fn store_value(&mut self, stamp: u64, value: Rc<[f64]>) {
        self.value = Some(CacheEntry { stamp, value });
    }

    pub(crate) fn fresh_layout(&self) -> Option<Rc<Layout>> {
        self.layout
            .as_ref()
            .filter(|(stamp, _)| *stamp == self.layout_generation)
            .map(|(_, layout)| Rc::clone(layout))
    }

    pub(crate) fn layout_generation(&self) -> u64 {
        self.layout_generation
    }

    pub(crate) fn store_layout(&mut self, stamp: u64, layout: Rc<Layout>) {
        self.layout = Some((stamp, layout));
    }
}

/// Push an invalidation from `origins` up to every transitive ancestor.
///
/// Each distinct node is bumped exactly once per call, however many paths
/// lead to it. Parents that have been dropped are pruned on the way.
///
/// Returns the number of nodes touched.
pub(crate) fn invalidate(origins: &[Node], what: Invalidation) -> usize {
    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut stack: Vec<Node> = origins.to_vec();

    while let Some(node) = stack.pop() {
        if !visited.insert(node.id()) {
            continue;
        }
        let mut inner = node.inner.borrow_mut();
        inner.cache.bump(what);
        inner.parents.retain(|parent| parent.strong_count() > 0);
        stack.extend(
            inner
                .parents
                .iter()
                .filter_map(Weak::upgrade)
                .map(Node::from_inner),
        );
    }

    trace!(touched = visited.len(), ?what, "invalidated");
    visited.len()
}

/// Return the node's value, calling its value function only if the cached
/// value is stale.
///
/// Stale descendants are evaluated first, in post-order with an explicit
/// stack, so a value function only ever reads fresh children and the call
/// depth stays constant however deep the graph is.
pub(crate) fn recompute_if_needed(node: &Node) -> Result<Rc<[f64]>, GraphError> {
    if let Some(value) = fresh_value(node) {
        return Ok(value);
    }

    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut stack = vec![(node.clone(), false)];
    while let Some((current, expanded)) = stack.pop() {
        if expanded {
            let value = evaluate(&current)?;
            if current.ptr_eq(node) {
                return Ok(value);
            }
            continue;
        }
        if !visited.insert(current.id()) || fresh_value(&current).is_some() {
            continue;
        }
        let inner = current.inner.borrow();
        let children: Vec<Node> = inner.children.iter().rev().cloned().collect();
        drop(inner);
        stack.push((current, true));
        stack.extend(children.into_iter().map(|child| (child, false)));
    }
    evaluate(node)
}

fn fresh_value(node: &Node) -> Option<Rc<[f64]>> {
    let inner = node.inner.borrow();
    let value = inner.cache.fresh_value()?;
    trace!(node = %inner.name, "cache hit");
    Some(value)
}

/// Call the value function and store the result under the generation seen
/// before the call.
fn evaluate(node: &Node) -> Result<Rc<[f64]>, GraphError> {
    let inner = node.inner.borrow();
    let generation = inner.cache.generation();
    debug!(node = %inner.name, generation, "recomputing value");
    let value: Rc<[f64]> = match &inner.evaluator {
        Some(evaluator) => {
            let ctx = EvalContext::new(&inner.name, &inner.dofs, &inner.children);
            evaluator.value(&ctx)?.into()
        }
        None => inner.dofs.full_values().into(),
    };
    drop(inner);

    node.inner
        .borrow_mut()
        .cache
        .store_value(generation, Rc::clone(&value));
    Ok(value)
}
