//! Optimizable nodes and their dependency DAG.
//!
//! A [`Node`] is a cheap, clonable handle. Parents hold strong handles to
//! their children, children only hold weak back-references to their parents,
//! so a node lives as long as its longest-living holder.

use crate::autodiff::{Derivative, backward};
use crate::cache::{self, CacheState, Invalidation, invalidate};
use crate::dofs::DofRegistry;
use crate::error::GraphError;
use crate::evaluate::Evaluate;
use crate::layout::{Layout, closure};
use smallvec::SmallVec;
use std::cell::{Cell, Ref, RefCell};
use std::collections::HashSet;
use std::fmt;
use std::rc::{Rc, Weak};

/// Unique identifier of a node within the current thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Get the internal index.
    pub fn index(&self) -> u64 {
        self.0
    }
}

// Thread-local counter for unique node IDs
thread_local! {
    static NEXT_ID: Cell<u64> = const { Cell::new(0) };
}

fn next_node_id() -> NodeId {
    NEXT_ID.with(|id| {
        let current = id.get();
        id.set(current + 1);
        NodeId(current)
    })
}

pub(crate) struct NodeInner {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) dofs: DofRegistry,
    pub(crate) children: SmallVec<[Node; 4]>,
    pub(crate) parents: Vec<Weak<RefCell<NodeInner>>>,
    pub(crate) evaluator: Option<Box<dyn Evaluate>>,
    pub(crate) cache: CacheState,
}

impl Drop for NodeInner {
    // Unlink uniquely owned descendants iteratively; the default drop
    // recurses once per level of a chain.
    fn drop(&mut self) {
        let mut stack: Vec<Node> = self.children.drain(..).collect();
        while let Some(child) = stack.pop() {
            if Rc::strong_count(&child.inner) == 1 {
                if let Ok(mut inner) = child.inner.try_borrow_mut() {
                    stack.extend(inner.children.drain(..));
                }
            }
        }
    }
}

/// Handle to an optimizable unit in the dependency graph.
///
/// A node owns a [`DofRegistry`] and an ordered list of children. Its output
/// is computed by an [`Evaluate`] implementation; a node without one outputs
/// its own DOF values (fixed ones included) and differentiates as the
/// identity.
///
/// The graph is single-threaded: handles are `!Send` and no method may be
/// called from inside a value or vjp routine of the same node.
///
/// # Example
///
/// ```
/// use dofgraph::{DofRegistry, Node};
///
/// let coil = Node::new("coil", DofRegistry::from_pairs([("x0", 1.0), ("y0", 2.0)]).unwrap());
/// let current = Node::new("current", DofRegistry::from_pairs([("I", 1e5)]).unwrap());
/// let set = Node::new("coilset", DofRegistry::new());
/// set.add_child(&coil).unwrap();
/// set.add_child(&current).unwrap();
///
/// assert_eq!(set.x(), vec![1.0, 2.0, 1e5]);
/// assert_eq!(set.dof_names(), vec!["coil:x0", "coil:y0", "current:I"]);
///
/// current.fix("I").unwrap();
/// assert_eq!(set.x(), vec![1.0, 2.0]);
/// ```
#[derive(Clone)]
pub struct Node {
    pub(crate) inner: Rc<RefCell<NodeInner>>,
}

impl Node {
    /// Create a parameter node: its output is its own DOF vector.
    pub fn new(name: impl Into<String>, dofs: DofRegistry) -> Self {
        Self::build(next_node_id(), name.into(), dofs, &[], None)
    }

    /// Create a node computing its output from its DOFs and children.
    pub fn composite(
        name: impl Into<String>,
        dofs: DofRegistry,
        children: &[Node],
        evaluator: impl Evaluate + 'static,
    ) -> Self {
        Self::build(
            next_node_id(),
            name.into(),
            dofs,
            children,
            Some(Box::new(evaluator)),
        )
    }

    /// Like [`Node::composite`], naming the node `<prefix><id>`.
    pub(crate) fn composite_auto(
        prefix: &str,
        dofs: DofRegistry,
        children: &[Node],
        evaluator: impl Evaluate + 'static,
    ) -> Self {
        let id = next_node_id();
        let name = format!("{prefix}{}", id.0);
        Self::build(id, name, dofs, children, Some(Box::new(evaluator)))
    }

    fn build(
        id: NodeId,
        name: String,
        mut dofs: DofRegistry,
        children: &[Node],
        evaluator: Option<Box<dyn Evaluate>>,
    ) -> Self {
        dofs.set_owner(&name);
        let node = Self {
            inner: Rc::new(RefCell::new(NodeInner {
                id,
                name,
                dofs,
                children: children.iter().cloned().collect(),
                parents: Vec::new(),
                evaluator,
                cache: CacheState::default(),
            })),
        };
        for child in children {
            child.register_parent(&node);
        }
        node
    }

    pub(crate) fn from_inner(inner: Rc<RefCell<NodeInner>>) -> Self {
        Self { inner }
    }

    fn register_parent(&self, parent: &Node) {
        let weak = Rc::downgrade(&parent.inner);
        let mut inner = self.inner.borrow_mut();
        if !inner.parents.iter().any(|p| p.ptr_eq(&weak)) {
            inner.parents.push(weak);
        }
    }

    /// Node identifier.
    pub fn id(&self) -> NodeId {
        self.inner.borrow().id
    }

    /// Node name.
    pub fn name(&self) -> String {
        self.inner.borrow().name.clone()
    }

    /// Whether both handles refer to the same node.
    pub fn ptr_eq(&self, other: &Node) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Direct children in insertion order.
    pub fn children(&self) -> Vec<Node> {
        self.inner.borrow().children.to_vec()
    }

    /// Parents that are still alive.
    pub fn parents(&self) -> Vec<Node> {
        self.inner
            .borrow()
            .parents
            .iter()
            .filter_map(Weak::upgrade)
            .map(Node::from_inner)
            .collect()
    }

    /// Every node reachable from this one (itself first), in flattening order.
    pub fn descendants(&self) -> Vec<Node> {
        closure(self)
    }

    /// Read-only view of the node's own DOFs.
    ///
    /// Writes go through the node so that caches stay coherent.
    pub fn dofs(&self) -> Ref<'_, DofRegistry> {
        Ref::map(self.inner.borrow(), |inner| &inner.dofs)
    }

    /// Whether the node has a user value function.
    pub fn has_evaluator(&self) -> bool {
        self.inner.borrow().evaluator.is_some()
    }

    // ------------------------------------------------------------------
    // DOF access
    // ------------------------------------------------------------------

    /// Value of one of the node's own DOFs.
    pub fn get_dof(&self, name: &str) -> Result<f64, GraphError> {
        self.inner.borrow().dofs.get_value(name)
    }

    /// Set one of the node's own free DOFs.
    pub fn set_dof(&self, name: &str, value: f64) -> Result<(), GraphError> {
        let changed = self.inner.borrow_mut().dofs.set_value(name, value)?;
        self.after_value_write(changed);
        Ok(())
    }

    /// Set one of the node's own DOFs even if it is fixed.
    pub fn force_set_dof(&self, name: &str, value: f64) -> Result<(), GraphError> {
        let changed = self.inner.borrow_mut().dofs.force_set_value(name, value)?;
        self.after_value_write(changed);
        Ok(())
    }

    fn after_value_write(&self, changed: bool) {
        if changed {
            self.inner.borrow_mut().cache.note_local_change();
            invalidate(std::slice::from_ref(self), Invalidation::Value);
        }
    }

    /// Fix one of the node's own DOFs.
    pub fn fix(&self, name: &str) -> Result<(), GraphError> {
        let changed = self.inner.borrow_mut().dofs.fix(name)?;
        self.after_flag_change(changed);
        Ok(())
    }

    /// Unfix one of the node's own DOFs.
    pub fn unfix(&self, name: &str) -> Result<(), GraphError> {
        let changed = self.inner.borrow_mut().dofs.unfix(name)?;
        self.after_flag_change(changed);
        Ok(())
    }

    /// Fix all of the node's own DOFs.
    pub fn fix_all(&self) {
        let changed = self.inner.borrow_mut().dofs.fix_all();
        self.after_flag_change(changed);
    }

    /// Unfix all of the node's own DOFs.
    pub fn unfix_all(&self) {
        let changed = self.inner.borrow_mut().dofs.unfix_all();
        self.after_flag_change(changed);
    }

    fn after_flag_change(&self, changed: bool) {
        if changed {
            invalidate(std::slice::from_ref(self), Invalidation::Layout);
        }
    }

    /// Set bounds on one of the node's own DOFs.
    pub fn set_bounds(&self, name: &str, lower: f64, upper: f64) -> Result<(), GraphError> {
        self.inner.borrow_mut().dofs.set_bounds(name, lower, upper)
    }

    // ------------------------------------------------------------------
    // Composition
    // ------------------------------------------------------------------

    /// Append `child` to this node's children.
    ///
    /// # Errors
    /// `Cycle` if `child` is this node or already depends on it. The graph is
    /// left unchanged.
    pub fn add_child(&self, child: &Node) -> Result<(), GraphError> {
        if child.depends_on(self) {
            return Err(GraphError::Cycle {
                parent: self.name(),
                child: child.name(),
            });
        }
        self.inner.borrow_mut().children.push(child.clone());
        child.register_parent(self);
        invalidate(std::slice::from_ref(self), Invalidation::All);
        Ok(())
    }

    /// Whether `other` is this node or reachable from it.
    pub fn depends_on(&self, other: &Node) -> bool {
        closure(self).iter().any(|node| node.ptr_eq(other))
    }

    // ------------------------------------------------------------------
    // Flattened view
    // ------------------------------------------------------------------

    pub(crate) fn layout(&self) -> Rc<Layout> {
        if let Some(layout) = self.inner.borrow().cache.fresh_layout() {
            return layout;
        }
        let stamp = self.inner.borrow().cache.layout_generation();
        let layout = Rc::new(Layout::build(self));
        self.inner
            .borrow_mut()
            .cache
            .store_layout(stamp, Rc::clone(&layout));
        layout
    }

    /// Free DOF values of the whole closure, in flattening order.
    pub fn x(&self) -> Vec<f64> {
        let layout = self.layout();
        layout
            .slots()
            .iter()
            .map(|&slot| {
                let owner = layout.owner(self, slot);
                owner.inner.borrow().dofs.dof_at(slot.dof).value()
            })
            .collect()
    }

    /// Write the flattened free DOF vector back to the owning nodes.
    ///
    /// # Errors
    /// `DimensionMismatch` if `x` has the wrong length; nothing is written.
    pub fn set_x(&self, x: &[f64]) -> Result<(), GraphError> {
        let layout = self.layout();
        if x.len() != layout.len() {
            return Err(GraphError::dimension(
                format!("x of '{}'", self.name()),
                layout.len(),
                x.len(),
            ));
        }

        let mut changed: Vec<Node> = Vec::new();
        let mut seen = HashSet::new();
        for (&slot, &value) in layout.slots().iter().zip(x) {
            let owner = layout.owner(self, slot);
            let mut inner = owner.inner.borrow_mut();
            if inner.dofs.write(slot.dof, value) && seen.insert(inner.id) {
                inner.cache.note_local_change();
                changed.push(owner.clone());
            }
        }

        if !changed.is_empty() {
            invalidate(&changed, Invalidation::Value);
        }
        Ok(())
    }

    /// Length of [`Node::x`].
    pub fn dof_size(&self) -> usize {
        self.layout().len()
    }

    /// Owner-qualified names (`node:dof`) aligned with [`Node::x`].
    pub fn dof_names(&self) -> Vec<String> {
        let layout = self.layout();
        layout
            .slots()
            .iter()
            .map(|&slot| {
                let inner = layout.owner(self, slot).inner.borrow();
                format!("{}:{}", inner.name, inner.dofs.dof_at(slot.dof).name())
            })
            .collect()
    }

    /// `(lower, upper)` bounds aligned with [`Node::x`].
    pub fn bounds(&self) -> (Vec<f64>, Vec<f64>) {
        let layout = self.layout();
        layout
            .slots()
            .iter()
            .map(|&slot| {
                let inner = layout.owner(self, slot).inner.borrow();
                let dof = inner.dofs.dof_at(slot.dof);
                (dof.lower(), dof.upper())
            })
            .unzip()
    }

    /// Free values of the node's own DOFs only.
    pub fn local_x(&self) -> Vec<f64> {
        self.inner.borrow().dofs.free_values()
    }

    // ------------------------------------------------------------------
    // Values and derivatives
    // ------------------------------------------------------------------

    /// Node output, recomputed only if a DOF in the closure changed.
    ///
    /// Stale descendants are evaluated bottom-up without recursion, so the
    /// depth of the graph is not limited by the call stack.
    pub fn value(&self) -> Result<Vec<f64>, GraphError> {
        Ok(self.cached_value()?.to_vec())
    }

    /// Node output as a shared slice.
    pub fn cached_value(&self) -> Result<Rc<[f64]>, GraphError> {
        cache::recompute_if_needed(self)
    }

    /// Node output for nodes producing a single scalar.
    pub fn scalar_value(&self) -> Result<f64, GraphError> {
        let value = self.cached_value()?;
        match &*value {
            [v] => Ok(*v),
            _ => Err(GraphError::dimension(
                format!("scalar output of '{}'", self.name()),
                1,
                value.len(),
            )),
        }
    }

    /// Reverse-mode derivative of the output contracted with `seed`.
    pub fn vjp(&self, seed: &[f64]) -> Result<Derivative, GraphError> {
        backward(self, seed)
    }

    /// Derivative of a scalar output with respect to every node in the closure.
    pub fn derivative(&self) -> Result<Derivative, GraphError> {
        backward(self, &[1.0])
    }

    /// Gradient of a scalar output aligned with [`Node::x`].
    pub fn gradient(&self) -> Result<Vec<f64>, GraphError> {
        Ok(self.derivative()?.project(self))
    }

    // ------------------------------------------------------------------
    // Cache introspection
    // ------------------------------------------------------------------

    /// Value generation; increases whenever a DOF value in the closure changes.
    pub fn generation(&self) -> u64 {
        self.inner.borrow().cache.generation()
    }

    /// Number of changes to this node's own DOF values.
    pub fn dof_counter(&self) -> u64 {
        self.inner.borrow().cache.local()
    }

    /// Whether a cached value exists and is current.
    pub fn has_fresh_value(&self) -> bool {
        self.inner.borrow().cache.fresh_value().is_some()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Node")
            .field("id", &inner.id)
            .field("name", &inner.name)
            .field("num_dofs", &inner.dofs.len())
            .field("num_children", &inner.children.len())
            .finish()
    }
}
