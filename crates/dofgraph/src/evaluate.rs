//! The value / vjp contract between the graph engine and the code that
//! actually computes things (field evaluators, penalties, user closures).

use crate::dofs::DofRegistry;
use crate::error::GraphError;
use crate::node::Node;
use std::fmt;
use std::rc::Rc;

/// Read-only view of a node handed to its value and vjp routines.
///
/// Gives access to the node's own DOFs (fixed ones included) and to the
/// cached values of its children, in the order the children were added.
pub struct EvalContext<'a> {
    node: &'a str,
    dofs: &'a DofRegistry,
    children: &'a [Node],
}

impl<'a> EvalContext<'a> {
    pub(crate) fn new(node: &'a str, dofs: &'a DofRegistry, children: &'a [Node]) -> Self {
        Self {
            node,
            dofs,
            children,
        }
    }

    /// Name of the node being evaluated.
    pub fn node_name(&self) -> &str {
        self.node
    }

    /// The node's own DOFs.
    pub fn dofs(&self) -> &DofRegistry {
        self.dofs
    }

    /// Value of one of the node's own DOFs.
    pub fn dof(&self, name: &str) -> Result<f64, GraphError> {
        self.dofs.get_value(name)
    }

    /// Number of children.
    pub fn num_children(&self) -> usize {
        self.children.len()
    }

    /// Child handle at `index`.
    pub fn child(&self, index: usize) -> Result<&Node, GraphError> {
        self.children
            .get(index)
            .ok_or_else(|| GraphError::UnknownChild {
                node: self.node.to_string(),
                index,
                count: self.children.len(),
            })
    }

    /// Current value of the child at `index`, recomputed if stale.
    pub fn child_value(&self, index: usize) -> Result<Rc<[f64]>, GraphError> {
        self.child(index)?.cached_value()
    }

    /// Current value of a child that must produce a single scalar.
    pub fn child_scalar(&self, index: usize) -> Result<f64, GraphError> {
        let value = self.child_value(index)?;
        match &*value {
            [v] => Ok(*v),
            _ => Err(GraphError::dimension(
                format!("scalar output of child {index} of '{}'", self.node),
                1,
                value.len(),
            )),
        }
    }

    /// Build an error attributed to this node.
    pub fn fail(&self, message: impl Into<String>) -> GraphError {
        GraphError::Evaluation {
            node: self.node.to_string(),
            message: message.into(),
        }
    }
}

/// Result of a vector-Jacobian product on one node.
///
/// `own` holds the sensitivity with respect to *all* of the node's DOFs in
/// declaration order (fixed ones included, the engine drops those), and
/// `children` the seeds to pass on to children by child position.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Vjp {
    own: Vec<f64>,
    children: Vec<(usize, Vec<f64>)>,
}

impl Vjp {
    /// Sensitivity with respect to the node's own DOFs.
    pub fn new(own: Vec<f64>) -> Self {
        Self {
            own,
            children: Vec::new(),
        }
    }

    /// Sensitivity for a node without own DOFs.
    pub fn children_only() -> Self {
        Self::default()
    }

    /// Add a seed for the child at `index`. Repeated indices are summed.
    pub fn with_child(mut self, index: usize, seed: Vec<f64>) -> Self {
        self.children.push((index, seed));
        self
    }

    /// Sensitivity with respect to own DOFs.
    pub fn own(&self) -> &[f64] {
        &self.own
    }

    /// `(child index, seed)` pairs.
    pub fn children(&self) -> &[(usize, Vec<f64>)] {
        &self.children
    }

    pub(crate) fn into_parts(self) -> (Vec<f64>, Vec<(usize, Vec<f64>)>) {
        (self.own, self.children)
    }
}

/// Value function of a node, optionally differentiable.
///
/// `value` must be idempotent for fixed DOF and child values; the engine
/// relies on that to cache it.
pub trait Evaluate: fmt::Debug {
    /// Compute the node output.
    fn value(&self, ctx: &EvalContext<'_>) -> Result<Vec<f64>, GraphError>;

    /// Pull `seed` (shaped like the output) back to own DOFs and children.
    fn vjp(&self, ctx: &EvalContext<'_>, seed: &[f64]) -> Result<Vjp, GraphError> {
        let _ = seed;
        Err(GraphError::NotDifferentiable {
            node: ctx.node_name().to_string(),
        })
    }
}

type ValueFn = Box<dyn Fn(&EvalContext<'_>) -> Result<Vec<f64>, GraphError>>;
type VjpFn = Box<dyn Fn(&EvalContext<'_>, &[f64]) -> Result<Vjp, GraphError>>;

/// [`Evaluate`] built from closures.
///
/// # Example
///
/// ```
/// use dofgraph::{DofRegistry, FnEvaluator, Node, Vjp};
///
/// let x = Node::new("x", DofRegistry::from_values(&[3.0]));
/// let square = Node::composite(
///     "square",
///     DofRegistry::new(),
///     &[x.clone()],
///     FnEvaluator::new(|ctx| {
///         let v = ctx.child_scalar(0)?;
///         Ok(vec![v * v])
///     })
///     .with_vjp(|ctx, seed| {
///         let v = ctx.child_scalar(0)?;
///         Ok(Vjp::children_only().with_child(0, vec![2.0 * v * seed[0]]))
///     }),
/// );
/// assert_eq!(square.scalar_value().unwrap(), 9.0);
/// assert_eq!(square.gradient().unwrap(), vec![6.0]);
/// ```
pub struct FnEvaluator {
    value: ValueFn,
    vjp: Option<VjpFn>,
}

impl FnEvaluator {
    /// Non-differentiable evaluator from a value closure.
    pub fn new<F>(value: F) -> Self
    where
        F: Fn(&EvalContext<'_>) -> Result<Vec<f64>, GraphError> + 'static,
    {
        Self {
            value: Box::new(value),
            vjp: None,
        }
    }

    /// Attach a vjp closure.
    pub fn with_vjp<G>(mut self, vjp: G) -> Self
    where
        G: Fn(&EvalContext<'_>, &[f64]) -> Result<Vjp, GraphError> + 'static,
    {
        self.vjp = Some(Box::new(vjp));
        self
    }
}

impl fmt::Debug for FnEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnEvaluator")
            .field("differentiable", &self.vjp.is_some())
            .finish()
    }
}

impl Evaluate for FnEvaluator {
    fn value(&self, ctx: &EvalContext<'_>) -> Result<Vec<f64>, GraphError> {
        (self.value)(ctx)
    }

    fn vjp(&self, ctx: &EvalContext<'_>, seed: &[f64]) -> Result<Vjp, GraphError> {
        match &self.vjp {
            Some(vjp) => vjp(ctx, seed),
            None => Err(GraphError::NotDifferentiable {
                node: ctx.node_name().to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vjp_builder() {
        let vjp = Vjp::new(vec![1.0, 2.0])
            .with_child(0, vec![3.0])
            .with_child(1, vec![4.0, 5.0]);
        assert_eq!(vjp.own(), &[1.0, 2.0]);
        assert_eq!(vjp.children().len(), 2);
        assert_eq!(vjp.children()[1], (1, vec![4.0, 5.0]));
    }

    #[test]
    fn test_context_accessors() {
        let dofs = DofRegistry::from_pairs([("w", 2.5)]).unwrap();
        let child = Node::new("c", DofRegistry::from_values(&[4.0]));
        let children = [child];
        let ctx = EvalContext::new("n", &dofs, &children);

        assert_eq!(ctx.node_name(), "n");
        assert_eq!(ctx.dof("w").unwrap(), 2.5);
        assert_eq!(ctx.num_children(), 1);
        assert_eq!(ctx.child_scalar(0).unwrap(), 4.0);
        assert!(matches!(
            ctx.child_value(3),
            Err(GraphError::UnknownChild { index: 3, count: 1, .. })
        ));
    }

    #[test]
    fn test_child_scalar_rejects_vector() {
        let dofs = DofRegistry::new();
        let children = [Node::new("c", DofRegistry::from_values(&[1.0, 2.0]))];
        let ctx = EvalContext::new("n", &dofs, &children);
        assert!(matches!(
            ctx.child_scalar(0),
            Err(GraphError::DimensionMismatch {
                expected: 1,
                actual: 2,
                ..
            })
        ));
    }

    #[test]
    fn test_fn_evaluator_without_vjp() {
        let eval = FnEvaluator::new(|_| Ok(vec![1.0]));
        let dofs = DofRegistry::new();
        let ctx = EvalContext::new("plain", &dofs, &[]);
        assert_eq!(eval.value(&ctx).unwrap(), vec![1.0]);
        assert!(matches!(
            eval.vjp(&ctx, &[1.0]),
            Err(GraphError::NotDifferentiable { ref node }) if node == "plain"
        ));
    }
}
