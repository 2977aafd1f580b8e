//! Composite objectives built from other nodes.
//!
//! Each builder returns an ordinary [`Node`] whose vjp only rescales or
//! fans out the incoming seed, so `J = J1 + w * J2` is differentiable as soon
//! as `J1` and `J2` are.
//!
//! ```
//! use dofgraph::{DofRegistry, Node, objectives};
//!
//! let a = Node::new("a", DofRegistry::from_values(&[2.0]));
//! let b = Node::new("b", DofRegistry::from_values(&[5.0]));
//! let j = objectives::weighted_sum(&[(1.0, a), (0.5, b)]);
//! assert_eq!(j.scalar_value().unwrap(), 4.5);
//! assert_eq!(j.gradient().unwrap(), vec![1.0, 0.5]);
//! ```

use crate::dofs::DofRegistry;
use crate::error::GraphError;
use crate::evaluate::{EvalContext, Evaluate, Vjp};
use crate::node::Node;

/// Name of the weight DOF on nodes built by [`scale`].
pub const FACTOR: &str = "factor";

/// Name of the threshold DOF on nodes built by [`quadratic_penalty`].
pub const THRESHOLD: &str = "threshold";

/// Elementwise sum of the children's outputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sum;

impl Evaluate for Sum {
    fn value(&self, ctx: &EvalContext<'_>) -> Result<Vec<f64>, GraphError> {
        if ctx.num_children() == 0 {
            return Ok(vec![0.0]);
        }
        let mut total = ctx.child_value(0)?.to_vec();
        for i in 1..ctx.num_children() {
            let term = ctx.child_value(i)?;
            if term.len() != total.len() {
                return Err(GraphError::dimension(
                    format!("term {i} of sum '{}'", ctx.node_name()),
                    total.len(),
                    term.len(),
                ));
            }
            for (t, v) in total.iter_mut().zip(term.iter()) {
                *t += v;
            }
        }
        Ok(total)
    }

    fn vjp(&self, ctx: &EvalContext<'_>, seed: &[f64]) -> Result<Vjp, GraphError> {
        Ok((0..ctx.num_children()).fold(Vjp::children_only(), |vjp, i| {
            vjp.with_child(i, seed.to_vec())
        }))
    }
}

/// Child output multiplied by the node's `factor` DOF.
#[derive(Debug, Clone, Copy, Default)]
pub struct Scale;

impl Evaluate for Scale {
    fn value(&self, ctx: &EvalContext<'_>) -> Result<Vec<f64>, GraphError> {
        let factor = ctx.dof(FACTOR)?;
        Ok(ctx.child_value(0)?.iter().map(|v| factor * v).collect())
    }

    fn vjp(&self, ctx: &EvalContext<'_>, seed: &[f64]) -> Result<Vjp, GraphError> {
        let factor = ctx.dof(FACTOR)?;
        let child = ctx.child_value(0)?;
        let d_factor: f64 = seed.iter().zip(child.iter()).map(|(s, v)| s * v).sum();
        Ok(Vjp::new(vec![d_factor]).with_child(0, seed.iter().map(|s| factor * s).collect()))
    }
}

/// Which side of the threshold a [`QuadraticPenalty`] punishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PenaltyKind {
    /// `0.5 * max(J - t, 0)^2`: penalize values above the threshold.
    Max,
    /// `0.5 * min(J - t, 0)^2`: penalize values below the threshold.
    Min,
    /// `0.5 * (J - t)^2`: penalize any deviation.
    #[default]
    Identity,
}

impl PenaltyKind {
    fn excess(self, diff: f64) -> f64 {
        match self {
            Self::Max => diff.max(0.0),
            Self::Min => diff.min(0.0),
            Self::Identity => diff,
        }
    }
}

/// Quadratic penalty on a scalar child relative to the `threshold` DOF.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuadraticPenalty {
    kind: PenaltyKind,
}

impl QuadraticPenalty {
    pub fn new(kind: PenaltyKind) -> Self {
        Self { kind }
    }

    fn excess(&self, ctx: &EvalContext<'_>) -> Result<f64, GraphError> {
        let diff = ctx.child_scalar(0)? - ctx.dof(THRESHOLD)?;
        Ok(self.kind.excess(diff))
    }
}

impl Evaluate for QuadraticPenalty {
    fn value(&self, ctx: &EvalContext<'_>) -> Result<Vec<f64>, GraphError> {
        let excess = self.excess(ctx)?;
        Ok(vec![0.5 * excess * excess])
    }

    fn vjp(&self, ctx: &EvalContext<'_>, seed: &[f64]) -> Result<Vjp, GraphError> {
        let excess = self.excess(ctx)?;
        let s = seed[0];
        Ok(Vjp::new(vec![-s * excess]).with_child(0, vec![s * excess]))
    }
}

/// `nodes[0] + nodes[1] + ...`, elementwise.
pub fn sum_of(nodes: &[Node]) -> Node {
    Node::composite_auto("Sum", DofRegistry::new(), nodes, Sum)
}

/// `factor * node`, with `factor` stored as a fixed DOF.
///
/// Change the weight with [`Node::force_set_dof`], or unfix it to let the
/// optimizer tune it.
pub fn scale(node: &Node, factor: f64) -> Node {
    let node = Node::composite_auto(
        "Scale",
        single_dof(FACTOR, factor),
        std::slice::from_ref(node),
        Scale,
    );
    node.fix_all();
    node
}

/// `sum_i w_i * node_i`.
pub fn weighted_sum(terms: &[(f64, Node)]) -> Node {
    let scaled: Vec<Node> = terms
        .iter()
        .map(|(weight, node)| scale(node, *weight))
        .collect();
    sum_of(&scaled)
}

/// Quadratic penalty of a scalar node against a fixed `threshold` DOF.
pub fn quadratic_penalty(node: &Node, threshold: f64, kind: PenaltyKind) -> Node {
    let node = Node::composite_auto(
        "QuadraticPenalty",
        single_dof(THRESHOLD, threshold),
        std::slice::from_ref(node),
        QuadraticPenalty::new(kind),
    );
    node.fix_all();
    node
}

fn single_dof(name: &str, value: f64) -> DofRegistry {
    DofRegistry::from_pairs([(name, value)]).expect("a single name cannot clash")
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn param(name: &str, values: &[f64]) -> Node {
        Node::new(name, DofRegistry::from_values(values))
    }

    #[test]
    fn test_sum_value_and_gradient() {
        let a = param("a", &[1.0]);
        let b = param("b", &[2.0]);
        let j = sum_of(&[a, b]);
        assert_eq!(j.scalar_value().unwrap(), 3.0);
        assert_eq!(j.gradient().unwrap(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_sum_shape_mismatch() {
        let a = param("a", &[1.0]);
        let b = param("b", &[2.0, 3.0]);
        let j = sum_of(&[a, b]);
        assert!(matches!(
            j.value(),
            Err(GraphError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_empty_sum_is_zero() {
        let j = sum_of(&[]);
        assert_eq!(j.scalar_value().unwrap(), 0.0);
        assert!(j.gradient().unwrap().is_empty());
    }

    #[test]
    fn test_sum_of_same_node_twice() {
        let a = param("a", &[1.5]);
        let j = sum_of(&[a.clone(), a]);
        assert_eq!(j.scalar_value().unwrap(), 3.0);
        assert_eq!(j.gradient().unwrap(), vec![2.0]);
    }

    #[test]
    fn test_scale_factor_is_fixed_dof() {
        let a = param("a", &[2.0]);
        let j = scale(&a, 3.0);
        assert_eq!(j.x(), vec![2.0]);
        assert_eq!(j.scalar_value().unwrap(), 6.0);
        assert!(matches!(
            j.set_dof(FACTOR, 4.0),
            Err(GraphError::FixedDof { .. })
        ));

        j.force_set_dof(FACTOR, 4.0).unwrap();
        assert_eq!(j.scalar_value().unwrap(), 8.0);
        assert_eq!(j.gradient().unwrap(), vec![4.0]);
    }

    #[test]
    fn test_scale_unfixed_factor_gets_gradient() {
        let a = param("a", &[2.0]);
        let j = scale(&a, 3.0);
        j.unfix(FACTOR).unwrap();
        assert_eq!(j.x(), vec![3.0, 2.0]);
        // d(f*a)/df = a, d(f*a)/da = f
        assert_eq!(j.gradient().unwrap(), vec![2.0, 3.0]);
    }

    #[test]
    fn test_weighted_sum() {
        let a = param("a", &[2.0]);
        let b = param("b", &[-1.0]);
        let j = weighted_sum(&[(2.0, a), (3.0, b)]);
        assert_eq!(j.scalar_value().unwrap(), 1.0);
        assert_eq!(j.gradient().unwrap(), vec![2.0, 3.0]);
    }

    #[test]
    fn test_quadratic_penalty_kinds() {
        let a = param("a", &[3.0]);
        let max = quadratic_penalty(&a, 1.0, PenaltyKind::Max);
        let min = quadratic_penalty(&a, 1.0, PenaltyKind::Min);
        let id = quadratic_penalty(&a, 5.0, PenaltyKind::Identity);

        assert_relative_eq!(max.scalar_value().unwrap(), 2.0);
        assert_relative_eq!(max.gradient().unwrap()[0], 2.0);
        assert_relative_eq!(min.scalar_value().unwrap(), 0.0);
        assert_relative_eq!(min.gradient().unwrap()[0], 0.0);
        assert_relative_eq!(id.scalar_value().unwrap(), 2.0);
        assert_relative_eq!(id.gradient().unwrap()[0], -2.0);
    }

    #[test]
    fn test_penalty_threshold_is_single_fixed_dof() {
        let a = param("a", &[3.0]);
        let p = quadratic_penalty(&a, 1.5, PenaltyKind::Max);
        assert_eq!(p.dofs().len(), 1);
        assert_eq!(p.get_dof(THRESHOLD).unwrap(), 1.5);
        assert!(p.dofs().is_fixed(THRESHOLD).unwrap());
    }

    #[test]
    fn test_quadratic_penalty_requires_scalar() {
        let a = param("a", &[1.0, 2.0]);
        let p = quadratic_penalty(&a, 0.0, PenaltyKind::Identity);
        assert!(p.value().is_err());
    }

    #[test]
    fn test_composed_node_names_are_unique() {
        let a = param("a", &[1.0]);
        let s1 = scale(&a, 1.0);
        let s2 = scale(&a, 2.0);
        assert!(s1.name().starts_with("Scale"));
        assert_ne!(s1.name(), s2.name());
    }
}
