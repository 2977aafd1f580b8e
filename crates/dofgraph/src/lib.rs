//! dofgraph - differentiable dependency graphs of optimizable parameters
//!
//! Physical models (coils, currents, surfaces, field evaluators, penalty
//! terms) are expressed as [`Node`]s. Each node owns a registry of named
//! scalar degrees of freedom and depends on child nodes. A root node exposes
//! the free DOFs of its whole closure as one flat vector `x`, computes its
//! output lazily with generation-stamped caching, and returns the gradient
//! of a scalar output with respect to `x` by reverse-mode propagation.
//!
//! # Architecture
//!
//! ```text
//! Level 1: Objectives (objectives module)
//!     → sum_of, scale, weighted_sum, quadratic_penalty
//!
//! Level 2: Graph (node module)
//!     → x / set_x / dof_names / bounds, value, gradient
//!     → cache: push-invalidate on write, pull-validate on read
//!     → autodiff: petgraph toposort + vjp accumulation
//!
//! Level 3: Node behaviour (evaluate module)
//!     → Evaluate trait, FnEvaluator closures
//! ```
//!
//! # Example
//!
//! ```
//! use dofgraph::{DofRegistry, FnEvaluator, Node, Vjp, objectives};
//!
//! // J(a, b) = a^2 + 0.5 * b
//! let a = Node::new("a", DofRegistry::from_values(&[3.0]));
//! let b = Node::new("b", DofRegistry::from_values(&[2.0]));
//! let square = Node::composite(
//!     "square",
//!     DofRegistry::new(),
//!     &[a],
//!     FnEvaluator::new(|ctx| Ok(vec![ctx.child_scalar(0)?.powi(2)]))
//!         .with_vjp(|ctx, seed| {
//!             Ok(Vjp::children_only().with_child(0, vec![2.0 * ctx.child_scalar(0)? * seed[0]]))
//!         }),
//! );
//! let j = objectives::weighted_sum(&[(1.0, square), (0.5, b)]);
//!
//! assert_eq!(j.x(), vec![3.0, 2.0]);
//! assert_eq!(j.scalar_value().unwrap(), 10.0);
//! assert_eq!(j.gradient().unwrap(), vec![6.0, 0.5]);
//!
//! j.set_x(&[1.0, 2.0]).unwrap();
//! assert_eq!(j.scalar_value().unwrap(), 2.0);
//! ```

pub mod autodiff;
pub mod check;
pub mod dofs;
pub mod error;
pub mod evaluate;
pub mod node;
pub mod objectives;
#[cfg(feature = "serde")]
pub mod snapshot;

mod cache;
mod layout;

pub use autodiff::{Derivative, backward};
pub use check::{TaylorReport, TaylorTestConfig, finite_difference_gradient, taylor_test};
pub use dofs::{Dof, DofRegistry};
pub use error::GraphError;
pub use evaluate::{EvalContext, Evaluate, FnEvaluator, Vjp};
pub use node::{Node, NodeId};
#[cfg(feature = "serde")]
pub use snapshot::GraphSnapshot;
