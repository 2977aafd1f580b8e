//! Error types for dofgraph.

use thiserror::Error;

/// Errors that can occur while building, mutating or differentiating a graph.
///
/// Every variant names the node (and DOF, where there is one) that triggered
/// the fault so a failure deep inside a large objective can be located.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GraphError {
    /// No DOF with this name exists on the node.
    #[error("node '{node}' has no dof named '{name}'")]
    UnknownDof { node: String, name: String },

    /// A DOF with this name already exists on the node.
    #[error("node '{node}' already has a dof named '{name}'")]
    DuplicateDof { node: String, name: String },

    /// Write to a fixed DOF through the regular setter.
    #[error("dof '{name}' of node '{node}' is fixed")]
    FixedDof { node: String, name: String },

    /// Lower bound above upper bound.
    #[error("dof '{name}' of node '{node}' has inverted bounds [{lower}, {upper}]")]
    InvalidBounds {
        node: String,
        name: String,
        lower: f64,
        upper: f64,
    },

    /// Vector length or output shape does not match.
    #[error("dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    /// Adding the edge would close a cycle.
    #[error("adding '{child}' as a child of '{parent}' would create a cycle")]
    Cycle { parent: String, child: String },

    /// Gradient requested through a node without a vjp.
    #[error("node '{node}' does not implement a vjp")]
    NotDifferentiable { node: String },

    /// A vjp seeded a child position that does not exist.
    #[error("node '{node}' has {count} children, vjp seeded child {index}")]
    UnknownChild {
        node: String,
        index: usize,
        count: usize,
    },

    /// A value or vjp routine reported failure.
    #[error("evaluation of node '{node}' failed: {message}")]
    Evaluation { node: String, message: String },

    /// Snapshot does not fit the graph it is applied to, or is malformed.
    #[error("snapshot error: {0}")]
    Snapshot(String),

    /// JSON encoding or decoding failed.
    #[cfg(feature = "serde")]
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl GraphError {
    pub(crate) fn dimension(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch {
            context: context.into(),
            expected,
            actual,
        }
    }
}
