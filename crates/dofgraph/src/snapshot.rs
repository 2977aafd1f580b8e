//! Save and restore the DOF state and structure of a graph.
//!
//! A [`GraphSnapshot`] is captured by walking a root's closure read-only.
//! Nodes are listed in flattening order (root first) and refer to their
//! children by position. Value functions are code, not data, so they are
//! not part of a snapshot: a snapshot can be restored onto a live graph of
//! the same shape, or turned into a parameter-only copy of the DAG.
//!
//! # Example
//!
//! ```
//! use dofgraph::{DofRegistry, GraphSnapshot, Node};
//!
//! let coil = Node::new("coil", DofRegistry::from_values(&[1.0, 2.0]));
//! let saved = GraphSnapshot::capture(&coil).to_json().unwrap();
//!
//! coil.set_x(&[5.0, 6.0]).unwrap();
//! GraphSnapshot::from_json(&saved).unwrap().restore(&coil).unwrap();
//! assert_eq!(coil.x(), vec![1.0, 2.0]);
//! ```

use crate::cache::{Invalidation, invalidate};
use crate::dofs::{Dof, DofRegistry};
use crate::error::GraphError;
use crate::layout::closure;
use crate::node::{Node, NodeId};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Saved state of one DOF.
///
/// Unbounded sides are omitted. Non-finite numbers are written as the
/// strings `"inf"`, `"-inf"` and `"nan"`, which JSON numbers cannot hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DofRecord {
    pub name: String,
    #[serde(with = "non_finite")]
    pub value: f64,
    pub fixed: bool,
    #[serde(
        with = "non_finite",
        default = "unbounded_below",
        skip_serializing_if = "is_unbounded_below"
    )]
    pub lower: f64,
    #[serde(
        with = "non_finite",
        default = "unbounded_above",
        skip_serializing_if = "is_unbounded_above"
    )]
    pub upper: f64,
}

fn unbounded_below() -> f64 {
    f64::NEG_INFINITY
}

fn unbounded_above() -> f64 {
    f64::INFINITY
}

fn is_unbounded_below(bound: &f64) -> bool {
    *bound == f64::NEG_INFINITY
}

fn is_unbounded_above(bound: &f64) -> bool {
    *bound == f64::INFINITY
}

mod non_finite {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub(super) fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else if value.is_nan() {
            serializer.serialize_str("nan")
        } else if *value > 0.0 {
            serializer.serialize_str("inf")
        } else {
            serializer.serialize_str("-inf")
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(value) => Ok(value),
            Repr::Text(text) => match text.as_str() {
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                "nan" => Ok(f64::NAN),
                other => Err(D::Error::custom(format!("invalid number '{other}'"))),
            },
        }
    }
}

impl From<&Dof> for DofRecord {
    fn from(dof: &Dof) -> Self {
        Self {
            name: dof.name().to_string(),
            value: dof.value(),
            fixed: dof.is_fixed(),
            lower: dof.lower(),
            upper: dof.upper(),
        }
    }
}

/// Saved state of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub name: String,
    pub dofs: Vec<DofRecord>,
    /// Positions of the children in [`GraphSnapshot::nodes`].
    pub children: Vec<usize>,
}

/// Structure and DOF state of a root's closure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    /// Closure of the root in flattening order; `nodes[0]` is the root.
    pub nodes: Vec<NodeRecord>,
}

impl GraphSnapshot {
    /// Walk `root`'s closure and record it.
    pub fn capture(root: &Node) -> Self {
        let nodes = closure(root);
        let position: HashMap<NodeId, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (node.id(), i))
            .collect();

        let records = nodes
            .iter()
            .map(|node| NodeRecord {
                name: node.name(),
                dofs: node.dofs().iter().map(DofRecord::from).collect(),
                children: node
                    .children()
                    .iter()
                    .map(|child| position[&child.id()])
                    .collect(),
            })
            .collect();

        Self { nodes: records }
    }

    /// Serialize to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, GraphError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse and validate a snapshot.
    pub fn from_json(json: &str) -> Result<Self, GraphError> {
        let snapshot: Self = serde_json::from_str(json)?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Check child references, acyclicity, DOF name uniqueness and bounds.
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.nodes.is_empty() {
            return Err(GraphError::Snapshot("snapshot has no nodes".to_string()));
        }

        let mut graph: DiGraph<(), ()> = DiGraph::with_capacity(self.nodes.len(), 0);
        let indices: Vec<NodeIndex> = self.nodes.iter().map(|_| graph.add_node(())).collect();
        for (i, record) in self.nodes.iter().enumerate() {
            for &child in &record.children {
                let Some(&child_idx) = indices.get(child) else {
                    return Err(GraphError::Snapshot(format!(
                        "node '{}' refers to missing child {child}",
                        record.name
                    )));
                };
                graph.add_edge(indices[i], child_idx, ());
            }
            for dof in &record.dofs {
                if dof.lower > dof.upper {
                    return Err(GraphError::InvalidBounds {
                        node: record.name.clone(),
                        name: dof.name.clone(),
                        lower: dof.lower,
                        upper: dof.upper,
                    });
                }
            }
            record_registry(record)?;
        }

        if is_cyclic_directed(&graph) {
            return Err(GraphError::Snapshot("snapshot graph is cyclic".to_string()));
        }
        Ok(())
    }

    /// Write values, fixed flags and bounds back onto a graph of the same
    /// shape.
    ///
    /// The shape (node names, DOF names, child positions) is checked for the
    /// whole closure before anything is written.
    pub fn restore(&self, root: &Node) -> Result<(), GraphError> {
        self.validate()?;
        let nodes = closure(root);
        if nodes.len() != self.nodes.len() {
            return Err(GraphError::Snapshot(format!(
                "snapshot has {} nodes, graph of '{}' has {}",
                self.nodes.len(),
                root.name(),
                nodes.len()
            )));
        }

        let position: HashMap<NodeId, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (node.id(), i))
            .collect();
        for (node, record) in nodes.iter().zip(&self.nodes) {
            check_shape(node, record, &position)?;
        }

        let mut changed = Vec::new();
        for (node, record) in nodes.iter().zip(&self.nodes) {
            let mut inner = node.inner.borrow_mut();
            let mut touched = false;
            for dof in &record.dofs {
                let i = inner.dofs.position(&dof.name)?;
                if inner.dofs.write(i, dof.value) {
                    inner.cache.note_local_change();
                    touched = true;
                }
                touched |= if dof.fixed {
                    inner.dofs.fix(&dof.name)?
                } else {
                    inner.dofs.unfix(&dof.name)?
                };
                inner
                    .dofs
                    .set_bounds(&dof.name, dof.lower, dof.upper)?;
            }
            if touched {
                changed.push(node.clone());
            }
        }

        if !changed.is_empty() {
            invalidate(&changed, Invalidation::All);
        }
        Ok(())
    }

    /// Rebuild the DAG as parameter nodes (no value functions).
    pub fn into_graph(&self) -> Result<Node, GraphError> {
        self.validate()?;
        let nodes = self
            .nodes
            .iter()
            .map(|record| Ok(Node::new(record.name.clone(), record_registry(record)?)))
            .collect::<Result<Vec<Node>, GraphError>>()?;

        for (node, record) in nodes.iter().zip(&self.nodes) {
            for &child in &record.children {
                node.add_child(&nodes[child])?;
            }
        }
        Ok(nodes[0].clone())
    }
}

fn record_registry(record: &NodeRecord) -> Result<DofRegistry, GraphError> {
    let mut dofs = DofRegistry::new();
    for dof in &record.dofs {
        dofs.add(dof.name.clone(), dof.value)?;
        dofs.set_bounds(&dof.name, dof.lower, dof.upper)?;
        if dof.fixed {
            dofs.fix(&dof.name)?;
        }
    }
    Ok(dofs)
}

fn check_shape(
    node: &Node,
    record: &NodeRecord,
    position: &HashMap<NodeId, usize>,
) -> Result<(), GraphError> {
    let name = node.name();
    if name != record.name {
        return Err(GraphError::Snapshot(format!(
            "expected node '{}', found '{name}'",
            record.name
        )));
    }

    let dofs = node.dofs();
    let names_match = dofs.len() == record.dofs.len()
        && dofs
            .iter()
            .zip(&record.dofs)
            .all(|(dof, saved)| dof.name() == saved.name);
    if !names_match {
        return Err(GraphError::Snapshot(format!(
            "dofs of node '{name}' do not match the snapshot"
        )));
    }

    let children: Vec<usize> = node
        .children()
        .iter()
        .map(|child| position[&child.id()])
        .collect();
    if children != record.children {
        return Err(GraphError::Snapshot(format!(
            "children of node '{name}' do not match the snapshot"
        )));
    }
    Ok(())
}
