//! Integration tests for saving and restoring graph state.

#![cfg(feature = "serde")]

use dofgraph::objectives::{self, PenaltyKind};
use dofgraph::{DofRegistry, GraphError, GraphSnapshot, Node};

fn objective() -> (Node, Node, Node) {
    let coil = Node::new(
        "coil",
        DofRegistry::from_pairs([("x0", 1.0), ("y0", 0.0), ("r", 0.5)]).unwrap(),
    );
    let current = Node::new("current", DofRegistry::from_pairs([("I", 2.0)]).unwrap());
    let total = objectives::sum_of(&[coil.clone(), coil.clone()]);
    let penalty = objectives::quadratic_penalty(&current, 1.0, PenaltyKind::Max);
    let j = objectives::sum_of(&[objectives::scale(&penalty, 1.0), total]);
    (j, coil, current)
}

#[test]
fn test_restore_after_optimizer_steps() {
    let (j, coil, current) = objective();
    coil.set_bounds("r", 0.1, 1.0).unwrap();
    let snapshot = GraphSnapshot::capture(&j);
    let x0 = j.x();
    let value0 = j.value().unwrap();

    j.set_x(&vec![0.25; x0.len()]).unwrap();
    coil.fix("y0").unwrap();
    current.force_set_dof("I", 7.0).unwrap();
    assert_ne!(j.x().len(), x0.len());

    snapshot.restore(&j).unwrap();
    assert_eq!(j.x(), x0);
    assert_eq!(j.value().unwrap(), value0);
    assert_eq!(coil.dofs().bounds_of("r").unwrap(), (0.1, 1.0));
}

#[test]
fn test_json_keeps_infinite_bounds_out() {
    let (j, coil, _) = objective();
    coil.set_bounds("r", 0.0, f64::INFINITY).unwrap();
    let json = GraphSnapshot::capture(&j).to_json().unwrap();

    let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
    let nodes = parsed["nodes"].as_array().unwrap();
    let coil_record = nodes.iter().find(|n| n["name"] == "coil").unwrap();
    let r = coil_record["dofs"]
        .as_array()
        .unwrap()
        .iter()
        .find(|d| d["name"] == "r")
        .unwrap();
    assert_eq!(r["lower"], 0.0);
    assert!(r.get("upper").is_none());

    let restored = GraphSnapshot::from_json(&json).unwrap();
    assert_eq!(restored, GraphSnapshot::capture(&j));
}

#[test]
fn test_into_graph_matches_flattening() {
    let (j, coil, _) = objective();
    coil.fix("x0").unwrap();
    let copy = GraphSnapshot::capture(&j).into_graph().unwrap();

    assert_eq!(copy.x(), j.x());
    assert_eq!(copy.dof_names(), j.dof_names());
    assert_eq!(copy.bounds(), j.bounds());
    assert!(!copy.has_evaluator());
}

#[test]
fn test_restore_onto_different_graph_fails() {
    let (j, _, _) = objective();
    let snapshot = GraphSnapshot::capture(&j);
    let (other, coil, _) = objective();
    coil.set_dof("r", 0.9).unwrap();

    // Same shape, different auto-generated names.
    assert!(matches!(
        snapshot.restore(&other),
        Err(GraphError::Snapshot(_))
    ));
    assert_eq!(coil.get_dof("r").unwrap(), 0.9);
}

#[test]
fn test_nan_value_survives_json() {
    let (j, _, current) = objective();
    current.force_set_dof("I", f64::NAN).unwrap();
    let json = GraphSnapshot::capture(&j).to_json().unwrap();

    current.force_set_dof("I", 1.0).unwrap();
    GraphSnapshot::from_json(&json).unwrap().restore(&j).unwrap();
    assert!(current.get_dof("I").unwrap().is_nan());
}

#[test]
fn test_bounds_pinned_at_infinity_round_trip() {
    let (j, coil, _) = objective();
    coil.set_bounds("r", f64::INFINITY, f64::INFINITY).unwrap();
    coil.set_bounds("x0", f64::NEG_INFINITY, f64::NEG_INFINITY)
        .unwrap();
    let json = GraphSnapshot::capture(&j).to_json().unwrap();

    coil.set_bounds("r", 0.0, 1.0).unwrap();
    coil.set_bounds("x0", 0.0, 1.0).unwrap();
    GraphSnapshot::from_json(&json).unwrap().restore(&j).unwrap();
    assert_eq!(
        coil.dofs().bounds_of("r").unwrap(),
        (f64::INFINITY, f64::INFINITY)
    );
    assert_eq!(
        coil.dofs().bounds_of("x0").unwrap(),
        (f64::NEG_INFINITY, f64::NEG_INFINITY)
    );
}

#[test]
fn test_json_rejects_unknown_number_text() {
    let (j, _, _) = objective();
    let json = GraphSnapshot::capture(&j)
        .to_json()
        .unwrap()
        .replacen("\"value\": 2.0", "\"value\": \"two\"", 1);
    assert!(matches!(
        GraphSnapshot::from_json(&json),
        Err(GraphError::Json(_))
    ));
}
