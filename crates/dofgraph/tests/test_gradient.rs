//! Integration tests for reverse-mode gradients.
//!
//! Analytic gradients are compared against central differences.

use approx::assert_relative_eq;
use dofgraph::objectives::{self, PenaltyKind};
use dofgraph::{
    DofRegistry, FnEvaluator, GraphError, Node, TaylorTestConfig, Vjp, finite_difference_gradient,
    taylor_test,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// `sum_i w_i * v_i^2` over the child's output, with weights as own DOFs.
fn weighted_squares(name: &str, child: &Node, weights: &[f64]) -> Node {
    Node::composite(
        name,
        DofRegistry::from_values(weights),
        std::slice::from_ref(child),
        FnEvaluator::new(|ctx| {
            let v = ctx.child_value(0)?;
            let w = ctx.dofs().full_values();
            Ok(vec![w.iter().zip(v.iter()).map(|(w, v)| w * v * v).sum::<f64>()])
        })
        .with_vjp(|ctx, seed| {
            let v = ctx.child_value(0)?;
            let w = ctx.dofs().full_values();
            let own = v.iter().map(|v| seed[0] * v * v).collect();
            let child = w
                .iter()
                .zip(v.iter())
                .map(|(w, v)| seed[0] * 2.0 * w * v)
                .collect();
            Ok(Vjp::new(own).with_child(0, child))
        }),
    )
}

/// Elementwise product of two children with equal output length.
fn product(name: &str, a: &Node, b: &Node) -> Node {
    Node::composite(
        name,
        DofRegistry::new(),
        &[a.clone(), b.clone()],
        FnEvaluator::new(|ctx| {
            let a = ctx.child_value(0)?;
            let b = ctx.child_value(1)?;
            Ok(a.iter().zip(b.iter()).map(|(a, b)| a * b).collect())
        })
        .with_vjp(|ctx, seed| {
            let a = ctx.child_value(0)?;
            let b = ctx.child_value(1)?;
            let da = seed.iter().zip(b.iter()).map(|(s, b)| s * b).collect();
            let db = seed.iter().zip(a.iter()).map(|(s, a)| s * a).collect();
            Ok(Vjp::children_only().with_child(0, da).with_child(1, db))
        }),
    )
}

fn assert_matches_finite_difference(node: &Node) {
    let analytic = node.gradient().unwrap();
    let numeric = finite_difference_gradient(node, 1e-6).unwrap();
    assert_eq!(analytic.len(), numeric.len());
    for (a, n) in analytic.iter().zip(&numeric) {
        assert_relative_eq!(a, n, epsilon = 1e-5, max_relative = 1e-5);
    }
}

#[test]
fn test_diamond_gradient_accumulates() {
    //        J = A + B
    //       /         \
    //  A = sq(S)   B = 2 * S
    //       \         /
    //        S (x0, x1)
    let shared = Node::new("shared", DofRegistry::from_values(&[1.5, -0.5]));
    let a = weighted_squares("a", &shared, &[1.0, 1.0]);
    a.fix_all();
    let b = objectives::scale(&shared, 2.0);
    let b_sum = objectives::sum_of(&[b]);
    let j = Node::composite(
        "j",
        DofRegistry::new(),
        &[a, b_sum],
        FnEvaluator::new(|ctx| {
            let a = ctx.child_scalar(0)?;
            let b = ctx.child_value(1)?;
            Ok(vec![a + b.iter().sum::<f64>()])
        })
        .with_vjp(|ctx, seed| {
            let n = ctx.child_value(1)?.len();
            Ok(Vjp::children_only()
                .with_child(0, vec![seed[0]])
                .with_child(1, vec![seed[0]; n]))
        }),
    );

    assert_eq!(j.x(), vec![1.5, -0.5]);
    // d/dx (x^2 + 2x) = 2x + 2
    assert_eq!(j.gradient().unwrap(), vec![5.0, 1.0]);
    assert_matches_finite_difference(&j);
}

#[test]
fn test_same_child_twice_sums_seeds() {
    let x = Node::new("x", DofRegistry::from_values(&[3.0]));
    let xx = product("xx", &x, &x);
    assert_eq!(xx.scalar_value().unwrap(), 9.0);
    assert_eq!(xx.gradient().unwrap(), vec![6.0]);
}

#[test]
fn test_deep_graph_with_diamond_random_direction() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut values = |n: usize| -> Vec<f64> {
        (0..n).map(|_| rng.random_range(-1.0..1.0)).collect()
    };

    // Level 0: shared parameters
    let base = Node::new("base", DofRegistry::from_values(&values(3)));
    let other = Node::new("other", DofRegistry::from_values(&values(3)));
    // Level 1: two paths through `base`
    let left = product("left", &base, &other);
    let right = weighted_squares("right", &base, &values(3));
    // Level 2: combine into a scalar
    let middle = weighted_squares("middle", &left, &values(3));
    // Level 3: objective with a penalty and a weighted sum
    let penalty = objectives::quadratic_penalty(&right, 0.1, PenaltyKind::Identity);
    let j = objectives::weighted_sum(&[(1.0, middle), (0.7, penalty)]);

    let x = j.x();
    assert_eq!(x.len(), 3 + 3 + 3 + 3);

    let config = TaylorTestConfig::along(values(x.len()));
    let report = taylor_test(&j, &config).unwrap();
    let step = report
        .steps
        .iter()
        .find(|step| step.epsilon == 1e-6)
        .unwrap();
    assert!(step.error < 1e-5, "relative error {}", step.error);
    assert_eq!(j.x(), x);

    assert_matches_finite_difference(&j);
}

#[test]
fn test_fixed_dofs_excluded_from_gradient() {
    let a = Node::new("a", DofRegistry::from_values(&[1.0, 2.0]));
    let j = weighted_squares("j", &a, &[3.0, 4.0]);
    assert_eq!(j.x().len(), 4);

    j.fix_all();
    a.fix("x0").unwrap();
    assert_eq!(j.x(), vec![2.0]);
    // d/da1 (4 * a1^2) = 8 a1
    assert_eq!(j.gradient().unwrap(), vec![16.0]);
}

#[test]
fn test_named_gradient() {
    let a = Node::new("a", DofRegistry::from_values(&[1.0, 2.0]));
    let j = weighted_squares("j", &a, &[3.0, 4.0]);
    let named = j.derivative().unwrap().named(&j);

    assert_eq!(named.len(), 4);
    assert_relative_eq!(named["j:x0"], 1.0);
    assert_relative_eq!(named["j:x1"], 4.0);
    assert_relative_eq!(named["a:x0"], 6.0);
    assert_relative_eq!(named["a:x1"], 16.0);
}

#[test]
fn test_derivative_projects_onto_subgraph() {
    let a = Node::new("a", DofRegistry::from_values(&[1.0, 2.0]));
    let j = weighted_squares("j", &a, &[3.0, 4.0]);
    let d = j.derivative().unwrap();
    assert_eq!(d.project(&a), vec![6.0, 16.0]);
}

#[test]
fn test_derivative_linear_combination() {
    let a = Node::new("a", DofRegistry::from_values(&[2.0]));
    let j1 = weighted_squares("j1", &a, &[1.0]);
    let j2 = objectives::scale(&a, 3.0);
    j1.fix_all();

    let j = objectives::sum_of(&[j1.clone(), j2.clone()]);
    let combined = j1.derivative().unwrap() + 2.0 * j2.derivative().unwrap();
    // d/da (a^2) + 2 * d/da (3a) = 2a + 6
    assert_eq!(combined.project(&a), vec![10.0]);
    assert_eq!(j.gradient().unwrap(), vec![7.0]);
}

#[test]
fn test_non_differentiable_node_blocks_gradient_only() {
    let a = Node::new("a", DofRegistry::from_values(&[0.5]));
    let opaque = Node::composite(
        "opaque",
        DofRegistry::new(),
        &[a],
        FnEvaluator::new(|ctx| Ok(vec![ctx.child_scalar(0)?.exp()])),
    );
    assert_relative_eq!(opaque.scalar_value().unwrap(), 0.5_f64.exp());
    assert!(matches!(
        opaque.gradient(),
        Err(GraphError::NotDifferentiable { .. })
    ));
}
