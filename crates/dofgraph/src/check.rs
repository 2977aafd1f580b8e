//! Finite-difference checks of analytic gradients.
//!
//! Both checks perturb `x` through the regular setter, so they exercise the
//! cache invalidation path as well, and restore the original `x` before
//! returning, also on error.

use crate::error::GraphError;
use crate::node::Node;
use tracing::debug;

/// Configuration of [`taylor_test`].
#[derive(Debug, Clone, PartialEq)]
pub struct TaylorTestConfig {
    /// Step sizes, typically decreasing.
    pub epsilons: Vec<f64>,
    /// Perturbation direction `h`; `None` uses `(1, ..., 1) / sqrt(n)`.
    pub direction: Option<Vec<f64>>,
}

impl Default for TaylorTestConfig {
    fn default() -> Self {
        Self {
            epsilons: vec![1e-2, 1e-3, 1e-4, 1e-5, 1e-6],
            direction: None,
        }
    }
}

impl TaylorTestConfig {
    /// Default step sizes along `direction`.
    pub fn along(direction: Vec<f64>) -> Self {
        Self {
            direction: Some(direction),
            ..Self::default()
        }
    }
}

/// One step of a Taylor test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaylorStep {
    pub epsilon: f64,
    /// `(f(x + eps h) - f(x - eps h)) / (2 eps)`
    pub estimate: f64,
    /// `|estimate - grad . h|`, relative to `|grad . h|` when that is nonzero.
    pub error: f64,
}

/// Outcome of [`taylor_test`].
#[derive(Debug, Clone, PartialEq)]
pub struct TaylorReport {
    /// `gradient(x) . h`
    pub directional_derivative: f64,
    pub steps: Vec<TaylorStep>,
}

impl TaylorReport {
    /// Smallest error over all steps.
    pub fn min_error(&self) -> f64 {
        self.steps
            .iter()
            .map(|step| step.error)
            .fold(f64::INFINITY, f64::min)
    }

    /// Whether some step agrees with the analytic derivative within `tol`.
    pub fn passed(&self, tol: f64) -> bool {
        self.min_error() < tol
    }
}

/// Compare the analytic directional derivative of a scalar node with
/// central differences.
///
/// # Errors
/// `DimensionMismatch` if the direction does not match `x`, plus anything
/// the value or gradient computation returns.
pub fn taylor_test(node: &Node, config: &TaylorTestConfig) -> Result<TaylorReport, GraphError> {
    let x0 = node.x();
    let h = match &config.direction {
        Some(direction) if direction.len() != x0.len() => {
            return Err(GraphError::dimension(
                format!("taylor test direction for '{}'", node.name()),
                x0.len(),
                direction.len(),
            ));
        }
        Some(direction) => direction.clone(),
        None => {
            let unit = 1.0 / (x0.len().max(1) as f64).sqrt();
            vec![unit; x0.len()]
        }
    };

    let gradient = node.gradient()?;
    let directional_derivative = dot(&gradient, &h);

    let steps = with_restored_x(node, &x0, || {
        config
            .epsilons
            .iter()
            .map(|&epsilon| {
                let estimate = central_difference(node, &x0, &h, epsilon)?;
                let mut error = (estimate - directional_derivative).abs();
                if directional_derivative != 0.0 {
                    error /= directional_derivative.abs();
                }
                debug!(node = %node.name(), epsilon, estimate, error, "taylor step");
                Ok(TaylorStep {
                    epsilon,
                    estimate,
                    error,
                })
            })
            .collect::<Result<Vec<_>, GraphError>>()
    })?;

    Ok(TaylorReport {
        directional_derivative,
        steps,
    })
}

/// Central-difference gradient of a scalar node, aligned with `x`.
pub fn finite_difference_gradient(node: &Node, epsilon: f64) -> Result<Vec<f64>, GraphError> {
    let x0 = node.x();
    with_restored_x(node, &x0, || {
        let mut e = vec![0.0; x0.len()];
        let mut grad = Vec::with_capacity(x0.len());
        for i in 0..x0.len() {
            e[i] = 1.0;
            grad.push(central_difference(node, &x0, &e, epsilon)?);
            e[i] = 0.0;
        }
        Ok(grad)
    })
}

fn central_difference(node: &Node, x0: &[f64], h: &[f64], epsilon: f64) -> Result<f64, GraphError> {
    let shifted = |sign: f64| -> Vec<f64> {
        x0.iter()
            .zip(h)
            .map(|(x, d)| x + sign * epsilon * d)
            .collect()
    };
    node.set_x(&shifted(1.0))?;
    let plus = node.scalar_value()?;
    node.set_x(&shifted(-1.0))?;
    let minus = node.scalar_value()?;
    Ok((plus - minus) / (2.0 * epsilon))
}

fn with_restored_x<T>(
    node: &Node,
    x0: &[f64],
    f: impl FnOnce() -> Result<T, GraphError>,
) -> Result<T, GraphError> {
    let result = f();
    node.set_x(x0)?;
    result
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
