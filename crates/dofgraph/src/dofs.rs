//! DOF registry: the named scalar parameters owned by one node.
//!
//! A registry keeps its DOFs in declaration order. That order is the order
//! in which free values appear in every flattened parameter vector that
//! contains them, so it never changes after a DOF is added.

use crate::error::GraphError;
use std::collections::HashMap;

const UNOWNED: &str = "<unowned>";

/// A single named scalar parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Dof {
    name: String,
    value: f64,
    fixed: bool,
    lower: f64,
    upper: f64,
}

impl Dof {
    fn new(name: String, value: f64) -> Self {
        Self {
            name,
            value,
            fixed: false,
            lower: f64::NEG_INFINITY,
            upper: f64::INFINITY,
        }
    }

    /// Identifier, unique within the owning registry.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current value.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Whether the DOF is hidden from the optimizer.
    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    /// Lower bound (`-inf` when unbounded).
    pub fn lower(&self) -> f64 {
        self.lower
    }

    /// Upper bound (`+inf` when unbounded).
    pub fn upper(&self) -> f64 {
        self.upper
    }
}

/// Ordered collection of DOFs with name lookup.
///
/// Values outside the bounds are accepted; bounds are only reported to the
/// optimizer.
///
/// # Example
///
/// ```
/// use dofgraph::DofRegistry;
///
/// let mut dofs = DofRegistry::from_pairs([("x0", 1.0), ("y0", 2.0)]).unwrap();
/// dofs.fix("x0").unwrap();
/// assert_eq!(dofs.free_names(), vec!["y0"]);
/// assert_eq!(dofs.free_values(), vec![2.0]);
/// assert!(dofs.set_value("x0", 5.0).is_err());
/// ```
#[derive(Debug, Clone)]
pub struct DofRegistry {
    owner: String,
    dofs: Vec<Dof>,
    index: HashMap<String, usize>,
}

impl DofRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            owner: UNOWNED.to_string(),
            dofs: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Create a registry from `(name, value)` pairs, all free.
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self, GraphError>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let mut registry = Self::new();
        for (name, value) in pairs {
            registry.add(name, value)?;
        }
        Ok(registry)
    }

    /// Create a registry named `x0, x1, ...` from plain values.
    pub fn from_values(values: &[f64]) -> Self {
        let mut registry = Self::new();
        for (i, &value) in values.iter().enumerate() {
            let name = format!("x{i}");
            registry.index.insert(name.clone(), i);
            registry.dofs.push(Dof::new(name, value));
        }
        registry
    }

    /// Append a free, unbounded DOF.
    pub fn add(&mut self, name: impl Into<String>, value: f64) -> Result<(), GraphError> {
        let name = name.into();
        if self.index.contains_key(&name) {
            return Err(GraphError::DuplicateDof {
                node: self.owner.clone(),
                name,
            });
        }
        self.index.insert(name.clone(), self.dofs.len());
        self.dofs.push(Dof::new(name, value));
        Ok(())
    }

    pub(crate) fn set_owner(&mut self, owner: &str) {
        self.owner = owner.to_string();
    }

    /// Position of `name` in declaration order.
    pub fn position(&self, name: &str) -> Result<usize, GraphError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::UnknownDof {
                node: self.owner.clone(),
                name: name.to_string(),
            })
    }

    /// Look up a DOF record.
    pub fn get(&self, name: &str) -> Result<&Dof, GraphError> {
        let i = self.position(name)?;
        Ok(&self.dofs[i])
    }

    /// Current value of `name`.
    pub fn get_value(&self, name: &str) -> Result<f64, GraphError> {
        Ok(self.get(name)?.value)
    }

    /// Set the value of a free DOF.
    ///
    /// Returns `true` when the stored value actually changed (bitwise).
    ///
    /// # Errors
    /// `UnknownDof` if absent, `FixedDof` if the DOF is fixed.
    pub fn set_value(&mut self, name: &str, value: f64) -> Result<bool, GraphError> {
        let i = self.position(name)?;
        if self.dofs[i].fixed {
            return Err(GraphError::FixedDof {
                node: self.owner.clone(),
                name: name.to_string(),
            });
        }
        Ok(self.write(i, value))
    }

    /// Set the value regardless of the fixed flag.
    pub fn force_set_value(&mut self, name: &str, value: f64) -> Result<bool, GraphError> {
        let i = self.position(name)?;
        Ok(self.write(i, value))
    }

    pub(crate) fn write(&mut self, i: usize, value: f64) -> bool {
        let dof = &mut self.dofs[i];
        let changed = dof.value.to_bits() != value.to_bits();
        dof.value = value;
        changed
    }

    /// Fix a DOF. Returns `true` if the flag changed.
    pub fn fix(&mut self, name: &str) -> Result<bool, GraphError> {
        let i = self.position(name)?;
        Ok(!std::mem::replace(&mut self.dofs[i].fixed, true))
    }

    /// Unfix a DOF. Returns `true` if the flag changed.
    pub fn unfix(&mut self, name: &str) -> Result<bool, GraphError> {
        let i = self.position(name)?;
        Ok(std::mem::replace(&mut self.dofs[i].fixed, false))
    }

    /// Fix every DOF. Returns `true` if any flag changed.
    pub fn fix_all(&mut self) -> bool {
        self.set_all_fixed(true)
    }

    /// Unfix every DOF. Returns `true` if any flag changed.
    pub fn unfix_all(&mut self) -> bool {
        self.set_all_fixed(false)
    }

    fn set_all_fixed(&mut self, fixed: bool) -> bool {
        let mut changed = false;
        for dof in &mut self.dofs {
            changed |= dof.fixed != fixed;
            dof.fixed = fixed;
        }
        changed
    }

    /// Whether `name` is fixed.
    pub fn is_fixed(&self, name: &str) -> Result<bool, GraphError> {
        Ok(self.get(name)?.fixed)
    }

    /// Set bounds for a DOF. Does not clamp the current value.
    pub fn set_bounds(&mut self, name: &str, lower: f64, upper: f64) -> Result<(), GraphError> {
        if lower > upper {
            return Err(GraphError::InvalidBounds {
                node: self.owner.clone(),
                name: name.to_string(),
                lower,
                upper,
            });
        }
        let i = self.position(name)?;
        let dof = &mut self.dofs[i];
        dof.lower = lower;
        dof.upper = upper;
        Ok(())
    }

    /// Bounds of a single DOF.
    pub fn bounds_of(&self, name: &str) -> Result<(f64, f64), GraphError> {
        let dof = self.get(name)?;
        Ok((dof.lower, dof.upper))
    }

    /// Values of unfixed DOFs, declaration order.
    pub fn free_values(&self) -> Vec<f64> {
        self.free().map(|d| d.value).collect()
    }

    /// Names of unfixed DOFs, declaration order.
    pub fn free_names(&self) -> Vec<&str> {
        self.free().map(|d| d.name.as_str()).collect()
    }

    /// `(lower, upper)` of unfixed DOFs, declaration order.
    pub fn free_bounds(&self) -> (Vec<f64>, Vec<f64>) {
        self.free().map(|d| (d.lower, d.upper)).unzip()
    }

    /// Values of all DOFs including fixed ones.
    pub fn full_values(&self) -> Vec<f64> {
        self.dofs.iter().map(|d| d.value).collect()
    }

    /// Iterate over all DOF records.
    pub fn iter(&self) -> impl Iterator<Item = &Dof> {
        self.dofs.iter()
    }

    fn free(&self) -> impl Iterator<Item = &Dof> {
        self.dofs.iter().filter(|d| !d.fixed)
    }

    /// Positions of the unfixed DOFs.
    pub(crate) fn free_positions(&self) -> impl Iterator<Item = usize> + '_ {
        self.dofs
            .iter()
            .enumerate()
            .filter(|(_, d)| !d.fixed)
            .map(|(i, _)| i)
    }

    pub(crate) fn dof_at(&self, i: usize) -> &Dof {
        &self.dofs[i]
    }

    /// Number of DOFs including fixed ones.
    pub fn len(&self) -> usize {
        self.dofs.len()
    }

    /// Number of unfixed DOFs.
    pub fn free_len(&self) -> usize {
        self.free().count()
    }

    /// Check if the registry has no DOFs at all.
    pub fn is_empty(&self) -> bool {
        self.dofs.is_empty()
    }
}

impl Default for DofRegistry {
    fn default() -> Self {
        Self::new()
    }
}
