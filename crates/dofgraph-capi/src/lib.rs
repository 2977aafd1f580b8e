//! C API for dofgraph
//!
//! This crate provides a C-compatible interface to the dofgraph library,
//! allowing optimizable graphs to be built and differentiated from Julia,
//! Python, C, and other languages.
//!
//! All extern "C" functions are inherently unsafe as they work with raw pointers
//! from foreign code. The `#[unsafe(no_mangle)]` attribute marks the entire
//! function signature as unsafe at the FFI boundary.
//!
//! Node handles are not thread-safe: a graph must only be used from the
//! thread that created it.

#![allow(clippy::not_unsafe_ptr_arg_deref)]
#![allow(non_camel_case_types)]

use dofgraph::objectives::{scale, sum_of};
use dofgraph::{DofRegistry, EvalContext, Evaluate, GraphError, Node, Vjp};
use libc::{c_char, c_double, c_int, c_void, size_t};
use std::ffi::CStr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr;

// Status codes
pub type StatusCode = c_int;

pub const DG_SUCCESS: StatusCode = 0;
pub const DG_INVALID_ARGUMENT: StatusCode = -1;
pub const DG_INTERNAL_ERROR: StatusCode = -2;
pub const DG_UNKNOWN_DOF: StatusCode = -3;
pub const DG_DUPLICATE_DOF: StatusCode = -4;
pub const DG_FIXED_DOF: StatusCode = -5;
pub const DG_INVALID_BOUNDS: StatusCode = -6;
pub const DG_DIMENSION_MISMATCH: StatusCode = -7;
pub const DG_CYCLE: StatusCode = -8;
pub const DG_NOT_DIFFERENTIABLE: StatusCode = -9;
pub const DG_UNKNOWN_CHILD: StatusCode = -10;
pub const DG_EVALUATION_FAILED: StatusCode = -11;

fn status_of(err: &GraphError) -> StatusCode {
    match err {
        GraphError::UnknownDof { .. } => DG_UNKNOWN_DOF,
        GraphError::DuplicateDof { .. } => DG_DUPLICATE_DOF,
        GraphError::FixedDof { .. } => DG_FIXED_DOF,
        GraphError::InvalidBounds { .. } => DG_INVALID_BOUNDS,
        GraphError::DimensionMismatch { .. } => DG_DIMENSION_MISMATCH,
        GraphError::Cycle { .. } => DG_CYCLE,
        GraphError::NotDifferentiable { .. } => DG_NOT_DIFFERENTIABLE,
        GraphError::UnknownChild { .. } => DG_UNKNOWN_CHILD,
        GraphError::Evaluation { .. } => DG_EVALUATION_FAILED,
        _ => DG_INTERNAL_ERROR,
    }
}

/// Value callback of a callback node.
///
/// `input` holds the node's full DOF values followed by the values of its
/// children, in child order. The callback writes `output_len` values to
/// `output` and returns 0 on success.
pub type dg_value_fn = Option<
    unsafe extern "C" fn(
        input: *const c_double,
        input_len: size_t,
        output: *mut c_double,
        output_len: size_t,
        user_data: *mut c_void,
    ) -> c_int,
>;

/// Vector-Jacobian product callback of a callback node.
///
/// Writes `seed^T d(output)/d(input)` to `grad` (`input_len` values) and
/// returns 0 on success.
pub type dg_vjp_fn = Option<
    unsafe extern "C" fn(
        input: *const c_double,
        input_len: size_t,
        seed: *const c_double,
        output_len: size_t,
        grad: *mut c_double,
        user_data: *mut c_void,
    ) -> c_int,
>;

/// Opaque node handle
#[repr(C)]
pub struct dg_node {
    _private: *mut c_void,
}

impl dg_node {
    fn from_node(node: Node) -> Self {
        let boxed = Box::new(node);
        Self {
            _private: Box::into_raw(boxed) as *mut c_void,
        }
    }

    fn inner(&self) -> &Node {
        unsafe { &*(self._private as *const Node) }
    }
}

impl Drop for dg_node {
    fn drop(&mut self) {
        if !self._private.is_null() {
            unsafe {
                let _ = Box::from_raw(self._private as *mut Node);
            }
        }
    }
}

fn into_handle(node: Node) -> *mut dg_node {
    Box::into_raw(Box::new(dg_node::from_node(node)))
}

/// Evaluator forwarding to foreign callbacks.
#[derive(Debug)]
struct CallbackEvaluator {
    value: unsafe extern "C" fn(*const c_double, size_t, *mut c_double, size_t, *mut c_void) -> c_int,
    vjp: dg_vjp_fn,
    user_data: *mut c_void,
    output_len: usize,
}

impl CallbackEvaluator {
    /// Own DOF values followed by child values, plus each child's length.
    fn input(ctx: &EvalContext<'_>) -> Result<(Vec<f64>, Vec<usize>), GraphError> {
        let mut input = ctx.dofs().full_values();
        let mut child_lens = Vec::with_capacity(ctx.num_children());
        for i in 0..ctx.num_children() {
            let value = ctx.child_value(i)?;
            child_lens.push(value.len());
            input.extend_from_slice(&value);
        }
        Ok((input, child_lens))
    }
}

impl Evaluate for CallbackEvaluator {
    fn value(&self, ctx: &EvalContext<'_>) -> Result<Vec<f64>, GraphError> {
        let (input, _) = Self::input(ctx)?;
        let mut output = vec![0.0; self.output_len];
        let code = unsafe {
            (self.value)(
                input.as_ptr(),
                input.len(),
                output.as_mut_ptr(),
                output.len(),
                self.user_data,
            )
        };
        if code != 0 {
            return Err(ctx.fail(format!("value callback returned {code}")));
        }
        Ok(output)
    }

    fn vjp(&self, ctx: &EvalContext<'_>, seed: &[f64]) -> Result<Vjp, GraphError> {
        let Some(vjp) = self.vjp else {
            return Err(GraphError::NotDifferentiable {
                node: ctx.node_name().to_string(),
            });
        };

        let (input, child_lens) = Self::input(ctx)?;
        let mut grad = vec![0.0; input.len()];
        let code = unsafe {
            vjp(
                input.as_ptr(),
                input.len(),
                seed.as_ptr(),
                seed.len(),
                grad.as_mut_ptr(),
                self.user_data,
            )
        };
        if code != 0 {
            return Err(ctx.fail(format!("vjp callback returned {code}")));
        }

        let (own, mut rest) = grad.split_at(ctx.dofs().len());
        let mut result = Vjp::new(own.to_vec());
        for (i, len) in child_lens.into_iter().enumerate() {
            let (child, tail) = rest.split_at(len);
            result = result.with_child(i, child.to_vec());
            rest = tail;
        }
        Ok(result)
    }
}

// ============================================================================
// Pointer helpers
// ============================================================================

/// Borrow a C string as UTF-8.
unsafe fn str_arg<'a>(s: *const c_char) -> Option<&'a str> {
    if s.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(s) }.to_str().ok()
}

/// Borrow `len` values; a null pointer is accepted only for `len == 0`.
unsafe fn slice_arg<'a, T>(data: *const T, len: size_t) -> Option<&'a [T]> {
    if len == 0 {
        return Some(&[]);
    }
    if data.is_null() {
        return None;
    }
    Some(unsafe { std::slice::from_raw_parts(data, len) })
}

unsafe fn slice_arg_mut<'a, T>(data: *mut T, len: size_t) -> Option<&'a mut [T]> {
    if len == 0 {
        return Some(&mut []);
    }
    if data.is_null() {
        return None;
    }
    Some(unsafe { std::slice::from_raw_parts_mut(data, len) })
}

unsafe fn node_arg<'a>(node: *const dg_node) -> Option<&'a Node> {
    if node.is_null() {
        return None;
    }
    Some(unsafe { (*node).inner() })
}

unsafe fn nodes_arg(nodes: *const *const dg_node, len: size_t) -> Option<Vec<Node>> {
    let handles = unsafe { slice_arg(nodes, len) }?;
    handles
        .iter()
        .map(|&handle| unsafe { node_arg(handle) }.cloned())
        .collect()
}

/// Build a registry from parallel name and value arrays.
unsafe fn registry_arg(
    dof_names: *const *const c_char,
    values: *const c_double,
    n_dofs: size_t,
) -> Result<DofRegistry, StatusCode> {
    let names = unsafe { slice_arg(dof_names, n_dofs) }.ok_or(DG_INVALID_ARGUMENT)?;
    let values = unsafe { slice_arg(values, n_dofs) }.ok_or(DG_INVALID_ARGUMENT)?;
    let mut pairs = Vec::with_capacity(n_dofs);
    for (&name, &value) in names.iter().zip(values) {
        let name = unsafe { str_arg(name) }.ok_or(DG_INVALID_ARGUMENT)?;
        pairs.push((name, value));
    }
    DofRegistry::from_pairs(pairs).map_err(|err| status_of(&err))
}

/// Run a constructor under `catch_unwind` and report through `status`.
fn construct(
    status: *mut StatusCode,
    f: impl FnOnce() -> Result<Node, StatusCode>,
) -> *mut dg_node {
    if status.is_null() {
        return ptr::null_mut();
    }

    let (node, code) = match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(node)) => (into_handle(node), DG_SUCCESS),
        Ok(Err(code)) => (ptr::null_mut(), code),
        Err(_) => (ptr::null_mut(), DG_INTERNAL_ERROR),
    };
    unsafe {
        *status = code;
    }
    node
}

/// Run a query under `catch_unwind` and map its result to a status code.
fn query(f: impl FnOnce() -> Result<(), StatusCode>) -> StatusCode {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => DG_SUCCESS,
        Ok(Err(code)) => code,
        Err(_) => DG_INTERNAL_ERROR,
    }
}

fn graph<T>(result: Result<T, GraphError>) -> Result<T, StatusCode> {
    result.map_err(|err| status_of(&err))
}

/// Copy `values` to a caller buffer of exactly the same length.
fn copy_out(values: &[f64], out: &mut [f64]) -> Result<(), StatusCode> {
    if values.len() != out.len() {
        return Err(DG_DIMENSION_MISMATCH);
    }
    out.copy_from_slice(values);
    Ok(())
}

// ============================================================================
// Node creation functions
// ============================================================================

/// Create a parameter node whose output is its own DOF vector.
///
/// # Arguments
/// * `name` - Node name (UTF-8, NUL-terminated)
/// * `dof_names` - Array of `n_dofs` DOF names
/// * `values` - Array of `n_dofs` initial values
/// * `n_dofs` - Number of DOFs
/// * `status` - Pointer to receive status code
///
/// # Returns
/// Pointer to new node, or null on error
#[unsafe(no_mangle)]
pub extern "C" fn dg_node_new_parameter(
    name: *const c_char,
    dof_names: *const *const c_char,
    values: *const c_double,
    n_dofs: size_t,
    status: *mut StatusCode,
) -> *mut dg_node {
    construct(status, || {
        let name = unsafe { str_arg(name) }.ok_or(DG_INVALID_ARGUMENT)?;
        let dofs = unsafe { registry_arg(dof_names, values, n_dofs) }?;
        Ok(Node::new(name, dofs))
    })
}

/// Create a node computed by foreign callbacks.
///
/// # Arguments
/// * `name` - Node name
/// * `dof_names`, `values`, `n_dofs` - Own DOFs, as in [`dg_node_new_parameter`]
/// * `children`, `n_children` - Child nodes; the node keeps its own references
/// * `output_len` - Number of values the value callback produces
/// * `value` - Value callback (required)
/// * `vjp` - Vjp callback, or null for a non-differentiable node
/// * `user_data` - Passed unchanged to both callbacks; must outlive the node
/// * `status` - Pointer to receive status code
///
/// # Returns
/// Pointer to new node, or null on error
#[unsafe(no_mangle)]
#[allow(clippy::too_many_arguments)]
pub extern "C" fn dg_node_new_callback(
    name: *const c_char,
    dof_names: *const *const c_char,
    values: *const c_double,
    n_dofs: size_t,
    children: *const *const dg_node,
    n_children: size_t,
    output_len: size_t,
    value: dg_value_fn,
    vjp: dg_vjp_fn,
    user_data: *mut c_void,
    status: *mut StatusCode,
) -> *mut dg_node {
    construct(status, || {
        let name = unsafe { str_arg(name) }.ok_or(DG_INVALID_ARGUMENT)?;
        let value = value.ok_or(DG_INVALID_ARGUMENT)?;
        let dofs = unsafe { registry_arg(dof_names, values, n_dofs) }?;
        let children = unsafe { nodes_arg(children, n_children) }.ok_or(DG_INVALID_ARGUMENT)?;
        let evaluator = CallbackEvaluator {
            value,
            vjp,
            user_data,
            output_len,
        };
        Ok(Node::composite(name, dofs, &children, evaluator))
    })
}

/// Elementwise sum of `n` nodes.
#[unsafe(no_mangle)]
pub extern "C" fn dg_sum(
    nodes: *const *const dg_node,
    n: size_t,
    status: *mut StatusCode,
) -> *mut dg_node {
    construct(status, || {
        let nodes = unsafe { nodes_arg(nodes, n) }.ok_or(DG_INVALID_ARGUMENT)?;
        Ok(sum_of(&nodes))
    })
}

/// `factor * node`, with `factor` stored as a fixed DOF named "factor".
#[unsafe(no_mangle)]
pub extern "C" fn dg_scale(
    node: *const dg_node,
    factor: c_double,
    status: *mut StatusCode,
) -> *mut dg_node {
    construct(status, || {
        let node = unsafe { node_arg(node) }.ok_or(DG_INVALID_ARGUMENT)?;
        Ok(scale(node, factor))
    })
}

// ============================================================================
// Node lifecycle functions
// ============================================================================

/// Release a node handle. The node itself lives on while parents hold it.
#[unsafe(no_mangle)]
pub extern "C" fn dg_node_release(node: *mut dg_node) {
    if !node.is_null() {
        unsafe {
            let _ = Box::from_raw(node);
        }
    }
}

/// Append `child` to `parent`'s children.
#[unsafe(no_mangle)]
pub extern "C" fn dg_node_add_child(parent: *const dg_node, child: *const dg_node) -> StatusCode {
    query(|| {
        let parent = unsafe { node_arg(parent) }.ok_or(DG_INVALID_ARGUMENT)?;
        let child = unsafe { node_arg(child) }.ok_or(DG_INVALID_ARGUMENT)?;
        graph(parent.add_child(child))
    })
}

// ============================================================================
// DOF functions
// ============================================================================

/// Number of free DOFs in the node's closure.
#[unsafe(no_mangle)]
pub extern "C" fn dg_node_dof_size(node: *const dg_node) -> size_t {
    if node.is_null() {
        return 0;
    }

    let result = catch_unwind(AssertUnwindSafe(|| unsafe { (*node).inner().dof_size() }));

    result.unwrap_or(0)
}

/// Copy the flattened free DOF vector into `out` (`len` must equal the DOF size).
#[unsafe(no_mangle)]
pub extern "C" fn dg_node_get_x(node: *const dg_node, out: *mut c_double, len: size_t) -> StatusCode {
    query(|| {
        let node = unsafe { node_arg(node) }.ok_or(DG_INVALID_ARGUMENT)?;
        let out = unsafe { slice_arg_mut(out, len) }.ok_or(DG_INVALID_ARGUMENT)?;
        copy_out(&node.x(), out)
    })
}

/// Write the flattened free DOF vector.
#[unsafe(no_mangle)]
pub extern "C" fn dg_node_set_x(node: *const dg_node, x: *const c_double, len: size_t) -> StatusCode {
    query(|| {
        let node = unsafe { node_arg(node) }.ok_or(DG_INVALID_ARGUMENT)?;
        let x = unsafe { slice_arg(x, len) }.ok_or(DG_INVALID_ARGUMENT)?;
        graph(node.set_x(x))
    })
}

/// Copy lower and upper bounds aligned with x.
#[unsafe(no_mangle)]
pub extern "C" fn dg_node_bounds(
    node: *const dg_node,
    lower: *mut c_double,
    upper: *mut c_double,
    len: size_t,
) -> StatusCode {
    query(|| {
        let node = unsafe { node_arg(node) }.ok_or(DG_INVALID_ARGUMENT)?;
        let lower_out = unsafe { slice_arg_mut(lower, len) }.ok_or(DG_INVALID_ARGUMENT)?;
        let upper_out = unsafe { slice_arg_mut(upper, len) }.ok_or(DG_INVALID_ARGUMENT)?;
        let (lower, upper) = node.bounds();
        copy_out(&lower, lower_out)?;
        copy_out(&upper, upper_out)
    })
}

/// Set bounds on one of the node's own DOFs.
#[unsafe(no_mangle)]
pub extern "C" fn dg_node_set_bounds(
    node: *const dg_node,
    dof: *const c_char,
    lower: c_double,
    upper: c_double,
) -> StatusCode {
    query(|| {
        let node = unsafe { node_arg(node) }.ok_or(DG_INVALID_ARGUMENT)?;
        let dof = unsafe { str_arg(dof) }.ok_or(DG_INVALID_ARGUMENT)?;
        graph(node.set_bounds(dof, lower, upper))
    })
}

/// Fix one of the node's own DOFs.
#[unsafe(no_mangle)]
pub extern "C" fn dg_node_fix(node: *const dg_node, dof: *const c_char) -> StatusCode {
    query(|| {
        let node = unsafe { node_arg(node) }.ok_or(DG_INVALID_ARGUMENT)?;
        let dof = unsafe { str_arg(dof) }.ok_or(DG_INVALID_ARGUMENT)?;
        graph(node.fix(dof))
    })
}

/// Unfix one of the node's own DOFs.
#[unsafe(no_mangle)]
pub extern "C" fn dg_node_unfix(node: *const dg_node, dof: *const c_char) -> StatusCode {
    query(|| {
        let node = unsafe { node_arg(node) }.ok_or(DG_INVALID_ARGUMENT)?;
        let dof = unsafe { str_arg(dof) }.ok_or(DG_INVALID_ARGUMENT)?;
        graph(node.unfix(dof))
    })
}

// ============================================================================
// Evaluation functions
// ============================================================================

/// Get the length of the node's output, evaluating it if needed.
#[unsafe(no_mangle)]
pub extern "C" fn dg_node_value_len(node: *const dg_node, out: *mut size_t) -> StatusCode {
    query(|| {
        let node = unsafe { node_arg(node) }.ok_or(DG_INVALID_ARGUMENT)?;
        if out.is_null() {
            return Err(DG_INVALID_ARGUMENT);
        }
        let len = graph(node.cached_value())?.len();
        unsafe {
            *out = len;
        }
        Ok(())
    })
}

/// Copy the node's output into `out` (`len` must equal the output length).
#[unsafe(no_mangle)]
pub extern "C" fn dg_node_value(node: *const dg_node, out: *mut c_double, len: size_t) -> StatusCode {
    query(|| {
        let node = unsafe { node_arg(node) }.ok_or(DG_INVALID_ARGUMENT)?;
        let out = unsafe { slice_arg_mut(out, len) }.ok_or(DG_INVALID_ARGUMENT)?;
        copy_out(&graph(node.cached_value())?, out)
    })
}

/// Copy the gradient of a scalar node, aligned with x, into `out`.
#[unsafe(no_mangle)]
pub extern "C" fn dg_node_gradient(
    node: *const dg_node,
    out: *mut c_double,
    len: size_t,
) -> StatusCode {
    query(|| {
        let node = unsafe { node_arg(node) }.ok_or(DG_INVALID_ARGUMENT)?;
        let out = unsafe { slice_arg_mut(out, len) }.ok_or(DG_INVALID_ARGUMENT)?;
        copy_out(&graph(node.gradient())?, out)
    })
}
