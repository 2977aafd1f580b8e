//! Reverse-mode gradient propagation through the node DAG.
//!
//! # Architecture
//!
//! ```text
//! root.gradient()
//!      │
//!      ▼
//! backward(root, seed) ── petgraph toposort ──► parents before children
//!      │
//!      ▼  per node: Evaluate::vjp(seed)
//!      ├── own DOF sensitivity ──► Derivative (keyed by NodeId)
//!      └── child seeds ─────────► pending accumulators (summed)
//!      │
//!      ▼
//! Derivative::project(root) ──► gradient aligned with root.x()
//! ```
//!
//! # Design Notes
//!
//! - Per-node accumulators are built fresh for each pass and dropped after.
//! - A child reached through several parents receives the sum of their seeds
//!   and runs its vjp once.
//! - Fixed DOFs get an entry in the `Derivative` but are dropped by
//!   projection, so they never appear in the gradient vector.

mod backward;
mod derivative;

pub use backward::backward;
pub use derivative::Derivative;
