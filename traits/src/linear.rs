//! Opaque keyed sparse linear system used by the semi-implicit
//! propagator.

use std::collections::HashMap;
use std::hash::Hash;

use otm_algebra::Real;

use crate::error::Result;

/// A linear system `A x = b` keyed by an arbitrary DOF identifier.
/// The propagator only adds coefficients, solves, and measures norms;
/// the factorisation backend is an implementation detail.
pub trait LinearSystem<K: Eq + Hash + Clone> {
    /// Accumulate `value` into `A[row, col]`.
    fn add(&mut self, row: K, col: K, value: Real);

    /// Accumulate `value` into `b[row]`.
    fn add_rhs(&mut self, row: K, value: Real);

    /// Euclidean norm of the current right-hand side.
    fn rhs_norm(&self) -> Real;

    /// Solve for `x`. Fails with `ThermalSolverFailed` on a singular
    /// system; the matrix and rhs are left untouched so the caller can
    /// roll the step back.
    fn solve(&mut self) -> Result<HashMap<K, Real>>;

    /// Drop all coefficients and the rhs, keeping allocations.
    fn clear(&mut self);
}
