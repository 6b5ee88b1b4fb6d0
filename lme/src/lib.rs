//! Local max-entropy (LME) approximation kernel.
//!
//! Given a material-point position, a candidate node list, and a
//! locality parameter beta, the kernel solves the convex LME dual for
//! the Lagrange multiplier lambda and returns the partition-of-unity
//! weights, their spatial gradients, and (on request) second-order
//! sensitivities. The multiplier is warm-started from the previous
//! evaluation of the same point.

mod dual;

pub use dual::{LmeKernel, LmeParams, LmeShape};

use otm_algebra::Real;

/// Locality parameter from a dimensionless gamma and a local spacing
/// `h`: `beta = gamma / h^2`. Typical gamma ranges 0.8 to 4; larger
/// values localize the weights more sharply.
pub fn beta_from_spacing(gamma: Real, h: Real) -> Real {
    gamma / (h * h)
}
