//! The node-contribution protocol shared by every element type.

use otm_algebra::{Real, Vector};

use crate::error::Result;
use crate::types::NodeId;

/// Per-call context handed to element kernels.
#[derive(Clone, Copy, Debug)]
pub struct ContribCtx {
    pub time: Real,
    pub dt: Real,
}

/// An element that contributes energy and nodal forces.
///
/// The caller (the global local state) gathers ambient positions and
/// velocities for `nodes()` in order and hands them in as slices; the
/// element adds its energy gradient `∂E/∂x_a` into `out` slot by slot.
/// External loads enter with a negative sign so the propagator's
/// `a = -f/m` sees them as driving forces.
pub trait NodalContributor<const D: usize>: Send + Sync {
    fn nodes(&self) -> &[NodeId];

    fn energy(&self, ctx: &ContribCtx, xs: &[Vector<D>]) -> Result<Real> {
        let _ = (ctx, xs);
        Ok(0.0)
    }

    fn add_forces(
        &self,
        ctx: &ContribCtx,
        xs: &[Vector<D>],
        vs: &[Vector<D>],
        out: &mut [Vector<D>],
    ) -> Result<()>;
}
