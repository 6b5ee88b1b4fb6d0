//! Constitutive kernel interfaces.
//!
//! Concrete material models are stateless kernels producing energy,
//! stress, and tangent from a deformation gradient plus an internal
//! state record that the caller owns. The engine carries the state with
//! the material point so kernels can be shared across every point of a
//! body.

use otm_algebra::{Hom, Real, Vector};

use crate::error::Result;

/// Internal-variable record carried per material point. The layout is
/// owned by the kernel that writes it; the engine only moves and
/// serializes it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MaterialState {
    pub vars: Vec<Real>,
}

impl MaterialState {
    pub fn with_len(n: usize) -> Self {
        MaterialState { vars: vec![0.0; n] }
    }
}

/// Mechanical constitutive kernel. `D` is the spatial dimension.
pub trait Solid<const D: usize>: Send + Sync {
    /// Strain-energy density per unit reference volume.
    fn energy(&self, f: &Hom<D, D>, state: &MaterialState) -> Result<Real>;

    /// First Piola-Kirchhoff stress.
    fn stress(&self, f: &Hom<D, D>, state: &MaterialState) -> Result<Hom<D, D>>;

    /// Commit the internal state at the end of a step (plastic flow,
    /// damage growth, reaction progress).
    fn advance(&self, f: &Hom<D, D>, state: &mut MaterialState) -> Result<()> {
        let _ = (f, state);
        Ok(())
    }

    /// Longitudinal wave speed for CFL estimates at the given mass
    /// density.
    fn wave_speed(&self, density: Real) -> Real;

    /// Number of internal variables the kernel expects in its state
    /// record.
    fn state_len(&self) -> usize {
        0
    }

    /// Dissipation committed by the last `advance`, if the kernel
    /// tracks one (plastic work, reaction heat). Used as a thermal
    /// source under thermo-mechanical coupling.
    fn dissipation(&self, state: &MaterialState) -> Real {
        let _ = state;
        0.0
    }
}

/// Thermal constitutive kernel for heat conduction.
pub trait Conduction<const D: usize>: Send + Sync {
    /// Heat flux from a temperature gradient at temperature `t`.
    fn flux(&self, grad_t: &Vector<D>, t: Real) -> Vector<D>;

    /// Derivative of the flux w.r.t. the temperature gradient
    /// (conductivity tensor), for implicit stiffness assembly.
    fn dflux_dgrad(&self, t: Real) -> Hom<D, D>;

    /// Volumetric heat capacity rho*c.
    fn capacity(&self, t: Real) -> Real;
}
