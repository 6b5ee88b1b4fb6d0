//! Semi-implicit thermal update.
//!
//! Mechanical DOFs advance explicitly; temperature DOFs advance by a
//! backward-Euler solve `(M_T/dt + DDE) ΔT = -DE` over an opaque keyed
//! system assembled by the model. On solver failure the caller rolls
//! the mechanical half-step back and surfaces `ThermalSolverFailed`.

use std::collections::HashMap;
use std::hash::Hash;

use log::debug;

use otm_algebra::Real;
use otm_traits::{LinearSystem, Result};

#[derive(Clone, Copy, Debug)]
pub struct ThermalSolve {
    /// Residual norm below which the solve is skipped entirely.
    pub tolerance: Real,
    /// Largest admissible |ΔT| per step; increments are clamped.
    pub max_increment: Real,
}

impl Default for ThermalSolve {
    fn default() -> Self {
        ThermalSolve {
            tolerance: 1e-14,
            max_increment: Real::INFINITY,
        }
    }
}

impl ThermalSolve {
    /// Solve the assembled system for the temperature increment.
    pub fn solve<K, S>(&self, system: &mut S) -> Result<HashMap<K, Real>>
    where
        K: Eq + Hash + Clone,
        S: LinearSystem<K>,
    {
        if system.rhs_norm() <= self.tolerance {
            debug!("thermal: residual below tolerance, skipping solve");
            return Ok(HashMap::new());
        }
        let mut dt_map = system.solve()?;
        if self.max_increment.is_finite() {
            for v in dt_map.values_mut() {
                *v = v.clamp(-self.max_increment, self.max_increment);
            }
        }
        Ok(dt_map)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::linear::KeyedSystem;
    use float_cmp::assert_approx_eq;

    #[test]
    fn backward_euler_single_dof_decay() {
        // m dT/dt = -k T with m=1, k=2, T0=1, dt=0.1:
        // (m/dt + k) dT = -k T0  ->  dT = -0.2/1.2? no: -2/(10+2) = -1/6
        let dt = 0.1;
        let mut sys = KeyedSystem::new();
        sys.add(0u64, 0u64, 1.0 / dt + 2.0);
        sys.add_rhs(0u64, -2.0 * 1.0);
        let inc = ThermalSolve::default().solve(&mut sys).unwrap();
        assert_approx_eq!(f64, inc[&0u64], -2.0 / 12.0, epsilon = 1e-12);
    }

    #[test]
    fn increments_are_clamped() {
        let mut sys = KeyedSystem::new();
        sys.add(0u64, 0u64, 1.0);
        sys.add_rhs(0u64, 100.0);
        let ts = ThermalSolve {
            max_increment: 5.0,
            ..ThermalSolve::default()
        };
        let inc = ts.solve(&mut sys).unwrap();
        assert_approx_eq!(f64, inc[&0u64], 5.0);
    }
}
