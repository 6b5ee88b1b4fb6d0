//! Explicit central-difference propagator (Newmark beta = 0).

use otm_algebra::{Real, Vector};
use otm_traits::Result;

use crate::clock::Clock;
use crate::dof::DofState;

/// Central-difference stepper over the reduced DOFs.
///
/// Predictor: `v += (1-γ) dt a; x += dt v`. After force assembly the
/// corrector applies `a = -f/m; v += γ dt a`. Detached and effectively
/// massless DOFs skip the acceleration update and coast at their last
/// velocity.
#[derive(Clone, Copy, Debug)]
pub struct CentralDifference {
    pub gamma: Real,
    /// DOFs with mass below this floor coast like detached ones.
    pub mass_floor: Real,
}

impl Default for CentralDifference {
    fn default() -> Self {
        CentralDifference {
            gamma: 0.5,
            mass_floor: 0.0,
        }
    }
}

impl CentralDifference {
    pub fn new(gamma: Real) -> Self {
        CentralDifference {
            gamma,
            mass_floor: 0.0,
        }
    }

    fn coasting<const D: usize>(&self, dofs: &DofState<D>, i: usize) -> bool {
        dofs.detached[i] || dofs.mass[i] <= self.mass_floor
    }

    /// Half-step velocity update and full position advance.
    pub fn predictor<const D: usize>(&self, clock: &Clock, dofs: &mut DofState<D>) -> Result<()> {
        clock.validate()?;
        let dt = clock.dt();
        for i in 0..dofs.len() {
            if !self.coasting(dofs, i) {
                let a = dofs.acceleration[i];
                dofs.velocity[i] += a.scale((1.0 - self.gamma) * dt);
            }
            let v = dofs.velocity[i];
            dofs.position[i] += v.scale(dt);
        }
        Ok(())
    }

    /// Finish the step from assembled reduced forces; advances the
    /// clock.
    pub fn corrector<const D: usize>(
        &self,
        clock: &mut Clock,
        dofs: &mut DofState<D>,
        forces: &[Vector<D>],
    ) -> Result<()> {
        clock.validate()?;
        debug_assert_eq!(forces.len(), dofs.len());
        let dt = clock.dt();
        for i in 0..dofs.len() {
            if self.coasting(dofs, i) {
                dofs.acceleration[i] = Vector::zero();
                continue;
            }
            let a_new = forces[i].scale(-1.0 / dofs.mass[i]);
            dofs.velocity[i] += a_new.scale(self.gamma * dt);
            dofs.acceleration[i] = a_new;
        }
        clock.tick();
        Ok(())
    }

    /// Position-only advance by the current velocities (free flight,
    /// no force assembly); advances the clock.
    pub fn ballistic_update<const D: usize>(
        &self,
        clock: &mut Clock,
        dofs: &mut DofState<D>,
    ) -> Result<()> {
        clock.validate()?;
        let dt = clock.dt();
        for i in 0..dofs.len() {
            let v = dofs.velocity[i];
            dofs.position[i] += v.scale(dt);
        }
        clock.tick();
        Ok(())
    }

    /// Rewind a predictor half-step (used when a step must be rolled
    /// back after a failed implicit solve).
    pub fn pull_back<const D: usize>(&self, clock: &Clock, dofs: &mut DofState<D>) {
        let dt = clock.dt();
        for i in 0..dofs.len() {
            let v = dofs.velocity[i];
            dofs.position[i] -= v.scale(dt);
            if !self.coasting(dofs, i) {
                let a = dofs.acceleration[i];
                dofs.velocity[i] -= a.scale((1.0 - self.gamma) * dt);
            }
        }
    }

    /// Uniform velocity scaling for quasi-static settling.
    pub fn dynamic_relaxation<const D: usize>(&self, dofs: &mut DofState<D>, factor: Real) {
        for v in dofs.velocity.iter_mut() {
            *v = v.scale(factor);
        }
    }
}

/// CFL-stable time step: `min h / (c + |v|)` over the supplied
/// (spacing, wave speed, speed) triples, times the caller's fraction.
pub fn stable_dt(samples: impl Iterator<Item = (Real, Real, Real)>, cfl_fraction: Real) -> Real {
    let mut dt = Real::INFINITY;
    for (h, c, v) in samples {
        let denom = c + v;
        if denom > 0.0 {
            dt = dt.min(h / denom);
        }
    }
    cfl_fraction * dt
}

#[cfg(test)]
mod test {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn free_dof_drifts_linearly() {
        let mut clock = Clock::new(0.1);
        let mut dofs = DofState::<2>::with_len(1);
        dofs.mass[0] = 2.0;
        dofs.velocity[0] = Vector([1.0, -0.5]);
        let prop = CentralDifference::default();
        for _ in 0..100 {
            prop.predictor(&clock, &mut dofs).unwrap();
            let forces = vec![Vector::zero(); 1];
            prop.corrector(&mut clock, &mut dofs, &forces).unwrap();
        }
        assert_approx_eq!(f64, clock.time(), 10.0, epsilon = 1e-12);
        assert_approx_eq!(f64, dofs.position[0][0], 10.0, epsilon = 1e-9);
        assert_approx_eq!(f64, dofs.position[0][1], -5.0, epsilon = 1e-9);
        assert_approx_eq!(f64, dofs.velocity[0][0], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn harmonic_oscillator_conserves_energy() {
        // unit mass on a unit spring, 1-D
        let k = 1.0;
        let dt = 0.01;
        let mut clock = Clock::new(dt);
        let mut dofs = DofState::<1>::with_len(1);
        dofs.mass[0] = 1.0;
        dofs.position[0] = Vector([1.0]);
        let prop = CentralDifference::default();
        // consistent initial acceleration
        dofs.acceleration[0] = Vector([-k * dofs.position[0][0]]);
        let e0 = 0.5 * k + 0.0;
        for _ in 0..10_000 {
            prop.predictor(&clock, &mut dofs).unwrap();
            let f = vec![Vector([k * dofs.position[0][0]])];
            prop.corrector(&mut clock, &mut dofs, &f).unwrap();
        }
        let e = 0.5 * k * dofs.position[0][0].powi(2) + 0.5 * dofs.velocity[0][0].powi(2);
        assert!((e - e0).abs() / e0 <= 1e-3, "energy drifted to {e}");
    }

    #[test]
    fn detached_dof_coasts() {
        let mut clock = Clock::new(0.1);
        let mut dofs = DofState::<2>::with_len(1);
        dofs.mass[0] = 1.0;
        dofs.detached[0] = true;
        dofs.velocity[0] = Vector([2.0, 0.0]);
        let prop = CentralDifference::default();
        prop.predictor(&clock, &mut dofs).unwrap();
        let forces = vec![Vector([100.0, 100.0])];
        prop.corrector(&mut clock, &mut dofs, &forces).unwrap();
        assert_approx_eq!(f64, dofs.velocity[0][0], 2.0);
        assert_approx_eq!(f64, dofs.acceleration[0].norm(), 0.0);
        assert_approx_eq!(f64, dofs.position[0][0], 0.2);
    }

    #[test]
    fn invalid_dt_is_rejected() {
        let clock = Clock::new(0.0);
        let mut dofs = DofState::<2>::with_len(1);
        let prop = CentralDifference::default();
        assert!(prop.predictor(&clock, &mut dofs).is_err());
    }

    #[test]
    fn pull_back_inverts_predictor() {
        let clock = Clock::new(0.05);
        let mut dofs = DofState::<2>::with_len(2);
        dofs.mass = vec![1.0, 3.0];
        dofs.position = vec![Vector([0.1, 0.2]), Vector([1.0, -1.0])];
        dofs.velocity = vec![Vector([1.0, 0.0]), Vector([0.0, 2.0])];
        dofs.acceleration = vec![Vector([0.5, 0.5]), Vector([-0.5, 0.0])];
        let before = dofs.clone();
        let prop = CentralDifference::default();
        prop.predictor(&clock, &mut dofs).unwrap();
        prop.pull_back(&clock, &mut dofs);
        for i in 0..2 {
            assert!((dofs.position[i] - before.position[i]).norm() <= 1e-14);
            assert!((dofs.velocity[i] - before.velocity[i]).norm() <= 1e-14);
        }
    }

    #[test]
    fn stable_dt_takes_the_worst_sample() {
        let dt = stable_dt(
            [(0.1, 100.0, 0.0), (0.1, 10.0, 10.0), (1.0, 1.0, 0.0)].into_iter(),
            0.5,
        );
        assert_approx_eq!(f64, dt, 0.5 * 0.1 / 100.0);
    }
}
