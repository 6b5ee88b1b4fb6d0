//! Reference constitutive kernels.
//!
//! The production material library is an external collaborator; these
//! small kernels exist so the engine's scenarios and tests have real
//! physics to run: compressible neo-Hookean hyperelasticity, J2
//! plasticity with isotropic hardening by radial return on the spatial
//! logarithmic strain, and Fourier heat conduction.

use otm_algebra::{Hom, Real, Vector};
use otm_traits::{Conduction, EngineError, MaterialState, Result, Solid};

/// Compressible neo-Hookean solid:
/// `W = mu/2 (I1 - D) - mu ln J + lambda/2 (ln J)^2`.
#[derive(Clone, Copy, Debug)]
pub struct NeoHookean {
    pub mu: Real,
    pub lambda: Real,
}

impl NeoHookean {
    pub fn new(mu: Real, lambda: Real) -> Self {
        NeoHookean { mu, lambda }
    }

    pub fn from_youngs(e: Real, nu: Real) -> Self {
        NeoHookean {
            mu: e / (2.0 * (1.0 + nu)),
            lambda: e * nu / ((1.0 + nu) * (1.0 - 2.0 * nu)),
        }
    }

    fn log_j<const D: usize>(f: &Hom<D, D>) -> Result<Real> {
        let j = f.det();
        if !(j > 0.0) || !j.is_finite() {
            return Err(EngineError::ContractViolation {
                time: 0.0,
                mp: None,
                what: "non-positive Jacobian in constitutive call",
                value: j,
            });
        }
        Ok(j.ln())
    }
}

impl<const D: usize> Solid<D> for NeoHookean {
    fn energy(&self, f: &Hom<D, D>, _state: &MaterialState) -> Result<Real> {
        let lnj = Self::log_j(f)?;
        let i1 = f.transpose().compose(f).trace();
        Ok(0.5 * self.mu * (i1 - D as Real) - self.mu * lnj + 0.5 * self.lambda * lnj * lnj)
    }

    fn stress(&self, f: &Hom<D, D>, _state: &MaterialState) -> Result<Hom<D, D>> {
        let lnj = Self::log_j(f)?;
        let f_inv_t = f
            .inverse()
            .ok_or(EngineError::ContractViolation {
                time: 0.0,
                mp: None,
                what: "singular deformation gradient",
                value: f.det(),
            })?
            .transpose();
        Ok(*f * self.mu + f_inv_t * (self.lambda * lnj - self.mu))
    }

    fn wave_speed(&self, density: Real) -> Real {
        ((self.lambda + 2.0 * self.mu) / density).sqrt()
    }
}

/// J2 plasticity with linear isotropic hardening, radial return on the
/// Kirchhoff stress built from the spatial logarithmic (Hencky) strain.
///
/// State layout: `[alpha, ep_00, ep_01, ..., ep_(D-1)(D-1)]` — the
/// equivalent plastic strain followed by the plastic-strain tensor in
/// row-major order.
#[derive(Clone, Copy, Debug)]
pub struct J2Plasticity {
    pub mu: Real,
    pub kappa: Real,
    pub yield_stress: Real,
    pub hardening: Real,
}

struct ReturnMap<const D: usize> {
    tau: Hom<D, D>,
    dgamma: Real,
    normal: Hom<D, D>,
    elastic_dev: Hom<D, D>,
    log_j: Real,
}

impl J2Plasticity {
    pub fn new(mu: Real, kappa: Real, yield_stress: Real, hardening: Real) -> Self {
        J2Plasticity {
            mu,
            kappa,
            yield_stress,
            hardening,
        }
    }

    fn unpack<const D: usize>(state: &MaterialState) -> (Real, Hom<D, D>) {
        let alpha = state.vars.first().copied().unwrap_or(0.0);
        let mut ep = Hom::zero();
        for i in 0..D {
            for j in 0..D {
                ep[(i, j)] = state.vars.get(1 + i * D + j).copied().unwrap_or(0.0);
            }
        }
        (alpha, ep)
    }

    fn pack<const D: usize>(state: &mut MaterialState, alpha: Real, ep: &Hom<D, D>) {
        state.vars.resize(1 + D * D, 0.0);
        state.vars[0] = alpha;
        for i in 0..D {
            for j in 0..D {
                state.vars[1 + i * D + j] = ep[(i, j)];
            }
        }
    }

    /// Trial state and radial return, without committing.
    fn return_map<const D: usize>(
        &self,
        f: &Hom<D, D>,
        state: &MaterialState,
    ) -> Result<ReturnMap<D>> {
        let b = f.compose(&f.transpose());
        let eps = b
            .sym_log()
            .ok_or(EngineError::ContractViolation {
                time: 0.0,
                mp: None,
                what: "non-SPD left Cauchy-Green tensor",
                value: b.det(),
            })?
            .scale(0.5);
        let (alpha, ep) = Self::unpack::<D>(state);
        let trial_dev = (eps - ep).deviator() * (2.0 * self.mu);
        let norm = trial_dev.norm();
        let flow = (2.0 / 3.0 as Real).sqrt() * (self.yield_stress + self.hardening * alpha);
        let fy = norm - flow;

        let log_j = eps.trace();
        let vol = Hom::identity() * (self.kappa * log_j);
        if fy <= 0.0 || norm == 0.0 {
            return Ok(ReturnMap {
                tau: vol + trial_dev,
                dgamma: 0.0,
                normal: Hom::zero(),
                elastic_dev: (eps - ep).deviator(),
                log_j,
            });
        }
        let dgamma = fy / (2.0 * self.mu + (2.0 / 3.0) * self.hardening);
        let normal = trial_dev.scale(1.0 / norm);
        let tau_dev = trial_dev - normal.scale(2.0 * self.mu * dgamma);
        Ok(ReturnMap {
            tau: vol + tau_dev,
            dgamma,
            normal,
            elastic_dev: (eps - ep).deviator() - normal.scale(dgamma),
            log_j,
        })
    }
}

impl<const D: usize> Solid<D> for J2Plasticity {
    fn energy(&self, f: &Hom<D, D>, state: &MaterialState) -> Result<Real> {
        let rm = self.return_map::<D>(f, state)?;
        let dev = rm.elastic_dev.norm();
        Ok(0.5 * self.kappa * rm.log_j * rm.log_j + self.mu * dev * dev)
    }

    fn stress(&self, f: &Hom<D, D>, state: &MaterialState) -> Result<Hom<D, D>> {
        let rm = self.return_map::<D>(f, state)?;
        // P = tau F^{-T}
        let f_inv_t = f
            .inverse()
            .ok_or(EngineError::ContractViolation {
                time: 0.0,
                mp: None,
                what: "singular deformation gradient",
                value: f.det(),
            })?
            .transpose();
        Ok(rm.tau.compose(&f_inv_t))
    }

    fn advance(&self, f: &Hom<D, D>, state: &mut MaterialState) -> Result<()> {
        let rm = self.return_map::<D>(f, state)?;
        if rm.dgamma > 0.0 {
            let (alpha, ep) = Self::unpack::<D>(state);
            let new_alpha = alpha + (2.0 / 3.0 as Real).sqrt() * rm.dgamma;
            let new_ep = ep + rm.normal.scale(rm.dgamma);
            let dissipated = state.vars.get(1 + D * D).copied().unwrap_or(0.0)
                + rm.dgamma * (2.0 / 3.0 as Real).sqrt() * self.yield_stress;
            Self::pack::<D>(state, new_alpha, &new_ep);
            state.vars.push(dissipated);
        } else if state.vars.len() < 2 + D * D {
            let (alpha, ep) = Self::unpack::<D>(state);
            let dissipated = state.vars.get(1 + D * D).copied().unwrap_or(0.0);
            Self::pack::<D>(state, alpha, &ep);
            state.vars.push(dissipated);
        }
        Ok(())
    }

    fn wave_speed(&self, density: Real) -> Real {
        ((self.kappa + 4.0 * self.mu / 3.0) / density).sqrt()
    }

    fn state_len(&self) -> usize {
        2 + D * D
    }

    fn dissipation(&self, state: &MaterialState) -> Real {
        state.vars.get(1 + D * D).copied().unwrap_or(0.0)
    }
}

/// Fourier conduction with constant conductivity and volumetric heat
/// capacity.
#[derive(Clone, Copy, Debug)]
pub struct FourierConduction {
    pub conductivity: Real,
    pub rho_c: Real,
}

impl FourierConduction {
    pub fn new(conductivity: Real, rho_c: Real) -> Self {
        FourierConduction {
            conductivity,
            rho_c,
        }
    }

    pub fn diffusivity(&self) -> Real {
        self.conductivity / self.rho_c
    }
}

impl<const D: usize> Conduction<D> for FourierConduction {
    fn flux(&self, grad_t: &Vector<D>, _t: Real) -> Vector<D> {
        grad_t.scale(-self.conductivity)
    }

    fn dflux_dgrad(&self, _t: Real) -> Hom<D, D> {
        Hom::identity() * (-self.conductivity)
    }

    fn capacity(&self, _t: Real) -> Real {
        self.rho_c
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn neo_hookean_stress_free_at_identity() {
        let m = NeoHookean::from_youngs(210e9, 0.3);
        let f = Hom::<3, 3>::identity();
        let s = MaterialState::default();
        let p = Solid::<3>::stress(&m, &f, &s).unwrap();
        assert!(p.norm() <= 1e-6 * m.mu);
        assert_approx_eq!(f64, Solid::<3>::energy(&m, &f, &s).unwrap(), 0.0);
    }

    #[test]
    fn neo_hookean_stress_matches_energy_gradient() {
        let m = NeoHookean::from_youngs(1e6, 0.3);
        let s = MaterialState::default();
        let f = Hom::<2, 2>::from_fn(|i, j| [[1.05, 0.02], [-0.01, 0.97]][i][j]);
        let p = Solid::<2>::stress(&m, &f, &s).unwrap();
        let delta = 1e-7;
        for i in 0..2 {
            for j in 0..2 {
                let mut fp = f;
                fp[(i, j)] += delta;
                let mut fm = f;
                fm[(i, j)] -= delta;
                let fd = (Solid::<2>::energy(&m, &fp, &s).unwrap()
                    - Solid::<2>::energy(&m, &fm, &s).unwrap())
                    / (2.0 * delta);
                assert!(
                    (p[(i, j)] - fd).abs() <= 1e-3 * p.norm().max(1.0),
                    "P[{i}{j}] {} vs fd {}",
                    p[(i, j)],
                    fd
                );
            }
        }
    }

    #[test]
    fn j2_elastic_below_yield() {
        let m = J2Plasticity::new(80e9, 170e9, 400e6, 1e9);
        let mut s = MaterialState::with_len(Solid::<3>::state_len(&m));
        // 0.1% shear strain: well below yield.
        let f = Hom::<3, 3>::from_fn(|i, j| {
            let id = if i == j { 1.0 } else { 0.0 };
            id + if (i, j) == (0, 1) { 1e-3 } else { 0.0 }
        });
        m.advance(&f, &mut s).unwrap();
        assert_approx_eq!(f64, s.vars[0], 0.0);
        assert_approx_eq!(f64, Solid::<3>::dissipation(&m, &s), 0.0);
    }

    #[test]
    fn j2_yields_under_large_shear() {
        let m = J2Plasticity::new(80e9, 170e9, 400e6, 1e9);
        let mut s = MaterialState::with_len(Solid::<3>::state_len(&m));
        let f = Hom::<3, 3>::from_fn(|i, j| {
            let id = if i == j { 1.0 } else { 0.0 };
            id + if (i, j) == (0, 1) { 0.05 } else { 0.0 }
        });
        let p = Solid::<3>::stress(&m, &f, &s).unwrap();
        assert!(p.is_finite());
        m.advance(&f, &mut s).unwrap();
        assert!(s.vars[0] > 0.0, "expected plastic flow, alpha = {}", s.vars[0]);
        assert!(Solid::<3>::dissipation(&m, &s) > 0.0);

        // the von Mises stress sits on the (hardened) yield surface
        let s2 = m.return_map::<3>(&f, &s).unwrap();
        let dev_norm = s2.tau.deviator().norm();
        let flow = (2.0 / 3.0f64).sqrt() * (m.yield_stress + m.hardening * s.vars[0]);
        assert!(dev_norm <= flow * 1.0001);
    }

    #[test]
    fn fourier_flux_opposes_gradient() {
        let c = FourierConduction::new(2.0, 1.0);
        let g = Vector([1.0, -2.0, 0.5]);
        let q = Conduction::<3>::flux(&c, &g, 300.0);
        assert_approx_eq!(f64, q[0], -2.0);
        assert_approx_eq!(f64, q[1], 4.0);
        assert_approx_eq!(f64, q[2], -1.0);
    }
}
