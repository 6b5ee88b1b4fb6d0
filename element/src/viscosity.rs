//! Artificial-viscosity shadow element.
//!
//! Mirrors each regular material point and contributes a dissipative
//! stress built from the recovered velocity gradient. The bulk branch
//! follows the classic linear-plus-quadratic shock viscosity; the
//! deviatoric branch exists but must be opted into via
//! [`ViscosityMode::Full`] — the default wiring is bulk-only.

use otm_algebra::{Hom, Real};

/// Coefficient block, bulk pair `(b_i, b_s)` and shear pair
/// `(c_i, c_s)`, plus a Newtonian floor viscosity `eta`.
#[derive(Clone, Copy, Debug)]
pub struct ViscosityData {
    /// Linear bulk coefficient (on h·c·tr D).
    pub b_i: Real,
    /// Quadratic bulk coefficient (on h²·min(tr D, 0)²).
    pub b_s: Real,
    /// Linear deviatoric coefficient.
    pub c_i: Real,
    /// Quadratic deviatoric coefficient.
    pub c_s: Real,
    /// Newtonian floor viscosity.
    pub eta: Real,
}

impl ViscosityData {
    pub fn bulk(b_i: Real, b_s: Real) -> Self {
        ViscosityData {
            b_i,
            b_s,
            c_i: 0.0,
            c_s: 0.0,
            eta: 0.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ViscosityMode {
    /// No contribution.
    Disabled,
    /// Volumetric branch only (the default element wiring).
    #[default]
    Bulk,
    /// Volumetric plus deviatoric branch.
    Full,
}

/// Stateless viscosity kernel shared by every point of a body.
#[derive(Clone, Copy, Debug)]
pub struct ArtificialViscosity {
    pub data: ViscosityData,
    pub mode: ViscosityMode,
}

impl ArtificialViscosity {
    pub fn new(data: ViscosityData, mode: ViscosityMode) -> Self {
        ArtificialViscosity { data, mode }
    }

    /// Viscous Cauchy stress from the symmetric velocity gradient.
    ///
    /// `density` and `sound_speed` are current point values; `h` is the
    /// local spacing. Returns zero when disabled; the bulk branch
    /// vanishes identically in pure shear (tr D = 0).
    pub fn stress<const D: usize>(
        &self,
        l: &Hom<D, D>,
        density: Real,
        sound_speed: Real,
        h: Real,
    ) -> Hom<D, D> {
        if self.mode == ViscosityMode::Disabled {
            return Hom::zero();
        }
        let d = l.symmetrize();
        let div = d.trace();
        let compress = div.min(0.0);
        let q = density * (self.data.b_i * h * sound_speed * div
            - self.data.b_s * h * h * compress * compress);
        let mut sigma = Hom::identity() * q;

        if self.mode == ViscosityMode::Full {
            let dev = d.deviator();
            let rate = dev.norm();
            let shear = density
                * (self.data.c_i * h * sound_speed + self.data.c_s * h * h * rate)
                + self.data.eta;
            sigma += dev * shear;
        }
        sigma
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pure_shear_has_no_bulk_contribution() {
        let av = ArtificialViscosity::new(ViscosityData::bulk(0.5, 1.5), ViscosityMode::Bulk);
        // traceless velocity gradient: simple shear
        let l = Hom::<2, 2>::from_fn(|i, j| if (i, j) == (0, 1) { 10.0 } else { 0.0 });
        let s = av.stress(&l, 1000.0, 5000.0, 0.01);
        assert!(s.norm() == 0.0);
    }

    #[test]
    fn compression_is_damped() {
        let av = ArtificialViscosity::new(ViscosityData::bulk(0.5, 1.5), ViscosityMode::Bulk);
        let l = Hom::<2, 2>::identity() * (-100.0);
        let s = av.stress(&l, 1000.0, 5000.0, 0.01);
        // compressive (negative) viscous pressure
        assert!(s[(0, 0)] < 0.0);
        assert!(s[(0, 1)] == 0.0);
    }

    #[test]
    fn full_mode_sees_shear() {
        let data = ViscosityData {
            c_i: 0.05,
            c_s: 0.1,
            ..ViscosityData::bulk(0.5, 1.5)
        };
        let av = ArtificialViscosity::new(data, ViscosityMode::Full);
        let l = Hom::<2, 2>::from_fn(|i, j| if (i, j) == (0, 1) { 10.0 } else { 0.0 });
        let s = av.stress(&l, 1000.0, 5000.0, 0.01);
        assert!(s.norm() > 0.0);
    }

    #[test]
    fn disabled_contributes_zero() {
        let av = ArtificialViscosity::new(ViscosityData::bulk(0.5, 1.5), ViscosityMode::Disabled);
        let l = Hom::<2, 2>::identity() * (-100.0);
        assert!(av.stress(&l, 1000.0, 5000.0, 0.01).norm() == 0.0);
    }
}
