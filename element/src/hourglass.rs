//! Hourglass control for the reduced quadrature.
//!
//! Zero-energy modes are nodal velocity fields invisible to the single
//! velocity-gradient sample: the non-affine residual of each node's
//! velocity. When the residual norm exceeds a threshold the mode is
//! penalized with a user-supplied modulus.

use otm_algebra::{Hom, Real, Vector};

use crate::material_point::SupportEntry;

#[derive(Clone, Copy, Debug)]
pub struct HourglassControl {
    pub modulus: Real,
    /// Relative residual threshold below which no penalty is applied.
    pub threshold: Real,
}

impl HourglassControl {
    pub fn new(modulus: Real) -> Self {
        HourglassControl {
            modulus,
            threshold: 1e-8,
        }
    }

    /// Add viscous penalty forces against the non-affine part of the
    /// nodal velocities: `r_a = v_a - v̄ - L (x_a - x̄)` projected out
    /// of the affine space the gradients span.
    pub fn add_forces<const D: usize>(
        &self,
        support: &[SupportEntry<D>],
        xs: &[Vector<D>],
        vs: &[Vector<D>],
        l: &Hom<D, D>,
        volume: Real,
        h: Real,
        out: &mut [Vector<D>],
    ) {
        if self.modulus <= 0.0 || support.len() <= D + 1 {
            return;
        }
        let mut vbar = Vector::zero();
        let mut xbar = Vector::zero();
        for (entry, (x, v)) in support.iter().zip(xs.iter().zip(vs)) {
            vbar += v.scale(entry.weight);
            xbar += x.scale(entry.weight);
        }
        let mut norm_sq = 0.0;
        let mut speed_sq = 0.0;
        let mut residuals = Vec::with_capacity(support.len());
        for (x, v) in xs.iter().zip(vs) {
            let affine = vbar + l.apply(&(*x - xbar));
            let r = *v - affine;
            norm_sq += r.norm_sq();
            speed_sq += v.norm_sq();
            residuals.push(r);
        }
        if norm_sq <= self.threshold * self.threshold * speed_sq.max(1e-30) {
            return;
        }
        let k = self.modulus * volume / (h * h);
        for ((entry, r), f) in support.iter().zip(&residuals).zip(out.iter_mut()) {
            *f += r.scale(k * entry.weight);
        }
    }
}
