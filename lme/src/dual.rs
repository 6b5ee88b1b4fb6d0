//! Newton solve of the LME dual with backtracking line search.

use log::warn;

use otm_algebra::{Hom, Hom3, Lu, Real, Vector};
use otm_traits::{EngineError, MpId, NodeId, Result};

#[derive(Clone, Copy, Debug)]
pub struct LmeParams {
    /// Residual tolerance, relative to the local spacing.
    pub tol: Real,
    /// Newton iteration budget before the point is flagged degenerate.
    pub max_iters: usize,
    /// Sparsity cutoff: weights below `cutoff * max(p)` are dropped and
    /// the remainder renormalized. Zero disables dropping.
    pub cutoff: Real,
    /// Smallest admissible Hessian eigenvalue relative to `h^2`; below
    /// this the support is degenerate.
    pub spd_tol: Real,
}

impl Default for LmeParams {
    fn default() -> Self {
        LmeParams {
            tol: 1e-12,
            max_iters: 60,
            cutoff: 1e-10,
            spd_tol: 1e-10,
        }
    }
}

/// Converged shape-function data at one evaluation point.
#[derive(Clone, Debug)]
pub struct LmeShape<const D: usize> {
    pub nodes: Vec<NodeId>,
    pub weights: Vec<Real>,
    pub gradients: Vec<Vector<D>>,
    /// Second derivatives d2 p_a / dx_i dx_j, present when requested.
    pub hessians: Option<Vec<Hom<D, D>>>,
    /// Multiplier on exit; the warm start for the next evaluation.
    pub lambda: Vector<D>,
    pub iterations: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct LmeKernel {
    pub params: LmeParams,
}

struct DualState<const D: usize> {
    value: Real,
    weights: Vec<Real>,
    residual: Vector<D>,
    hessian: Hom<D, D>,
}

impl LmeKernel {
    pub fn new(params: LmeParams) -> Self {
        LmeKernel { params }
    }

    /// Evaluate weights and gradients at `x` over `candidates`.
    ///
    /// `beta` is the locality parameter (possibly from a spatially
    /// varying field, resolved by the caller), `h` the local spacing
    /// used to scale tolerances, `warm` the multiplier from the last
    /// evaluation of this point.
    pub fn evaluate<const D: usize>(
        &self,
        mp: Option<MpId>,
        x: &Vector<D>,
        candidates: &[(NodeId, Vector<D>)],
        beta: Real,
        h: Real,
        warm: &Vector<D>,
        with_hessians: bool,
    ) -> Result<LmeShape<D>> {
        if candidates.is_empty() {
            return Err(EngineError::SupportDegenerate {
                mp,
                detail: "empty candidate set",
                iterations: 0,
            });
        }
        // A single-node support can only represent rigid translation:
        // unit weight, vanishing gradient.
        if candidates.len() == 1 {
            return Ok(LmeShape {
                nodes: vec![candidates[0].0],
                weights: vec![1.0],
                gradients: vec![Vector::zero()],
                hessians: with_hessians.then(|| vec![Hom::zero()]),
                lambda: Vector::zero(),
                iterations: 0,
            });
        }

        let dx: Vec<Vector<D>> = candidates.iter().map(|(_, xa)| *xa - *x).collect();
        let mut lambda = *warm;
        if !lambda.is_finite() {
            lambda = Vector::zero();
        }
        let mut state = Self::dual_state(&dx, beta, &lambda);
        let tol = self.params.tol * h.max(Real::EPSILON);
        let mut iterations = 0;

        while state.residual.norm() > tol {
            if iterations >= self.params.max_iters {
                warn!(
                    "lme: no convergence for {:?} after {} iterations (|r|={:.3e})",
                    mp,
                    iterations,
                    state.residual.norm()
                );
                return Err(EngineError::SupportDegenerate {
                    mp,
                    detail: "dual did not converge",
                    iterations,
                });
            }
            let Some(lu) = Lu::factor(&state.hessian) else {
                return Err(EngineError::SupportDegenerate {
                    mp,
                    detail: "singular dual Hessian",
                    iterations,
                });
            };
            let step = lu.solve(&(-state.residual));
            let slope = state.residual.dot(&step);

            // Backtracking line search on the dual objective. Near the
            // optimum the Armijo decrease sinks below floating-point
            // resolution, so a plain residual decrease also accepts.
            let mut t = 1.0;
            let mut accepted = false;
            for _ in 0..30 {
                let trial = lambda.axpy(t, &step);
                let trial_state = Self::dual_state(&dx, beta, &trial);
                if trial_state.value.is_finite() {
                    let slack = 16.0 * Real::EPSILON * state.value.abs().max(1.0);
                    let value_ok = trial_state.value <= state.value + 1e-4 * t * slope + slack;
                    let residual_ok = trial_state.residual.norm() < state.residual.norm();
                    if value_ok || residual_ok {
                        lambda = trial;
                        state = trial_state;
                        accepted = true;
                        break;
                    }
                }
                t *= 0.5;
            }
            if !accepted {
                return Err(EngineError::SupportDegenerate {
                    mp,
                    detail: "line search stalled",
                    iterations,
                });
            }
            iterations += 1;
        }

        // Enforce compact support: drop negligible weights, renormalize.
        let mut keep: Vec<usize> = (0..candidates.len()).collect();
        if self.params.cutoff > 0.0 {
            let pmax = state.weights.iter().cloned().fold(0.0, Real::max);
            keep.retain(|&a| state.weights[a] >= self.params.cutoff * pmax);
            let total: Real = keep.iter().map(|&a| state.weights[a]).sum();
            for w in state.weights.iter_mut() {
                *w /= total;
            }
        }

        // Hessian of the kept, renormalized weights; must be SPD.
        let mut hess = Hom::<D, D>::zero();
        for &a in &keep {
            hess += Hom::outer(&dx[a], &dx[a]).scale(state.weights[a]);
        }
        let eigs = hess.sym_eigenvalues();
        if eigs[D - 1] <= self.params.spd_tol * h * h {
            return Err(EngineError::SupportDegenerate {
                mp,
                detail: "support Hessian not positive definite",
                iterations,
            });
        }
        let hinv = hess
            .inverse()
            .ok_or(EngineError::SupportDegenerate {
                mp,
                detail: "support Hessian not invertible",
                iterations,
            })?;

        let nodes: Vec<NodeId> = keep.iter().map(|&a| candidates[a].0).collect();
        let weights: Vec<Real> = keep.iter().map(|&a| state.weights[a]).collect();
        let gradients: Vec<Vector<D>> = keep
            .iter()
            .map(|&a| hinv.apply(&dx[a]).scale(state.weights[a]))
            .collect();

        let hessians = if with_hessians {
            Some(Self::second_derivatives(
                &keep, &dx, &weights, &gradients, &hinv,
            ))
        } else {
            None
        };

        Ok(LmeShape {
            nodes,
            weights,
            gradients,
            hessians,
            lambda,
            iterations,
        })
    }

    /// Dual objective log Σ_a exp(-beta |dx_a|^2 + lambda·dx_a), its
    /// gradient r = Σ p_a dx_a, and Hessian J = Σ p_a dx_a⊗dx_a - r⊗r,
    /// evaluated with the usual max-shift for overflow safety.
    fn dual_state<const D: usize>(dx: &[Vector<D>], beta: Real, lambda: &Vector<D>) -> DualState<D> {
        let f: Vec<Real> = dx
            .iter()
            .map(|d| -beta * d.norm_sq() + lambda.dot(d))
            .collect();
        let fmax = f.iter().cloned().fold(Real::NEG_INFINITY, Real::max);
        let mut weights: Vec<Real> = f.iter().map(|&fa| (fa - fmax).exp()).collect();
        let z: Real = weights.iter().sum();
        for w in weights.iter_mut() {
            *w /= z;
        }
        let mut residual = Vector::zero();
        for (w, d) in weights.iter().zip(dx) {
            residual += d.scale(*w);
        }
        let mut hessian = Hom::zero();
        for (w, d) in weights.iter().zip(dx) {
            hessian += Hom::outer(d, d).scale(*w);
        }
        hessian += Hom::outer(&residual, &residual).scale(-1.0);
        DualState {
            value: z.ln() + fmax,
            weights,
            residual,
            hessian,
        }
    }

    /// d2 p_a / dx^2 from the converged state:
    ///   grad p_a = p_a H^-1 dx_a,
    ///   d(grad p_a)_i/dx_j = q_i g_j + p_a (-(H^-1 K_j q)_i - (H^-1)_ij)
    /// with q = H^-1 dx_a and K_j = dH/dx_j assembled from the kept set.
    fn second_derivatives<const D: usize>(
        keep: &[usize],
        dx: &[Vector<D>],
        weights: &[Real],
        gradients: &[Vector<D>],
        hinv: &Hom<D, D>,
    ) -> Vec<Hom<D, D>> {
        let mut dh = Hom3::<D, D, D>::zero();
        for j in 0..D {
            let slab = dh.slab_mut(j);
            for (k, &a) in keep.iter().enumerate() {
                let d = &dx[a];
                *slab += Hom::outer(d, d).scale(gradients[k][j]);
                let mut ej = Vector::zero();
                ej[j] = 1.0;
                *slab += (Hom::outer(&ej, d) + Hom::outer(d, &ej)).scale(-weights[k]);
            }
        }

        keep.iter()
            .enumerate()
            .map(|(k, &a)| {
                let q = hinv.apply(&dx[a]);
                let g = &gradients[k];
                let p = weights[k];
                Hom::from_fn(|i, j| {
                    let kj_q = dh.slab(j).apply(&q);
                    let corr = hinv.apply(&kj_q);
                    q[i] * g[j] + p * (-corr[i] - hinv[(i, j)])
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use float_cmp::assert_approx_eq;
    use rand::prelude::*;

    fn node_grid_2d(n: usize, h: Real) -> Vec<(NodeId, Vector<2>)> {
        let mut out = Vec::new();
        for i in 0..n {
            for j in 0..n {
                out.push((
                    NodeId((i * n + j) as u64),
                    Vector([i as Real * h, j as Real * h]),
                ));
            }
        }
        out
    }

    fn kernel() -> LmeKernel {
        LmeKernel::new(LmeParams::default())
    }

    #[test]
    fn partition_of_unity() {
        let h = 0.1;
        let nodes = node_grid_2d(6, h);
        let beta = crate::beta_from_spacing(1.8, h);
        let x = Vector([0.23, 0.31]);
        let shape = kernel()
            .evaluate(None, &x, &nodes, beta, h, &Vector::zero(), false)
            .unwrap();
        let sum: Real = shape.weights.iter().sum();
        assert!((sum - 1.0).abs() <= 1e-10);
        assert!(shape.weights.iter().all(|&w| w >= 0.0));
    }

    #[test]
    fn first_moment_consistency() {
        let h = 0.1;
        let nodes = node_grid_2d(6, h);
        let beta = crate::beta_from_spacing(1.8, h);
        let x = Vector([0.27, 0.18]);
        let shape = kernel()
            .evaluate(None, &x, &nodes, beta, h, &Vector::zero(), false)
            .unwrap();
        let mut moment = Vector::<2>::zero();
        for (w, (_, xa)) in shape.weights.iter().zip(
            nodes
                .iter()
                .filter(|(id, _)| shape.nodes.contains(id)),
        ) {
            moment += (*xa - x).scale(*w);
        }
        assert!(moment.norm() <= 1e-8 * h);
    }

    #[test]
    fn gradient_sums_to_zero_and_reproduces_linear_fields() {
        let h = 0.1;
        let nodes = node_grid_2d(6, h);
        let beta = crate::beta_from_spacing(2.0, h);
        let x = Vector([0.22, 0.34]);
        let shape = kernel()
            .evaluate(None, &x, &nodes, beta, h, &Vector::zero(), false)
            .unwrap();
        let kept: Vec<Vector<2>> = nodes
            .iter()
            .filter(|(id, _)| shape.nodes.contains(id))
            .map(|(_, xa)| *xa)
            .collect();

        let mut gsum = Vector::<2>::zero();
        let mut lin = Hom::<2, 2>::zero();
        for (g, xa) in shape.gradients.iter().zip(&kept) {
            gsum += *g;
            lin += Hom::outer(xa, g);
        }
        assert!(gsum.norm() <= 1e-8);
        // Σ x_a ⊗ ∇p_a = I (exact reproduction of linear fields)
        for i in 0..2 {
            for j in 0..2 {
                let want = if i == j { 1.0 } else { 0.0 };
                assert_approx_eq!(f64, lin[(i, j)], want, epsilon = 1e-7);
            }
        }
    }

    #[test]
    fn gradient_matches_central_difference() {
        let h = 0.1;
        let nodes = node_grid_2d(6, h);
        let beta = crate::beta_from_spacing(1.5, h);
        // Disable the cutoff so the support set is identical across the
        // perturbed evaluations.
        let k = LmeKernel::new(LmeParams {
            cutoff: 0.0,
            ..LmeParams::default()
        });
        let x = Vector([0.24, 0.29]);
        let shape = k
            .evaluate(None, &x, &nodes, beta, h, &Vector::zero(), false)
            .unwrap();
        let delta = 1e-6;
        for dim in 0..2 {
            let mut xp = x;
            xp[dim] += delta;
            let mut xm = x;
            xm[dim] -= delta;
            let sp = k
                .evaluate(None, &xp, &nodes, beta, h, &shape.lambda, false)
                .unwrap();
            let sm = k
                .evaluate(None, &xm, &nodes, beta, h, &shape.lambda, false)
                .unwrap();
            for a in 0..shape.weights.len() {
                let fd = (sp.weights[a] - sm.weights[a]) / (2.0 * delta);
                assert!(
                    (shape.gradients[a][dim] - fd).abs() <= 1e-6,
                    "node {a} dim {dim}: analytic {} vs fd {}",
                    shape.gradients[a][dim],
                    fd
                );
            }
        }
    }

    #[test]
    fn second_derivatives_match_gradient_differences() {
        let h = 0.1;
        let nodes = node_grid_2d(6, h);
        let beta = crate::beta_from_spacing(1.5, h);
        let k = LmeKernel::new(LmeParams {
            cutoff: 0.0,
            ..LmeParams::default()
        });
        let x = Vector([0.26, 0.31]);
        let shape = k
            .evaluate(None, &x, &nodes, beta, h, &Vector::zero(), true)
            .unwrap();
        let hessians = shape.hessians.as_ref().unwrap();
        let delta = 1e-6;
        for dim in 0..2 {
            let mut xp = x;
            xp[dim] += delta;
            let mut xm = x;
            xm[dim] -= delta;
            let sp = k
                .evaluate(None, &xp, &nodes, beta, h, &shape.lambda, false)
                .unwrap();
            let sm = k
                .evaluate(None, &xm, &nodes, beta, h, &shape.lambda, false)
                .unwrap();
            for a in 0..shape.weights.len() {
                for i in 0..2 {
                    let fd = (sp.gradients[a][i] - sm.gradients[a][i]) / (2.0 * delta);
                    assert!(
                        (hessians[a][(i, dim)] - fd).abs() <= 5e-4,
                        "node {a} ({i},{dim}): analytic {} vs fd {}",
                        hessians[a][(i, dim)],
                        fd
                    );
                }
            }
        }
    }

    #[test]
    fn warm_start_cuts_iterations() {
        let h = 0.1;
        let nodes = node_grid_2d(8, h);
        let beta = crate::beta_from_spacing(2.0, h);
        let x0 = Vector([0.31, 0.42]);
        let cold = kernel()
            .evaluate(None, &x0, &nodes, beta, h, &Vector::zero(), false)
            .unwrap();
        let x1 = Vector([0.312, 0.421]);
        let warm = kernel()
            .evaluate(None, &x1, &nodes, beta, h, &cold.lambda, false)
            .unwrap();
        let fresh = kernel()
            .evaluate(None, &x1, &nodes, beta, h, &Vector::zero(), false)
            .unwrap();
        assert!(warm.iterations <= fresh.iterations);
    }

    #[test]
    fn colinear_support_is_degenerate_in_2d() {
        let h = 0.1;
        let nodes: Vec<(NodeId, Vector<2>)> = (0..5)
            .map(|i| (NodeId(i as u64), Vector([i as Real * h, 0.0])))
            .collect();
        let beta = crate::beta_from_spacing(1.8, h);
        let err = kernel()
            .evaluate(None, &Vector([0.2, 0.0]), &nodes, beta, h, &Vector::zero(), false)
            .unwrap_err();
        assert!(matches!(err, EngineError::SupportDegenerate { .. }));
    }

    #[test]
    fn random_points_stay_partition_of_unity() {
        let h = 0.05;
        let nodes = node_grid_2d(10, h);
        let beta = crate::beta_from_spacing(1.2, h);
        let mut rng = StdRng::seed_from_u64(17);
        for _ in 0..40 {
            let x = Vector([rng.gen_range(0.1..0.35), rng.gen_range(0.1..0.35)]);
            let shape = kernel()
                .evaluate(None, &x, &nodes, beta, h, &Vector::zero(), false)
                .unwrap();
            let sum: Real = shape.weights.iter().sum();
            assert!((sum - 1.0).abs() <= 1e-10);
            let mut moment = Vector::<2>::zero();
            let kept: Vec<Vector<2>> = nodes
                .iter()
                .filter(|(id, _)| shape.nodes.contains(id))
                .map(|(_, xa)| *xa)
                .collect();
            for (w, xa) in shape.weights.iter().zip(&kept) {
                moment += (*xa - x).scale(*w);
            }
            assert!(moment.norm() <= 1e-8 * h);
        }
    }
}
