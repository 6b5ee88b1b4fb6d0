//! Material-point local state.
//!
//! Each material point carries its kinematic and thermal state plus a
//! dynamically maintained node support with per-node LME weight and
//! gradient. The deformation gradient is updated incrementally against
//! the configuration at the last support rebuild, so a rebuild always
//! happens at a committed configuration (inside `advance`).

use otm_algebra::{Hom, Real, Vector};
use otm_lme::{LmeKernel, LmeShape};
use otm_traits::{CarrierId, EngineError, MaterialState, MpId, NodeId, Result, Solid};

/// One edge of the support relation: a node with its shape-function
/// weight and gradient at this material point.
#[derive(Clone, Copy, Debug)]
pub struct SupportEntry<const D: usize> {
    pub node: NodeId,
    pub weight: Real,
    pub grad: Vector<D>,
}

/// Per-body material-point parameters shared across every point of the
/// body.
#[derive(Clone, Copy, Debug)]
pub struct MpData {
    /// Dimensionless LME locality (beta = gamma / h^2).
    pub gamma: Real,
    /// Support rebuild when the point drifts farther than this fraction
    /// of its spacing from the configuration the support was built at.
    pub drift_factor: Real,
    /// Rebuild every step regardless of drift.
    pub always_update: bool,
    /// Incremental F recomputation (relative to the last rebuild) vs a
    /// total reset from the reference configuration.
    pub incremental: bool,
}

impl Default for MpData {
    fn default() -> Self {
        MpData {
            gamma: 1.8,
            drift_factor: 0.4,
            always_update: false,
            incremental: true,
        }
    }
}

/// Kinematic, thermal, and constitutive state of one material point.
#[derive(Clone, Debug)]
pub struct MpLocalState<const D: usize> {
    pub id: MpId,
    pub carrier: CarrierId,
    /// Body index into the model's material/element-data tables.
    pub body: usize,
    pub active: bool,

    /// Current spatial position.
    pub position: Vector<D>,
    /// Position at the last committed step.
    pub position_committed: Vector<D>,
    /// Position at the last support rebuild.
    pub position_rebuilt: Vector<D>,
    /// Reference position (for displacement queries).
    pub position_ref: Vector<D>,

    pub f: Hom<D, D>,
    pub f_old: Hom<D, D>,
    /// Incremental gradient relative to the rebuild configuration.
    pub delta_f: Hom<D, D>,

    pub volume_ref: Real,
    pub volume: Real,
    pub mass: Real,
    /// Local spacing (element size from the seeding cell).
    pub h: Real,

    pub temperature: Real,
    pub reaction: Real,

    pub support: Vec<SupportEntry<D>>,
    /// LME multiplier warm start; migrated with the point.
    pub lambda: Vector<D>,

    pub state: MaterialState,

    /// Free energy from the latest Energy<0> evaluation.
    pub free_energy: Real,
    /// Cumulative dissipation reported by the constitutive kernel, and
    /// its value at the previous commit (their difference over dt is
    /// the heat source under thermo-mechanical coupling).
    pub dissipated: Real,
    pub dissipated_prev: Real,
    /// Cauchy stress cached by the latest force assembly.
    pub cauchy: Hom<D, D>,
    /// Artificial-viscosity stress and strain rate from the latest
    /// assembly, for output queries.
    pub av_stress: Hom<D, D>,
    pub av_strain_rate: Hom<D, D>,

    /// Cost estimate (support size from prior steps) seeding the
    /// scheduler and the load balancer.
    pub cost: u32,
}

impl<const D: usize> MpLocalState<D> {
    pub fn new(
        id: MpId,
        carrier: CarrierId,
        body: usize,
        position: Vector<D>,
        volume: Real,
        mass: Real,
        h: Real,
        state: MaterialState,
    ) -> Self {
        MpLocalState {
            id,
            carrier,
            body,
            active: true,
            position,
            position_committed: position,
            position_rebuilt: position,
            position_ref: position,
            f: Hom::identity(),
            f_old: Hom::identity(),
            delta_f: Hom::identity(),
            volume_ref: volume,
            volume,
            mass,
            h,
            temperature: 0.0,
            reaction: 0.0,
            support: Vec::new(),
            lambda: Vector::zero(),
            state,
            free_energy: 0.0,
            dissipated: 0.0,
            dissipated_prev: 0.0,
            cauchy: Hom::zero(),
            av_stress: Hom::zero(),
            av_strain_rate: Hom::zero(),
            cost: 1,
        }
    }

    pub fn density(&self) -> Real {
        self.mass / self.volume
    }

    pub fn jacobian(&self) -> Real {
        self.f.det()
    }

    /// Recompute the incremental deformation from the gathered current
    /// positions of the support nodes (aligned with `support` order),
    /// update `f`, the spatial position, and the current volume.
    pub fn reset(&mut self, time: Real, xs: &[Vector<D>]) -> Result<()> {
        debug_assert_eq!(xs.len(), self.support.len());
        if !self.active {
            return Ok(());
        }
        if self.support.len() < 2 {
            // Single-node support: the point rides its node rigidly.
            if let Some(x) = xs.first() {
                self.position = *x;
            }
            self.delta_f = Hom::identity();
            self.f = self.f_old;
            return Ok(());
        }

        let mut df = Hom::zero();
        let mut pos = Vector::zero();
        for (entry, x) in self.support.iter().zip(xs) {
            df += Hom::outer(x, &entry.grad);
            pos += x.scale(entry.weight);
        }
        let jdf = df.det();
        if !(jdf > 0.0) || !jdf.is_finite() {
            return Err(EngineError::ContractViolation {
                time,
                mp: Some(self.id),
                what: "non-positive incremental Jacobian",
                value: jdf,
            });
        }
        self.delta_f = df;
        self.f = if self.support.len() > D {
            df.compose(&self.f_old)
        } else {
            // Under-determined support cannot carry a full gradient;
            // freeze F until the neighborhood recovers.
            self.f_old
        };
        self.position = pos;
        self.volume = self.volume_ref * self.f.det();
        Ok(())
    }

    /// Commit the step: constitutive internal variables advanced,
    /// position committed. With `commit_f` (incremental mode, the
    /// default) the deformation base also moves up, `F_old <- F`;
    /// without it F stays relative to the last re-query, which rebases
    /// instead (see [`mark_requeried`](Self::mark_requeried)).
    pub fn advance(&mut self, solid: &dyn Solid<D>, commit_f: bool) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        solid.advance(&self.f, &mut self.state)?;
        self.dissipated_prev = self.dissipated;
        self.dissipated = solid.dissipation(&self.state);
        if commit_f {
            self.f_old = self.f;
        }
        self.position_committed = self.position;
        self.cost = self.support.len().max(1) as u32;
        Ok(())
    }

    /// Whether the point has drifted far enough from its rebuild
    /// configuration to need a new support.
    pub fn needs_rebuild(&self, data: &MpData) -> bool {
        data.always_update
            || (self.position - self.position_rebuilt).norm() > data.drift_factor * self.h
    }

    /// Rebuild the support from a candidate node list (already range-
    /// queried and admission-filtered by the caller, sorted by id):
    /// an LME solve warm-started from the stored multiplier. Must be
    /// called at a committed configuration.
    ///
    /// On LME failure the caller owns the retry policy (grow the range,
    /// soften beta, or deactivate the point).
    pub fn rebuild_from_candidates(
        &mut self,
        kernel: &LmeKernel,
        candidates: &[(NodeId, Vector<D>)],
        gamma: Real,
    ) -> Result<()> {
        let beta = otm_lme::beta_from_spacing(gamma, self.h);
        let shape = kernel.evaluate(
            Some(self.id),
            &self.position,
            candidates,
            beta,
            self.h,
            &self.lambda,
            false,
        )?;
        self.apply_shape(&shape);
        Ok(())
    }

    /// Install a converged shape into the support relation. Does not
    /// touch the drift origin: weights and gradients refresh every
    /// commit, while `position_rebuilt` tracks the last node-list
    /// re-query (see [`mark_requeried`](Self::mark_requeried)).
    pub fn apply_shape(&mut self, shape: &LmeShape<D>) {
        self.support.clear();
        self.support
            .extend(shape.nodes.iter().zip(&shape.weights).zip(&shape.gradients).map(
                |((node, weight), grad)| SupportEntry {
                    node: *node,
                    weight: *weight,
                    grad: *grad,
                },
            ));
        self.lambda = shape.lambda;
    }

    /// Record that the support node list was re-queried at the current
    /// position: the drift measure resets and the deformation base
    /// moves to the current gradient.
    pub fn mark_requeried(&mut self) {
        self.position_rebuilt = self.position;
        self.f_old = self.f;
    }

    /// Internal nodal forces (energy gradient) from the current state:
    /// `f_a = V_ref · P(F) · (F_oldᵀ ∇p_a)`, the exact gradient of the
    /// stored energy w.r.t. the gathered positions. Also caches the
    /// Cauchy stress and free energy for queries and the fracture scan.
    pub fn internal_forces(
        &mut self,
        solid: &dyn Solid<D>,
        out: &mut [Vector<D>],
    ) -> Result<()> {
        debug_assert_eq!(out.len(), self.support.len());
        if !self.active {
            return Ok(());
        }
        let p = solid.stress(&self.f, &self.state)?;
        self.free_energy = self.volume_ref * solid.energy(&self.f, &self.state)?;
        let j = self.f.det();
        self.cauchy = p.compose(&self.f.transpose()).scale(1.0 / j);

        if self.support.len() <= D {
            return Ok(());
        }
        let f_old_t = self.f_old.transpose();
        for (slot, entry) in self.support.iter().enumerate() {
            let pull = f_old_t.apply(&entry.grad);
            out[slot] += p.apply(&pull).scale(self.volume_ref);
        }
        Ok(())
    }

    /// Spatial shape-function gradients at the current configuration,
    /// `∇̃p_a = ΔF⁻ᵀ ∇p_a`, for velocity-gradient recovery and thermal
    /// assembly. Fails when the incremental map is singular.
    pub fn spatial_gradients(&self, out: &mut Vec<Vector<D>>) -> Result<()> {
        out.clear();
        let inv = self
            .delta_f
            .inverse()
            .ok_or(EngineError::ContractViolation {
                time: 0.0,
                mp: Some(self.id),
                what: "singular incremental map",
                value: self.delta_f.det(),
            })?;
        let inv_t = inv.transpose();
        out.extend(self.support.iter().map(|e| inv_t.apply(&e.grad)));
        Ok(())
    }

    /// Velocity gradient `L = Σ_a v_a ⊗ ∇̃p_a` recovered from gathered
    /// nodal velocities.
    pub fn velocity_gradient(
        &self,
        vs: &[Vector<D>],
        spatial_grads: &[Vector<D>],
    ) -> Hom<D, D> {
        let mut l = Hom::zero();
        for (v, g) in vs.iter().zip(spatial_grads) {
            l += Hom::outer(v, g);
        }
        l
    }

    /// Maximum principal stretch, for the erosion stretch criterion.
    pub fn max_principal_stretch(&self) -> Real {
        let c = self.f.transpose().compose(&self.f);
        let ev = c.sym_eigenvalues();
        ev[0].max(0.0).sqrt()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::constitutive::NeoHookean;
    use float_cmp::assert_approx_eq;
    use otm_lme::{LmeKernel, LmeParams};

    fn square_support(h: Real) -> (MpLocalState<2>, Vec<Vector<2>>) {
        // 3x3 node patch around the point.
        let nodes: Vec<(NodeId, Vector<2>)> = (0..3)
            .flat_map(|i| {
                (0..3).map(move |j| {
                    (
                        NodeId((i * 3 + j) as u64),
                        Vector([i as Real * h, j as Real * h]),
                    )
                })
            })
            .collect();
        let mut mp = MpLocalState::<2>::new(
            MpId(0),
            CarrierId(0),
            0,
            Vector([h, h]),
            h * h,
            h * h * 1000.0,
            h,
            MaterialState::default(),
        );
        let kernel = LmeKernel::new(LmeParams::default());
        let shape = kernel
            .evaluate(
                Some(mp.id),
                &mp.position,
                &nodes,
                otm_lme::beta_from_spacing(1.8, h),
                h,
                &Vector::zero(),
                false,
            )
            .unwrap();
        mp.apply_shape(&shape);
        let xs = nodes
            .iter()
            .filter(|(id, _)| mp.support.iter().any(|e| e.node == *id))
            .map(|(_, x)| *x)
            .collect();
        (mp, xs)
    }

    #[test]
    fn identity_motion_keeps_f_identity() {
        let (mut mp, xs) = square_support(0.1);
        mp.reset(0.0, &xs).unwrap();
        for i in 0..2 {
            for j in 0..2 {
                let want = if i == j { 1.0 } else { 0.0 };
                assert_approx_eq!(f64, mp.f[(i, j)], want, epsilon = 1e-7);
            }
        }
        assert_approx_eq!(f64, mp.volume, mp.volume_ref, epsilon = 1e-7 * mp.volume_ref);
    }

    #[test]
    fn uniform_stretch_is_recovered() {
        let (mut mp, xs) = square_support(0.1);
        let stretched: Vec<Vector<2>> = xs
            .iter()
            .map(|x| Vector([x[0] * 1.05, x[1] * 0.98]))
            .collect();
        mp.reset(0.0, &stretched).unwrap();
        assert_approx_eq!(f64, mp.f[(0, 0)], 1.05, epsilon = 1e-6);
        assert_approx_eq!(f64, mp.f[(1, 1)], 0.98, epsilon = 1e-6);
        assert_approx_eq!(f64, mp.f[(0, 1)], 0.0, epsilon = 1e-6);
        assert!(mp.jacobian() > 0.0);
    }

    #[test]
    fn inverted_motion_is_a_contract_violation() {
        let (mut mp, xs) = square_support(0.1);
        let flipped: Vec<Vector<2>> = xs.iter().map(|x| Vector([-x[0], x[1]])).collect();
        let err = mp.reset(0.0, &flipped).unwrap_err();
        assert!(matches!(err, EngineError::ContractViolation { .. }));
    }

    #[test]
    fn internal_forces_self_equilibrate() {
        let (mut mp, xs) = square_support(0.1);
        let stretched: Vec<Vector<2>> = xs
            .iter()
            .map(|x| Vector([x[0] * 1.02, x[1] * 1.01]))
            .collect();
        mp.reset(0.0, &stretched).unwrap();
        let solid = NeoHookean::from_youngs(210e9, 0.3);
        let mut out = vec![Vector::zero(); mp.support.len()];
        mp.internal_forces(&solid, &mut out).unwrap();
        let total: Vector<2> = out.iter().fold(Vector::zero(), |acc, f| acc + *f);
        let scale: Real = out.iter().map(|f| f.norm()).sum();
        assert!(total.norm() <= 1e-10 * scale.max(1.0));
        assert!(mp.free_energy > 0.0);
    }

    #[test]
    fn forces_match_energy_gradient() {
        let (mut mp, xs) = square_support(0.1);
        let solid = NeoHookean::from_youngs(1e6, 0.25);
        let deformed: Vec<Vector<2>> = xs
            .iter()
            .map(|x| Vector([x[0] * 1.03 + 0.01 * x[1], x[1] * 0.99]))
            .collect();
        mp.reset(0.0, &deformed).unwrap();
        let mut forces = vec![Vector::zero(); mp.support.len()];
        mp.internal_forces(&solid, &mut forces).unwrap();

        let energy_at = |pts: &[Vector<2>], mp: &mut MpLocalState<2>| -> Real {
            mp.reset(0.0, pts).unwrap();
            mp.volume_ref * solid.energy(&mp.f, &mp.state).unwrap()
        };
        let delta = 1e-7;
        for a in 0..deformed.len() {
            for dim in 0..2 {
                let mut plus = deformed.clone();
                plus[a][dim] += delta;
                let mut minus = deformed.clone();
                minus[a][dim] -= delta;
                let fd = (energy_at(&plus, &mut mp) - energy_at(&minus, &mut mp)) / (2.0 * delta);
                let scale = forces[a][dim].abs().max(1.0);
                assert!(
                    (forces[a][dim] - fd).abs() <= 1e-4 * scale,
                    "node {a} dim {dim}: analytic {} vs fd {}",
                    forces[a][dim],
                    fd
                );
            }
        }
    }

    #[test]
    fn drift_triggers_rebuild_flag() {
        let (mut mp, _) = square_support(0.1);
        let data = MpData::default();
        assert!(!mp.needs_rebuild(&data));
        mp.position = mp.position + Vector([0.05, 0.0]);
        assert!(mp.needs_rebuild(&data));
    }

    #[test]
    fn inactive_point_contributes_nothing() {
        let (mut mp, xs) = square_support(0.1);
        mp.active = false;
        mp.reset(0.0, &xs).unwrap();
        let solid = NeoHookean::from_youngs(1e6, 0.3);
        let mut out = vec![Vector::zero(); mp.support.len()];
        mp.internal_forces(&solid, &mut out).unwrap();
        assert!(out.iter().all(|f| f.norm() == 0.0));
    }
}
