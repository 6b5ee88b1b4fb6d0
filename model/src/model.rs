//! Driver-facing model: staged step pipeline and state queries.
//!
//! The step is a fork-join pipeline with explicit barriers between
//! stages: predictor → local-state reset + force assembly → (thermal
//! solve) → corrector → advance/support update → erosion. Material
//! points fan out across the injected worker pool; nodal force
//! accumulation merges per-point contribution lists either in fixed
//! order (deterministic mode) or by parallel reduction.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use rayon::prelude::*;

use otm_algebra::{Hom, Real, Vector};
use otm_element::{MpLocalState, Traction, TwoBodyContact};
use otm_lme::LmeKernel;
use otm_search::CellBucketSearch;
use otm_traits::element::{ContribCtx, NodalContributor};
use otm_traits::{
    EngineError, FieldTag, LinearSystem, MpId, NeighborSearch, NodeId, Rank, ReleaseRateMode,
    Result, StepStatus, Threading,
};
use otm_solver::{CentralDifference, Clock, DofState, KeyedSystem, ThermalSolve};

use crate::arena::NodeArena;
use crate::builder::BodyData;
use crate::erosion::ErosionParams;
use crate::local_state::{embed_positions, embed_velocities, submerge_forces};

/// Scalar/vector/tensor views of per-point data.
pub enum QpField<const D: usize> {
    Scalar(Vec<(MpId, Real)>),
    Vector(Vec<(MpId, Vector<D>)>),
    Tensor(Vec<(MpId, Hom<D, D>)>),
}

/// Nodal data views.
pub enum NodeField<const D: usize> {
    Scalar(Vec<(NodeId, Real)>),
    Vector(Vec<(NodeId, Vector<D>)>),
}

pub struct Model<const D: usize> {
    pub(crate) clock: Clock,
    pub(crate) search_range: Real,
    pub(crate) multi_body: bool,
    pub(crate) adaptive_search: bool,
    pub(crate) threading: Threading,
    pub(crate) pool: Arc<rayon::ThreadPool>,
    pub(crate) lme: LmeKernel,
    pub(crate) propagator: CentralDifference,
    pub(crate) thermal: ThermalSolve,
    pub(crate) critical_mass_factor: Real,
    pub(crate) erosion: Option<ErosionParams<D>>,
    pub(crate) rank: Rank,

    pub(crate) arena: NodeArena<D>,
    pub(crate) dofs: DofState<D>,
    pub(crate) position_ref: Vec<Vector<D>>,
    pub(crate) mps: Vec<MpLocalState<D>>,
    pub(crate) bodies: Vec<BodyData<D>>,
    pub(crate) tractions: Vec<Traction<D>>,
    pub(crate) fluxes: Vec<otm_element::SurfaceFlux>,
    pub(crate) body_forces: Vec<otm_element::BodyForce<D>>,
    pub(crate) contacts: Vec<TwoBodyContact<D>>,
    pub(crate) temp_fixed: Vec<bool>,
    pub(crate) search: CellBucketSearch<D>,

    pub(crate) min_mass: Real,
    pub(crate) avg_neighbors: usize,
    pub(crate) release_rates: HashMap<MpId, (Real, ReleaseRateMode)>,
    pub(crate) fracture_dissipated: Real,
    pub(crate) max_steps: u64,
    pub(crate) end_time: Option<Real>,
}

impl<const D: usize> Model<D> {
    // ------------------------------------------------------------------
    // accessors

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn set_dt(&mut self, dt: Real) {
        self.clock.set_dt(dt);
    }

    pub fn set_end_time(&mut self, t: Real) {
        self.end_time = Some(t);
    }

    pub fn set_max_steps(&mut self, n: u64) {
        self.max_steps = n;
    }

    pub fn arena(&self) -> &NodeArena<D> {
        &self.arena
    }

    pub fn dofs(&self) -> &DofState<D> {
        &self.dofs
    }

    pub fn dofs_mut(&mut self) -> &mut DofState<D> {
        &mut self.dofs
    }

    pub fn material_points(&self) -> &[MpLocalState<D>] {
        &self.mps
    }

    pub fn material_points_mut(&mut self) -> &mut [MpLocalState<D>] {
        &mut self.mps
    }

    pub fn average_neighbors(&self) -> usize {
        self.avg_neighbors
    }

    pub fn eroded_points(&self) -> usize {
        self.bodies.iter().map(|b| b.eroded).sum()
    }

    pub fn has_thermal(&self) -> bool {
        self.bodies.iter().any(|b| b.conduction.is_some())
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn search_range(&self) -> Real {
        self.search_range
    }

    pub fn threading(&self) -> Threading {
        self.threading
    }

    /// Ambient node positions for the current configuration.
    pub fn ambient_positions(&self) -> Vec<Vector<D>> {
        embed_positions(&self.arena, &self.dofs)
    }

    // ------------------------------------------------------------------
    // distributed-layer surface

    /// Register a node received from another rank (or return its
    /// existing slot). New nodes arrive as shadows unless this rank is
    /// their home.
    pub fn ensure_node(
        &mut self,
        id: NodeId,
        carrier: otm_traits::CarrierId,
        home: Rank,
        embedding: Option<otm_algebra::Embedding<D>>,
        position: Vector<D>,
    ) -> Result<usize> {
        if let Some(slot) = self.arena.slot(id) {
            return Ok(slot);
        }
        let shadow = home != self.rank;
        let slot = self.arena.insert(id, carrier, embedding, home, shadow)?;
        let pushed = self.dofs.push_default();
        debug_assert_eq!(slot, pushed);
        self.dofs.position[slot] = position;
        self.position_ref.push(match self.arena.embedding(slot) {
            Some(emb) => emb.map(&position),
            None => position,
        });
        self.temp_fixed.push(false);
        Ok(slot)
    }

    pub fn arena_mut(&mut self) -> &mut NodeArena<D> {
        &mut self.arena
    }

    /// Detach purely on the lumped-mass criterion; the distributed
    /// layer uses this after summing remote mass partials, when local
    /// support inspection would miss remote references.
    pub fn update_detached_from_mass(&mut self) {
        self.min_mass = self
            .dofs
            .mass
            .iter()
            .copied()
            .filter(|&m| m > 0.0)
            .fold(Real::INFINITY, Real::min);
        let floor = self.critical_mass_factor * self.min_mass;
        for slot in 0..self.arena.len() {
            self.dofs.detached[slot] = self.dofs.mass[slot] <= floor.max(0.0);
        }
    }

    /// Adopt a migrated point (its warm-start multiplier and internal
    /// state travel with it).
    pub fn insert_point(&mut self, mp: MpLocalState<D>) {
        self.mps.push(mp);
    }

    /// Remove points by id (migration out); returns them by value.
    pub fn extract_points(&mut self, ids: &[MpId]) -> Vec<MpLocalState<D>> {
        let mut out = Vec::with_capacity(ids.len());
        let mut keep = Vec::with_capacity(self.mps.len());
        for mp in self.mps.drain(..) {
            if ids.contains(&mp.id) {
                out.push(mp);
            } else {
                keep.push(mp);
            }
        }
        self.mps = keep;
        out
    }

    pub fn erosion_enabled(&self) -> bool {
        self.erosion.is_some()
    }

    // ------------------------------------------------------------------
    // step pipeline

    /// Advance one step through the full pipeline.
    pub fn step(&mut self) -> Result<StepStatus> {
        if let Some(end) = self.end_time {
            if self.clock.time() >= end {
                return Ok(StepStatus::EndOfSimulation);
            }
        }
        self.predictor()?;
        let forces = match self.assemble_forces() {
            Ok(f) => f,
            Err(e) => {
                self.propagator.pull_back(&self.clock, &mut self.dofs);
                return Err(e);
            }
        };
        if self.has_thermal() {
            if let Err(e) = self.thermal_update() {
                self.propagator.pull_back(&self.clock, &mut self.dofs);
                return Err(e);
            }
        }
        self.corrector(&forces)?;
        self.advance_mps()?;
        if self.erosion.is_some() {
            self.erode()?;
        }
        debug!(
            "step {} done, t={:.6e}",
            self.clock.step_count(),
            self.clock.time()
        );
        Ok(StepStatus::StepTaken)
    }

    /// Step until `duration` has elapsed or the step budget runs out.
    pub fn equilibrate(&mut self, duration: Real) -> Result<StepStatus> {
        let target = self.clock.time() + duration;
        let mut steps = 0u64;
        while self.clock.time() < target - 1e-15 * duration.abs().max(1.0) {
            if steps >= self.max_steps {
                return Ok(StepStatus::StepCountExceeded);
            }
            if self.step()? == StepStatus::EndOfSimulation {
                break;
            }
            steps += 1;
        }
        Ok(StepStatus::EndOfSimulation)
    }

    pub fn predictor(&mut self) -> Result<()> {
        self.propagator.predictor(&self.clock, &mut self.dofs)
    }

    pub fn corrector(&mut self, forces: &[Vector<D>]) -> Result<()> {
        self.propagator
            .corrector(&mut self.clock, &mut self.dofs, forces)
    }

    /// Reset every material point against the predicted configuration
    /// and assemble the reduced nodal forces.
    pub fn assemble_forces(&mut self) -> Result<Vec<Vector<D>>> {
        let ambient_x = embed_positions(&self.arena, &self.dofs);
        let ambient_v = embed_velocities(&self.arena, &self.dofs);
        let time = self.clock.time();
        let dt = self.clock.dt();
        let n = self.arena.len();

        let arena = &self.arena;
        let bodies = &self.bodies;
        let body_forces = &self.body_forces;
        let temperatures = &self.dofs.temperature;
        let mps = &mut self.mps;
        let pool = Arc::clone(&self.pool);

        type Contribution<const D: usize> = Vec<(usize, Vector<D>)>;
        let results: Vec<Result<Contribution<D>>> = pool.install(|| {
            mps.par_iter_mut()
                .map(|mp| -> Result<Contribution<D>> {
                    if !mp.active {
                        return Ok(Vec::new());
                    }
                    let slots: Vec<usize> = mp
                        .support
                        .iter()
                        .map(|e| arena.slot(e.node).unwrap())
                        .collect();
                    let xs: Vec<Vector<D>> = slots.iter().map(|&s| ambient_x[s]).collect();
                    let vs: Vec<Vector<D>> = slots.iter().map(|&s| ambient_v[s]).collect();
                    mp.reset(time, &xs)?;
                    mp.temperature = mp
                        .support
                        .iter()
                        .zip(&slots)
                        .map(|(e, &s)| e.weight * temperatures[s])
                        .sum();

                    let body = &bodies[mp.body];
                    let mut out = vec![Vector::zero(); slots.len()];
                    mp.internal_forces(body.solid.as_ref(), &mut out)?;

                    if body.av.is_some() || body.hourglass.is_some() {
                        let mut grads = Vec::new();
                        mp.spatial_gradients(&mut grads)?;
                        let l = mp.velocity_gradient(&vs, &grads);
                        if let Some(av) = &body.av {
                            let c = body.solid.wave_speed(mp.density());
                            let sigma = av.stress(&l, mp.density(), c, mp.h);
                            mp.av_stress = sigma;
                            mp.av_strain_rate = l.symmetrize();
                            for (g, f) in grads.iter().zip(out.iter_mut()) {
                                *f += sigma.apply(g).scale(mp.volume);
                            }
                        }
                        if let Some(hg) = &body.hourglass {
                            hg.add_forces(&mp.support, &xs, &vs, &l, mp.volume, mp.h, &mut out);
                        }
                    }

                    for bf in body_forces.iter().filter(|bf| bf.carrier == mp.carrier) {
                        let b = (bf.accel)(time);
                        for (e, f) in mp.support.iter().zip(out.iter_mut()) {
                            *f -= b.scale(e.weight * mp.mass);
                        }
                    }
                    Ok(slots.into_iter().zip(out).collect())
                })
                .collect()
        });

        let mut contributions: Vec<Contribution<D>> = Vec::with_capacity(results.len());
        let mut first_recoverable: Option<EngineError> = None;
        for r in results {
            match r {
                Ok(c) => contributions.push(c),
                Err(e) if e.is_recoverable() => {
                    if first_recoverable.is_none() {
                        first_recoverable = Some(e);
                    } else {
                        warn!("additional per-point error this step: {e}");
                    }
                }
                Err(e) => return Err(e),
            }
        }
        if let Some(e) = first_recoverable {
            return Err(e);
        }

        let mut ambient_f: Vec<Vector<D>> = match self.threading {
            Threading::Deterministic => {
                let mut acc = vec![Vector::zero(); n];
                for contribution in &contributions {
                    for &(slot, f) in contribution {
                        acc[slot] += f;
                    }
                }
                acc
            }
            Threading::WorkStealing => pool.install(|| {
                contributions
                    .par_iter()
                    .fold(
                        || vec![Vector::zero(); n],
                        |mut acc, contribution| {
                            for &(slot, f) in contribution {
                                acc[slot] += f;
                            }
                            acc
                        },
                    )
                    .reduce(
                        || vec![Vector::zero(); n],
                        |mut a, b| {
                            for (x, y) in a.iter_mut().zip(b) {
                                *x += y;
                            }
                            a
                        },
                    )
            }),
        };

        // auxiliary contributor elements: tractions, two-body contact
        let ctx = ContribCtx { time, dt };
        for element in self
            .tractions
            .iter()
            .map(|t| t as &dyn NodalContributor<D>)
            .chain(self.contacts.iter().map(|c| c as &dyn NodalContributor<D>))
        {
            let slots: Vec<usize> = element
                .nodes()
                .iter()
                .map(|&id| self.arena.slot(id).unwrap())
                .collect();
            let xs: Vec<Vector<D>> = slots.iter().map(|&s| ambient_x[s]).collect();
            let vs: Vec<Vector<D>> = slots.iter().map(|&s| ambient_v[s]).collect();
            let mut out = vec![Vector::zero(); slots.len()];
            element.add_forces(&ctx, &xs, &vs, &mut out)?;
            for (&slot, f) in slots.iter().zip(out) {
                ambient_f[slot] += f;
            }
        }

        Ok(submerge_forces(&self.arena, &ambient_f))
    }

    /// Commit every material point, refresh the spatial index, and
    /// recompute shape functions at the committed configuration. The
    /// node list is re-queried only for points past their drift
    /// threshold (with the one-retry expansion policy); everyone else
    /// re-solves the LME dual over their existing support, warm-started
    /// from the stored multiplier. Lumped masses refresh afterwards.
    pub fn advance_mps(&mut self) -> Result<()> {
        {
            let bodies = &self.bodies;
            let mps = &mut self.mps;
            self.pool.install(|| {
                mps.par_iter_mut().try_for_each(|mp| {
                    let body = &bodies[mp.body];
                    mp.advance(body.solid.as_ref(), body.data.incremental)
                })
            })?;
        }

        let ambient = embed_positions(&self.arena, &self.dofs);
        let cloud: Vec<(NodeId, Vector<D>)> = ambient
            .iter()
            .enumerate()
            .map(|(slot, x)| (self.arena.id(slot), *x))
            .collect();
        if self.adaptive_search {
            self.search.refresh(&cloud);
        } else {
            self.search.rebuild(&cloud);
        }

        let arena = &self.arena;
        let search = &self.search;
        let kernel = &self.lme;
        let bodies = &self.bodies;
        let range = self.search_range;
        let multi_body = self.multi_body;
        let mps = &mut self.mps;

        self.pool.install(|| {
            mps.par_iter_mut()
                .map_init(Vec::new, |scratch: &mut Vec<NodeId>, mp| -> Result<()> {
                    let body = &bodies[mp.body];
                    if !mp.active {
                        return Ok(());
                    }
                    let gamma = body
                        .gamma_field
                        .as_ref()
                        .map(|g| g(&mp.position))
                        .unwrap_or(body.data.gamma);
                    let requery = mp.needs_rebuild(&body.data);
                    if !requery && !body.data.incremental {
                        // total mode: gradients stay pinned to the last
                        // re-query configuration
                        return Ok(());
                    }
                    if !requery {
                        // refresh weights and gradients over the
                        // existing node list at the committed positions
                        let candidates: Vec<(NodeId, Vector<D>)> = mp
                            .support
                            .iter()
                            .map(|e| (e.node, ambient[arena.slot(e.node).unwrap()]))
                            .collect();
                        match mp.rebuild_from_candidates(kernel, &candidates, gamma) {
                            Ok(()) => return Ok(()),
                            Err(e) if e.is_recoverable() => {
                                // fall through to a full re-query
                            }
                            Err(e) => return Err(e),
                        }
                    }

                    let mut attempt = |factor: Real, scratch: &mut Vec<NodeId>| -> Result<()> {
                        search.query(&mp.position, factor * range, scratch)?;
                        if multi_body {
                            scratch
                                .retain(|&id| arena.carrier(arena.slot(id).unwrap()) == mp.carrier);
                        }
                        scratch.sort_unstable();
                        let candidates: Vec<(NodeId, Vector<D>)> = scratch
                            .iter()
                            .map(|&id| (id, ambient[arena.slot(id).unwrap()]))
                            .collect();
                        mp.rebuild_from_candidates(kernel, &candidates, gamma)
                    };
                    match attempt(1.0, scratch) {
                        Ok(()) => {
                            mp.mark_requeried();
                            Ok(())
                        }
                        Err(e) if e.is_recoverable() => match attempt(1.5, scratch) {
                            Ok(()) => {
                                mp.mark_requeried();
                                Ok(())
                            }
                            Err(e2) if e2.is_recoverable() => {
                                warn!(
                                    "deactivating {:?}: support rebuild failed twice ({e2})",
                                    mp.id
                                );
                                mp.active = false;
                                Ok(())
                            }
                            Err(e2) => Err(e2),
                        },
                        Err(e) => Err(e),
                    }
                })
                .try_reduce(|| (), |_, _| Ok(()))
        })?;

        let active = self.mps.iter().filter(|m| m.active).count().max(1);
        self.avg_neighbors = self
            .mps
            .iter()
            .filter(|m| m.active)
            .map(|m| m.support.len())
            .sum::<usize>()
            / active;

        self.recompute_mass();
        self.update_detached();
        Ok(())
    }

    /// Reassemble the lumped nodal masses from the active points.
    pub fn recompute_mass(&mut self) {
        for m in self.dofs.mass.iter_mut() {
            *m = 0.0;
        }
        for mp in self.mps.iter().filter(|m| m.active) {
            for e in &mp.support {
                let slot = self.arena.slot(e.node).unwrap();
                self.dofs.mass[slot] += e.weight * mp.mass;
            }
        }
        self.min_mass = self
            .dofs
            .mass
            .iter()
            .copied()
            .filter(|&m| m > 0.0)
            .fold(Real::INFINITY, Real::min);
    }

    /// Nodes with no active support (or below the critical-mass floor)
    /// detach: velocity frozen, no mass accumulation.
    pub fn update_detached(&mut self) {
        let mut supported = vec![false; self.arena.len()];
        for mp in self.mps.iter().filter(|m| m.active) {
            for e in &mp.support {
                supported[self.arena.slot(e.node).unwrap()] = true;
            }
        }
        let floor = if self.min_mass.is_finite() {
            self.critical_mass_factor * self.min_mass
        } else {
            0.0
        };
        for slot in 0..self.arena.len() {
            let detached = !supported[slot] || self.dofs.mass[slot] < floor;
            if detached && !self.dofs.detached[slot] {
                debug!("node {:?} detached", self.arena.id(slot));
            }
            self.dofs.detached[slot] = detached;
        }
    }

    // ------------------------------------------------------------------
    // thermal

    /// Backward-Euler temperature update; rolls nothing back itself
    /// (the caller owns mechanical roll-back on failure).
    fn thermal_update(&mut self) -> Result<()> {
        let mut sys = KeyedSystem::new();
        self.assemble_thermal(&mut sys)?;
        let increments = self.thermal.solve(&mut sys)?;
        for (id, dt_val) in increments {
            let slot = self.arena.slot(id).unwrap();
            self.dofs.temperature[slot] += dt_val;
        }
        Ok(())
    }

    /// Assemble capacity, conduction stiffness, and thermal residual
    /// into `(M_T/dt + DDE) ΔT = -DE` for the free temperature DOFs.
    pub fn assemble_thermal(&self, sys: &mut KeyedSystem<NodeId>) -> Result<()> {
        let dt = self.clock.dt();
        let time = self.clock.time();
        let n = self.arena.len();
        let mut capacity = vec![0.0; n];
        let mut residual = vec![0.0; n];

        let mut grads = Vec::new();
        for mp in self.mps.iter().filter(|m| m.active) {
            let body = &self.bodies[mp.body];
            let Some(cond) = &body.conduction else {
                continue;
            };
            let slots: Vec<usize> = mp
                .support
                .iter()
                .map(|e| self.arena.slot(e.node).unwrap())
                .collect();
            mp.spatial_gradients(&mut grads)?;

            let t_mp: Real = mp
                .support
                .iter()
                .zip(&slots)
                .map(|(e, &s)| e.weight * self.dofs.temperature[s])
                .sum();
            let mut grad_t = Vector::zero();
            for (g, &s) in grads.iter().zip(&slots) {
                grad_t += g.scale(self.dofs.temperature[s]);
            }
            let q = cond.flux(&grad_t, t_mp);
            let conductivity = cond.dflux_dgrad(t_mp).scale(-1.0);
            let vol = mp.volume;

            let source_rate = (mp.dissipated - mp.dissipated_prev) / dt;
            for ((e, g), &s) in mp.support.iter().zip(&grads).zip(&slots) {
                residual[s] += -vol * g.dot(&q) - e.weight * source_rate;
                capacity[s] += e.weight * cond.capacity(t_mp) * vol;
            }
            for (ga, &sa) in grads.iter().zip(&slots) {
                if self.temp_fixed[sa] || self.dofs.detached[sa] {
                    continue;
                }
                let row = self.arena.id(sa);
                for (gb, &sb) in grads.iter().zip(&slots) {
                    if self.temp_fixed[sb] || self.dofs.detached[sb] {
                        continue;
                    }
                    sys.add(row, self.arena.id(sb), vol * ga.dot(&conductivity.apply(gb)));
                }
            }
        }

        for fx in &self.fluxes {
            let mut out = vec![0.0; fx.nodes.len()];
            fx.add_thermal(time, &mut out);
            for (id, r) in fx.nodes.iter().zip(out) {
                residual[self.arena.slot(*id).unwrap()] += r;
            }
        }

        for slot in 0..n {
            if capacity[slot] <= 0.0 || self.temp_fixed[slot] || self.dofs.detached[slot] {
                continue;
            }
            let id = self.arena.id(slot);
            sys.add(id, id, capacity[slot] / dt);
            sys.add_rhs(id, -residual[slot]);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // queries

    /// Total mass of the active points.
    pub fn mass(&self) -> Real {
        self.mps
            .iter()
            .filter(|m| m.active)
            .map(|m| m.mass)
            .sum()
    }

    /// Total mass of one carrier's active points.
    pub fn mass_of(&self, carrier: otm_traits::CarrierId) -> Real {
        self.mps
            .iter()
            .filter(|m| m.active && m.carrier == carrier)
            .map(|m| m.mass)
            .sum()
    }

    /// Kinetic energy interpolated at the material points, skipping
    /// detached nodes.
    pub fn kinetic_energy(&self) -> Real {
        let vamb = embed_velocities(&self.arena, &self.dofs);
        let mut ke = 0.0;
        for mp in self.mps.iter().filter(|m| m.active) {
            let v = self.point_velocity(mp, &vamb);
            ke += 0.5 * mp.mass * v.norm_sq();
        }
        ke
    }

    /// Kinetic energy of one carrier.
    pub fn kinetic_energy_of(&self, carrier: otm_traits::CarrierId) -> Real {
        let vamb = embed_velocities(&self.arena, &self.dofs);
        self.mps
            .iter()
            .filter(|m| m.active && m.carrier == carrier)
            .map(|m| 0.5 * m.mass * self.point_velocity(m, &vamb).norm_sq())
            .sum()
    }

    /// Linear momentum of one carrier.
    pub fn momentum_of(&self, carrier: otm_traits::CarrierId) -> Vector<D> {
        let vamb = embed_velocities(&self.arena, &self.dofs);
        let mut p = Vector::zero();
        for mp in self
            .mps
            .iter()
            .filter(|m| m.active && m.carrier == carrier)
        {
            p += self.point_velocity(mp, &vamb).scale(mp.mass);
        }
        p
    }

    /// Stored strain energy of one carrier.
    pub fn strain_energy_of(&self, carrier: otm_traits::CarrierId) -> Real {
        self.mps
            .iter()
            .filter(|m| m.active && m.carrier == carrier)
            .map(|mp| {
                let body = &self.bodies[mp.body];
                mp.volume_ref * body.solid.energy(&mp.f, &mp.state).unwrap_or(0.0)
            })
            .sum()
    }

    /// Linear momentum interpolated at the material points.
    pub fn momentum(&self) -> Vector<D> {
        let vamb = embed_velocities(&self.arena, &self.dofs);
        let mut p = Vector::zero();
        for mp in self.mps.iter().filter(|m| m.active) {
            p += self.point_velocity(mp, &vamb).scale(mp.mass);
        }
        p
    }

    /// Stored strain energy of the active points, evaluated fresh.
    pub fn strain_energy(&self) -> Real {
        self.mps
            .iter()
            .filter(|m| m.active)
            .map(|mp| {
                let body = &self.bodies[mp.body];
                mp.volume_ref
                    * body
                        .solid
                        .energy(&mp.f, &mp.state)
                        .unwrap_or(0.0)
            })
            .sum()
    }

    /// Energy dissipated by constitutive flow and fracture.
    pub fn dissipated_energy(&self) -> Real {
        self.fracture_dissipated
            + self
                .mps
                .iter()
                .map(|m| m.dissipated)
                .sum::<Real>()
    }

    fn point_velocity(&self, mp: &MpLocalState<D>, vamb: &[Vector<D>]) -> Vector<D> {
        let mut v = Vector::zero();
        for e in &mp.support {
            let slot = self.arena.slot(e.node).unwrap();
            if !self.dofs.detached[slot] {
                v += vamb[slot].scale(e.weight);
            }
        }
        v
    }

    /// Per-point field extraction over the active and failed points.
    pub fn qp_data(&self, tag: FieldTag) -> QpField<D> {
        let vamb = embed_velocities(&self.arena, &self.dofs);
        let scalar = |f: &dyn Fn(&MpLocalState<D>) -> Real| -> QpField<D> {
            QpField::Scalar(self.mps.iter().map(|m| (m.id, f(m))).collect())
        };
        match tag {
            FieldTag::EffectiveStress => scalar(&|m| {
                // von Mises
                (1.5_f64).sqrt() * m.cauchy.deviator().norm()
            }),
            FieldTag::EffectiveStrain => scalar(&|m| {
                let b = m.f.compose(&m.f.transpose());
                match b.sym_log() {
                    Some(l) => (2.0 / 3.0_f64).sqrt() * l.scale(0.5).deviator().norm(),
                    None => 0.0,
                }
            }),
            FieldTag::Temperature => scalar(&|m| m.temperature),
            FieldTag::MeanStress => scalar(&|m| m.cauchy.trace() / D as Real),
            FieldTag::Velocity => QpField::Vector(
                self.mps
                    .iter()
                    .map(|m| (m.id, self.point_velocity(m, &vamb)))
                    .collect(),
            ),
            FieldTag::Displacement => QpField::Vector(
                self.mps
                    .iter()
                    .map(|m| (m.id, m.position - m.position_ref))
                    .collect(),
            ),
            FieldTag::Status => scalar(&|m| if m.active { 1.0 } else { 0.0 }),
            FieldTag::Jacobian => scalar(&|m| m.f.det()),
            FieldTag::J3 => scalar(&|m| m.cauchy.deviator().det()),
            FieldTag::DeformationGradient => {
                QpField::Tensor(self.mps.iter().map(|m| (m.id, m.f)).collect())
            }
            FieldTag::VoidFraction => scalar(&|m| (1.0 - 1.0 / m.f.det().max(1e-12)).max(0.0)),
            FieldTag::Rotation => QpField::Tensor(
                self.mps
                    .iter()
                    .map(|m| (m.id, polar_rotation(&m.f)))
                    .collect(),
            ),
            FieldTag::Orientation => QpField::Vector(
                self.mps
                    .iter()
                    .map(|m| {
                        let c = m.f.transpose().compose(&m.f);
                        let (_, vecs) = c.sym_eigen();
                        (m.id, vecs.col(0))
                    })
                    .collect(),
            ),
            FieldTag::Gamma => scalar(&|m| m.state.vars.first().copied().unwrap_or(0.0)),
            FieldTag::Weight => scalar(&|m| m.volume_ref),
            FieldTag::CauchyStress => {
                QpField::Tensor(self.mps.iter().map(|m| (m.id, m.cauchy)).collect())
            }
            FieldTag::TrueStrain => QpField::Tensor(
                self.mps
                    .iter()
                    .map(|m| {
                        let b = m.f.compose(&m.f.transpose());
                        (m.id, b.sym_log().map(|l| l.scale(0.5)).unwrap_or_default())
                    })
                    .collect(),
            ),
            FieldTag::EnergyReleaseRate => scalar(&|m| {
                self.release_rates
                    .get(&m.id)
                    .map(|(g, _)| *g)
                    .unwrap_or(0.0)
            }),
            FieldTag::DissipatedEnergy => scalar(&|m| m.dissipated),
            FieldTag::Vorticity => scalar(&|m| {
                let mut grads = Vec::new();
                if m.spatial_gradients(&mut grads).is_err() {
                    return 0.0;
                }
                let mut l = Hom::<D, D>::zero();
                for (g, e) in grads.iter().zip(&m.support) {
                    let slot = self.arena.slot(e.node).unwrap();
                    l += Hom::outer(&vamb[slot], g);
                }
                let spin = (l - l.transpose()).scale(0.5);
                spin.norm()
            }),
            FieldTag::Mass => scalar(&|m| m.mass),
            FieldTag::AvStress => {
                QpField::Tensor(self.mps.iter().map(|m| (m.id, m.av_stress)).collect())
            }
            FieldTag::AvDeformation => {
                QpField::Tensor(self.mps.iter().map(|m| (m.id, m.av_strain_rate)).collect())
            }
        }
    }

    /// Nodal field extraction.
    pub fn node_data(&self, tag: FieldTag) -> NodeField<D> {
        let ids = self.arena.ids();
        match tag {
            FieldTag::Velocity => {
                let v = embed_velocities(&self.arena, &self.dofs);
                NodeField::Vector(ids.iter().copied().zip(v).collect())
            }
            FieldTag::Displacement => {
                let x = embed_positions(&self.arena, &self.dofs);
                NodeField::Vector(
                    ids.iter()
                        .copied()
                        .zip(
                            x.iter()
                                .zip(&self.position_ref)
                                .map(|(a, b)| *a - *b),
                        )
                        .collect(),
                )
            }
            FieldTag::Mass => NodeField::Scalar(
                ids.iter().copied().zip(self.dofs.mass.iter().copied()).collect(),
            ),
            FieldTag::Temperature => NodeField::Scalar(
                ids.iter()
                    .copied()
                    .zip(self.dofs.temperature.iter().copied())
                    .collect(),
            ),
            FieldTag::Status => NodeField::Scalar(
                ids.iter()
                    .copied()
                    .zip(self.dofs.detached.iter().map(|&d| if d { 0.0 } else { 1.0 }))
                    .collect(),
            ),
            _ => NodeField::Scalar(Vec::new()),
        }
    }

    /// CFL-stable dt over the active points at the caller's fraction.
    pub fn stable_dt(&self, cfl_fraction: Real) -> Real {
        let vamb = embed_velocities(&self.arena, &self.dofs);
        otm_solver::explicit::stable_dt(
            self.mps.iter().filter(|m| m.active).map(|m| {
                let c = self.bodies[m.body].solid.wave_speed(m.density());
                (m.h, c, self.point_velocity(m, &vamb).norm())
            }),
            cfl_fraction,
        )
    }

    /// Per-point stable time steps, for dt diagnostics.
    pub fn stable_dt_per_point(&self) -> Vec<(MpId, Real)> {
        let vamb = embed_velocities(&self.arena, &self.dofs);
        self.mps
            .iter()
            .filter(|m| m.active)
            .map(|m| {
                let c = self.bodies[m.body].solid.wave_speed(m.density());
                let v = self.point_velocity(m, &vamb).norm();
                (m.id, m.h / (c + v))
            })
            .collect()
    }

    /// Recompute shape functions for the current configuration (after
    /// a migration or checkpoint restore).
    pub fn reset(&mut self) -> Result<()> {
        let ambient = embed_positions(&self.arena, &self.dofs);
        let cloud: Vec<(NodeId, Vector<D>)> = ambient
            .iter()
            .enumerate()
            .map(|(slot, x)| (self.arena.id(slot), *x))
            .collect();
        self.search.rebuild(&cloud);
        let mut scratch = Vec::new();
        let arena = &self.arena;
        let search = &self.search;
        let kernel = self.lme;
        let multi_body = self.multi_body;
        let range = self.search_range;
        let bodies = &self.bodies;
        for mp in self.mps.iter_mut().filter(|m| m.active) {
            let body = &bodies[mp.body];
            let gamma = body
                .gamma_field
                .as_ref()
                .map(|g| g(&mp.position))
                .unwrap_or(body.data.gamma);
            search.query(&mp.position, range, &mut scratch)?;
            if multi_body {
                scratch.retain(|&id| arena.carrier(arena.slot(id).unwrap()) == mp.carrier);
            }
            scratch.sort_unstable();
            let candidates: Vec<(NodeId, Vector<D>)> = scratch
                .iter()
                .map(|&id| (id, ambient[arena.slot(id).unwrap()]))
                .collect();
            mp.rebuild_from_candidates(&kernel, &candidates, gamma)?;
            mp.mark_requeried();
        }
        self.recompute_mass();
        self.update_detached();
        info!("model reset: supports rebuilt for current configuration");
        Ok(())
    }
}

/// Rotation from the polar decomposition `F = R U`.
fn polar_rotation<const D: usize>(f: &Hom<D, D>) -> Hom<D, D> {
    let c = f.transpose().compose(f);
    let (ev, vecs) = c.sym_eigen();
    let mut u_inv = Hom::<D, D>::zero();
    for k in 0..D {
        let lam = ev[k].max(1e-30).sqrt();
        let col = vecs.col(k);
        u_inv += Hom::outer(&col, &col).scale(1.0 / lam);
    }
    f.compose(&u_inv)
}
