//! Model builder: sole owner of materials, elements, local states, and
//! the node map. Bodies, boundary conditions, and force generators are
//! declared first; `create_model` then allocates supports, lumped
//! masses, and the spatial index, and hands ownership to the driver
//! [`Model`](crate::Model).

use std::sync::Arc;

use log::info;

use otm_algebra::{Embedding, Hom, Real, Vector};
use otm_element::loads::{AccelFn, LoadFn};
use otm_element::{
    ArtificialViscosity, BodyForce, HourglassControl, MpData, MpLocalState, SurfaceFlux, Traction,
    TwoBodyContact,
};
use otm_lme::{LmeKernel, LmeParams};
use otm_search::CellBucketSearch;
use otm_traits::{
    CarrierId, Conduction, EngineError, MaterialState, MpId, NeighborSearch, NodeId, Rank, Result,
    Solid, Threading,
};
use otm_solver::{CentralDifference, Clock, DofState, ThermalSolve};

use crate::arena::NodeArena;
use crate::erosion::ErosionParams;
use crate::mesh::CellComplex;
use crate::model::Model;

/// Spatially varying LME locality override.
pub type GammaField<const D: usize> = Arc<dyn Fn(&Vector<D>) -> Real + Send + Sync>;

/// Everything needed to insert one body.
pub struct BodySpec<const D: usize> {
    pub mesh: CellComplex<D>,
    pub solid: Arc<dyn Solid<D>>,
    pub conduction: Option<Arc<dyn Conduction<D>>>,
    pub density: Real,
    pub data: MpData,
    pub points_per_cell: usize,
    pub initial_f: Option<Hom<D, D>>,
    pub initial_velocity: Vector<D>,
    pub initial_temperature: Real,
    /// Per-cell activity mask; `None` activates every cell.
    pub active_cells: Option<Vec<bool>>,
    pub av: Option<ArtificialViscosity>,
    pub hourglass: Option<HourglassControl>,
    pub gamma_field: Option<GammaField<D>>,
}

impl<const D: usize> BodySpec<D> {
    pub fn new(mesh: CellComplex<D>, solid: Arc<dyn Solid<D>>, density: Real) -> Self {
        BodySpec {
            mesh,
            solid,
            conduction: None,
            density,
            data: MpData::default(),
            points_per_cell: 1,
            initial_f: None,
            initial_velocity: Vector::zero(),
            initial_temperature: 0.0,
            active_cells: None,
            av: None,
            hourglass: None,
            gamma_field: None,
        }
    }
}

/// Per-body runtime data retained by the model.
pub struct BodyData<const D: usize> {
    pub carrier: CarrierId,
    pub solid: Arc<dyn Solid<D>>,
    pub conduction: Option<Arc<dyn Conduction<D>>>,
    pub density: Real,
    pub data: MpData,
    pub av: Option<ArtificialViscosity>,
    pub hourglass: Option<HourglassControl>,
    pub gamma_field: Option<GammaField<D>>,
    /// Arena slots of this body's nodes.
    pub node_slots: Vec<usize>,
    /// Mesh-vertex index to node id, for boundary insertion.
    pub vertex_nodes: Vec<NodeId>,
    pub eroded: usize,
}

/// Nodal constraint kinds applied by the builder.
pub enum Constraint<const D: usize> {
    /// Pin the node at its current position.
    Fixed,
    /// Constrain motion to a line along `direction`.
    Line(Vector<D>),
    /// Constrain motion to the plane orthogonal to `normal`.
    Plane(Vector<D>),
}

pub struct ModelBuilder<const D: usize> {
    clock: Clock,
    search_range: Real,
    multi_body: bool,
    adaptive_search: bool,
    threading: Threading,
    pool: Option<Arc<rayon::ThreadPool>>,
    lme: LmeParams,
    gamma_newmark: Real,
    critical_mass_factor: Real,
    erosion: Option<ErosionParams<D>>,
    thermal: ThermalSolve,
    rank: Rank,

    pub(crate) arena: NodeArena<D>,
    pub(crate) dofs: DofState<D>,
    pub(crate) mps: Vec<MpLocalState<D>>,
    pub(crate) bodies: Vec<BodyData<D>>,
    pub(crate) tractions: Vec<Traction<D>>,
    pub(crate) fluxes: Vec<SurfaceFlux>,
    pub(crate) body_forces: Vec<BodyForce<D>>,
    pub(crate) contacts: Vec<TwoBodyContact<D>>,
    pub(crate) temp_fixed: Vec<bool>,

    next_node: u64,
    next_mp: u64,
}

impl<const D: usize> ModelBuilder<D> {
    pub fn new(clock: Clock, search_range: Real) -> Self {
        ModelBuilder {
            clock,
            search_range,
            multi_body: true,
            adaptive_search: false,
            threading: Threading::default(),
            pool: None,
            lme: LmeParams::default(),
            gamma_newmark: 0.5,
            critical_mass_factor: 0.0,
            erosion: None,
            thermal: ThermalSolve::default(),
            rank: 0,
            arena: NodeArena::new(),
            dofs: DofState::default(),
            mps: Vec::new(),
            bodies: Vec::new(),
            tractions: Vec::new(),
            fluxes: Vec::new(),
            body_forces: Vec::new(),
            contacts: Vec::new(),
            temp_fixed: Vec::new(),
            next_node: 0,
            next_mp: 0,
        }
    }

    pub fn multi_body(mut self, on: bool) -> Self {
        self.multi_body = on;
        self
    }

    pub fn adaptive_search(mut self, on: bool) -> Self {
        self.adaptive_search = on;
        self
    }

    pub fn threading(mut self, mode: Threading) -> Self {
        self.threading = mode;
        self
    }

    /// Inject the worker pool; by default `create_model` builds one.
    pub fn thread_pool(mut self, pool: Arc<rayon::ThreadPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn lme_params(mut self, params: LmeParams) -> Self {
        self.lme = params;
        self
    }

    pub fn newmark_gamma(mut self, gamma: Real) -> Self {
        self.gamma_newmark = gamma;
        self
    }

    /// Nodes whose lumped mass drops below `factor * min_mass` are
    /// treated as detached.
    pub fn critical_mass_factor(mut self, factor: Real) -> Self {
        self.critical_mass_factor = factor;
        self
    }

    pub fn eigen_erosion(mut self, params: ErosionParams<D>) -> Self {
        self.erosion = Some(params);
        self
    }

    pub fn thermal_solve(mut self, solve: ThermalSolve) -> Self {
        self.thermal = solve;
        self
    }

    pub fn rank(mut self, rank: Rank) -> Self {
        self.rank = rank;
        self
    }

    /// Register a body: its mesh vertices become nodes of a fresh
    /// carrier and its volume cells seed material points.
    pub fn insert_body(&mut self, spec: BodySpec<D>) -> Result<CarrierId> {
        let carrier = CarrierId(self.bodies.len() as u32);
        let body_index = self.bodies.len();

        let mut node_slots = Vec::with_capacity(spec.mesh.vertices.len());
        let mut vertex_nodes = Vec::with_capacity(spec.mesh.vertices.len());
        for v in &spec.mesh.vertices {
            let id = NodeId(self.next_node);
            self.next_node += 1;
            let slot = self.arena.insert(id, carrier, None, self.rank, false)?;
            let new_slot = self.dofs.push_default();
            debug_assert_eq!(slot, new_slot);
            self.dofs.position[slot] = *v;
            self.dofs.velocity[slot] = spec.initial_velocity;
            self.dofs.temperature[slot] = spec.initial_temperature;
            self.temp_fixed.push(false);
            node_slots.push(slot);
            vertex_nodes.push(id);
        }

        let npc = spec.points_per_cell.max(1);
        for (ci, cell) in spec.mesh.cells.iter().enumerate() {
            if let Some(mask) = &spec.active_cells {
                if !mask.get(ci).copied().unwrap_or(true) {
                    continue;
                }
            }
            let vol = spec.mesh.cell_volume(cell);
            let h = spec.mesh.cell_size(cell);
            let centroid = spec.mesh.cell_centroid(cell);
            for q in 0..npc {
                let position = if npc == 1 {
                    centroid
                } else {
                    // blend each point halfway toward one vertex in turn
                    let v = spec.mesh.vertices[cell[q % cell.len()]];
                    centroid.axpy(0.5, &(v - centroid))
                };
                let mut mp = MpLocalState::new(
                    MpId(self.next_mp),
                    carrier,
                    body_index,
                    position,
                    vol / npc as Real,
                    spec.density * vol / npc as Real,
                    h,
                    MaterialState::with_len(spec.solid.state_len()),
                );
                self.next_mp += 1;
                mp.temperature = spec.initial_temperature;
                if let Some(f0) = spec.initial_f {
                    mp.f = f0;
                    mp.f_old = f0;
                }
                self.mps.push(mp);
            }
        }

        self.bodies.push(BodyData {
            carrier,
            solid: spec.solid,
            conduction: spec.conduction,
            density: spec.density,
            data: spec.data,
            av: spec.av,
            hourglass: spec.hourglass,
            gamma_field: spec.gamma_field,
            node_slots,
            vertex_nodes,
            eroded: 0,
        });
        Ok(carrier)
    }

    fn body(&self, carrier: CarrierId) -> Result<&BodyData<D>> {
        self.bodies
            .get(carrier.0 as usize)
            .ok_or_else(|| EngineError::Misuse(format!("unknown carrier {carrier:?}")))
    }

    /// Attach a traction over boundary facets given as vertex-index
    /// lists of the carrier's mesh. `normals` may be omitted in 1-D.
    pub fn insert_traction(
        &mut self,
        carrier: CarrierId,
        facets: &[Vec<usize>],
        normals: Option<&[Vector<D>]>,
        load: LoadFn,
    ) -> Result<()> {
        let body = self.body(carrier)?;
        let vertex_nodes = body.vertex_nodes.clone();
        for (fi, facet) in facets.iter().enumerate() {
            let nodes: Vec<NodeId> = facet.iter().map(|&v| vertex_nodes[v]).collect();
            let weights = vec![1.0 / nodes.len() as Real; nodes.len()];
            let (area, normal) = self.facet_geometry(carrier, facet, normals.map(|n| n[fi]))?;
            self.tractions
                .push(Traction::new(nodes, weights, normal, area, load.clone()));
        }
        Ok(())
    }

    /// Prescribed heat flux over boundary facets.
    pub fn insert_flux(
        &mut self,
        carrier: CarrierId,
        facets: &[Vec<usize>],
        flux: LoadFn,
    ) -> Result<()> {
        let body = self.body(carrier)?;
        let vertex_nodes = body.vertex_nodes.clone();
        for facet in facets {
            let nodes: Vec<NodeId> = facet.iter().map(|&v| vertex_nodes[v]).collect();
            let weights = vec![1.0 / nodes.len() as Real; nodes.len()];
            let (area, _) = self.facet_geometry(carrier, facet, None)?;
            self.fluxes
                .push(SurfaceFlux::new(nodes, weights, area, flux.clone()));
        }
        Ok(())
    }

    /// One-body force field over a carrier (body force, gravity-like
    /// potential fields).
    pub fn insert_one_body_field(&mut self, carrier: CarrierId, accel: AccelFn<D>) -> Result<()> {
        self.body(carrier)?;
        self.body_forces.push(BodyForce::new(carrier, accel));
        Ok(())
    }

    /// Two-body penalty contact between carriers.
    pub fn insert_two_body_potential(
        &mut self,
        a: CarrierId,
        b: CarrierId,
        stiffness: Real,
        range: Real,
        symmetric: bool,
    ) -> Result<()> {
        if !self.multi_body {
            return Err(EngineError::Misuse(
                "two-body potentials need a multi-body model".into(),
            ));
        }
        let nodes_a = self.body(a)?.vertex_nodes.clone();
        let nodes_b = self.body(b)?.vertex_nodes.clone();
        self.contacts.push(TwoBodyContact::new(
            nodes_a, nodes_b, stiffness, range, symmetric,
        ));
        Ok(())
    }

    /// Constrain every node of `carrier` whose initial position matches
    /// the predicate.
    pub fn constrain(
        &mut self,
        carrier: CarrierId,
        at: impl Fn(&Vector<D>) -> bool,
        kind: Constraint<D>,
    ) -> Result<usize> {
        let slots: Vec<usize> = self
            .body(carrier)?
            .node_slots
            .iter()
            .copied()
            .filter(|&s| at(&self.dofs.position[s]))
            .collect();
        for &slot in &slots {
            let origin = self.dofs.position[slot];
            let v_amb = self.dofs.velocity[slot];
            let emb = match &kind {
                Constraint::Fixed => Embedding::fixed(origin),
                Constraint::Line(dir) => Embedding::line(origin, *dir),
                Constraint::Plane(normal) => plane_embedding(origin, normal),
            };
            self.dofs.position[slot] = Vector::zero();
            self.dofs.velocity[slot] = emb.pull_back(&v_amb);
            self.dofs.acceleration[slot] = Vector::zero();
            self.arena.set_embedding(slot, Some(emb));
        }
        Ok(slots.len())
    }

    /// Pin the temperature of matching nodes (thermal Dirichlet data).
    pub fn fix_temperature(
        &mut self,
        carrier: CarrierId,
        at: impl Fn(&Vector<D>) -> bool,
        value: Real,
    ) -> Result<usize> {
        let slots: Vec<usize> = self
            .body(carrier)?
            .node_slots
            .iter()
            .copied()
            .filter(|&s| {
                let x = match self.arena.embedding(s) {
                    Some(e) => e.map(&self.dofs.position[s]),
                    None => self.dofs.position[s],
                };
                at(&x)
            })
            .collect();
        for &slot in &slots {
            self.dofs.temperature[slot] = value;
            self.temp_fixed[slot] = true;
        }
        Ok(slots.len())
    }

    fn facet_geometry(
        &self,
        carrier: CarrierId,
        facet: &[usize],
        normal: Option<Vector<D>>,
    ) -> Result<(Real, Vector<D>)> {
        let body = self.body(carrier)?;
        let pos =
            |v: usize| self.dofs.position[self.arena.slot(body.vertex_nodes[v]).unwrap()];
        let area = match facet.len() {
            1 => 1.0,
            2 => (pos(facet[1]) - pos(facet[0])).norm(),
            3 => {
                let a = pos(facet[1]) - pos(facet[0]);
                let b = pos(facet[2]) - pos(facet[0]);
                // Gram determinant gives the parallelogram area in any
                // ambient dimension.
                let g = a.norm_sq() * b.norm_sq() - a.dot(&b).powi(2);
                0.5 * g.max(0.0).sqrt()
            }
            n => {
                return Err(EngineError::Misuse(format!(
                    "unsupported facet arity {n}"
                )))
            }
        };
        let normal = match normal {
            Some(n) => n.scale(1.0 / n.norm()),
            None => {
                if D == 1 {
                    let mut n = Vector::zero();
                    n[0] = 1.0;
                    n
                } else {
                    return Err(EngineError::Misuse(
                        "facet normals are required above 1-D".into(),
                    ));
                }
            }
        };
        Ok((area, normal))
    }

    /// Allocate supports, lumped masses, and the spatial index, and
    /// hand everything to the driver. Must be called exactly once,
    /// after all inserts; consuming the builder enforces that.
    pub fn create_model(mut self) -> Result<Model<D>> {
        if self.bodies.is_empty() {
            return Err(EngineError::Misuse("create_model with no bodies".into()));
        }
        let pool = match self.pool.take() {
            Some(p) => p,
            None => Arc::new(
                rayon::ThreadPoolBuilder::new()
                    .build()
                    .map_err(|e| EngineError::Misuse(format!("thread pool: {e}")))?,
            ),
        };

        let mut search = CellBucketSearch::<D>::new(self.search_range);
        let ambient = crate::local_state::embed_positions(&self.arena, &self.dofs);
        let cloud: Vec<(NodeId, Vector<D>)> = ambient
            .iter()
            .enumerate()
            .map(|(slot, x)| (self.arena.id(slot), *x))
            .collect();
        search.rebuild(&cloud);

        let kernel = LmeKernel::new(self.lme);
        let arena = &self.arena;
        let multi_body = self.multi_body;
        let posfn = |id: NodeId| ambient[arena.slot(id).unwrap()];
        let mut scratch = Vec::new();
        for mp in self.mps.iter_mut() {
            let body = &self.bodies[mp.body];
            let gamma = body
                .gamma_field
                .as_ref()
                .map(|g| g(&mp.position))
                .unwrap_or(body.data.gamma);
            let carrier = mp.carrier;
            // In multi-body mode a point only admits nodes of its own
            // carrier into the support.
            search.query(&mp.position, self.search_range, &mut scratch)?;
            if multi_body {
                scratch.retain(|&id| arena.carrier(arena.slot(id).unwrap()) == carrier);
            }
            scratch.sort_unstable();
            let candidates: Vec<(NodeId, Vector<D>)> =
                scratch.iter().map(|&id| (id, posfn(id))).collect();
            let beta = otm_lme::beta_from_spacing(gamma, mp.h);
            let shape = match kernel.evaluate(
                Some(mp.id),
                &mp.position,
                &candidates,
                beta,
                mp.h,
                &mp.lambda,
                false,
            ) {
                Ok(s) => s,
                Err(e) if e.is_recoverable() => {
                    // one retry with an expanded neighborhood
                    search.query(&mp.position, 1.5 * self.search_range, &mut scratch)?;
                    if multi_body {
                        scratch.retain(|&id| arena.carrier(arena.slot(id).unwrap()) == carrier);
                    }
                    scratch.sort_unstable();
                    let candidates: Vec<(NodeId, Vector<D>)> =
                        scratch.iter().map(|&id| (id, posfn(id))).collect();
                    kernel.evaluate(
                        Some(mp.id),
                        &mp.position,
                        &candidates,
                        beta,
                        mp.h,
                        &mp.lambda,
                        false,
                    )?
                }
                Err(e) => return Err(e),
            };
            mp.apply_shape(&shape);
        }

        info!(
            "created model: {} nodes, {} material points, {} bodies",
            self.arena.len(),
            self.mps.len(),
            self.bodies.len()
        );

        let mut model = Model {
            clock: self.clock,
            search_range: self.search_range,
            multi_body: self.multi_body,
            adaptive_search: self.adaptive_search,
            threading: self.threading,
            pool,
            lme: kernel,
            propagator: CentralDifference::new(self.gamma_newmark),
            thermal: self.thermal,
            critical_mass_factor: self.critical_mass_factor,
            erosion: self.erosion,
            rank: self.rank,
            position_ref: ambient,
            arena: self.arena,
            dofs: self.dofs,
            mps: self.mps,
            bodies: self.bodies,
            tractions: self.tractions,
            fluxes: self.fluxes,
            body_forces: self.body_forces,
            contacts: self.contacts,
            temp_fixed: self.temp_fixed,
            search,
            min_mass: 0.0,
            avg_neighbors: 0,
            release_rates: Default::default(),
            fracture_dissipated: 0.0,
            max_steps: u64::MAX,
            end_time: None,
        };
        model.recompute_mass();
        model.update_detached();
        Ok(model)
    }
}

fn plane_embedding<const D: usize>(origin: Vector<D>, normal: &Vector<D>) -> Embedding<D> {
    let n = normal.scale(1.0 / normal.norm());
    // Gram-Schmidt the coordinate axes against the normal.
    let mut columns: Vec<Vector<D>> = Vec::with_capacity(D - 1);
    for axis in 0..D {
        if columns.len() == D - 1 {
            break;
        }
        let mut e = Vector::zero();
        e[axis] = 1.0;
        let mut v = e - n.scale(n.dot(&e));
        for c in &columns {
            v -= c.scale(c.dot(&v));
        }
        let len = v.norm();
        if len > 1e-10 {
            columns.push(v.scale(1.0 / len));
        }
    }
    Embedding::new(origin, columns)
}
