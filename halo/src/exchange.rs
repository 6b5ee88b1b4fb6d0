//! Per-step halo exchange.
//!
//! Bounding boxes are advertised with an all-gather; pairwise overlap
//! of the extended boxes defines the communication graph. Each step:
//! node data flows to every overlapping neighbor (partial lumped mass
//! additive, kinematics overwritten when the sender is the owner,
//! unknown nodes instantiated as shadows), and after force assembly
//! the shadow contributions flow back to each node's home rank.

use log::debug;

use otm_algebra::{Real, Vector};
use otm_model::Model;
use otm_traits::comm::{RankComm, Tag};
use otm_traits::{NodeId, Rank, Result, StepStatus};

use crate::balance::LoadBalancer;
use crate::records::{Buf, Cur, NodeRecord};

const TAG_NODES: Tag = 1;
const TAG_FORCES: Tag = 2;

pub struct DistributedModel<const D: usize, C: RankComm> {
    pub model: Model<D>,
    pub comm: C,
    /// Extended-box margin around the owned point cloud.
    pub margin: Real,
    pub balancer: LoadBalancer,
    /// Ranks this rank exchanges with (pairwise box overlap).
    pub(crate) recv_graph: Vec<Rank>,
    pub(crate) boxes: Vec<([Real; 3], [Real; 3])>,
}

impl<const D: usize, C: RankComm> DistributedModel<D, C> {
    pub fn new(model: Model<D>, comm: C) -> Self {
        let margin = 2.0 * model.search_range();
        DistributedModel {
            model,
            comm,
            margin,
            balancer: LoadBalancer::default(),
            recv_graph: Vec::new(),
            boxes: Vec::new(),
        }
    }

    pub fn neighbors(&self) -> &[Rank] {
        &self.recv_graph
    }

    fn local_box(&self) -> ([Real; 3], [Real; 3]) {
        let mut lo = [Real::INFINITY; 3];
        let mut hi = [Real::NEG_INFINITY; 3];
        for mp in self.model.material_points().iter().filter(|m| m.active) {
            for i in 0..D.min(3) {
                lo[i] = lo[i].min(mp.position[i] - self.margin);
                hi[i] = hi[i].max(mp.position[i] + self.margin);
            }
        }
        (lo, hi)
    }

    fn boxes_overlap(a: &([Real; 3], [Real; 3]), b: &([Real; 3], [Real; 3])) -> bool {
        (0..D.min(3)).all(|i| a.0[i] <= b.1[i] && b.0[i] <= a.1[i])
    }

    fn point_in_box(x: &Vector<D>, b: &([Real; 3], [Real; 3])) -> bool {
        (0..D.min(3)).all(|i| x[i] >= b.0[i] && x[i] <= b.1[i])
    }

    /// Publish the local bounding box and rebuild the communication
    /// graph from pairwise overlap.
    pub fn advertise(&mut self) {
        let (lo, hi) = self.local_box();
        let mut buf = Buf::new();
        for v in lo.iter().chain(hi.iter()) {
            buf.f64(*v);
        }
        let gathered = self.comm.all_gather(buf.data);
        self.boxes.clear();
        for payload in gathered {
            let mut cur = Cur::new(&payload);
            let mut lo = [0.0; 3];
            let mut hi = [0.0; 3];
            for v in lo.iter_mut().chain(hi.iter_mut()) {
                *v = cur.f64().unwrap_or(0.0);
            }
            self.boxes.push((lo, hi));
        }
        let me = self.comm.rank();
        let mine = self.boxes[me];
        self.recv_graph = (0..self.comm.size())
            .filter(|&r| r != me && Self::boxes_overlap(&mine, &self.boxes[r]))
            .collect();
        debug!("rank {me}: neighbors {:?}", self.recv_graph);
    }

    /// Synchronize shadow nodes: partial masses, kinematics, and
    /// embeddings; unknown nodes are created on first sight.
    pub fn exchange(&mut self) -> Result<()> {
        self.advertise();
        // local partial masses from owned points
        self.model.recompute_mass();
        let ambient = self.model.ambient_positions();

        for &r in &self.recv_graph {
            let target_box = self.boxes[r];
            let mut buf = Buf::new();
            let mut count = 0u64;
            let mut body = Buf::new();
            for slot in 0..self.model.arena().len() {
                if !Self::point_in_box(&ambient[slot], &target_box) {
                    continue;
                }
                let arena = self.model.arena();
                let dofs = self.model.dofs();
                NodeRecord::<D> {
                    id: arena.id(slot),
                    carrier: arena.carrier(slot),
                    home: arena.home_rank(slot),
                    mass_partial: dofs.mass[slot],
                    position: dofs.position[slot],
                    velocity: dofs.velocity[slot],
                    acceleration: dofs.acceleration[slot],
                    temperature: dofs.temperature[slot],
                    embedding: arena.embedding(slot).cloned(),
                }
                .encode(&mut body);
                count += 1;
            }
            buf.u64(count);
            buf.data.extend_from_slice(&body.data);
            self.comm.send(r, TAG_NODES, buf.data);
        }

        let graph = self.recv_graph.clone();
        for r in graph {
            let payload = self.comm.recv(r, TAG_NODES);
            let mut cur = Cur::new(&payload);
            let count = cur.u64()?;
            for _ in 0..count {
                let rec = NodeRecord::<D>::decode(&mut cur)?;
                let slot = self.model.ensure_node(
                    rec.id,
                    rec.carrier,
                    rec.home,
                    rec.embedding.clone(),
                    rec.position,
                )?;
                let dofs = self.model.dofs_mut();
                dofs.mass[slot] += rec.mass_partial;
                // kinematics are authoritative only from the owner
                if rec.home == r {
                    dofs.position[slot] = rec.position;
                    dofs.velocity[slot] = rec.velocity;
                    dofs.acceleration[slot] = rec.acceleration;
                    dofs.temperature[slot] = rec.temperature;
                }
            }
        }
        Ok(())
    }

    /// Route shadow-node force contributions back to their home rank
    /// and add the deltas received for owned nodes.
    pub fn return_force_deltas(&mut self, forces: &mut [Vector<D>]) -> Result<()> {
        let me = self.comm.rank();
        for &r in &self.recv_graph {
            let mut buf = Buf::new();
            let mut count = 0u64;
            let mut body = Buf::new();
            for slot in 0..self.model.arena().len() {
                if self.model.arena().home_rank(slot) == r && forces[slot].norm_sq() > 0.0 {
                    body.u64(self.model.arena().id(slot).0);
                    body.vector(&forces[slot]);
                    count += 1;
                }
            }
            buf.u64(count);
            buf.data.extend_from_slice(&body.data);
            self.comm.send(r, TAG_FORCES, buf.data);
        }
        let graph = self.recv_graph.clone();
        for r in graph {
            let payload = self.comm.recv(r, TAG_FORCES);
            let mut cur = Cur::new(&payload);
            let count = cur.u64()?;
            for _ in 0..count {
                let id = NodeId(cur.u64()?);
                let delta: Vector<D> = cur.vector()?;
                if let Some(slot) = self.model.arena().slot(id) {
                    if self.model.arena().home_rank(slot) == me {
                        forces[slot] += delta;
                    }
                }
            }
        }
        Ok(())
    }

    /// Write the rank-local checkpoint: the model state plus this
    /// rank's communication-graph entries (ownership and shadow flags
    /// ride with the node records).
    pub fn write_checkpoint<W: std::io::Write>(&self, w: &mut W) -> Result<()> {
        self.model.write_checkpoint(w)?;
        let mut buf = Buf::new();
        buf.u64(self.recv_graph.len() as u64);
        for &r in &self.recv_graph {
            buf.u64(r as u64);
        }
        w.write_all(&buf.data)?;
        Ok(())
    }

    /// Restore a rank-local checkpoint and rebuild the supports for
    /// the restored configuration.
    pub fn read_checkpoint<R: std::io::Read>(&mut self, r: &mut R) -> Result<()> {
        self.model.read_checkpoint(r)?;
        let mut word = [0u8; 8];
        r.read_exact(&mut word)?;
        let n = u64::from_le_bytes(word) as usize;
        self.recv_graph.clear();
        for _ in 0..n {
            r.read_exact(&mut word)?;
            self.recv_graph.push(u64::from_le_bytes(word) as usize);
        }
        self.model.reset()
    }

    /// One distributed step: exchange, predict, assemble, return force
    /// deltas, correct, advance, erode.
    pub fn step(&mut self) -> Result<StepStatus> {
        self.exchange()?;
        self.model.update_detached_from_mass();
        self.model.predictor()?;
        let mut forces = self.model.assemble_forces()?;
        self.return_force_deltas(&mut forces)?;
        self.model.corrector(&forces)?;
        self.model.advance_mps()?;
        if self.model.erosion_enabled() {
            self.model.erode()?;
        }
        Ok(StepStatus::StepTaken)
    }
}
