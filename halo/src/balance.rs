//! Cost-driven dynamic load balance.
//!
//! Per-point cost estimates (support sizes from prior steps) are
//! gathered from every rank; when the relative spread exceeds the
//! threshold, points migrate by value along the communication graph —
//! greedily from the most loaded rank toward its cheapest neighbor, or
//! diffusively from every rank proportional to the cost differential.
//! Node ownership follows the points: after migration a node is homed
//! on the rank holding the plurality of points referencing it.

use std::collections::{HashMap, HashSet};

use log::info;

use otm_algebra::Real;
use otm_traits::comm::{RankComm, Tag};
use otm_traits::{MpId, NodeId, Rank, Result};

use crate::exchange::DistributedModel;
use crate::records::{decode_mp, encode_mp, Buf, Cur};

const TAG_MIGRATE: Tag = 3;
const TAG_OWNERSHIP: Tag = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BalancePolicy {
    /// Move work from the most loaded rank to its cheapest neighbor
    /// until the spread is back under the threshold.
    Greedy,
    /// Every rank sheds a fraction of its excess to every neighbor,
    /// proportional to the cost differential.
    Diffusive,
}

#[derive(Clone, Copy, Debug)]
pub struct LoadBalancer {
    /// Relative cost spread (std dev over mean) that triggers
    /// rebalancing.
    pub threshold: Real,
    pub policy: BalancePolicy,
    /// Diffusive shed fraction per neighbor pair.
    pub diffusion: Real,
}

impl Default for LoadBalancer {
    fn default() -> Self {
        LoadBalancer {
            threshold: 0.3,
            policy: BalancePolicy::Greedy,
            diffusion: 0.5,
        }
    }
}

impl LoadBalancer {
    /// Planned cost flow (from, to, amount), identical on every rank
    /// given identical inputs.
    fn plan(
        &self,
        costs: &[Real],
        adjacency: &dyn Fn(Rank, Rank) -> bool,
    ) -> Vec<(Rank, Rank, Real)> {
        let n = costs.len();
        if n < 2 {
            return Vec::new();
        }
        let mean = costs.iter().sum::<Real>() / n as Real;
        if mean <= 0.0 {
            return Vec::new();
        }
        let var = costs.iter().map(|c| (c - mean) * (c - mean)).sum::<Real>() / n as Real;
        if var.sqrt() / mean <= self.threshold {
            return Vec::new();
        }
        match self.policy {
            BalancePolicy::Greedy => {
                let (src, &src_cost) = costs
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
                    .unwrap();
                let dst = (0..n)
                    .filter(|&r| r != src && adjacency(src, r))
                    .min_by(|&a, &b| costs[a].partial_cmp(&costs[b]).unwrap());
                match dst {
                    Some(dst) => vec![(src, dst, (src_cost - mean) / 2.0)],
                    None => Vec::new(),
                }
            }
            BalancePolicy::Diffusive => {
                let mut flows = Vec::new();
                for from in 0..n {
                    for to in 0..n {
                        if from == to || !adjacency(from, to) {
                            continue;
                        }
                        let diff = costs[from] - costs[to];
                        if diff > 0.0 {
                            flows.push((from, to, self.diffusion * diff / 2.0));
                        }
                    }
                }
                flows
            }
        }
    }
}

impl<const D: usize, C: RankComm> DistributedModel<D, C> {
    fn local_cost(&self) -> Real {
        self.model
            .material_points()
            .iter()
            .filter(|m| m.active)
            .map(|m| m.cost as Real)
            .sum()
    }

    /// Rebalance if the gathered cost spread exceeds the threshold.
    /// Returns the number of points that left this rank.
    pub fn rebalance(&mut self) -> Result<usize> {
        let mut buf = Buf::new();
        buf.f64(self.local_cost());
        let gathered = self.comm.all_gather(buf.data);
        let mut costs = Vec::with_capacity(gathered.len());
        for payload in &gathered {
            costs.push(Cur::new(payload).f64()?);
        }

        let boxes = self.boxes.clone();
        let overlap = |a: Rank, b: Rank| -> bool {
            if a >= boxes.len() || b >= boxes.len() {
                return false;
            }
            (0..D.min(3)).all(|i| boxes[a].0[i] <= boxes[b].1[i] && boxes[b].0[i] <= boxes[a].1[i])
        };
        let flows = self.balancer.plan(&costs, &overlap);
        if flows.is_empty() {
            return Ok(0);
        }
        info!("rebalancing: planned flows {flows:?}");

        let me = self.comm.rank();
        let mut migrated_out = 0usize;
        let mut touched: HashSet<NodeId> = HashSet::new();

        for &(from, to, amount) in &flows {
            if from == me {
                let ids = self.select_points_toward(to, amount);
                migrated_out += ids.len();
                let points = self.model.extract_points(&ids);
                let mut buf = Buf::new();
                buf.u64(points.len() as u64);
                for mp in &points {
                    for e in &mp.support {
                        touched.insert(e.node);
                    }
                    encode_mp(mp, &mut buf);
                }
                // bundle the support-node records so the receiver can
                // instantiate unknown nodes
                let mut node_ids: Vec<NodeId> = points
                    .iter()
                    .flat_map(|mp| mp.support.iter().map(|e| e.node))
                    .collect();
                node_ids.sort_unstable();
                node_ids.dedup();
                buf.u64(node_ids.len() as u64);
                for id in node_ids {
                    let slot = self.model.arena().slot(id).unwrap();
                    let arena = self.model.arena();
                    let dofs = self.model.dofs();
                    crate::records::NodeRecord::<D> {
                        id,
                        carrier: arena.carrier(slot),
                        home: arena.home_rank(slot),
                        mass_partial: 0.0,
                        position: dofs.position[slot],
                        velocity: dofs.velocity[slot],
                        acceleration: dofs.acceleration[slot],
                        temperature: dofs.temperature[slot],
                        embedding: arena.embedding(slot).cloned(),
                    }
                    .encode(&mut buf);
                }
                self.comm.send(to, TAG_MIGRATE, buf.data);
            } else if to == me {
                let payload = self.comm.recv(from, TAG_MIGRATE);
                let mut cur = Cur::new(&payload);
                let count = cur.u64()?;
                let mut incoming = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let mp = decode_mp::<D>(&mut cur)?;
                    for e in &mp.support {
                        touched.insert(e.node);
                    }
                    incoming.push(mp);
                }
                let nodes = cur.u64()?;
                for _ in 0..nodes {
                    let rec = crate::records::NodeRecord::<D>::decode(&mut cur)?;
                    let slot = self.model.ensure_node(
                        rec.id,
                        rec.carrier,
                        rec.home,
                        rec.embedding.clone(),
                        rec.position,
                    )?;
                    if self.model.arena().home_rank(slot) != rec.home {
                        return Err(otm_traits::EngineError::MigrationMismatch {
                            node: rec.id,
                            detail: format!(
                                "home {} conflicts with local {}",
                                rec.home,
                                self.model.arena().home_rank(slot)
                            ),
                        });
                    }
                    let dofs = self.model.dofs_mut();
                    dofs.position[slot] = rec.position;
                    dofs.velocity[slot] = rec.velocity;
                    dofs.acceleration[slot] = rec.acceleration;
                    dofs.temperature[slot] = rec.temperature;
                }
                for mp in incoming {
                    self.model.insert_point(mp);
                }
            }
        }

        self.reassign_ownership(&touched)?;
        self.model.recompute_mass();
        self.model.update_detached_from_mass();
        Ok(migrated_out)
    }

    /// Owned active points nearest the target rank's box center, taken
    /// until the requested cost amount is covered.
    fn select_points_toward(&self, to: Rank, amount: Real) -> Vec<MpId> {
        let center: [Real; 3] = {
            let (lo, hi) = self.boxes[to];
            std::array::from_fn(|i| 0.5 * (lo[i] + hi[i]))
        };
        let mut candidates: Vec<(Real, MpId, Real)> = self
            .model
            .material_points()
            .iter()
            .filter(|m| m.active)
            .map(|m| {
                let mut d2 = 0.0;
                for i in 0..D.min(3) {
                    let dx = m.position[i] - center[i];
                    d2 += dx * dx;
                }
                (d2, m.id, m.cost as Real)
            })
            .collect();
        candidates.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        let mut out = Vec::new();
        let mut moved = 0.0;
        for (_, id, cost) in candidates {
            if moved >= amount {
                break;
            }
            out.push(id);
            moved += cost;
        }
        out
    }

    /// A node is homed on the rank holding the plurality of points
    /// that reference it; ties go to the lowest rank. Only nodes
    /// touched by the migration are revisited: the touched sets are
    /// unioned first so every rank votes, not just the two endpoints
    /// of a transfer.
    fn reassign_ownership(&mut self, touched: &HashSet<NodeId>) -> Result<()> {
        // phase 1: union of touched ids across ranks
        let mut buf = Buf::new();
        let mut sorted: Vec<NodeId> = touched.iter().copied().collect();
        sorted.sort_unstable();
        buf.u64(sorted.len() as u64);
        for id in &sorted {
            buf.u64(id.0);
        }
        let gathered = self.comm.all_gather(buf.data);
        let mut union: HashSet<NodeId> = HashSet::new();
        for payload in &gathered {
            let mut cur = Cur::new(payload);
            let n = cur.u64()?;
            for _ in 0..n {
                union.insert(NodeId(cur.u64()?));
            }
        }
        if union.is_empty() {
            return Ok(());
        }

        // phase 2: everyone counts its references over the union
        let mut counts: HashMap<NodeId, u64> = HashMap::new();
        for mp in self.model.material_points().iter().filter(|m| m.active) {
            for e in &mp.support {
                if union.contains(&e.node) {
                    *counts.entry(e.node).or_insert(0) += 1;
                }
            }
        }
        let mut buf = Buf::new();
        buf.u64(counts.len() as u64);
        let mut sorted: Vec<_> = counts.into_iter().collect();
        sorted.sort_unstable_by_key(|(id, _)| *id);
        for (id, c) in &sorted {
            buf.u64(id.0);
            buf.u64(*c);
        }
        let me = self.comm.rank();
        for r in 0..self.comm.size() {
            if r != me {
                self.comm.send(r, TAG_OWNERSHIP, buf.data.clone());
            }
        }
        let votes_by_rank: Vec<Vec<u8>> = (0..self.comm.size())
            .map(|r| {
                if r == me {
                    buf.data.clone()
                } else {
                    self.comm.recv(r, TAG_OWNERSHIP)
                }
            })
            .collect();

        let mut tallies: HashMap<NodeId, Vec<(u64, Rank)>> = HashMap::new();
        for (rank, payload) in votes_by_rank.iter().enumerate() {
            let mut cur = Cur::new(payload);
            let n = cur.u64()?;
            for _ in 0..n {
                let id = NodeId(cur.u64()?);
                let c = cur.u64()?;
                tallies.entry(id).or_default().push((c, rank));
            }
        }
        for (id, votes) in tallies {
            let (_, owner) = votes
                .iter()
                .copied()
                .max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)))
                .unwrap();
            if let Some(slot) = self.model.arena().slot(id) {
                self.model.arena_mut().set_home_rank(slot, owner);
                self.model.arena_mut().set_shadow(slot, owner != me);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn greedy_plan_moves_from_max_to_min() {
        let lb = LoadBalancer {
            threshold: 0.1,
            policy: BalancePolicy::Greedy,
            diffusion: 0.5,
        };
        let costs = vec![10.0, 100.0, 20.0];
        let all = |_: Rank, _: Rank| true;
        let flows = lb.plan(&costs, &all);
        assert_eq!(flows.len(), 1);
        let (from, to, amount) = flows[0];
        assert_eq!(from, 1);
        assert_eq!(to, 0);
        assert!(amount > 0.0);
    }

    #[test]
    fn balanced_costs_produce_no_flow() {
        let lb = LoadBalancer::default();
        let costs = vec![50.0, 52.0, 49.0, 51.0];
        let all = |_: Rank, _: Rank| true;
        assert!(lb.plan(&costs, &all).is_empty());
    }

    #[test]
    fn diffusive_plan_sheds_to_every_cheaper_neighbor() {
        let lb = LoadBalancer {
            threshold: 0.1,
            policy: BalancePolicy::Diffusive,
            diffusion: 0.5,
        };
        let costs = vec![100.0, 10.0, 10.0];
        let all = |_: Rank, _: Rank| true;
        let flows = lb.plan(&costs, &all);
        assert_eq!(flows.len(), 2);
        assert!(flows.iter().all(|&(from, _, _)| from == 0));
    }
}
