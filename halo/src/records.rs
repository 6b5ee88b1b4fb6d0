//! Wire records for the halo exchange and migration messages.
//! Little-endian, 64-bit integers, matching the checkpoint
//! conventions.

use otm_algebra::{Embedding, Hom, Real, Vector};
use otm_element::{MpLocalState, SupportEntry};
use otm_traits::{CarrierId, EngineError, MaterialState, MpId, NodeId, Rank, Result};

#[derive(Default)]
pub struct Buf {
    pub data: Vec<u8>,
}

impl Buf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u64(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn f64(&mut self, v: Real) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn vector<const D: usize>(&mut self, v: &Vector<D>) {
        for i in 0..D {
            self.f64(v[i]);
        }
    }

    pub fn hom<const D: usize>(&mut self, h: &Hom<D, D>) {
        for j in 0..D {
            self.vector(&h.col(j));
        }
    }
}

pub struct Cur<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cur<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Cur { data, pos: 0 }
    }

    pub fn done(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(EngineError::Codec("truncated exchange payload".into()));
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn f64(&mut self) -> Result<Real> {
        Ok(Real::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn vector<const D: usize>(&mut self) -> Result<Vector<D>> {
        let mut v = Vector::zero();
        for i in 0..D {
            v[i] = self.f64()?;
        }
        Ok(v)
    }

    pub fn hom<const D: usize>(&mut self) -> Result<Hom<D, D>> {
        let mut h = Hom::zero();
        for j in 0..D {
            let col = self.vector()?;
            h.set_col(j, &col);
        }
        Ok(h)
    }
}

/// Per-node exchange record: identity, partial lumped mass from the
/// sender, kinematics, and the constraint map (reduced dimension plus
/// linear columns, or the free marker).
pub struct NodeRecord<const D: usize> {
    pub id: NodeId,
    pub carrier: CarrierId,
    pub home: Rank,
    pub mass_partial: Real,
    pub position: Vector<D>,
    pub velocity: Vector<D>,
    pub acceleration: Vector<D>,
    pub temperature: Real,
    pub embedding: Option<Embedding<D>>,
}

impl<const D: usize> NodeRecord<D> {
    pub fn encode(&self, buf: &mut Buf) {
        buf.u64(self.id.0);
        buf.u64(self.carrier.0 as u64);
        buf.u64(self.home as u64);
        buf.f64(self.mass_partial);
        buf.vector(&self.position);
        buf.vector(&self.velocity);
        buf.vector(&self.acceleration);
        buf.f64(self.temperature);
        match &self.embedding {
            None => buf.u64(u64::MAX),
            Some(emb) => {
                buf.u64(emb.reduced_dim() as u64);
                buf.vector(emb.origin());
                for col in emb.columns() {
                    buf.vector(col);
                }
            }
        }
    }

    pub fn decode(cur: &mut Cur<'_>) -> Result<Self> {
        let id = NodeId(cur.u64()?);
        let carrier = CarrierId(cur.u64()? as u32);
        let home = cur.u64()? as Rank;
        let mass_partial = cur.f64()?;
        let position = cur.vector()?;
        let velocity = cur.vector()?;
        let acceleration = cur.vector()?;
        let temperature = cur.f64()?;
        let emb_dim = cur.u64()?;
        let embedding = if emb_dim == u64::MAX {
            None
        } else {
            let origin = cur.vector()?;
            let mut columns = Vec::with_capacity(emb_dim as usize);
            for _ in 0..emb_dim {
                columns.push(cur.vector()?);
            }
            Some(Embedding::new(origin, columns))
        };
        Ok(NodeRecord {
            id,
            carrier,
            home,
            mass_partial,
            position,
            velocity,
            acceleration,
            temperature,
            embedding,
        })
    }
}

/// Full material-point migration record.
pub fn encode_mp<const D: usize>(mp: &MpLocalState<D>, buf: &mut Buf) {
    buf.u64(mp.id.0);
    buf.u64(mp.carrier.0 as u64);
    buf.u64(mp.body as u64);
    buf.u64(mp.active as u64);
    buf.vector(&mp.position);
    buf.vector(&mp.position_committed);
    buf.vector(&mp.position_rebuilt);
    buf.vector(&mp.position_ref);
    buf.hom(&mp.f);
    buf.hom(&mp.f_old);
    buf.f64(mp.volume_ref);
    buf.f64(mp.volume);
    buf.f64(mp.mass);
    buf.f64(mp.h);
    buf.f64(mp.temperature);
    buf.f64(mp.reaction);
    buf.vector(&mp.lambda);
    buf.f64(mp.free_energy);
    buf.f64(mp.dissipated);
    buf.f64(mp.dissipated_prev);
    buf.u64(mp.cost as u64);
    buf.u64(mp.support.len() as u64);
    for e in &mp.support {
        buf.u64(e.node.0);
        buf.f64(e.weight);
        buf.vector(&e.grad);
    }
    buf.u64(mp.state.vars.len() as u64);
    for v in &mp.state.vars {
        buf.f64(*v);
    }
}

pub fn decode_mp<const D: usize>(cur: &mut Cur<'_>) -> Result<MpLocalState<D>> {
    let id = MpId(cur.u64()?);
    let carrier = CarrierId(cur.u64()? as u32);
    let body = cur.u64()? as usize;
    let active = cur.u64()? != 0;
    let position = cur.vector()?;
    let position_committed = cur.vector()?;
    let position_rebuilt = cur.vector()?;
    let position_ref = cur.vector()?;
    let f = cur.hom()?;
    let f_old = cur.hom()?;
    let volume_ref = cur.f64()?;
    let volume = cur.f64()?;
    let mass = cur.f64()?;
    let h = cur.f64()?;
    let temperature = cur.f64()?;
    let reaction = cur.f64()?;
    let lambda = cur.vector()?;
    let free_energy = cur.f64()?;
    let dissipated = cur.f64()?;
    let dissipated_prev = cur.f64()?;
    let cost = cur.u64()? as u32;
    let ns = cur.u64()? as usize;
    let mut support = Vec::with_capacity(ns);
    for _ in 0..ns {
        let node = NodeId(cur.u64()?);
        let weight = cur.f64()?;
        let grad = cur.vector()?;
        support.push(SupportEntry { node, weight, grad });
    }
    let nv = cur.u64()? as usize;
    let mut vars = Vec::with_capacity(nv);
    for _ in 0..nv {
        vars.push(cur.f64()?);
    }

    let mut mp = MpLocalState::new(
        id,
        carrier,
        body,
        position,
        volume_ref,
        mass,
        h,
        MaterialState { vars },
    );
    mp.active = active;
    mp.position_committed = position_committed;
    mp.position_rebuilt = position_rebuilt;
    mp.position_ref = position_ref;
    mp.f = f;
    mp.f_old = f_old;
    mp.volume = volume;
    mp.temperature = temperature;
    mp.reaction = reaction;
    mp.lambda = lambda;
    mp.free_energy = free_energy;
    mp.dissipated = dissipated;
    mp.dissipated_prev = dissipated_prev;
    mp.cost = cost;
    mp.support = support;
    Ok(mp)
}
