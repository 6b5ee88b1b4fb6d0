//! Checkpoint codec.
//!
//! Implementation-defined binary format, stable within a major
//! version: little-endian throughout, all integers 64-bit. Per node:
//! id, carrier, kinematics, constraint map. Per material point: full
//! kinematic and thermal state, the stored multiplier, the support
//! list, and the constitutive internal variables. The distributed
//! layer appends its ownership sets on top of this record.

use std::io::{Read, Write};

use otm_algebra::{Embedding, Hom, Real, Vector};
use otm_traits::{EngineError, Result};

use crate::model::Model;

const MAGIC: &[u8; 8] = b"OTMCKPT1";

pub(crate) struct Encoder<'w, W: Write> {
    w: &'w mut W,
}

impl<'w, W: Write> Encoder<'w, W> {
    pub fn new(w: &'w mut W) -> Self {
        Encoder { w }
    }

    pub fn u64(&mut self, v: u64) -> Result<()> {
        self.w.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    pub fn f64(&mut self, v: Real) -> Result<()> {
        self.w.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    pub fn bool(&mut self, v: bool) -> Result<()> {
        self.u64(v as u64)
    }

    pub fn vector<const D: usize>(&mut self, v: &Vector<D>) -> Result<()> {
        for i in 0..D {
            self.f64(v[i])?;
        }
        Ok(())
    }

    pub fn hom<const D: usize>(&mut self, h: &Hom<D, D>) -> Result<()> {
        for j in 0..D {
            self.vector(&h.col(j))?;
        }
        Ok(())
    }
}

pub(crate) struct Decoder<'r, R: Read> {
    r: &'r mut R,
}

impl<'r, R: Read> Decoder<'r, R> {
    pub fn new(r: &'r mut R) -> Self {
        Decoder { r }
    }

    pub fn u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.r.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn f64(&mut self) -> Result<Real> {
        let mut buf = [0u8; 8];
        self.r.read_exact(&mut buf)?;
        Ok(Real::from_le_bytes(buf))
    }

    pub fn bool(&mut self) -> Result<bool> {
        Ok(self.u64()? != 0)
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

impl<const D: usize> Model<D> {
    pub fn write_checkpoint<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(MAGIC)?;
        let mut e = Encoder::new(w);
        e.u64(D as u64)?;
        e.f64(self.clock.time())?;
        e.f64(self.clock.dt())?;
        e.u64(self.clock.step_count())?;

        e.u64(self.arena.len() as u64)?;
        for slot in 0..self.arena.len() {
            e.u64(self.arena.id(slot).0)?;
            e.u64(self.arena.carrier(slot).0 as u64)?;
            e.u64(self.arena.home_rank(slot) as u64)?;
            e.bool(self.arena.is_shadow(slot))?;
            e.bool(self.dofs.detached[slot])?;
            e.bool(self.temp_fixed[slot])?;
            e.f64(self.dofs.mass[slot])?;
            e.vector(&self.dofs.position[slot])?;
            e.vector(&self.dofs.velocity[slot])?;
            e.vector(&self.dofs.acceleration[slot])?;
            e.f64(self.dofs.temperature[slot])?;
            match self.arena.embedding(slot) {
                None => e.u64(u64::MAX)?,
                Some(emb) => {
                    e.u64(emb.reduced_dim() as u64)?;
                    e.vector(emb.origin())?;
                    for col in emb.columns() {
                        e.vector(col)?;
                    }
                }
            }
        }

        e.u64(self.mps.len() as u64)?;
        for mp in &self.mps {
            e.u64(mp.id.0)?;
            e.u64(mp.body as u64)?;
            e.u64(mp.carrier.0 as u64)?;
            e.bool(mp.active)?;
            e.vector(&mp.position)?;
            e.vector(&mp.position_committed)?;
            e.vector(&mp.position_rebuilt)?;
            e.vector(&mp.position_ref)?;
            e.hom(&mp.f)?;
            e.hom(&mp.f_old)?;
            e.f64(mp.volume_ref)?;
            e.f64(mp.volume)?;
            e.f64(mp.mass)?;
            e.f64(mp.h)?;
            e.f64(mp.temperature)?;
            e.f64(mp.reaction)?;
            e.vector(&mp.lambda)?;
            e.f64(mp.free_energy)?;
            e.f64(mp.dissipated)?;
            e.f64(mp.dissipated_prev)?;
            e.u64(mp.support.len() as u64)?;
            for entry in &mp.support {
                e.u64(entry.node.0)?;
                e.f64(entry.weight)?;
                e.vector(&entry.grad)?;
            }
            e.u64(mp.state.vars.len() as u64)?;
            for v in &mp.state.vars {
                e.f64(*v)?;
            }
        }
        Ok(())
    }

    /// Restore state written by [`write_checkpoint`](Self::write_checkpoint)
    /// into a model built from the same configuration. Node and point
    /// id sets must match.
    pub fn read_checkpoint<R: Read>(&mut self, r: &mut R) -> Result<()> {
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(EngineError::Codec("bad checkpoint magic".into()));
        }
        let mut d = Decoder::new(r);
        let dim = d.u64()?;
        if dim != D as u64 {
            return Err(EngineError::Codec(format!(
                "dimension mismatch: checkpoint {dim}, model {D}"
            )));
        }
        let time = d.f64()?;
        let dt = d.f64()?;
        let step = d.u64()?;
        self.clock = otm_solver::Clock::restore(time, dt, step);

        let n = d.u64()? as usize;
        if n != self.arena.len() {
            return Err(EngineError::Codec(format!(
                "node count mismatch: checkpoint {n}, model {}",
                self.arena.len()
            )));
        }
        for _ in 0..n {
            let id = otm_traits::NodeId(d.u64()?);
            let slot = self.arena.slot(id).ok_or_else(|| {
                EngineError::Codec(format!("checkpoint node {id:?} unknown to this model"))
            })?;
            let _carrier = d.u64()?;
            let home = d.u64()? as usize;
            let shadow = d.bool()?;
            self.arena.set_home_rank(slot, home);
            self.arena.set_shadow(slot, shadow);
            self.dofs.detached[slot] = d.bool()?;
            self.temp_fixed[slot] = d.bool()?;
            self.dofs.mass[slot] = d.f64()?;
            self.dofs.position[slot] = d.vector()?;
            self.dofs.velocity[slot] = d.vector()?;
            self.dofs.acceleration[slot] = d.vector()?;
            self.dofs.temperature[slot] = d.f64()?;
            let emb_dim = d.u64()?;
            if emb_dim == u64::MAX {
                self.arena.set_embedding(slot, None);
            } else {
                let origin = d.vector()?;
                let mut columns = Vec::with_capacity(emb_dim as usize);
                for _ in 0..emb_dim {
                    columns.push(d.vector()?);
                }
                self.arena
                    .set_embedding(slot, Some(Embedding::new(origin, columns)));
            }
        }

        let m = d.u64()? as usize;
        if m != self.mps.len() {
            return Err(EngineError::Codec(format!(
                "point count mismatch: checkpoint {m}, model {}",
                self.mps.len()
            )));
        }
        for mp in self.mps.iter_mut() {
            let id = d.u64()?;
            if id != mp.id.0 {
                return Err(EngineError::Codec(format!(
                    "point id mismatch: checkpoint {id}, model {}",
                    mp.id.0
                )));
            }
            mp.body = d.u64()? as usize;
            let _carrier = d.u64()?;
            mp.active = d.bool()?;
            mp.position = d.vector()?;
            mp.position_committed = d.vector()?;
            mp.position_rebuilt = d.vector()?;
            mp.position_ref = d.vector()?;
            mp.f = d.hom()?;
            mp.f_old = d.hom()?;
            mp.volume_ref = d.f64()?;
            mp.volume = d.f64()?;
            mp.mass = d.f64()?;
            mp.h = d.f64()?;
            mp.temperature = d.f64()?;
            mp.reaction = d.f64()?;
            mp.lambda = d.vector()?;
            mp.free_energy = d.f64()?;
            mp.dissipated = d.f64()?;
            mp.dissipated_prev = d.f64()?;
            let ns = d.u64()? as usize;
            mp.support.clear();
            for _ in 0..ns {
                let node = otm_traits::NodeId(d.u64()?);
                let weight = d.f64()?;
                let grad = d.vector()?;
                mp.support.push(otm_element::SupportEntry { node, weight, grad });
            }
            let nv = d.u64()? as usize;
            mp.state.vars.clear();
            for _ in 0..nv {
                mp.state.vars.push(d.f64()?);
            }
        }
        Ok(())
    }
}
