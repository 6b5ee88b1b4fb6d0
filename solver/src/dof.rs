//! Reduced nodal state arrays.
//!
//! Slot-indexed parallel arrays; the model keeps the slot ↔ node-id
//! mapping. Positions, velocities, and accelerations live in the
//! reduced (free) coordinate space of each DOF; embeddings into
//! ambient space are the model's concern.

use otm_algebra::{Real, Vector};

#[derive(Clone, Debug, Default)]
pub struct DofState<const D: usize> {
    pub mass: Vec<Real>,
    pub position: Vec<Vector<D>>,
    pub velocity: Vec<Vector<D>>,
    pub acceleration: Vec<Vector<D>>,
    pub temperature: Vec<Real>,
    /// Detached DOFs coast: no mass accumulation, no acceleration
    /// update.
    pub detached: Vec<bool>,
}

impl<const D: usize> DofState<D> {
    pub fn with_len(n: usize) -> Self {
        DofState {
            mass: vec![0.0; n],
            position: vec![Vector::zero(); n],
            velocity: vec![Vector::zero(); n],
            acceleration: vec![Vector::zero(); n],
            temperature: vec![0.0; n],
            detached: vec![false; n],
        }
    }

    pub fn len(&self) -> usize {
        self.mass.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mass.is_empty()
    }

    pub fn push_default(&mut self) -> usize {
        self.mass.push(0.0);
        self.position.push(Vector::zero());
        self.velocity.push(Vector::zero());
        self.acceleration.push(Vector::zero());
        self.temperature.push(0.0);
        self.detached.push(false);
        self.mass.len() - 1
    }

    /// Total linear momentum in reduced coordinates, skipping detached
    /// DOFs.
    pub fn momentum(&self) -> Vector<D> {
        let mut p = Vector::zero();
        for i in 0..self.len() {
            if !self.detached[i] {
                p += self.velocity[i].scale(self.mass[i]);
            }
        }
        p
    }

    /// Nodal kinetic energy, skipping detached DOFs.
    pub fn kinetic_energy(&self) -> Real {
        let mut ke = 0.0;
        for i in 0..self.len() {
            if !self.detached[i] {
                ke += 0.5 * self.mass[i] * self.velocity[i].norm_sq();
            }
        }
        ke
    }
}
