//! Global local state: the bridge between the reduced (free) DOF
//! representation the propagator drives and the ambient configuration
//! every element sees. These functions are the only places that know
//! about constraints.

use otm_algebra::Vector;
use otm_solver::DofState;

use crate::arena::NodeArena;

/// Ambient positions for every slot: constrained DOFs go through their
/// embedding, free DOFs are already ambient.
pub fn embed_positions<const D: usize>(
    arena: &NodeArena<D>,
    dofs: &DofState<D>,
) -> Vec<Vector<D>> {
    (0..arena.len())
        .map(|slot| match arena.embedding(slot) {
            Some(emb) => emb.map(&dofs.position[slot]),
            None => dofs.position[slot],
        })
        .collect()
}

/// Ambient velocities: the embedding tangent applied to the reduced
/// velocity.
pub fn embed_velocities<const D: usize>(
    arena: &NodeArena<D>,
    dofs: &DofState<D>,
) -> Vec<Vector<D>> {
    (0..arena.len())
        .map(|slot| match arena.embedding(slot) {
            Some(emb) => emb.push_forward(&dofs.velocity[slot]),
            None => dofs.velocity[slot],
        })
        .collect()
}

/// Pull an ambient force map back into the reduced space through the
/// transpose tangent of each embedding.
pub fn submerge_forces<const D: usize>(
    arena: &NodeArena<D>,
    ambient: &[Vector<D>],
) -> Vec<Vector<D>> {
    ambient
        .iter()
        .enumerate()
        .map(|(slot, f)| match arena.embedding(slot) {
            Some(emb) => emb.pull_back(f),
            None => *f,
        })
        .collect()
}
