//! Two-body penalty contact.
//!
//! Node-pair repulsion between two carriers: pairs closer than the
//! contact range accumulate a quadratic penalty. Admission of pairs is
//! by carrier, so self-contact within one body never triggers.

use otm_algebra::{Real, Vector};
use otm_traits::element::{ContribCtx, NodalContributor};
use otm_traits::{NodeId, Result};

pub struct TwoBodyContact<const D: usize> {
    /// Node list: the first `split` entries belong to body a, the rest
    /// to body b.
    nodes: Vec<NodeId>,
    split: usize,
    pub stiffness: Real,
    pub range: Real,
    /// Apply reaction forces on body b as well.
    pub symmetric: bool,
}

impl<const D: usize> TwoBodyContact<D> {
    pub fn new(
        nodes_a: Vec<NodeId>,
        nodes_b: Vec<NodeId>,
        stiffness: Real,
        range: Real,
        symmetric: bool,
    ) -> Self {
        let split = nodes_a.len();
        let mut nodes = nodes_a;
        nodes.extend(nodes_b);
        TwoBodyContact {
            nodes,
            split,
            stiffness,
            range,
            symmetric,
        }
    }
}

impl<const D: usize> NodalContributor<D> for TwoBodyContact<D> {
    fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    fn energy(&self, _ctx: &ContribCtx, xs: &[Vector<D>]) -> Result<Real> {
        let (a, b) = xs.split_at(self.split);
        let mut e = 0.0;
        for xa in a {
            for xb in b {
                let gap = self.range - (*xa - *xb).norm();
                if gap > 0.0 {
                    e += 0.5 * self.stiffness * gap * gap;
                }
            }
        }
        Ok(e)
    }

    fn add_forces(
        &self,
        _ctx: &ContribCtx,
        xs: &[Vector<D>],
        _vs: &[Vector<D>],
        out: &mut [Vector<D>],
    ) -> Result<()> {
        let (a, b) = xs.split_at(self.split);
        for (i, xa) in a.iter().enumerate() {
            for (j, xb) in b.iter().enumerate() {
                let sep = *xa - *xb;
                let dist = sep.norm();
                if dist >= self.range || dist <= 0.0 {
                    continue;
                }
                let gap = self.range - dist;
                // dE/dx_a = -k gap (x_a - x_b)/d
                let grad = sep.scale(-self.stiffness * gap / dist);
                out[i] += grad;
                if self.symmetric {
                    out[self.split + j] -= grad;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn overlapping_nodes_repel() {
        let c = TwoBodyContact::<2>::new(vec![NodeId(0)], vec![NodeId(1)], 100.0, 1.0, true);
        let ctx = ContribCtx { time: 0.0, dt: 0.1 };
        let xs = [Vector([0.0, 0.0]), Vector([0.5, 0.0])];
        let mut out = vec![Vector::zero(); 2];
        c.add_forces(&ctx, &xs, &[], &mut out).unwrap();
        // gradient on a points toward b (energy decreases as a moves
        // away), reaction is equal and opposite
        assert!(out[0][0] > 0.0);
        assert!((out[0][0] + out[1][0]).abs() < 1e-12);
    }

    #[test]
    fn separated_nodes_are_silent() {
        let c = TwoBodyContact::<2>::new(vec![NodeId(0)], vec![NodeId(1)], 100.0, 1.0, true);
        let ctx = ContribCtx { time: 0.0, dt: 0.1 };
        let xs = [Vector([0.0, 0.0]), Vector([2.0, 0.0])];
        let mut out = vec![Vector::zero(); 2];
        c.add_forces(&ctx, &xs, &[], &mut out).unwrap();
        assert!(out.iter().all(|f| f.norm() == 0.0));
        assert!(c.energy(&ctx, &xs).unwrap() == 0.0);
    }

    #[test]
    fn force_is_energy_gradient() {
        let c = TwoBodyContact::<2>::new(vec![NodeId(0)], vec![NodeId(1)], 50.0, 1.0, true);
        let ctx = ContribCtx { time: 0.0, dt: 0.1 };
        let xs = [Vector([0.1, 0.2]), Vector([0.6, 0.1])];
        let mut out = vec![Vector::zero(); 2];
        c.add_forces(&ctx, &xs, &[], &mut out).unwrap();
        let delta = 1e-7;
        for dim in 0..2 {
            let mut plus = xs;
            plus[0][dim] += delta;
            let mut minus = xs;
            minus[0][dim] -= delta;
            let fd = (c.energy(&ctx, &plus).unwrap() - c.energy(&ctx, &minus).unwrap())
                / (2.0 * delta);
            assert!((out[0][dim] - fd).abs() <= 1e-5 * fd.abs().max(1.0));
        }
    }
}
