//! Sequential-scan backend: always correct, never stale.

use otm_algebra::{Real, Vector};
use otm_traits::{NeighborSearch, NodeId, Result};

/// Linear scan over the stored point array. O(n) per query; the
/// correctness oracle for [`CellBucketSearch`](crate::CellBucketSearch).
#[derive(Clone, Debug, Default)]
pub struct BruteScan<const D: usize> {
    points: Vec<(NodeId, Vector<D>)>,
}

impl<const D: usize> BruteScan<D> {
    pub fn new() -> Self {
        BruteScan { points: Vec::new() }
    }
}

impl<const D: usize> NeighborSearch<D> for BruteScan<D> {
    fn rebuild(&mut self, points: &[(NodeId, Vector<D>)]) {
        self.points.clear();
        self.points.extend_from_slice(points);
    }

    fn refresh(&mut self, points: &[(NodeId, Vector<D>)]) -> bool {
        self.rebuild(points);
        true
    }

    fn suppress_rebuild(&mut self, _suppressed: bool) {}

    fn query(&self, center: &Vector<D>, radius: Real, out: &mut Vec<NodeId>) -> Result<()> {
        out.clear();
        let r2 = radius * radius;
        for (id, p) in &self.points {
            if (*p - *center).norm_sq() <= r2 {
                out.push(*id);
            }
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.points.len()
    }
}
