//! Neighborhood search contract.

use otm_algebra::{Real, Vector};

use crate::error::Result;
use crate::types::NodeId;

/// Spatial index over a point set, queried with ball ranges.
///
/// The index owns its copy of the point array. `refresh` measures how
/// far the points have drifted since the last rebuild and rebuilds when
/// the drift exceeds a fraction of the cell size, unless rebuilds are
/// suppressed; a query on a stale, rebuild-suppressed index fails with
/// `SearchStale`.
pub trait NeighborSearch<const D: usize>: Send + Sync {
    /// Rebuild the index from scratch.
    fn rebuild(&mut self, points: &[(NodeId, Vector<D>)]);

    /// Update positions; rebuild if the drift threshold was crossed.
    /// Returns true when a rebuild happened.
    fn refresh(&mut self, points: &[(NodeId, Vector<D>)]) -> bool;

    /// Suppress or re-enable automatic rebuilds on refresh.
    fn suppress_rebuild(&mut self, suppressed: bool);

    /// Collect all ids within `radius` of `center` into `out`
    /// (cleared first).
    fn query(&self, center: &Vector<D>, radius: Real, out: &mut Vec<NodeId>) -> Result<()>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
