//! Cell-bucket hash index keyed on current positions.

use std::collections::HashMap;

use itertools::Itertools;

use otm_algebra::{Real, Vector};
use otm_traits::{EngineError, NeighborSearch, NodeId, Result};

/// Hash-grid spatial index. Cell size is chosen at construction (the
/// search range of the model); queries cover the cells intersecting the
/// requested ball, O(1) average per query.
///
/// The index keeps the positions it was last rebuilt from. `refresh`
/// measures the largest displacement since then and rebuilds once it
/// exceeds `drift_fraction` of the cell size; with rebuilds suppressed
/// the index goes stale instead and queries fail.
#[derive(Clone, Debug)]
pub struct CellBucketSearch<const D: usize> {
    cell: Real,
    drift_fraction: Real,
    suppressed: bool,
    stale_drift: Option<Real>,
    points: Vec<(NodeId, Vector<D>)>,
    buckets: HashMap<[i64; D], Vec<u32>>,
}

impl<const D: usize> CellBucketSearch<D> {
    pub fn new(cell_size: Real) -> Self {
        assert!(cell_size > 0.0 && cell_size.is_finite());
        CellBucketSearch {
            cell: cell_size,
            drift_fraction: 0.5,
            suppressed: false,
            stale_drift: None,
            points: Vec::new(),
            buckets: HashMap::new(),
        }
    }

    pub fn with_drift_fraction(mut self, fraction: Real) -> Self {
        self.drift_fraction = fraction;
        self
    }

    pub fn cell_size(&self) -> Real {
        self.cell
    }

    fn key(&self, p: &Vector<D>) -> [i64; D] {
        std::array::from_fn(|i| (p[i] / self.cell).floor() as i64)
    }
}

impl<const D: usize> NeighborSearch<D> for CellBucketSearch<D> {
    fn rebuild(&mut self, points: &[(NodeId, Vector<D>)]) {
        self.points.clear();
        self.points.extend_from_slice(points);
        self.buckets.clear();
        for (i, (_, p)) in self.points.iter().enumerate() {
            let key = std::array::from_fn(|k| (p[k] / self.cell).floor() as i64);
            self.buckets.entry(key).or_default().push(i as u32);
        }
        self.stale_drift = None;
    }

    fn refresh(&mut self, points: &[(NodeId, Vector<D>)]) -> bool {
        let threshold = self.drift_fraction * self.cell;
        let same_shape = points.len() == self.points.len()
            && points
                .iter()
                .zip(&self.points)
                .all(|((a, _), (b, _))| a == b);
        if !same_shape {
            self.rebuild(points);
            return true;
        }
        let mut drift: Real = 0.0;
        for ((_, new), (_, old)) in points.iter().zip(&self.points) {
            drift = drift.max((*new - *old).norm());
        }
        if drift <= threshold {
            return false;
        }
        if self.suppressed {
            self.stale_drift = Some(drift);
            return false;
        }
        self.rebuild(points);
        true
    }

    fn suppress_rebuild(&mut self, suppressed: bool) {
        self.suppressed = suppressed;
    }

    fn query(&self, center: &Vector<D>, radius: Real, out: &mut Vec<NodeId>) -> Result<()> {
        if let Some(drift) = self.stale_drift {
            return Err(EngineError::SearchStale {
                drift,
                threshold: self.drift_fraction * self.cell,
            });
        }
        out.clear();
        let r2 = radius * radius;
        let lo = self.key(&Vector::from_fn(|i| center[i] - radius));
        let hi = self.key(&Vector::from_fn(|i| center[i] + radius));
        let ranges = (0..D).map(|i| lo[i]..=hi[i]);
        for key in ranges.multi_cartesian_product() {
            let key: [i64; D] = std::array::from_fn(|i| key[i]);
            let Some(bucket) = self.buckets.get(&key) else {
                continue;
            };
            for &idx in bucket {
                let (id, p) = self.points[idx as usize];
                if (p - *center).norm_sq() <= r2 {
                    out.push(id);
                }
            }
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.points.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::BruteScan;
    use rand::prelude::*;

    fn points_fixture(n: usize, seed: u64) -> Vec<(NodeId, Vector<3>)> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|i| {
                (
                    NodeId(i as u64),
                    Vector([rng.gen_range(0.0..1.0), rng.gen_range(0.0..1.0), rng.gen_range(0.0..1.0)]),
                )
            })
            .collect()
    }

    #[test]
    fn agrees_with_brute_scan() {
        let pts = points_fixture(500, 3);
        let mut bucket = CellBucketSearch::<3>::new(0.1);
        let mut brute = BruteScan::<3>::new();
        bucket.rebuild(&pts);
        brute.rebuild(&pts);

        let mut rng = StdRng::seed_from_u64(4);
        let mut got = Vec::new();
        let mut want = Vec::new();
        for _ in 0..50 {
            let c = Vector([
                rng.gen_range(0.0..1.0),
                rng.gen_range(0.0..1.0),
                rng.gen_range(0.0..1.0),
            ]);
            let r = rng.gen_range(0.02..0.3);
            bucket.query(&c, r, &mut got).unwrap();
            brute.query(&c, r, &mut want).unwrap();
            got.sort();
            want.sort();
            assert_eq!(got, want);
        }
    }

    #[test]
    fn small_drift_keeps_index() {
        let pts = points_fixture(100, 9);
        let mut bucket = CellBucketSearch::<3>::new(0.2);
        bucket.rebuild(&pts);
        let moved: Vec<_> = pts
            .iter()
            .map(|(id, p)| (*id, *p + Vector([0.01, 0.0, 0.0])))
            .collect();
        assert!(!bucket.refresh(&moved));
        let mut out = Vec::new();
        assert!(bucket.query(&Vector([0.5, 0.5, 0.5]), 0.2, &mut out).is_ok());
    }

    #[test]
    fn suppressed_rebuild_goes_stale() {
        let pts = points_fixture(100, 11);
        let mut bucket = CellBucketSearch::<3>::new(0.2);
        bucket.rebuild(&pts);
        bucket.suppress_rebuild(true);
        let moved: Vec<_> = pts
            .iter()
            .map(|(id, p)| (*id, *p + Vector([0.5, 0.0, 0.0])))
            .collect();
        assert!(!bucket.refresh(&moved));
        let mut out = Vec::new();
        let err = bucket
            .query(&Vector([0.5, 0.5, 0.5]), 0.2, &mut out)
            .unwrap_err();
        assert!(matches!(err, otm_traits::EngineError::SearchStale { .. }));
        // re-enabling rebuilds recovers on the next refresh
        bucket.suppress_rebuild(false);
        assert!(bucket.refresh(&moved));
        assert!(bucket.query(&Vector([0.5, 0.5, 0.5]), 0.2, &mut out).is_ok());
    }

    #[test]
    fn query_spanning_many_cells() {
        let pts = points_fixture(300, 21);
        let mut bucket = CellBucketSearch::<3>::new(0.05);
        bucket.rebuild(&pts);
        let mut out = Vec::new();
        bucket.query(&Vector([0.5, 0.5, 0.5]), 2.0, &mut out).unwrap();
        assert_eq!(out.len(), 300);
    }
}
