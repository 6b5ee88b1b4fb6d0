//! Eigen-erosion fracture scan.
//!
//! Each active point owns a transient ε-ball cluster in the current
//! configuration. The candidate energy-release rate is the regularized
//! cluster average of free-energy density times 2ε, with overlap
//! weights split proportionally to volume (the exponent is a modeling
//! parameter). Failures are applied after propagation: the scan is
//! parallel, the failure marking serialized — the worst point fails
//! first, its neighborhood is re-scored, and the loop repeats until no
//! candidate clears the threshold.

use std::collections::HashMap;

use log::info;
use rayon::prelude::*;

use otm_algebra::{Real, Vector};
use otm_element::MpLocalState;
use otm_search::CellBucketSearch;
use otm_traits::{MpId, NeighborSearch, NodeId, ReleaseRateMode, Result};

use crate::model::Model;

#[derive(Clone, Debug)]
pub struct ErosionParams<const D: usize> {
    /// Crack-regularization radius ε.
    pub epsilon: Real,
    /// Critical energy-release rate; per-mode overrides win.
    pub gc: Real,
    pub gc_by_mode: HashMap<ReleaseRateMode, Real>,
    /// Gate failures on max principal stretch exceeding this value.
    pub critical_stretch: Option<Real>,
    /// Exponent on volume in the overlap-weight split (1 =
    /// proportional).
    pub overlap_exponent: Real,
    /// Axis-aligned box restricting the scan; points outside never
    /// fail.
    pub check_region: Option<(Vector<D>, Vector<D>)>,
    pub vaporization_temperature: Option<Real>,
}

impl<const D: usize> ErosionParams<D> {
    pub fn new(epsilon: Real, gc: Real) -> Self {
        ErosionParams {
            epsilon,
            gc,
            gc_by_mode: HashMap::new(),
            critical_stretch: None,
            overlap_exponent: 1.0,
            check_region: None,
            vaporization_temperature: None,
        }
    }

    fn gc_for(&self, mode: ReleaseRateMode) -> Real {
        self.gc_by_mode.get(&mode).copied().unwrap_or(self.gc)
    }

    fn in_region(&self, x: &Vector<D>) -> bool {
        match &self.check_region {
            None => true,
            Some((lo, hi)) => (0..D).all(|i| x[i] >= lo[i] && x[i] <= hi[i]),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ErosionReport {
    pub failed: Vec<MpId>,
    pub dissipated: Real,
    pub scans: usize,
}

fn failure_mode<const D: usize>(
    mp: &MpLocalState<D>,
    params: &ErosionParams<D>,
) -> Option<ReleaseRateMode> {
    if let Some(tv) = params.vaporization_temperature {
        if mp.temperature > tv {
            return Some(ReleaseRateMode::Vaporization);
        }
    }
    if mp.reaction > 0.5 {
        return Some(ReleaseRateMode::Damage);
    }
    let mean = mp.cauchy.trace() / D as Real;
    let dev = mp.cauchy.deviator().norm();
    if mean > 0.0 {
        Some(ReleaseRateMode::TensileI)
    } else if dev > mean.abs() {
        if D == 3 {
            let in_plane = mp.cauchy[(0, 1)].abs();
            let anti_plane = mp.cauchy[(0, 2)].abs() + mp.cauchy[(1, 2)].abs();
            if anti_plane > in_plane {
                Some(ReleaseRateMode::ShearIII)
            } else {
                Some(ReleaseRateMode::ShearII)
            }
        } else {
            Some(ReleaseRateMode::ShearII)
        }
    } else {
        None
    }
}

/// Cluster-averaged energy-release rate at one point: the ε-ball
/// neighbors contribute their free-energy density with volume-split
/// weights, `G = 2ε Σ μ_n (W_n / V_n) / Σ μ_n` with `μ_n = V_n^q`.
fn release_rate<const D: usize>(
    center: usize,
    mps: &[MpLocalState<D>],
    search: &CellBucketSearch<D>,
    params: &ErosionParams<D>,
    scratch: &mut Vec<NodeId>,
) -> Real {
    let mp = &mps[center];
    if search
        .query(&mp.position, params.epsilon, scratch)
        .is_err()
    {
        return 0.0;
    }
    let q = params.overlap_exponent;
    let mut num = 0.0;
    let mut den = 0.0;
    for &NodeId(raw) in scratch.iter() {
        let n = &mps[raw as usize];
        if !n.active {
            continue;
        }
        let mu = n.volume.max(1e-300).powf(q);
        num += mu * (n.free_energy / n.volume.max(1e-300));
        den += mu;
    }
    if den <= 0.0 {
        return 0.0;
    }
    2.0 * params.epsilon * num / den
}

impl<const D: usize> Model<D> {
    /// Run the fracture scan and apply failures. Returns what failed.
    pub fn erode(&mut self) -> Result<ErosionReport> {
        let Some(params) = self.erosion.clone() else {
            return Ok(ErosionReport::default());
        };
        let mut report = ErosionReport::default();

        // Spatial index over the active points in the current
        // configuration, keyed by point index.
        let cell = params.epsilon;
        let mut mp_search = CellBucketSearch::<D>::new(cell);
        let cloud: Vec<(NodeId, Vector<D>)> = self
            .mps
            .iter()
            .enumerate()
            .filter(|(_, m)| m.active)
            .map(|(i, m)| (NodeId(i as u64), m.position))
            .collect();
        if cloud.is_empty() {
            return Ok(report);
        }
        mp_search.rebuild(&cloud);

        // Parallel scoring pass.
        let mps = &self.mps;
        let search = &mp_search;
        let scores: Vec<Option<(usize, Real, ReleaseRateMode)>> = self.pool.install(|| {
            (0..mps.len())
                .into_par_iter()
                .map_init(Vec::new, |scratch, i| {
                    let mp = &mps[i];
                    if !mp.active || !params.in_region(&mp.position) {
                        return None;
                    }
                    let mode = failure_mode(mp, &params)?;
                    let g = release_rate(i, mps, search, &params, scratch);
                    Some((i, g, mode))
                })
                .collect()
        });
        report.scans = scores.iter().filter(|s| s.is_some()).count();

        let mut candidates: HashMap<usize, (Real, ReleaseRateMode)> = HashMap::new();
        for entry in scores.into_iter().flatten() {
            let (i, g, mode) = entry;
            self.release_rates.insert(self.mps[i].id, (g, mode));
            if self.admissible(i, g, mode, &params) {
                candidates.insert(i, (g, mode));
            }
        }

        // Serialized failure pass: worst first, neighborhoods
        // re-scored after each failure.
        let mut scratch = Vec::new();
        while let Some((&worst, &(g, mode))) = candidates
            .iter()
            .max_by(|a, b| a.1 .0.partial_cmp(&b.1 .0).unwrap_or(std::cmp::Ordering::Equal))
        {
            let position = self.mps[worst].position;
            {
                let mp = &mut self.mps[worst];
                mp.active = false;
                report.failed.push(mp.id);
                report.dissipated += mp.free_energy;
                self.fracture_dissipated += mp.free_energy;
                self.bodies[mp.body].eroded += 1;
                info!("eroded {:?} (G={:.3e}, mode {:?})", mp.id, g, mode);
            }
            candidates.remove(&worst);

            // Re-score the overlapping clusters.
            let rebuilt: Vec<(NodeId, Vector<D>)> = self
                .mps
                .iter()
                .enumerate()
                .filter(|(_, m)| m.active)
                .map(|(i, m)| (NodeId(i as u64), m.position))
                .collect();
            if rebuilt.is_empty() {
                break;
            }
            mp_search.rebuild(&rebuilt);
            let mut affected = Vec::new();
            mp_search
                .query(&position, 2.0 * params.epsilon, &mut affected)
                .ok();
            for NodeId(raw) in affected {
                let i = raw as usize;
                if !self.mps[i].active {
                    candidates.remove(&i);
                    continue;
                }
                let Some(mode) = failure_mode(&self.mps[i], &params) else {
                    candidates.remove(&i);
                    continue;
                };
                let g = release_rate(i, &self.mps, &mp_search, &params, &mut scratch);
                self.release_rates.insert(self.mps[i].id, (g, mode));
                if self.admissible(i, g, mode, &params) {
                    candidates.insert(i, (g, mode));
                } else {
                    candidates.remove(&i);
                }
            }
        }

        if !report.failed.is_empty() {
            self.recompute_mass();
            self.update_detached();
            info!(
                "erosion failed {} points, dissipated {:.3e}",
                report.failed.len(),
                report.dissipated
            );
        }
        Ok(report)
    }

    fn admissible(
        &self,
        i: usize,
        g: Real,
        mode: ReleaseRateMode,
        params: &ErosionParams<D>,
    ) -> bool {
        if g <= params.gc_for(mode) {
            return false;
        }
        match params.critical_stretch {
            Some(crit) => self.mps[i].max_principal_stretch() > crit,
            None => true,
        }
    }
}
