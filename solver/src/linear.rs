//! Keyed sparse linear system with a dense LU solve.
//!
//! The semi-implicit propagator treats its system as opaque: add
//! coefficients keyed by DOF id, solve, measure norms. Coefficients are
//! kept as a hash-of-triplets and densified at solve time; thermal
//! systems in this engine are small relative to the mechanical work,
//! and the factor/solve backend can be swapped behind the
//! [`LinearSystem`] trait without touching the propagator.

use std::collections::HashMap;
use std::hash::Hash;

use otm_algebra::Real;
use otm_traits::{EngineError, LinearSystem, Result};

#[derive(Clone, Debug)]
pub struct KeyedSystem<K: Eq + Hash + Clone> {
    index: HashMap<K, usize>,
    keys: Vec<K>,
    coeffs: HashMap<(usize, usize), Real>,
    rhs: Vec<Real>,
}

impl<K: Eq + Hash + Clone> Default for KeyedSystem<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> KeyedSystem<K> {
    pub fn new() -> Self {
        KeyedSystem {
            index: HashMap::new(),
            keys: Vec::new(),
            coeffs: HashMap::new(),
            rhs: Vec::new(),
        }
    }

    fn slot(&mut self, key: K) -> usize {
        if let Some(&i) = self.index.get(&key) {
            return i;
        }
        let i = self.keys.len();
        self.keys.push(key.clone());
        self.index.insert(key, i);
        self.rhs.push(0.0);
        i
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    /// Accumulated coefficient at `(row, col)`, zero if never touched.
    pub fn coefficient(&self, row: &K, col: &K) -> Real {
        match (self.index.get(row), self.index.get(col)) {
            (Some(&r), Some(&c)) => self.coeffs.get(&(r, c)).copied().unwrap_or(0.0),
            _ => 0.0,
        }
    }
}

impl<K: Eq + Hash + Clone> LinearSystem<K> for KeyedSystem<K> {
    fn add(&mut self, row: K, col: K, value: Real) {
        let r = self.slot(row);
        let c = self.slot(col);
        *self.coeffs.entry((r, c)).or_insert(0.0) += value;
    }

    fn add_rhs(&mut self, row: K, value: Real) {
        let r = self.slot(row);
        self.rhs[r] += value;
    }

    fn rhs_norm(&self) -> Real {
        self.rhs.iter().map(|x| x * x).sum::<Real>().sqrt()
    }

    fn solve(&mut self) -> Result<HashMap<K, Real>> {
        let n = self.keys.len();
        if n == 0 {
            return Ok(HashMap::new());
        }
        // densify
        let mut a = vec![0.0; n * n];
        for (&(r, c), &v) in &self.coeffs {
            a[r * n + c] += v;
        }
        let mut b = self.rhs.clone();
        let mut perm: Vec<usize> = (0..n).collect();

        // LU with partial pivoting
        for k in 0..n {
            let mut pivot = k;
            let mut best = a[perm[k] * n + k].abs();
            for i in (k + 1)..n {
                let cand = a[perm[i] * n + k].abs();
                if cand > best {
                    best = cand;
                    pivot = i;
                }
            }
            if best < 1e-300 || !best.is_finite() {
                return Err(EngineError::ThermalSolverFailed {
                    detail: format!("singular pivot at column {k} of {n}"),
                });
            }
            perm.swap(k, pivot);
            let pk = perm[k];
            for i in (k + 1)..n {
                let pi = perm[i];
                let factor = a[pi * n + k] / a[pk * n + k];
                a[pi * n + k] = factor;
                for j in (k + 1)..n {
                    a[pi * n + j] -= factor * a[pk * n + j];
                }
            }
        }
        // forward
        let mut y = vec![0.0; n];
        for i in 0..n {
            let pi = perm[i];
            let mut acc = b[pi];
            for j in 0..i {
                acc -= a[pi * n + j] * y[j];
            }
            y[i] = acc;
        }
        // backward
        let mut x = vec![0.0; n];
        for i in (0..n).rev() {
            let pi = perm[i];
            let mut acc = y[i];
            for j in (i + 1)..n {
                acc -= a[pi * n + j] * x[j];
            }
            x[i] = acc / a[pi * n + i];
        }
        b.clear();

        Ok(self
            .keys
            .iter()
            .cloned()
            .zip(x)
            .collect())
    }

    fn clear(&mut self) {
        self.index.clear();
        self.keys.clear();
        self.coeffs.clear();
        self.rhs.clear();
    }
}
