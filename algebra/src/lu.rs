//! LU factorisation with partial pivoting for square tensors of
//! compile-time dimension.

use crate::hom::Hom;
use crate::vector::Vector;
use crate::Real;

/// Packed LU factors of a square `Hom<N, N>` with the row permutation.
#[derive(Clone, Copy, Debug)]
pub struct Lu<const N: usize> {
    lu: [[Real; N]; N],
    perm: [usize; N],
    sign: Real,
}

impl<const N: usize> Lu<N> {
    /// Factor `a = P L U`. Returns `None` when a pivot collapses below
    /// machine scale (the matrix is singular to working precision).
    pub fn factor(a: &Hom<N, N>) -> Option<Self> {
        let mut lu = [[0.0; N]; N];
        for i in 0..N {
            for j in 0..N {
                lu[i][j] = a[(i, j)];
            }
        }
        let mut perm = [0usize; N];
        for (i, p) in perm.iter_mut().enumerate() {
            *p = i;
        }
        let mut sign = 1.0;

        for k in 0..N {
            let mut pivot = k;
            let mut best = lu[k][k].abs();
            for i in (k + 1)..N {
                if lu[i][k].abs() > best {
                    best = lu[i][k].abs();
                    pivot = i;
                }
            }
            if best < Real::EPSILON * 16.0 || !best.is_finite() {
                return None;
            }
            if pivot != k {
                lu.swap(pivot, k);
                perm.swap(pivot, k);
                sign = -sign;
            }
            for i in (k + 1)..N {
                lu[i][k] /= lu[k][k];
                for j in (k + 1)..N {
                    lu[i][j] -= lu[i][k] * lu[k][j];
                }
            }
        }
        Some(Lu { lu, perm, sign })
    }

    pub fn det(&self) -> Real {
        let mut d = self.sign;
        for i in 0..N {
            d *= self.lu[i][i];
        }
        d
    }

    /// Solve `a x = b` from the stored factors.
    pub fn solve(&self, b: &Vector<N>) -> Vector<N> {
        let mut y = [0.0; N];
        for i in 0..N {
            let mut acc = b[self.perm[i]];
            for j in 0..i {
                acc -= self.lu[i][j] * y[j];
            }
            y[i] = acc;
        }
        let mut x = [0.0; N];
        for i in (0..N).rev() {
            let mut acc = y[i];
            for j in (i + 1)..N {
                acc -= self.lu[i][j] * x[j];
            }
            x[i] = acc / self.lu[i][i];
        }
        Vector(x)
    }

    pub fn inverse(&self) -> Hom<N, N> {
        let mut inv = Hom::zero();
        for j in 0..N {
            let mut e = Vector::zero();
            e[j] = 1.0;
            let col = self.solve(&e);
            inv.set_col(j, &col);
        }
        inv
    }
}
