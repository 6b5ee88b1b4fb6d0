//! Background simplicial complexes seeding material points.
//!
//! The mesh exists only at model construction: its volume cells define
//! material-point positions, masses, and spacings, and its vertices
//! become nodes. After `create_model` the simulation is meshfree.

use otm_algebra::{Hom, Real, Vector};

/// A simplicial cell complex in dimension `D`: vertices plus volume
/// cells of `D + 1` vertex indices each.
#[derive(Clone, Debug, Default)]
pub struct CellComplex<const D: usize> {
    pub vertices: Vec<Vector<D>>,
    pub cells: Vec<Vec<usize>>,
}

impl<const D: usize> CellComplex<D> {
    pub fn new(vertices: Vec<Vector<D>>, cells: Vec<Vec<usize>>) -> Self {
        debug_assert!(cells.iter().all(|c| c.len() == D + 1));
        CellComplex { vertices, cells }
    }

    /// Signed volume of a simplex: det of the edge matrix over D!.
    pub fn cell_volume(&self, cell: &[usize]) -> Real {
        let v0 = self.vertices[cell[0]];
        let edges = Hom::<D, D>::from_fn(|i, j| (self.vertices[cell[j + 1]] - v0)[i]);
        let mut fact = 1.0;
        for k in 2..=D {
            fact *= k as Real;
        }
        edges.det().abs() / fact
    }

    pub fn cell_centroid(&self, cell: &[usize]) -> Vector<D> {
        let mut c = Vector::zero();
        for &v in cell {
            c += self.vertices[v];
        }
        c.scale(1.0 / cell.len() as Real)
    }

    /// Longest edge of a simplex, the local spacing estimate.
    pub fn cell_size(&self, cell: &[usize]) -> Real {
        let mut h: Real = 0.0;
        for (k, &a) in cell.iter().enumerate() {
            for &b in &cell[k + 1..] {
                h = h.max((self.vertices[a] - self.vertices[b]).norm());
            }
        }
        h
    }

    pub fn total_volume(&self) -> Real {
        self.cells.iter().map(|c| self.cell_volume(c)).sum()
    }
}

/// Canonical test geometries, one per spatial dimension.
pub mod shapes {
    use super::*;

    /// A 1-D bar of `n` segments on [0, length].
    pub fn bar(n: usize, length: Real) -> CellComplex<1> {
        let vertices = (0..=n)
            .map(|i| Vector([length * i as Real / n as Real]))
            .collect();
        let cells = (0..n).map(|i| vec![i, i + 1]).collect();
        CellComplex { vertices, cells }
    }

    /// A rectangle [0,a]x[0,b] on an nx-by-ny grid, two triangles per
    /// quad.
    pub fn rectangle(nx: usize, ny: usize, a: Real, b: Real) -> CellComplex<2> {
        let idx = |i: usize, j: usize| i * (ny + 1) + j;
        let mut vertices = Vec::with_capacity((nx + 1) * (ny + 1));
        for i in 0..=nx {
            for j in 0..=ny {
                vertices.push(Vector([
                    a * i as Real / nx as Real,
                    b * j as Real / ny as Real,
                ]));
            }
        }
        let mut cells = Vec::with_capacity(2 * nx * ny);
        for i in 0..nx {
            for j in 0..ny {
                let (p00, p10, p01, p11) =
                    (idx(i, j), idx(i + 1, j), idx(i, j + 1), idx(i + 1, j + 1));
                cells.push(vec![p00, p10, p11]);
                cells.push(vec![p00, p11, p01]);
            }
        }
        CellComplex { vertices, cells }
    }

    /// A box [0,a]x[0,b]x[0,c], six Kuhn tetrahedra per hex cell.
    pub fn brick(nx: usize, ny: usize, nz: usize, a: Real, b: Real, c: Real) -> CellComplex<3> {
        let idx = |i: usize, j: usize, k: usize| (i * (ny + 1) + j) * (nz + 1) + k;
        let mut vertices = Vec::with_capacity((nx + 1) * (ny + 1) * (nz + 1));
        for i in 0..=nx {
            for j in 0..=ny {
                for k in 0..=nz {
                    vertices.push(Vector([
                        a * i as Real / nx as Real,
                        b * j as Real / ny as Real,
                        c * k as Real / nz as Real,
                    ]));
                }
            }
        }
        // Kuhn decomposition along vertex orderings of the unit cube.
        const PATHS: [[usize; 4]; 6] = [
            [0, 1, 3, 7],
            [0, 1, 5, 7],
            [0, 2, 3, 7],
            [0, 2, 6, 7],
            [0, 4, 5, 7],
            [0, 4, 6, 7],
        ];
        let mut cells = Vec::with_capacity(6 * nx * ny * nz);
        for i in 0..nx {
            for j in 0..ny {
                for k in 0..nz {
                    let corner = |m: usize| {
                        idx(
                            i + (m & 1),
                            j + ((m >> 1) & 1),
                            k + ((m >> 2) & 1),
                        )
                    };
                    for path in PATHS {
                        cells.push(path.iter().map(|&m| corner(m)).collect());
                    }
                }
            }
        }
        CellComplex { vertices, cells }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn bar_volume_is_length() {
        let m = shapes::bar(10, 2.0);
        assert_approx_eq!(f64, m.total_volume(), 2.0, epsilon = 1e-12);
        assert_eq!(m.cells.len(), 10);
    }

    #[test]
    fn rectangle_volume_is_area() {
        let m = shapes::rectangle(4, 3, 2.0, 1.5);
        assert_approx_eq!(f64, m.total_volume(), 3.0, epsilon = 1e-12);
    }

    #[test]
    fn brick_volume_is_box_volume() {
        let m = shapes::brick(2, 2, 2, 1.0, 2.0, 3.0);
        assert_approx_eq!(f64, m.total_volume(), 6.0, epsilon = 1e-10);
        assert_eq!(m.cells.len(), 6 * 8);
    }

    #[test]
    fn cell_size_is_longest_edge() {
        let m = shapes::rectangle(1, 1, 1.0, 1.0);
        // diagonal of the unit square
        assert_approx_eq!(f64, m.cell_size(&m.cells[0]), 2.0f64.sqrt(), epsilon = 1e-12);
    }
}
