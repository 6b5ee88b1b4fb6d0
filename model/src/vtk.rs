//! Legacy-VTK ASCII output.
//!
//! Emits the material-point cloud as an unstructured grid of vertex
//! cells: the points carry interpolated velocity, mass, and status as
//! point data, and the per-point stress and state fields as cell data.
//! Coordinates in sub-3-D simulations are padded with zeros.

use std::io::Write;

use otm_algebra::Real;
use otm_traits::{FieldTag, Result};

use crate::model::{Model, QpField};

fn pad3<const D: usize>(x: &otm_algebra::Vector<D>) -> [Real; 3] {
    let mut out = [0.0; 3];
    for i in 0..D.min(3) {
        out[i] = x[i];
    }
    out
}

fn scalar_field<const D: usize>(model: &Model<D>, tag: FieldTag) -> Vec<Real> {
    match model.qp_data(tag) {
        QpField::Scalar(v) => v.into_iter().map(|(_, s)| s).collect(),
        _ => Vec::new(),
    }
}

impl<const D: usize> Model<D> {
    /// Write the current state as a legacy VTK unstructured grid.
    pub fn write_vtk<W: Write>(&self, w: &mut W) -> Result<()> {
        let mps = self.material_points();
        writeln!(w, "# vtk DataFile Version 3.0")?;
        writeln!(
            w,
            "otm state t={:.9e} step={}",
            self.clock().time(),
            self.clock().step_count()
        )?;
        writeln!(w, "ASCII")?;
        writeln!(w, "DATASET UNSTRUCTURED_GRID")?;

        writeln!(w, "POINTS {} double", mps.len())?;
        for mp in mps {
            let p = pad3(&mp.position);
            writeln!(w, "{:.12e} {:.12e} {:.12e}", p[0], p[1], p[2])?;
        }

        writeln!(w, "CELLS {} {}", mps.len(), 2 * mps.len())?;
        for i in 0..mps.len() {
            writeln!(w, "1 {i}")?;
        }
        writeln!(w, "CELL_TYPES {}", mps.len())?;
        for _ in 0..mps.len() {
            writeln!(w, "1")?;
        }

        // point data: velocity, mass, status
        writeln!(w, "POINT_DATA {}", mps.len())?;
        writeln!(w, "VECTORS velocity double")?;
        if let QpField::Vector(vel) = self.qp_data(FieldTag::Velocity) {
            for (_, v) in vel {
                let v = pad3(&v);
                writeln!(w, "{:.12e} {:.12e} {:.12e}", v[0], v[1], v[2])?;
            }
        }
        for (name, tag) in [("mass", FieldTag::Mass), ("status", FieldTag::Status)] {
            writeln!(w, "SCALARS {name} double 1")?;
            writeln!(w, "LOOKUP_TABLE default")?;
            for s in scalar_field(self, tag) {
                writeln!(w, "{s:.12e}")?;
            }
        }

        // cell data: stress invariants and state
        writeln!(w, "CELL_DATA {}", mps.len())?;
        for (name, tag) in [
            ("pressure", FieldTag::MeanStress),
            ("mises", FieldTag::EffectiveStress),
            ("temperature", FieldTag::Temperature),
            ("jacobian", FieldTag::Jacobian),
            ("effective_strain", FieldTag::EffectiveStrain),
            ("energy_release_rate", FieldTag::EnergyReleaseRate),
        ] {
            writeln!(w, "SCALARS {name} double 1")?;
            writeln!(w, "LOOKUP_TABLE default")?;
            for s in scalar_field(self, tag) {
                writeln!(w, "{s:.12e}")?;
            }
        }
        // principal Cauchy stresses
        writeln!(w, "SCALARS principal_stress double 3")?;
        writeln!(w, "LOOKUP_TABLE default")?;
        if let QpField::Tensor(sig) = self.qp_data(FieldTag::CauchyStress) {
            for (_, s) in sig {
                let ev = s.sym_eigenvalues();
                let p = pad3(&ev);
                writeln!(w, "{:.12e} {:.12e} {:.12e}", p[0], p[1], p[2])?;
            }
        }
        // artificial-viscosity stress and strain-rate magnitudes
        for (name, tag) in [
            ("av_stress", FieldTag::AvStress),
            ("av_strain_rate", FieldTag::AvDeformation),
        ] {
            writeln!(w, "SCALARS {name} double 1")?;
            writeln!(w, "LOOKUP_TABLE default")?;
            if let QpField::Tensor(t) = self.qp_data(tag) {
                for (_, h) in t {
                    writeln!(w, "{:.12e}", h.norm())?;
                }
            }
        }
        Ok(())
    }
}
