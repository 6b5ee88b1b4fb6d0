//! Model layer: ownership of nodes, material points, materials, and
//! element data; global state aggregation between the reduced and
//! ambient representations; the eigen-erosion fracture scan; and the
//! driver-facing `Model` API with checkpoint and VTK output.

pub mod arena;
pub mod builder;
pub mod checkpoint;
pub mod erosion;
pub mod local_state;
pub mod mesh;
pub mod model;
pub mod vtk;

pub use arena::NodeArena;
pub use builder::{BodySpec, ModelBuilder};
pub use erosion::{ErosionParams, ErosionReport};
pub use mesh::CellComplex;
pub use model::{Model, NodeField, QpField};
