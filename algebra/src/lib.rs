//! Fixed-dimension algebra kernels for the meshfree engine.
//!
//! Everything here is sized at compile time for spatial dimensions 1 to 4:
//! Cartesian vectors, second-order tensors ([`Hom`]), third-order tensors
//! ([`Hom3`]) stored as a sequence of second-order slabs, LU factorisation
//! with partial pivoting for determinants and inverses, and affine
//! [`Embedding`]s mapping constrained degrees of freedom into ambient space.

pub mod embedding;
pub mod hom;
pub mod lu;
pub mod vector;

pub use embedding::Embedding;
pub use hom::{Hom, Hom3};
pub use lu::Lu;
pub use vector::Vector;

/// Scalar type used throughout the engine.
pub type Real = f64;
