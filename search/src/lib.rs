//! Spatial indices over node clouds.
//!
//! Two backends behind the same [`NeighborSearch`] contract: a
//! cell-bucket hash keyed on current positions (the production path)
//! and a brute scan used as fallback and as a correctness oracle in
//! tests.

pub mod brute;
pub mod bucket;

pub use brute::BruteScan;
pub use bucket::CellBucketSearch;

pub use otm_traits::NeighborSearch;
