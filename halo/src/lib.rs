//! Domain decomposition: each rank owns a disjoint set of material
//! points; nodes live on their home rank and appear as shadows on the
//! neighbors whose points touch them. Per-step exchange keeps the
//! shadow region consistent, force deltas flow back to the home rank,
//! and a cost-driven balancer migrates points when work skews.

pub mod balance;
pub mod exchange;
pub mod local;
pub mod records;

pub use balance::{BalancePolicy, LoadBalancer};
pub use exchange::DistributedModel;
pub use local::{LocalCluster, LocalComm};
