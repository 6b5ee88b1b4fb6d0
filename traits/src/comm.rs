//! Rank-to-rank exchange contract for the halo layer.
//!
//! The real transport (MPI or otherwise) is an external collaborator;
//! the halo exchange and load balancer only require this surface. All
//! exchanges within a step are collective: non-blocking sends to
//! neighbors followed by matching receives, no background traffic. A
//! lost message is fatal at the transport layer; there is no retry
//! here.

use crate::types::Rank;

/// Message tags keep the per-step phases apart so out-of-order delivery
/// between phases cannot alias.
pub type Tag = u32;

pub trait RankComm: Send {
    fn rank(&self) -> Rank;

    fn size(&self) -> usize;

    /// Post a message to `to`. Returns immediately; the payload is
    /// owned by the transport after the call.
    fn send(&self, to: Rank, tag: Tag, payload: Vec<u8>);

    /// Block until the matching message from `from` arrives.
    fn recv(&self, from: Rank, tag: Tag) -> Vec<u8>;

    /// Gather one payload from every rank, ordered by rank.
    fn all_gather(&self, payload: Vec<u8>) -> Vec<Vec<u8>>;

    /// Block until every rank has entered the barrier.
    fn barrier(&self);
}
