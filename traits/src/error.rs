//! Error kinds surfaced by the engine.
//!
//! Kernels never retry; recoverable convergence failures are raised to
//! the policy layer (the model builder), which may retry with modified
//! parameters or fail the material point. Contract violations and
//! resource problems are fatal.

use thiserror::Error;

use crate::types::{MpId, NodeId};

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad inputs to a kernel. Fatal; carries enough to locate the
    /// offending state.
    #[error("contract violation at t={time}: {what} (mp={mp:?}, value={value})")]
    ContractViolation {
        time: f64,
        mp: Option<MpId>,
        what: &'static str,
        value: f64,
    },

    /// The clock's dt is non-positive or non-finite.
    #[error("invalid time step dt={dt}")]
    TimeStepInvalid { dt: f64 },

    /// The spatial index was queried after positions drifted past the
    /// rebuild threshold while rebuilds were suppressed.
    #[error("neighborhood search is stale (drift {drift} exceeds {threshold})")]
    SearchStale { drift: f64, threshold: f64 },

    /// The LME dual failed to converge or its Hessian lost positive
    /// definiteness. Recoverable at the policy layer.
    #[error("degenerate support for mp {mp:?}: {detail} after {iterations} iterations")]
    SupportDegenerate {
        mp: Option<MpId>,
        detail: &'static str,
        iterations: usize,
    },

    /// The implicit thermal solve reported a singular system; the step
    /// has been rolled back.
    #[error("thermal solver failed: {detail}")]
    ThermalSolverFailed { detail: String },

    /// A node arrived from another rank with conflicting identity.
    /// Fatal; indicates a model-setup bug.
    #[error("migration mismatch for node {node:?}: {detail}")]
    MigrationMismatch { node: NodeId, detail: String },

    /// Driver misuse (create_model called twice, stepping before
    /// create_model, unknown carrier, ...).
    #[error("model misuse: {0}")]
    Misuse(String),

    /// Checkpoint or exchange payload could not be decoded.
    #[error("malformed payload: {0}")]
    Codec(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Recoverable errors may be retried by the policy layer with
    /// modified parameters; everything else aborts the simulation.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::SupportDegenerate { .. } | EngineError::ThermalSolverFailed { .. }
        )
    }
}
