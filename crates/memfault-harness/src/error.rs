//! Harness error types.

use memfault_core::{FaultError, OutOfMemory};
use thiserror::Error;

/// Failure reported by a workload run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkloadError {
    /// The workload observed an allocation failure and unwound.
    #[error(transparent)]
    OutOfMemory(#[from] OutOfMemory),
    /// The workload's own result check failed.
    #[error("workload invariant violated: {0}")]
    Invariant(String),
    #[error(transparent)]
    Fault(#[from] FaultError),
}

impl WorkloadError {
    #[must_use]
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory(_))
    }
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Fault(#[from] FaultError),
    #[error("unknown workload `{0}`")]
    UnknownWorkload(String),
}
