//! Error taxonomy for the fault overlay.
//!
//! Simulated allocation failures are not errors: they surface as an ordinary
//! `None` from `allocate`/`reallocate`, indistinguishable from exhaustion.

use thiserror::Error;

/// Coarse classification of a [`FaultError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid arguments or configuration values.
    Configuration,
    /// Operation issued from the wrong lifecycle state.
    State,
    /// Allocator slot contents no longer match what was saved.
    Integrity,
    /// The wrapped allocator reported a failure of its own.
    Allocator,
}

/// Status code view of install/uninstall results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OverlayStatus {
    Ok,
    AlreadyInstalled,
    NotInstalled,
    NoRealAllocator,
    IntegrityMismatch,
    Error,
}

impl OverlayStatus {
    /// Map an install/uninstall result onto its status code.
    #[must_use]
    pub fn from_result(result: &Result<(), FaultError>) -> Self {
        match result {
            Ok(()) => Self::Ok,
            Err(err) => err.status(),
        }
    }

    /// Stable machine-readable label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::AlreadyInstalled => "already_installed",
            Self::NotInstalled => "not_installed",
            Self::NoRealAllocator => "no_real_allocator",
            Self::IntegrityMismatch => "integrity_mismatch",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FaultError {
    #[error("invalid fault plan `{0}` (expected DELAY[:REPEAT] or `off`)")]
    InvalidFaultPlan(String),
    #[error("invalid value `{value}` for {var}")]
    InvalidEnvValue { var: &'static str, value: String },
    #[error("fault overlay is already installed")]
    AlreadyInstalled,
    #[error("fault overlay is not installed")]
    NotInstalled,
    #[error("no real allocator is configured in the slot")]
    NoRealAllocator,
    #[error("benign region exit without a matching enter")]
    UnmatchedBenignExit,
    #[error("allocator slot integrity mismatch: saved {saved}, found {current}")]
    IntegrityMismatch { saved: String, current: String },
    #[error("allocator `{table}` failed to initialize (code {code})")]
    InitFailed { table: String, code: i32 },
}

impl FaultError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidFaultPlan(_) | Self::InvalidEnvValue { .. } => ErrorKind::Configuration,
            Self::AlreadyInstalled
            | Self::NotInstalled
            | Self::NoRealAllocator
            | Self::UnmatchedBenignExit => ErrorKind::State,
            Self::IntegrityMismatch { .. } => ErrorKind::Integrity,
            Self::InitFailed { .. } => ErrorKind::Allocator,
        }
    }

    #[must_use]
    pub const fn status(&self) -> OverlayStatus {
        match self {
            Self::AlreadyInstalled => OverlayStatus::AlreadyInstalled,
            Self::NotInstalled => OverlayStatus::NotInstalled,
            Self::NoRealAllocator => OverlayStatus::NoRealAllocator,
            Self::IntegrityMismatch { .. } => OverlayStatus::IntegrityMismatch,
            _ => OverlayStatus::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(
            FaultError::InvalidFaultPlan("x".into()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(FaultError::AlreadyInstalled.kind(), ErrorKind::State);
        assert_eq!(FaultError::UnmatchedBenignExit.kind(), ErrorKind::State);
        let mismatch = FaultError::IntegrityMismatch {
            saved: "a".into(),
            current: "b".into(),
        };
        assert_eq!(mismatch.kind(), ErrorKind::Integrity);
        assert_eq!(mismatch.status(), OverlayStatus::IntegrityMismatch);
    }

    #[test]
    fn status_from_result() {
        assert_eq!(OverlayStatus::from_result(&Ok(())), OverlayStatus::Ok);
        assert_eq!(
            OverlayStatus::from_result(&Err(FaultError::NotInstalled)),
            OverlayStatus::NotInstalled
        );
        assert_eq!(
            OverlayStatus::from_result(&Err(FaultError::UnmatchedBenignExit)),
            OverlayStatus::Error
        );
        assert_eq!(OverlayStatus::AlreadyInstalled.as_str(), "already_installed");
    }
}
