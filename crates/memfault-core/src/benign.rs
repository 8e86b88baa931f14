//! Nesting counter for regions that tolerate allocation failure.
//!
//! Code that can recover from an allocation failure without reporting it (an
//! optional cache, a best-effort resize) brackets that work with
//! [`BenignDepthTracker::enter`] and [`BenignDepthTracker::exit`]. Regions nest;
//! a simulated failure counts as benign while the depth is non-zero.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::FaultError;

#[derive(Debug, Default)]
pub struct BenignDepthTracker {
    depth: AtomicU32,
}

impl BenignDepthTracker {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            depth: AtomicU32::new(0),
        }
    }

    pub fn enter(&self) {
        let depth = self.depth.load(Ordering::Relaxed);
        self.depth.store(depth.saturating_add(1), Ordering::Relaxed);
    }

    /// Leave the innermost benign region.
    ///
    /// Exiting at depth zero is a contract violation and leaves the depth at
    /// zero.
    pub fn exit(&self) -> Result<(), FaultError> {
        let depth = self.depth.load(Ordering::Relaxed);
        if depth == 0 {
            return Err(FaultError::UnmatchedBenignExit);
        }
        self.depth.store(depth - 1, Ordering::Relaxed);
        Ok(())
    }

    #[must_use]
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_benign(&self) -> bool {
        self.depth() > 0
    }

    /// Enter a region that is exited when the guard drops.
    #[must_use]
    pub fn region(&self) -> BenignGuard<'_> {
        self.enter();
        BenignGuard { tracker: self }
    }
}

/// Scope guard returned by [`BenignDepthTracker::region`].
#[derive(Debug)]
pub struct BenignGuard<'a> {
    tracker: &'a BenignDepthTracker,
}

impl Drop for BenignGuard<'_> {
    fn drop(&mut self) {
        // Paired with the enter in `region`.
        let _ = self.tracker.exit();
    }
}
