//! Countdown/repeat fault scheduler.
//!
//! After [`FaultScheduler::reconfigure`]`(delay, repeat)` the next `delay`
//! decisions pass, the following `repeat` decisions fail, and every decision
//! after that passes until the next reconfigure. A negative delay disarms the
//! scheduler.
//!
//! The decrement is a plain load/store sequence on relaxed atomics. It is not a
//! critical section: callers that issue decisions from several threads must
//! serialize them externally to get reproducible failure timing.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use crate::benign::BenignDepthTracker;

/// Outcome of a single scheduling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    /// Forward the call to the real allocator.
    Pass,
    /// Simulate an allocation failure.
    Fail,
}

impl Decision {
    #[must_use]
    pub const fn is_fail(self) -> bool {
        matches!(self, Self::Fail)
    }
}

/// Snapshot of the scheduling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultConfig {
    pub countdown_remaining: i64,
    pub repeat_count: i64,
    pub enabled: bool,
}

/// Failure counters accumulated since the last reconfigure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultCounters {
    /// Every simulated failure, hard or benign.
    pub total_failures: u64,
    /// Failures produced while a benign region was open.
    pub benign_failures: u64,
}

impl FaultCounters {
    /// Failures produced outside any benign region.
    #[must_use]
    pub const fn hard_failures(&self) -> u64 {
        self.total_failures.saturating_sub(self.benign_failures)
    }
}

#[derive(Debug)]
pub struct FaultScheduler {
    countdown: AtomicI64,
    repeat: AtomicI64,
    enabled: AtomicBool,
    failures: AtomicU64,
    benign_failures: AtomicU64,
}

impl Default for FaultScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultScheduler {
    /// Create a disarmed scheduler.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            countdown: AtomicI64::new(-1),
            repeat: AtomicI64::new(0),
            enabled: AtomicBool::new(false),
            failures: AtomicU64::new(0),
            benign_failures: AtomicU64::new(0),
        }
    }

    /// Decide the outcome of the next intercepted call.
    ///
    /// `benign` is consulted only when a failure is produced.
    pub fn decide(&self, benign: &BenignDepthTracker) -> Decision {
        if !self.enabled.load(Ordering::Relaxed) {
            return Decision::Pass;
        }
        let countdown = self.countdown.load(Ordering::Relaxed);
        if countdown > 0 {
            self.countdown.store(countdown - 1, Ordering::Relaxed);
            return Decision::Pass;
        }

        self.failures.fetch_add(1, Ordering::Relaxed);
        if benign.is_benign() {
            self.benign_failures.fetch_add(1, Ordering::Relaxed);
        }
        let repeat = self.repeat.load(Ordering::Relaxed).saturating_sub(1);
        self.repeat.store(repeat, Ordering::Relaxed);
        if repeat <= 0 {
            self.enabled.store(false, Ordering::Relaxed);
        }
        Decision::Fail
    }

    /// Arm (or, with a negative `delay`, disarm) the scheduler.
    ///
    /// Returns the counters accumulated since the previous reconfigure; both
    /// counters restart from zero.
    pub fn reconfigure(&self, delay: i64, repeat: i64) -> FaultCounters {
        let previous = self.counters();
        self.countdown.store(delay, Ordering::Relaxed);
        self.repeat.store(repeat, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.benign_failures.store(0, Ordering::Relaxed);
        self.enabled.store(delay >= 0, Ordering::Relaxed);
        previous
    }

    /// Successful decisions left before the next failure, or −1 when no
    /// failure is scheduled.
    #[must_use]
    pub fn pending(&self) -> i64 {
        if self.enabled.load(Ordering::Relaxed) {
            self.countdown.load(Ordering::Relaxed)
        } else {
            -1
        }
    }

    #[must_use]
    pub fn total_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn benign_failures(&self) -> u64 {
        self.benign_failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn counters(&self) -> FaultCounters {
        FaultCounters {
            total_failures: self.total_failures(),
            benign_failures: self.benign_failures(),
        }
    }

    #[must_use]
    pub fn config(&self) -> FaultConfig {
        FaultConfig {
            countdown_remaining: self.countdown.load(Ordering::Relaxed),
            repeat_count: self.repeat.load(Ordering::Relaxed),
            enabled: self.is_enabled(),
        }
    }
}
