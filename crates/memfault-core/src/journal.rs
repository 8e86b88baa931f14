//! Structured lifecycle journal for the overlay.
//!
//! Install, uninstall, reconfigure, integrity checks and every simulated
//! failure append one record. The journal is a bounded ring: once `capacity`
//! records are held, the oldest is dropped. Pass-through decisions are never
//! journaled.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// Default number of records retained.
pub const DEFAULT_JOURNAL_CAPACITY: usize = 256;

/// Journal record severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OverlayLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl OverlayLogLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Scheduler and tracker state captured alongside a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverlaySnapshot {
    pub pending: i64,
    pub total_failures: u64,
    pub benign_failures: u64,
    pub benign_depth: u32,
}

/// Structured overlay lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayLogRecord {
    /// Monotonic event id, starting at 1.
    pub decision_id: u64,
    /// Correlation id (`memfault::overlay::{symbol}::{decision_id:016x}`).
    pub trace_id: String,
    pub level: OverlayLogLevel,
    /// Operation that produced the record (`install`, `allocate`, ...).
    pub symbol: &'static str,
    /// Event kind (`overlay_installed`, `simulated_failure`, ...).
    pub event: &'static str,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    pub details: String,
    /// Snapshot: scheduler pending value after the event.
    pub pending: i64,
    /// Snapshot: failures since the last reconfigure.
    pub total_failures: u64,
    /// Snapshot: benign failures since the last reconfigure.
    pub benign_failures: u64,
    /// Snapshot: benign nesting depth.
    pub benign_depth: u32,
}

#[derive(Debug)]
struct JournalState {
    next_decision_id: u64,
    dropped: u64,
    records: VecDeque<OverlayLogRecord>,
}

#[derive(Debug)]
pub struct LifecycleJournal {
    capacity: usize,
    state: Mutex<JournalState>,
}

impl Default for LifecycleJournal {
    fn default() -> Self {
        Self::new(DEFAULT_JOURNAL_CAPACITY)
    }
}

impl LifecycleJournal {
    /// Create a journal retaining at most `capacity` records. A zero capacity
    /// keeps nothing but still advances decision ids.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(JournalState {
                next_decision_id: 1,
                dropped: 0,
                records: VecDeque::with_capacity(capacity.min(DEFAULT_JOURNAL_CAPACITY)),
            }),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a record and return its decision id.
    pub fn record(
        &self,
        level: OverlayLogLevel,
        symbol: &'static str,
        event: &'static str,
        outcome: &'static str,
        details: impl Into<String>,
        snapshot: OverlaySnapshot,
    ) -> u64 {
        let mut state = self.state.lock();
        let decision_id = state.next_decision_id;
        state.next_decision_id = state.next_decision_id.wrapping_add(1);
        if self.capacity == 0 {
            state.dropped = state.dropped.saturating_add(1);
            return decision_id;
        }
        if state.records.len() == self.capacity {
            state.records.pop_front();
            state.dropped = state.dropped.saturating_add(1);
        }
        state.records.push_back(OverlayLogRecord {
            decision_id,
            trace_id: format!("memfault::overlay::{symbol}::{decision_id:016x}"),
            level,
            symbol,
            event,
            outcome,
            details: details.into(),
            pending: snapshot.pending,
            total_failures: snapshot.total_failures,
            benign_failures: snapshot.benign_failures,
            benign_depth: snapshot.benign_depth,
        });
        decision_id
    }

    /// Copy of the retained records, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<OverlayLogRecord> {
        self.state.lock().records.iter().cloned().collect()
    }

    /// Remove and return the retained records, oldest first.
    pub fn drain(&self) -> Vec<OverlayLogRecord> {
        self.state.lock().records.drain(..).collect()
    }

    pub fn clear(&self) {
        self.state.lock().records.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records evicted (or never kept) because of the capacity bound.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }
}
