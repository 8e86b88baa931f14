//! Allocation-site aggregation.
//!
//! While recording, every attributed allocation is keyed by a fixed-width
//! snapshot of its caller frames and folded into a per-key
//! {call count, total bytes} aggregate. Stack walking is not done here: a
//! [`StackCapture`] implementation supplies the frame identifiers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

/// Number of frames in a [`FrameKey`].
pub const SITE_KEY_FRAMES: usize = 10;

/// Fixed-width call-site identifier.
///
/// Shorter frame chains are zero-padded, longer ones keep the leading
/// [`SITE_KEY_FRAMES`] entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameKey([usize; SITE_KEY_FRAMES]);

impl FrameKey {
    #[must_use]
    pub fn from_frames(frames: &[usize]) -> Self {
        let mut key = [0_usize; SITE_KEY_FRAMES];
        let n = frames.len().min(SITE_KEY_FRAMES);
        key[..n].copy_from_slice(&frames[..n]);
        Self(key)
    }

    #[must_use]
    pub const fn frames(&self) -> &[usize; SITE_KEY_FRAMES] {
        &self.0
    }
}

/// Supplies caller frame identifiers for the current allocation.
pub trait StackCapture: Send + Sync {
    /// Fill `frames` with up to `frames.len()` identifiers, innermost first,
    /// and return how many were written.
    fn capture(&self, frames: &mut [usize]) -> usize;
}

impl<F> StackCapture for F
where
    F: Fn(&mut [usize]) -> usize + Send + Sync,
{
    fn capture(&self, frames: &mut [usize]) -> usize {
        self(frames)
    }
}

/// Capture that reports no frames; every allocation lands on the zero key.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoStackCapture;

impl StackCapture for NoStackCapture {
    fn capture(&self, _frames: &mut [usize]) -> usize {
        0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SiteAggregate {
    pub call_count: u64,
    pub total_bytes: u64,
}

/// One row of [`AllocationSiteLog::dump`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteRecord {
    pub call_count: u64,
    pub total_bytes: u64,
    pub key: FrameKey,
}

pub struct AllocationSiteLog {
    active: AtomicBool,
    sites: Mutex<BTreeMap<FrameKey, SiteAggregate>>,
    capture: Arc<dyn StackCapture>,
}

impl std::fmt::Debug for AllocationSiteLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationSiteLog")
            .field("active", &self.is_active())
            .field("sites", &self.len())
            .finish_non_exhaustive()
    }
}

impl Default for AllocationSiteLog {
    fn default() -> Self {
        Self::new(NoStackCapture)
    }
}

impl AllocationSiteLog {
    /// Create an inactive log that captures frames through `capture`.
    pub fn new(capture: impl StackCapture + 'static) -> Self {
        Self::with_shared_capture(Arc::new(capture))
    }

    #[must_use]
    pub fn with_shared_capture(capture: Arc<dyn StackCapture>) -> Self {
        Self {
            active: AtomicBool::new(false),
            sites: Mutex::new(BTreeMap::new()),
            capture,
        }
    }

    pub fn start(&self) {
        self.active.store(true, Ordering::Relaxed);
    }

    pub fn stop(&self) {
        self.active.store(false, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Attribute an allocation of `bytes` to the current call site.
    ///
    /// No-op while stopped.
    pub fn record(&self, bytes: usize) {
        if !self.is_active() {
            return;
        }
        let mut frames = [0_usize; SITE_KEY_FRAMES];
        let n = self.capture.capture(&mut frames).min(SITE_KEY_FRAMES);
        self.record_key(FrameKey::from_frames(&frames[..n]), bytes);
    }

    /// Attribute an allocation of `bytes` to an explicit key.
    ///
    /// No-op while stopped.
    pub fn record_key(&self, key: FrameKey, bytes: usize) {
        if !self.is_active() {
            return;
        }
        let mut sites = self.sites.lock();
        let entry = sites.entry(key).or_default();
        entry.call_count = entry.call_count.saturating_add(1);
        entry.total_bytes = entry.total_bytes.saturating_add(bytes as u64);
    }

    /// Aggregates ordered by key.
    #[must_use]
    pub fn dump(&self) -> Vec<SiteRecord> {
        self.sites
            .lock()
            .iter()
            .map(|(key, agg)| SiteRecord {
                call_count: agg.call_count,
                total_bytes: agg.total_bytes,
                key: *key,
            })
            .collect()
    }

    #[must_use]
    pub fn get(&self, key: &FrameKey) -> Option<SiteAggregate> {
        self.sites.lock().get(key).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sites.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard all aggregates. Recording state is unchanged.
    pub fn clear(&self) {
        self.sites.lock().clear();
    }

    /// Checkpoint: discard all aggregates and (re)start recording.
    pub fn sync(&self) {
        self.clear();
        self.start();
    }
}
