//! The fault overlay table and its installer.
//!
//! [`FaultOverlayTable`] wraps the real table captured at install. Every
//! `allocate` and `reallocate` asks the scheduler first; a failure returns
//! `None` without reaching the real table. `free`, `size`, `roundup`, `init`
//! and `shutdown` always pass through.
//!
//! [`OverlayInstaller`] swaps the slot between the real table and the overlay.
//! Install and uninstall are not reentrant; callers serialize them.

#![allow(unsafe_code)]

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::benign::BenignDepthTracker;
use crate::config::{FatalHandler, FaultPlan, OverlayConfig};
use crate::error::FaultError;
use crate::journal::{LifecycleJournal, OverlayLogLevel, OverlaySnapshot};
use crate::scheduler::{FaultCounters, FaultScheduler};
use crate::site_log::AllocationSiteLog;
use crate::slot::{AllocatorSlot, global_slot};
use crate::table::{AllocatorHandle, AllocatorTable};

/// Name reported by [`FaultOverlayTable`].
pub const OVERLAY_TABLE_NAME: &str = "memfault-overlay";

static SIMULATED_FAULT_HITS: AtomicU64 = AtomicU64::new(0);

/// Breakpoint target: runs once per simulated failure.
#[inline(never)]
fn simulated_fault() {
    SIMULATED_FAULT_HITS.fetch_add(1, Ordering::Relaxed);
}

/// Process-wide number of simulated failures, across all overlays.
#[must_use]
pub fn simulated_fault_hits() -> u64 {
    SIMULATED_FAULT_HITS.load(Ordering::Relaxed)
}

/// State shared between an installer and the overlay tables it creates.
#[derive(Debug)]
struct OverlayCore {
    scheduler: FaultScheduler,
    benign: Arc<BenignDepthTracker>,
    site_log: AllocationSiteLog,
    journal: LifecycleJournal,
}

impl OverlayCore {
    fn snapshot(&self) -> OverlaySnapshot {
        OverlaySnapshot {
            pending: self.scheduler.pending(),
            total_failures: self.scheduler.total_failures(),
            benign_failures: self.scheduler.benign_failures(),
            benign_depth: self.benign.depth(),
        }
    }

    fn log(
        &self,
        level: OverlayLogLevel,
        symbol: &'static str,
        event: &'static str,
        outcome: &'static str,
        details: impl Into<String>,
    ) {
        self.journal
            .record(level, symbol, event, outcome, details, self.snapshot());
    }

    /// Returns true when this call should fail.
    fn should_fail(&self, symbol: &'static str, size: usize) -> bool {
        if !self.scheduler.decide(&self.benign).is_fail() {
            return false;
        }
        simulated_fault();
        let outcome = if self.benign.is_benign() { "benign" } else { "hard" };
        self.log(
            OverlayLogLevel::Warn,
            symbol,
            "simulated_failure",
            outcome,
            format!("size={size}"),
        );
        true
    }
}

/// Overlay table interposed in front of a real table.
pub struct FaultOverlayTable {
    real: AllocatorHandle,
    core: Arc<OverlayCore>,
}

impl fmt::Debug for FaultOverlayTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultOverlayTable")
            .field("real", &self.real)
            .finish_non_exhaustive()
    }
}

impl FaultOverlayTable {
    /// The table calls pass through to.
    #[must_use]
    pub fn real(&self) -> &AllocatorHandle {
        &self.real
    }
}

impl AllocatorTable for FaultOverlayTable {
    fn name(&self) -> &str {
        OVERLAY_TABLE_NAME
    }

    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        if self.core.should_fail("allocate", size) {
            return None;
        }
        let block = self.real.allocate(size)?;
        self.core.site_log.record(size);
        Some(block)
    }

    unsafe fn reallocate(&self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        if self.core.should_fail("reallocate", size) {
            return None;
        }
        // SAFETY: the overlay hands out the real table's blocks unchanged.
        unsafe { self.real.reallocate(ptr, size) }
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        // SAFETY: as above.
        unsafe { self.real.free(ptr) }
    }

    unsafe fn size(&self, ptr: NonNull<u8>) -> usize {
        // SAFETY: as above.
        unsafe { self.real.size(ptr) }
    }

    fn roundup(&self, size: usize) -> usize {
        self.real.roundup(size)
    }

    fn init(&self) -> Result<(), FaultError> {
        self.real.init()
    }

    fn shutdown(&self) {
        self.real.shutdown();
    }
}

#[derive(Debug, Default)]
struct OverlayState {
    installed: bool,
    saved_real: Option<AllocatorHandle>,
}

pub struct OverlayInstaller {
    slot: Arc<dyn AllocatorSlot>,
    core: Arc<OverlayCore>,
    state: Mutex<OverlayState>,
    initial_plan: FaultPlan,
    site_log_autostart: bool,
    fatal: FatalHandler,
}

impl fmt::Debug for OverlayInstaller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlayInstaller")
            .field("installed", &self.is_installed())
            .field("pending", &self.pending())
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

impl OverlayInstaller {
    #[must_use]
    pub fn new(slot: Arc<dyn AllocatorSlot>, config: OverlayConfig) -> Self {
        let core = OverlayCore {
            scheduler: FaultScheduler::new(),
            benign: Arc::new(BenignDepthTracker::new()),
            site_log: AllocationSiteLog::with_shared_capture(config.capture),
            journal: LifecycleJournal::new(config.journal_capacity),
        };
        Self {
            slot,
            core: Arc::new(core),
            state: Mutex::new(OverlayState::default()),
            initial_plan: config.initial_plan,
            site_log_autostart: config.site_log_autostart,
            fatal: config.fatal,
        }
    }

    /// Interpose the overlay in front of the slot's current table.
    pub fn install(&self) -> Result<(), FaultError> {
        let mut state = self.state.lock();
        if state.installed {
            self.core.log(
                OverlayLogLevel::Warn,
                "install",
                "install_rejected",
                "already_installed",
                "",
            );
            return Err(FaultError::AlreadyInstalled);
        }
        let Some(real) = self.slot.current() else {
            self.core.log(
                OverlayLogLevel::Error,
                "install",
                "install_rejected",
                "no_real_allocator",
                "",
            );
            return Err(FaultError::NoRealAllocator);
        };

        let overlay = AllocatorHandle::new(FaultOverlayTable {
            real: real.clone(),
            core: Arc::clone(&self.core),
        });
        self.slot.configure(Some(overlay));
        self.slot.set_benign_hooks(Some(Arc::clone(&self.core.benign)));
        let details = format!("real={} image={}", real.name(), real.image().to_hex());
        state.saved_real = Some(real);
        state.installed = true;

        if self.initial_plan.is_armed() {
            self.core
                .scheduler
                .reconfigure(self.initial_plan.delay, self.initial_plan.repeat);
        }
        if self.site_log_autostart {
            self.core.site_log.start();
        }
        self.core.log(
            OverlayLogLevel::Info,
            "install",
            "overlay_installed",
            "ok",
            details,
        );
        Ok(())
    }

    /// Restore the saved real table and verify the slot now holds it.
    ///
    /// A slot that reads back anything else is fatal.
    pub fn uninstall(&self) -> Result<(), FaultError> {
        let mut state = self.state.lock();
        if !state.installed {
            self.core.log(
                OverlayLogLevel::Warn,
                "uninstall",
                "uninstall_rejected",
                "not_installed",
                "",
            );
            return Err(FaultError::NotInstalled);
        }
        let Some(saved) = state.saved_real.take() else {
            state.installed = false;
            return Err(FaultError::NoRealAllocator);
        };
        state.installed = false;

        self.slot.configure(Some(saved.clone()));
        let restored = self.slot.current();
        let saved_image = saved.image();
        let matches = restored
            .as_ref()
            .is_some_and(|current| current.image() == saved_image);
        if !matches {
            let err = FaultError::IntegrityMismatch {
                saved: saved_image.to_hex(),
                current: restored.map_or_else(|| "empty".to_string(), |c| c.image().to_hex()),
            };
            self.core.log(
                OverlayLogLevel::Error,
                "uninstall",
                "integrity_check",
                "mismatch",
                err.to_string(),
            );
            (self.fatal)(&err);
        }
        self.core.log(
            OverlayLogLevel::Debug,
            "uninstall",
            "integrity_check",
            "match",
            saved_image.to_hex(),
        );
        self.slot.set_benign_hooks(None);
        self.core.log(
            OverlayLogLevel::Info,
            "uninstall",
            "overlay_uninstalled",
            "ok",
            format!("real={}", saved.name()),
        );
        Ok(())
    }

    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.state.lock().installed
    }

    /// Re-arm the scheduler; see [`FaultScheduler::reconfigure`].
    pub fn reconfigure(&self, delay: i64, repeat: i64) -> FaultCounters {
        let previous = self.core.scheduler.reconfigure(delay, repeat);
        self.core.log(
            OverlayLogLevel::Debug,
            "reconfigure",
            "fault_plan_set",
            if delay >= 0 { "armed" } else { "disarmed" },
            format!(
                "delay={delay} repeat={repeat} previous_total={} previous_benign={}",
                previous.total_failures, previous.benign_failures
            ),
        );
        previous
    }

    pub fn apply_plan(&self, plan: FaultPlan) -> FaultCounters {
        self.reconfigure(plan.delay, plan.repeat)
    }

    #[must_use]
    pub fn pending(&self) -> i64 {
        self.core.scheduler.pending()
    }

    #[must_use]
    pub fn total_failures(&self) -> u64 {
        self.core.scheduler.total_failures()
    }

    #[must_use]
    pub fn benign_failures(&self) -> u64 {
        self.core.scheduler.benign_failures()
    }

    #[must_use]
    pub fn scheduler(&self) -> &FaultScheduler {
        &self.core.scheduler
    }

    #[must_use]
    pub fn benign(&self) -> &Arc<BenignDepthTracker> {
        &self.core.benign
    }

    #[must_use]
    pub fn site_log(&self) -> &AllocationSiteLog {
        &self.core.site_log
    }

    #[must_use]
    pub fn journal(&self) -> &LifecycleJournal {
        &self.core.journal
    }

    #[must_use]
    pub fn slot(&self) -> &Arc<dyn AllocatorSlot> {
        &self.slot
    }
}

static GLOBAL_OVERLAY: OnceLock<OverlayInstaller> = OnceLock::new();

/// The overlay bound to [`global_slot`], configured from the environment
/// unless [`global_overlay_with`] bound it first.
#[must_use]
pub fn global_overlay() -> &'static OverlayInstaller {
    GLOBAL_OVERLAY.get_or_init(|| bind_global(OverlayConfig::from_env()))
}

/// Bind the process-wide overlay with `config`.
///
/// Only the first binding takes effect; later calls return the existing
/// instance unchanged.
pub fn global_overlay_with(config: OverlayConfig) -> &'static OverlayInstaller {
    GLOBAL_OVERLAY.get_or_init(|| bind_global(config))
}

fn bind_global(config: OverlayConfig) -> OverlayInstaller {
    let slot: Arc<dyn AllocatorSlot> = global_slot().clone();
    OverlayInstaller::new(slot, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OverlayStatus;
    use crate::slot::MallocSlot;
    use crate::system::SystemTable;

    fn panic_on_fatal(err: &FaultError) -> ! {
        panic!("fatal: {err}")
    }

    fn fixture(config: OverlayConfig) -> (Arc<MallocSlot>, Arc<SystemTable>, OverlayInstaller) {
        let system = Arc::new(SystemTable::new());
        let slot = Arc::new(MallocSlot::with_table(AllocatorHandle::from_arc(system.clone())));
        let installer = OverlayInstaller::new(slot.clone(), config.with_fatal_handler(panic_on_fatal));
        (slot, system, installer)
    }

    fn outcomes(slot: &MallocSlot, calls: usize) -> Vec<bool> {
        (0..calls)
            .map(|_| match slot.malloc(16) {
                Some(block) => {
                    // SAFETY: block was just allocated from this slot.
                    unsafe { slot.free(Some(block)) };
                    true
                }
                None => false,
            })
            .collect()
    }

    #[test]
    fn install_swaps_and_uninstall_restores() {
        let (slot, _system, installer) = fixture(OverlayConfig::default());
        let real = slot.current().unwrap();
        installer.install().unwrap();
        assert!(installer.is_installed());
        assert_eq!(slot.current().unwrap().name(), OVERLAY_TABLE_NAME);
        installer.uninstall().unwrap();
        assert!(slot.current().unwrap().same_table(&real));
        assert!(!installer.is_installed());
    }

    #[test]
    fn double_install_and_uninstall_are_rejected() {
        let (_slot, _system, installer) = fixture(OverlayConfig::default());
        assert_eq!(installer.uninstall(), Err(FaultError::NotInstalled));
        installer.install().unwrap();
        let second = installer.install();
        assert_eq!(OverlayStatus::from_result(&second), OverlayStatus::AlreadyInstalled);
        installer.uninstall().unwrap();
        assert_eq!(
            OverlayStatus::from_result(&installer.uninstall()),
            OverlayStatus::NotInstalled
        );
    }

    #[test]
    fn empty_slot_cannot_be_overlaid() {
        let slot: Arc<dyn AllocatorSlot> = Arc::new(MallocSlot::new());
        let installer = OverlayInstaller::new(slot, OverlayConfig::default());
        assert_eq!(installer.install(), Err(FaultError::NoRealAllocator));
        assert!(!installer.is_installed());
    }

    #[test]
    fn scheduled_failures_through_the_slot() {
        let (slot, system, installer) = fixture(OverlayConfig::default());
        installer.install().unwrap();
        installer.reconfigure(2, 3);
        assert_eq!(outcomes(&slot, 6), vec![true, true, false, false, false, true]);
        assert_eq!(installer.total_failures(), 3);
        assert_eq!(installer.pending(), -1);
        assert_eq!(system.outstanding_blocks(), 0);
        installer.uninstall().unwrap();
    }

    #[test]
    fn benign_failure_then_success() {
        let (slot, _system, installer) = fixture(OverlayConfig::default());
        installer.install().unwrap();
        slot.begin_benign();
        installer.reconfigure(0, 1);
        assert!(slot.malloc(8).is_none());
        assert_eq!(installer.benign_failures(), 1);
        assert_eq!(installer.total_failures(), 1);
        slot.end_benign().unwrap();
        let block = slot.malloc(8).unwrap();
        // SAFETY: block is live.
        unsafe { slot.free(Some(block)) };
        installer.uninstall().unwrap();
    }

    #[test]
    fn uninstall_clears_benign_hooks() {
        let (slot, _system, installer) = fixture(OverlayConfig::default());
        installer.install().unwrap();
        slot.begin_benign();
        assert_eq!(installer.benign().depth(), 1);
        slot.end_benign().unwrap();
        installer.uninstall().unwrap();
        slot.begin_benign();
        assert_eq!(installer.benign().depth(), 0);
    }

    #[test]
    fn realloc_is_scheduled_and_keeps_block_on_failure() {
        let (slot, system, installer) = fixture(OverlayConfig::default());
        installer.install().unwrap();
        let block = slot.malloc(4).unwrap();
        installer.reconfigure(0, 1);
        // SAFETY: block is live in the slot's table.
        assert!(unsafe { slot.realloc(Some(block), 64) }.is_none());
        // SAFETY: the failed realloc left block untouched.
        assert_eq!(unsafe { slot.allocation_size(Some(block)) }, 4);
        // SAFETY: block is live.
        unsafe { slot.free(Some(block)) };
        assert_eq!(system.outstanding_blocks(), 0);
        installer.uninstall().unwrap();
    }

    #[test]
    fn zero_byte_malloc_does_not_tick() {
        let (slot, _system, installer) = fixture(OverlayConfig::default());
        installer.install().unwrap();
        installer.reconfigure(1, 1);
        assert!(slot.malloc(0).is_none());
        assert_eq!(installer.pending(), 1);
        installer.uninstall().unwrap();
    }

    #[test]
    fn failures_are_journaled_and_counted() {
        let (slot, _system, installer) = fixture(OverlayConfig::default());
        installer.install().unwrap();
        installer.reconfigure(0, 2);
        let before = simulated_fault_hits();
        assert_eq!(outcomes(&slot, 3), vec![false, false, true]);
        assert!(simulated_fault_hits() >= before + 2);
        installer.uninstall().unwrap();

        let journal = installer.journal().snapshot();
        let failures: Vec<_> = journal
            .iter()
            .filter(|r| r.event == "simulated_failure")
            .collect();
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().all(|r| r.outcome == "hard"));
        assert_eq!(failures[1].total_failures, 2);
        assert!(journal.iter().any(|r| r.event == "overlay_installed"));
        assert!(journal
            .iter()
            .any(|r| r.event == "integrity_check" && r.outcome == "match"));
        assert!(journal
            .iter()
            .all(|r| r.trace_id.starts_with("memfault::overlay::")));
    }

    #[test]
    fn site_log_sees_pass_through_allocations() {
        let (slot, _system, installer) = fixture(
            OverlayConfig::default()
                .with_site_log_autostart(true)
                .with_capture(|frames: &mut [usize]| -> usize {
                    frames[0] = 0x42;
                    1
                }),
        );
        installer.install().unwrap();
        installer.reconfigure(1, 1);
        assert_eq!(outcomes(&slot, 3), vec![true, false, true]);
        let dump = installer.site_log().dump();
        assert_eq!(dump.len(), 1);
        assert_eq!(dump[0].call_count, 2);
        assert_eq!(dump[0].total_bytes, 32);
        installer.uninstall().unwrap();
    }

    #[test]
    fn initial_plan_arms_at_install() {
        let (slot, _system, installer) =
            fixture(OverlayConfig::default().with_initial_plan(FaultPlan::new(1, 1)));
        assert_eq!(installer.pending(), -1);
        installer.install().unwrap();
        assert_eq!(installer.pending(), 1);
        assert_eq!(outcomes(&slot, 3), vec![true, false, true]);
        installer.uninstall().unwrap();
    }

    #[test]
    fn nested_overlays_unwind_in_order() {
        let (slot, _system, outer) = fixture(OverlayConfig::default());
        let inner = OverlayInstaller::new(slot.clone(), OverlayConfig::default());
        outer.install().unwrap();
        inner.install().unwrap();
        inner.reconfigure(0, 1);
        assert_eq!(outcomes(&slot, 2), vec![false, true]);
        assert_eq!(outer.total_failures(), 0);
        inner.uninstall().unwrap();
        assert_eq!(slot.current().unwrap().name(), OVERLAY_TABLE_NAME);
        outer.uninstall().unwrap();
        assert_eq!(slot.current().unwrap().name(), "system");
    }

    /// Slot that ignores every configure after the first.
    struct StickySlot {
        inner: MallocSlot,
        writes: Mutex<u32>,
    }

    impl AllocatorSlot for StickySlot {
        fn current(&self) -> Option<AllocatorHandle> {
            self.inner.current()
        }

        fn configure(&self, table: Option<AllocatorHandle>) {
            let mut writes = self.writes.lock();
            if *writes == 0 {
                self.inner.configure(table);
            }
            *writes += 1;
        }

        fn set_benign_hooks(&self, hooks: Option<Arc<BenignDepthTracker>>) {
            self.inner.set_benign_hooks(hooks);
        }
    }

    /// Real table that hands out nothing and counts the calls it sees.
    #[derive(Default)]
    struct CountingTable {
        allocs: AtomicU64,
        roundups: AtomicU64,
        inits: AtomicU64,
        shutdowns: AtomicU64,
    }

    impl AllocatorTable for CountingTable {
        fn name(&self) -> &str {
            "counting"
        }

        fn allocate(&self, _size: usize) -> Option<NonNull<u8>> {
            self.allocs.fetch_add(1, Ordering::Relaxed);
            None
        }

        unsafe fn reallocate(&self, _ptr: NonNull<u8>, _size: usize) -> Option<NonNull<u8>> {
            None
        }

        unsafe fn free(&self, _ptr: NonNull<u8>) {}

        unsafe fn size(&self, _ptr: NonNull<u8>) -> usize {
            0
        }

        fn roundup(&self, size: usize) -> usize {
            self.roundups.fetch_add(1, Ordering::Relaxed);
            size.next_multiple_of(8)
        }

        fn init(&self) -> Result<(), FaultError> {
            self.inits.fetch_add(1, Ordering::Relaxed);
            Err(FaultError::InitFailed {
                table: self.name().to_string(),
                code: 7,
            })
        }

        fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn counting_fixture(config: OverlayConfig) -> (Arc<CountingTable>, Arc<MallocSlot>, OverlayInstaller) {
        let table = Arc::new(CountingTable::default());
        let slot = Arc::new(MallocSlot::with_table(AllocatorHandle::from_arc(table.clone())));
        let installer = OverlayInstaller::new(slot.clone(), config.with_fatal_handler(panic_on_fatal));
        (table, slot, installer)
    }

    #[test]
    fn housekeeping_calls_reach_the_real_table_untimed() {
        let (table, slot, installer) = counting_fixture(OverlayConfig::default());
        installer.install().unwrap();
        installer.reconfigure(1, 1);

        assert_eq!(slot.roundup(13), 16);
        let err = slot.init().unwrap_err();
        assert_eq!(
            err,
            FaultError::InitFailed {
                table: "counting".to_string(),
                code: 7
            }
        );
        assert_eq!(err.kind(), crate::error::ErrorKind::Allocator);
        slot.shutdown();

        assert_eq!(table.roundups.load(Ordering::Relaxed), 1);
        assert_eq!(table.inits.load(Ordering::Relaxed), 1);
        assert_eq!(table.shutdowns.load(Ordering::Relaxed), 1);
        assert_eq!(installer.pending(), 1);
        assert_eq!(installer.total_failures(), 0);
        installer.uninstall().unwrap();
    }

    #[test]
    fn real_exhaustion_is_not_attributed_to_a_site() {
        let (table, slot, installer) =
            counting_fixture(OverlayConfig::default().with_site_log_autostart(true));
        installer.install().unwrap();
        assert!(slot.malloc(16).is_none());
        assert_eq!(table.allocs.load(Ordering::Relaxed), 1);
        assert_eq!(installer.total_failures(), 0);
        assert!(installer.site_log().is_active());
        assert!(installer.site_log().is_empty());
        installer.uninstall().unwrap();
    }

    #[test]
    #[should_panic(expected = "integrity mismatch")]
    fn mismatched_restore_is_fatal() {
        let slot = Arc::new(StickySlot {
            inner: MallocSlot::with_table(AllocatorHandle::new(SystemTable::new())),
            writes: Mutex::new(0),
        });
        let installer = OverlayInstaller::new(
            slot,
            OverlayConfig::default().with_fatal_handler(panic_on_fatal),
        );
        installer.install().unwrap();
        let _ = installer.uninstall();
    }
}
