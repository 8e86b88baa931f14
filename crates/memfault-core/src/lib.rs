//! # memfault-core
//!
//! Deterministic fault injection for a pluggable allocator table.
//!
//! An [`OverlayInstaller`] swaps a [`FaultOverlayTable`] into an allocator
//! slot in front of the real table. A countdown/repeat [`FaultScheduler`] then
//! decides for each `allocate`/`reallocate` whether to pass the call through or
//! return `None`, and a [`BenignDepthTracker`] classifies failures produced
//! inside tolerant regions as benign. An [`AllocationSiteLog`] can aggregate
//! pass-through allocations by call site.

pub mod benign;
pub mod config;
pub mod error;
pub mod journal;
pub mod overlay;
pub mod scheduler;
pub mod site_log;
pub mod slot;
pub mod system;
pub mod table;

pub use benign::{BenignDepthTracker, BenignGuard};
pub use config::{FaultPlan, OverlayConfig};
pub use error::{ErrorKind, FaultError, OverlayStatus};
pub use journal::{LifecycleJournal, OverlayLogLevel, OverlayLogRecord};
pub use overlay::{
    FaultOverlayTable, OverlayInstaller, global_overlay, global_overlay_with, simulated_fault_hits,
};
pub use scheduler::{Decision, FaultConfig, FaultCounters, FaultScheduler};
pub use site_log::{AllocationSiteLog, FrameKey, SITE_KEY_FRAMES, SiteRecord, StackCapture};
pub use slot::{AllocatorSlot, MallocSlot, OutOfMemory, SlotBuffer, global_slot};
pub use system::{SystemTable, global_system_table};
pub use table::{AllocatorHandle, AllocatorTable, TableImage};
