//! The allocator slot: where the environment looks up its current table.
//!
//! Allocation entry points (`malloc`, `realloc`, ...) always dispatch through
//! whatever handle the slot holds at call time, so swapping the handle
//! redirects every subsequent call. The slot also carries the benign hooks an
//! installed overlay registers.

#![allow(unsafe_code)]

use std::ptr::NonNull;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::benign::BenignDepthTracker;
use crate::error::FaultError;
use crate::system::global_system_table;
use crate::table::AllocatorHandle;

/// Process-wide slot interface the installer operates on.
pub trait AllocatorSlot: Send + Sync {
    /// Handle currently configured, if any.
    fn current(&self) -> Option<AllocatorHandle>;

    /// Replace the configured handle.
    fn configure(&self, table: Option<AllocatorHandle>);

    /// Register (or, with `None`, clear) the tracker that benign begin/end
    /// calls forward to.
    fn set_benign_hooks(&self, hooks: Option<Arc<BenignDepthTracker>>);
}

/// Allocation failed: the table returned no block for the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("out of memory allocating {0} bytes")]
pub struct OutOfMemory(pub usize);

#[derive(Debug, Default)]
pub struct MallocSlot {
    table: RwLock<Option<AllocatorHandle>>,
    benign: RwLock<Option<Arc<BenignDepthTracker>>>,
}

impl AllocatorSlot for MallocSlot {
    fn current(&self) -> Option<AllocatorHandle> {
        self.table.read().clone()
    }

    fn configure(&self, table: Option<AllocatorHandle>) {
        *self.table.write() = table;
    }

    fn set_benign_hooks(&self, hooks: Option<Arc<BenignDepthTracker>>) {
        *self.benign.write() = hooks;
    }
}

impl MallocSlot {
    /// Create an empty slot with no table and no benign hooks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_table(table: AllocatorHandle) -> Self {
        let slot = Self::new();
        slot.configure(Some(table));
        slot
    }

    /// Allocate `size` bytes through the current table.
    ///
    /// A zero-byte request returns `None` without reaching the table.
    pub fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        self.current()?.allocate(size)
    }

    /// Resize through the current table.
    ///
    /// `ptr == None` behaves as [`malloc`](Self::malloc); `size == 0` frees the
    /// block and returns `None`.
    ///
    /// # Safety
    ///
    /// A `Some` pointer must be a live block of the current table.
    pub unsafe fn realloc(&self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        let Some(ptr) = ptr else {
            return self.malloc(size);
        };
        if size == 0 {
            // SAFETY: forwarded caller contract.
            unsafe { self.free(Some(ptr)) };
            return None;
        }
        let table = self.current()?;
        // SAFETY: forwarded caller contract.
        unsafe { table.reallocate(ptr, size) }
    }

    /// Free through the current table. `None` is ignored.
    ///
    /// # Safety
    ///
    /// A `Some` pointer must be a live block of the current table.
    pub unsafe fn free(&self, ptr: Option<NonNull<u8>>) {
        let (Some(ptr), Some(table)) = (ptr, self.current()) else {
            return;
        };
        // SAFETY: forwarded caller contract.
        unsafe { table.free(ptr) };
    }

    /// Usable size of a block; zero for `None` or an empty slot.
    ///
    /// # Safety
    ///
    /// A `Some` pointer must be a live block of the current table.
    pub unsafe fn allocation_size(&self, ptr: Option<NonNull<u8>>) -> usize {
        let (Some(ptr), Some(table)) = (ptr, self.current()) else {
            return 0;
        };
        // SAFETY: forwarded caller contract.
        unsafe { table.size(ptr) }
    }

    #[must_use]
    pub fn roundup(&self, size: usize) -> usize {
        self.current().map_or(size, |table| table.roundup(size))
    }

    pub fn init(&self) -> Result<(), FaultError> {
        self.current().ok_or(FaultError::NoRealAllocator)?.init()
    }

    pub fn shutdown(&self) {
        if let Some(table) = self.current() {
            table.shutdown();
        }
    }

    /// Enter a benign region on the registered tracker; no-op without hooks.
    pub fn begin_benign(&self) {
        if let Some(tracker) = self.benign.read().as_ref() {
            tracker.enter();
        }
    }

    /// Leave a benign region on the registered tracker; no-op without hooks.
    pub fn end_benign(&self) -> Result<(), FaultError> {
        match self.benign.read().as_ref() {
            Some(tracker) => tracker.exit(),
            None => Ok(()),
        }
    }

    /// Benign region that ends on the same tracker it began on, even if the
    /// hooks change in between.
    #[must_use]
    pub fn benign_region(&self) -> SlotBenignGuard {
        let tracker = self.benign.read().clone();
        if let Some(tracker) = &tracker {
            tracker.enter();
        }
        SlotBenignGuard { tracker }
    }

    /// Whether the registered tracker (if any) reports an open benign region.
    #[must_use]
    pub fn in_benign_region(&self) -> bool {
        self.benign.read().as_ref().is_some_and(|t| t.is_benign())
    }
}

/// Guard returned by [`MallocSlot::benign_region`].
#[derive(Debug)]
pub struct SlotBenignGuard {
    tracker: Option<Arc<BenignDepthTracker>>,
}

impl Drop for SlotBenignGuard {
    fn drop(&mut self) {
        if let Some(tracker) = &self.tracker {
            let _ = tracker.exit();
        }
    }
}

/// Zero-initialized byte buffer allocated from a slot.
///
/// The buffer stays bound to the table that produced it: resizes and the final
/// free go to that table even if the slot is reconfigured meanwhile.
pub struct SlotBuffer {
    table: AllocatorHandle,
    block: Option<NonNull<u8>>,
    len: usize,
}

impl std::fmt::Debug for SlotBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotBuffer")
            .field("table", &self.table.name())
            .field("len", &self.len)
            .finish()
    }
}

impl SlotBuffer {
    /// Allocate `len` zeroed bytes through the slot's current table.
    ///
    /// An empty slot fails like exhaustion. A zero length holds no block.
    pub fn new(slot: &MallocSlot, len: usize) -> Result<Self, OutOfMemory> {
        let table = slot.current().ok_or(OutOfMemory(len))?;
        let mut buffer = Self {
            table,
            block: None,
            len: 0,
        };
        buffer.resize(len)?;
        Ok(buffer)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match self.block {
            // SAFETY: block is live for `len` initialized bytes.
            Some(block) => unsafe { std::slice::from_raw_parts(block.as_ptr(), self.len) },
            None => &[],
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self.block {
            // SAFETY: block is live for `len` initialized bytes and uniquely owned.
            Some(block) => unsafe { std::slice::from_raw_parts_mut(block.as_ptr(), self.len) },
            None => &mut [],
        }
    }

    /// Resize to `len` bytes, zero-filling any growth.
    ///
    /// On failure the buffer keeps its previous block and contents.
    pub fn resize(&mut self, len: usize) -> Result<(), OutOfMemory> {
        if len == self.len {
            return Ok(());
        }
        let resized = match (self.block, len) {
            (None, _) => Some(self.table.allocate(len).ok_or(OutOfMemory(len))?),
            (Some(block), 0) => {
                // SAFETY: block is live and owned by this buffer.
                unsafe { self.table.free(block) };
                None
            }
            // SAFETY: block is live and owned by this buffer.
            (Some(block), _) => Some(unsafe { self.table.reallocate(block, len) }.ok_or(OutOfMemory(len))?),
        };
        if let Some(block) = resized {
            if len > self.len {
                // SAFETY: block is valid for `len` bytes; the tail past the old
                // length is uninitialized.
                unsafe { block.as_ptr().add(self.len).write_bytes(0, len - self.len) };
            }
        }
        self.block = resized;
        self.len = len;
        Ok(())
    }
}

impl Drop for SlotBuffer {
    fn drop(&mut self) {
        if let Some(block) = self.block.take() {
            // SAFETY: block is live and owned by this buffer.
            unsafe { self.table.free(block) };
        }
    }
}

static GLOBAL_SLOT: OnceLock<Arc<MallocSlot>> = OnceLock::new();

/// Process-wide allocator slot, configured with the global [`SystemTable`].
///
/// [`SystemTable`]: crate::system::SystemTable
#[must_use]
pub fn global_slot() -> &'static Arc<MallocSlot> {
    GLOBAL_SLOT.get_or_init(|| {
        let system = Arc::clone(global_system_table());
        Arc::new(MallocSlot::with_table(AllocatorHandle::from_arc(system)))
    })
}
