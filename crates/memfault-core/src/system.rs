//! Default real allocator backed by `std::alloc`.
//!
//! Every block carries a 16-byte header in front of the user base that records
//! the user size, so `size` and `free` need no side table. Outstanding bytes and
//! blocks are counted so a harness can detect leaks on recovery paths.

#![allow(unsafe_code)]

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crate::error::FaultError;
use crate::table::AllocatorTable;

/// Header bytes in front of every user block.
const HEADER_SIZE: usize = 16;

/// Alignment of every user block.
const BLOCK_ALIGN: usize = 16;

/// Granularity reported by `roundup`.
const ROUNDUP_GRANULE: usize = 8;

#[derive(Debug, Default)]
pub struct SystemTable {
    outstanding_bytes: AtomicUsize,
    outstanding_blocks: AtomicUsize,
}

impl SystemTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            outstanding_bytes: AtomicUsize::new(0),
            outstanding_blocks: AtomicUsize::new(0),
        }
    }

    /// User bytes currently allocated and not yet freed.
    #[must_use]
    pub fn outstanding_bytes(&self) -> usize {
        self.outstanding_bytes.load(Ordering::Relaxed)
    }

    /// Blocks currently allocated and not yet freed.
    #[must_use]
    pub fn outstanding_blocks(&self) -> usize {
        self.outstanding_blocks.load(Ordering::Relaxed)
    }

    fn layout_for(user_size: usize) -> Option<Layout> {
        let total = user_size.checked_add(HEADER_SIZE)?;
        Layout::from_size_align(total, BLOCK_ALIGN).ok()
    }

    /// Raw base and recorded user size of a block.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live user pointer handed out by this table.
    unsafe fn header(ptr: NonNull<u8>) -> (NonNull<u8>, usize) {
        // SAFETY: the header sits HEADER_SIZE bytes before the user base inside
        // the same allocation, and was written at allocation time.
        unsafe {
            let raw = ptr.as_ptr().sub(HEADER_SIZE);
            let size = raw.cast::<usize>().read();
            (NonNull::new_unchecked(raw), size)
        }
    }

    /// Write the header and return the user pointer.
    ///
    /// # Safety
    ///
    /// `raw` must be valid for `HEADER_SIZE + user_size` bytes and aligned to
    /// `BLOCK_ALIGN`.
    unsafe fn seal(raw: NonNull<u8>, user_size: usize) -> NonNull<u8> {
        // SAFETY: caller guarantees the header region is writable and aligned.
        unsafe {
            raw.as_ptr().cast::<usize>().write(user_size);
            NonNull::new_unchecked(raw.as_ptr().add(HEADER_SIZE))
        }
    }
}

impl AllocatorTable for SystemTable {
    fn name(&self) -> &str {
        "system"
    }

    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let layout = Self::layout_for(size)?;
        // SAFETY: layout has non-zero size (header is always present).
        let raw = NonNull::new(unsafe { std::alloc::alloc(layout) })?;
        self.outstanding_bytes.fetch_add(size, Ordering::Relaxed);
        self.outstanding_blocks.fetch_add(1, Ordering::Relaxed);
        // SAFETY: raw is valid for layout.size() bytes and BLOCK_ALIGN-aligned.
        Some(unsafe { Self::seal(raw, size) })
    }

    unsafe fn reallocate(&self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        // SAFETY: caller guarantees ptr is a live block of this table.
        let (raw, old_size) = unsafe { Self::header(ptr) };
        let old_layout = Self::layout_for(old_size)?;
        let new_total = size.checked_add(HEADER_SIZE)?;
        Layout::from_size_align(new_total, BLOCK_ALIGN).ok()?;
        // SAFETY: raw was allocated with old_layout; new_total is a valid size
        // for BLOCK_ALIGN as checked above.
        let moved = NonNull::new(unsafe { std::alloc::realloc(raw.as_ptr(), old_layout, new_total) })?;
        self.outstanding_bytes.fetch_sub(old_size, Ordering::Relaxed);
        self.outstanding_bytes.fetch_add(size, Ordering::Relaxed);
        // SAFETY: moved is valid for new_total bytes and keeps the alignment.
        Some(unsafe { Self::seal(moved, size) })
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        // SAFETY: caller guarantees ptr is a live block of this table.
        let (raw, size) = unsafe { Self::header(ptr) };
        let Some(layout) = Self::layout_for(size) else {
            return;
        };
        // SAFETY: raw was allocated with exactly this layout.
        unsafe { std::alloc::dealloc(raw.as_ptr(), layout) };
        self.outstanding_bytes.fetch_sub(size, Ordering::Relaxed);
        self.outstanding_blocks.fetch_sub(1, Ordering::Relaxed);
    }

    unsafe fn size(&self, ptr: NonNull<u8>) -> usize {
        // SAFETY: caller guarantees ptr is a live block of this table.
        unsafe { Self::header(ptr).1 }
    }

    fn roundup(&self, size: usize) -> usize {
        size.checked_add(ROUNDUP_GRANULE - 1)
            .map_or(size, |n| n & !(ROUNDUP_GRANULE - 1))
    }

    fn init(&self) -> Result<(), FaultError> {
        Ok(())
    }

    fn shutdown(&self) {}
}

static GLOBAL_SYSTEM_TABLE: OnceLock<Arc<SystemTable>> = OnceLock::new();

/// The real allocator the global slot starts out with.
#[must_use]
pub fn global_system_table() -> &'static Arc<SystemTable> {
    GLOBAL_SYSTEM_TABLE.get_or_init(|| Arc::new(SystemTable::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_records_size() {
        let table = SystemTable::new();
        let ptr = table.allocate(100).unwrap();
        assert_eq!(ptr.as_ptr() as usize % BLOCK_ALIGN, 0);
        // SAFETY: ptr is live.
        assert_eq!(unsafe { table.size(ptr) }, 100);
        assert_eq!(table.outstanding_bytes(), 100);
        assert_eq!(table.outstanding_blocks(), 1);
        // SAFETY: ptr is live and freed once.
        unsafe { table.free(ptr) };
        assert_eq!(table.outstanding_bytes(), 0);
        assert_eq!(table.outstanding_blocks(), 0);
    }

    #[test]
    fn reallocate_preserves_contents() {
        let table = SystemTable::new();
        let ptr = table.allocate(4).unwrap();
        // SAFETY: ptr is valid for 4 bytes.
        unsafe { std::ptr::copy_nonoverlapping([1_u8, 2, 3, 4].as_ptr(), ptr.as_ptr(), 4) };
        // SAFETY: ptr is live.
        let grown = unsafe { table.reallocate(ptr, 64) }.unwrap();
        // SAFETY: grown is valid for 64 bytes, the first 4 were copied over.
        let head = unsafe { std::slice::from_raw_parts(grown.as_ptr(), 4) };
        assert_eq!(head, &[1, 2, 3, 4]);
        // SAFETY: grown is live.
        assert_eq!(unsafe { table.size(grown) }, 64);
        assert_eq!(table.outstanding_bytes(), 64);
        assert_eq!(table.outstanding_blocks(), 1);
        // SAFETY: grown is live and freed once.
        unsafe { table.free(grown) };
        assert_eq!(table.outstanding_blocks(), 0);
    }

    #[test]
    fn zero_byte_block_is_real() {
        let table = SystemTable::new();
        let ptr = table.allocate(0).unwrap();
        // SAFETY: ptr is live.
        assert_eq!(unsafe { table.size(ptr) }, 0);
        // SAFETY: ptr is live and freed once.
        unsafe { table.free(ptr) };
    }

    #[test]
    fn roundup_to_granule() {
        let table = SystemTable::new();
        assert_eq!(table.roundup(0), 0);
        assert_eq!(table.roundup(1), 8);
        assert_eq!(table.roundup(8), 8);
        assert_eq!(table.roundup(9), 16);
        assert_eq!(table.roundup(usize::MAX), usize::MAX);
    }

    #[test]
    fn oversized_request_fails_cleanly() {
        let table = SystemTable::new();
        assert!(table.allocate(usize::MAX).is_none());
        assert_eq!(table.outstanding_blocks(), 0);
    }
}
