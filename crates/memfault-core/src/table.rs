//! Pluggable allocator table and the strategy handle that carries it.
//!
//! A table owns its own context: `init` and `shutdown` take `&self`.

#![allow(unsafe_code)]

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::FaultError;

/// Capability set every installable allocator implements.
///
/// Returning `None` from [`allocate`](Self::allocate) or
/// [`reallocate`](Self::reallocate) signals exhaustion. Callers cannot tell a
/// simulated failure from a real one.
pub trait AllocatorTable: Send + Sync {
    /// Short descriptor, part of the table image.
    fn name(&self) -> &str;

    /// Allocate `size` bytes.
    fn allocate(&self, size: usize) -> Option<NonNull<u8>>;

    /// Resize the block at `ptr` to `size` bytes. On `None` the original block
    /// is left untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this table and not yet freed.
    unsafe fn reallocate(&self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>>;

    /// Release the block at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this table and not yet freed.
    unsafe fn free(&self, ptr: NonNull<u8>);

    /// Usable size of the block at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this table and not yet freed.
    unsafe fn size(&self, ptr: NonNull<u8>) -> usize;

    /// Size the table would actually hand out for a request of `size` bytes.
    fn roundup(&self, size: usize) -> usize;

    fn init(&self) -> Result<(), FaultError>;

    fn shutdown(&self);
}

/// Identity of the table behind an [`AllocatorHandle`].
///
/// Equality is pointer identity of the table object. The digest covers the
/// address and [`AllocatorTable::name`] only; it is the short printable form
/// used in logs and integrity errors, not a hash of table state.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TableImage {
    addr: usize,
    digest: blake3::Hash,
}

impl TableImage {
    /// Address of the table object behind the handle.
    #[must_use]
    pub const fn addr(&self) -> usize {
        self.addr
    }

    /// Hex rendering used in logs and integrity errors.
    #[must_use]
    pub fn to_hex(&self) -> String {
        format!("{:016x}:{}", self.addr, &self.digest.to_hex().as_str()[..16])
    }
}

impl fmt::Debug for TableImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TableImage").field(&self.to_hex()).finish()
    }
}

/// Cloneable handle to a swappable allocator table.
#[derive(Clone)]
pub struct AllocatorHandle {
    table: Arc<dyn AllocatorTable>,
}

impl AllocatorHandle {
    pub fn new<T: AllocatorTable + 'static>(table: T) -> Self {
        Self {
            table: Arc::new(table),
        }
    }

    /// Wrap an already shared table, keeping the caller's `Arc` usable for
    /// type-specific queries.
    #[must_use]
    pub fn from_arc(table: Arc<dyn AllocatorTable>) -> Self {
        Self { table }
    }

    #[must_use]
    pub fn table(&self) -> &dyn AllocatorTable {
        self.table.as_ref()
    }

    #[must_use]
    pub fn image(&self) -> TableImage {
        let addr = Arc::as_ptr(&self.table).cast::<()>() as usize;
        let mut hasher = blake3::Hasher::new();
        hasher.update(&addr.to_le_bytes());
        hasher.update(self.table.name().as_bytes());
        TableImage {
            addr,
            digest: hasher.finalize(),
        }
    }

    /// Returns true if both handles carry the same table image.
    #[must_use]
    pub fn same_table(&self, other: &Self) -> bool {
        self.image() == other.image()
    }
}

impl std::ops::Deref for AllocatorHandle {
    type Target = dyn AllocatorTable;

    fn deref(&self) -> &Self::Target {
        self.table.as_ref()
    }
}

impl fmt::Debug for AllocatorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatorHandle")
            .field("name", &self.table.name())
            .field("image", &self.image())
            .finish()
    }
}
