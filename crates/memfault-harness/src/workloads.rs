//! Built-in sweep workloads.
//!
//! A workload allocates exclusively through the slot it is handed, so an
//! installed overlay sees every request. Each run must either succeed or
//! report the allocation failure it observed.

use memfault_core::{MallocSlot, SlotBuffer};

use crate::error::WorkloadError;

pub trait Workload {
    /// Stable CLI name.
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn run(&mut self, slot: &MallocSlot) -> Result<(), WorkloadError>;
}

/// Names accepted by [`workload_by_name`].
pub const WORKLOAD_NAMES: [&str; 3] = ["string-table", "benign-cache", "leaky"];

#[must_use]
pub fn workload_by_name(name: &str) -> Option<Box<dyn Workload>> {
    match name {
        "string-table" => Some(Box::new(StringTable::default())),
        "benign-cache" => Some(Box::new(BenignCache::default())),
        "leaky" => Some(Box::new(Leaky)),
        _ => None,
    }
}

/// Builds a table of short strings, growing the index with `realloc`, then
/// verifies every entry. Everything is released on both paths.
#[derive(Debug, Clone)]
pub struct StringTable {
    pub entries: usize,
}

impl Default for StringTable {
    fn default() -> Self {
        Self { entries: 12 }
    }
}

impl Workload for StringTable {
    fn name(&self) -> &'static str {
        "string-table"
    }

    fn description(&self) -> &'static str {
        "grow an index with realloc and fill it with string entries"
    }

    fn run(&mut self, slot: &MallocSlot) -> Result<(), WorkloadError> {
        let mut index = SlotBuffer::new(slot, 0)?;
        let mut strings = Vec::with_capacity(self.entries);
        for i in 0..self.entries {
            let text = format!("entry-{i:04}");
            let mut entry = SlotBuffer::new(slot, text.len())?;
            entry.as_mut_slice().copy_from_slice(text.as_bytes());
            strings.push(entry);

            // Index holds one length byte per entry and doubles when full.
            if index.len() <= i {
                index.resize((index.len() * 2).max(4))?;
            }
            index.as_mut_slice()[i] = text.len() as u8;
        }

        for (i, entry) in strings.iter().enumerate() {
            let expected = format!("entry-{i:04}");
            if entry.as_slice() != expected.as_bytes() {
                return Err(WorkloadError::Invariant(format!("entry {i} corrupted")));
            }
            if usize::from(index.as_slice()[i]) != expected.len() {
                return Err(WorkloadError::Invariant(format!("index slot {i} corrupted")));
            }
        }
        Ok(())
    }
}

/// Allocates a result buffer, then tries to attach an optional cache inside a
/// benign region. A missing cache is tolerated; the result is still produced.
#[derive(Debug, Clone, Default)]
pub struct BenignCache {
    /// Runs that completed without their cache.
    pub cache_misses: u64,
}

impl Workload for BenignCache {
    fn name(&self) -> &'static str {
        "benign-cache"
    }

    fn description(&self) -> &'static str {
        "attach an optional cache inside a benign region"
    }

    fn run(&mut self, slot: &MallocSlot) -> Result<(), WorkloadError> {
        let mut result = SlotBuffer::new(slot, 64)?;
        let cache = {
            let _region = slot.benign_region();
            SlotBuffer::new(slot, 256).ok()
        };
        match &cache {
            Some(cache) => result.as_mut_slice()[0] = cache.len().min(255) as u8,
            None => self.cache_misses += 1,
        }
        let summary = SlotBuffer::new(slot, 16)?;
        if summary.as_slice().iter().any(|b| *b != 0) {
            return Err(WorkloadError::Invariant("summary not zeroed".to_string()));
        }
        Ok(())
    }
}

/// Forgets its first block when the second allocation fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct Leaky;

impl Workload for Leaky {
    fn name(&self) -> &'static str {
        "leaky"
    }

    fn description(&self) -> &'static str {
        "leak the first block on the recovery path"
    }

    fn run(&mut self, slot: &MallocSlot) -> Result<(), WorkloadError> {
        let first = SlotBuffer::new(slot, 48)?;
        match SlotBuffer::new(slot, 96) {
            Ok(_second) => Ok(()),
            Err(oom) => {
                std::mem::forget(first);
                Err(oom.into())
            }
        }
    }
}
