//! Transactional wrapper over [`crate::alloc::BuddyAllocator`] (component F).
//!
//! `stmalloc.c`'s `alloc_new`/`alloc_free`/`alloc_init` each bracket a single
//! buddy-allocator call in its own named transaction so allocation and free
//! participate in the same conflict-detection protocol as any other write to
//! the segment; a caller running a larger transaction that also happens to
//! allocate simply nests inside it (`transaction()`'s reentrancy). The block
//! size actually handed to the buddy allocator is stashed in a header word
//! immediately before the address returned to the caller, so `free` can
//! recover it without the caller having to remember it.

use crate::alloc::{block_size_for, BuddyAllocator};
use crate::error::StmError;
use crate::index::Offset;
use crate::segment::Segment;
use crate::transaction;

/// Size of the header word stashed before every block handed out by
/// [`TxAllocator::alloc`], mirroring `sizeof(size_t)` in `stmalloc.c`.
pub const HEADER_SIZE: u64 = std::mem::size_of::<u64>() as u64;

/// How [`TxAllocator::init`] should treat the segment's free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitMode {
    /// Seed a fresh free list across the whole segment (`mode=1` in the
    /// original): use the first time a segment's data file is created.
    Fresh,
    /// The segment's free list was already initialized by a previous
    /// process; just start using it as-is (`mode=0`).
    Existing,
}

/// Transactional facade over one segment's buddy allocator.
///
/// Carries no state of its own — every call opens (or joins) a transaction,
/// operates on the allocator embedded in the segment's bytes, and commits
/// before returning, so two `TxAllocator`s over the same segment from
/// different threads or processes are always coordinated through the
/// segment's own page table, never through anything held here.
pub struct TxAllocator;

impl TxAllocator {
    /// Prepare a segment's free list for use. Must be called once per
    /// segment before the first [`alloc`](Self::alloc)/[`free`](Self::free),
    /// either with [`InitMode::Fresh`] right after the segment's data file
    /// was created, or [`InitMode::Existing`] when reopening one another
    /// process already initialized.
    pub fn init(segment: &Segment, mode: InitMode) -> Result<(), StmError> {
        transaction::transaction(&[segment], "alloc.init", |_txn| {
            if mode == InitMode::Fresh {
                let mut allocator = unsafe { BuddyAllocator::new(segment.base(), segment.size()) };
                allocator.init();
            }
            Ok(())
        })
    }

    /// Allocate at least `n` bytes, returning the offset (within `segment`)
    /// of the first byte usable by the caller — i.e. already past the
    /// internal header word. Runs in its own `"alloc.new"` transaction,
    /// nested inside the caller's if one is already open on this thread.
    pub fn alloc(segment: &Segment, n: u64) -> Result<Offset, StmError> {
        transaction::transaction(&[segment], "alloc.new", |_txn| {
            let real_size = block_size_for(n + HEADER_SIZE);
            let mut allocator = unsafe { BuddyAllocator::new(segment.base(), segment.size()) };
            let block = allocator.alloc(real_size)?;
            unsafe {
                std::ptr::write_unaligned(segment.base().add(block as usize) as *mut u64, real_size);
            }
            Ok(block + HEADER_SIZE)
        })
    }

    /// Return a block previously returned by [`alloc`](Self::alloc). `at` is
    /// the same offset `alloc` returned (past the header, not the block's
    /// base). Runs in its own `"alloc.free"` transaction.
    pub fn free(segment: &Segment, at: Offset) -> Result<(), StmError> {
        transaction::transaction(&[segment], "alloc.free", |_txn| {
            let block = at - HEADER_SIZE;
            let real_size = unsafe { std::ptr::read_unaligned(segment.base().add(block as usize) as *const u64) };
            let mut allocator = unsafe { BuddyAllocator::new(segment.base(), segment.size()) };
            allocator.free(block, real_size);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentOpenOptions;
    use tempfile::tempdir;

    #[test]
    fn alloc_and_free_round_trip_through_transactions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("alloc.dat");
        let segment = SegmentOpenOptions::new()
            .size(1 << 20)
            .open(&path)
            .unwrap();
        TxAllocator::init(&segment, InitMode::Fresh).unwrap();

        let a = TxAllocator::alloc(&segment, 32).unwrap();
        let b = TxAllocator::alloc(&segment, 32).unwrap();
        assert_ne!(a, b);

        TxAllocator::free(&segment, a).unwrap();
        TxAllocator::free(&segment, b).unwrap();
    }
}
