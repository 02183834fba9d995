//! End-to-end coverage of the transaction and allocator protocol against a
//! real, file-backed segment. Each test opens its own temp file and runs
//! entirely on the calling thread: segment registration and fault-handler
//! state are thread-local (see `src/segment.rs`), matching a single process
//! driving its own transactions rather than sharing one open handle across
//! threads.

use stm_mmap::alloc::BuddyAllocator;
use stm_mmap::{init, transaction, InitMode, SegmentOpenOptions, TxAllocator, Verbosity};
use tempfile::tempdir;

fn open_segment(size: u64) -> (tempfile::TempDir, stm_mmap::Segment) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("seg.dat");
    let segment = SegmentOpenOptions::new().size(size).open(&path).unwrap();
    (dir, segment)
}

#[test]
fn committed_writes_are_visible_to_later_transactions() {
    init(Verbosity::ERRORS).unwrap();
    let (_dir, segment) = open_segment(4096);

    transaction(&[&segment], "write", |_txn| {
        unsafe { *(segment.base() as *mut u64) = 123 };
        Ok(())
    })
    .unwrap();

    transaction(&[&segment], "read", |_txn| {
        let value = unsafe { *(segment.base() as *const u64) };
        assert_eq!(value, 123);
        Ok(())
    })
    .unwrap();
}

#[test]
fn a_transaction_that_returns_an_error_does_not_persist_its_writes() {
    init(Verbosity::ERRORS).unwrap();
    let (_dir, segment) = open_segment(4096);

    transaction(&[&segment], "seed", |_txn| {
        unsafe { *(segment.base() as *mut u64) = 1 };
        Ok(())
    })
    .unwrap();

    let result = transaction(&[&segment], "doomed", |_txn| {
        unsafe { *(segment.base() as *mut u64) = 999 };
        Err(stm_mmap::StmError::Other("deliberate failure"))
    });
    assert!(result.is_err());

    transaction(&[&segment], "verify", |_txn| {
        let value = unsafe { *(segment.base() as *const u64) };
        assert_eq!(value, 1, "aborted transaction's write must not be visible");
        Ok(())
    })
    .unwrap();
}

#[test]
fn nested_transactions_commit_together_with_the_outer_one() {
    init(Verbosity::ERRORS).unwrap();
    let (_dir, segment) = open_segment(4096);

    transaction(&[&segment], "outer", |_txn| {
        unsafe { *(segment.base() as *mut u64) = 1 };
        transaction(&[&segment], "inner", |_txn| {
            unsafe { *((segment.base() as *mut u64).add(1)) = 2 };
            Ok(())
        })?;
        Ok(())
    })
    .unwrap();

    transaction(&[&segment], "verify", |_txn| {
        let a = unsafe { *(segment.base() as *const u64) };
        let b = unsafe { *((segment.base() as *const u64).add(1)) };
        assert_eq!((a, b), (1, 2));
        Ok(())
    })
    .unwrap();
}

#[test]
fn a_nested_transaction_can_itself_return_an_error_without_poisoning_the_outer_one() {
    init(Verbosity::ERRORS).unwrap();
    let (_dir, segment) = open_segment(4096);

    let result = transaction(&[&segment], "outer", |_txn| {
        unsafe { *(segment.base() as *mut u64) = 7 };
        transaction(&[&segment], "inner", |_txn| {
            Err(stm_mmap::StmError::Other("inner failed"))
        })
    });
    assert!(result.is_err());

    transaction(&[&segment], "verify", |_txn| {
        let value = unsafe { *(segment.base() as *const u64) };
        assert_eq!(value, 0, "outer write must not persist if the whole transaction errors");
        Ok(())
    })
    .unwrap();
}

#[test]
fn transactional_allocator_round_trips_through_many_alloc_free_cycles() {
    init(Verbosity::ERRORS).unwrap();
    let (_dir, segment) = open_segment(1 << 16);
    TxAllocator::init(&segment, InitMode::Fresh).unwrap();

    let mut live = Vec::new();
    for round in 0..20 {
        let block = TxAllocator::alloc(&segment, 48).unwrap();
        live.push(block);
        if round % 3 == 0 {
            if let Some(to_free) = live.pop() {
                TxAllocator::free(&segment, to_free).unwrap();
            }
        }
    }
    for block in live {
        TxAllocator::free(&segment, block).unwrap();
    }

    let allocator = unsafe { BuddyAllocator::new(segment.base(), segment.size()) };
    allocator.verify_integrity().unwrap();
}

#[test]
fn reopening_an_existing_segment_preserves_committed_data() {
    init(Verbosity::ERRORS).unwrap();
    let dir = tempdir().unwrap();
    let path = dir.path().join("seg.dat");

    {
        let segment = SegmentOpenOptions::new().size(4096).open(&path).unwrap();
        transaction(&[&segment], "write", |_txn| {
            unsafe { *(segment.base() as *mut u64) = 0xabad_1dea };
            Ok(())
        })
        .unwrap();
    }

    let segment = SegmentOpenOptions::new().size(4096).open(&path).unwrap();
    transaction(&[&segment], "read", |_txn| {
        let value = unsafe { *(segment.base() as *const u64) };
        assert_eq!(value, 0xabad_1dea);
        Ok(())
    })
    .unwrap();
}
