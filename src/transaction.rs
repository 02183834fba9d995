//! Starting, nesting, committing, and retrying transactions.
//!
//! [`transaction`] is the single entry point: it starts a transaction if
//! none is running on this thread, runs `body`, and on success commits if
//! this was the outermost call. A conflict detected anywhere underneath
//! unwinds straight back to the outermost call via
//! [`crate::error::StmUnwind::Retry`], the same way a nested `longjmp`
//! would skip over every intervening stack frame; inner calls never
//! install their own catch point, so a retry always restarts the whole
//! outermost transaction, matching nested transactions being unable to
//! commit independently of their enclosing one.

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use crate::error::{StmError, StmUnwind};
use crate::fault::{self, FaultState};
use crate::metadata;
use crate::platform::{self, TransactionId};
use crate::segment::Segment;

const MIN_DELAY: Duration = Duration::from_nanos(10);

thread_local! {
    static NAME_STACK: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// Capability handle passed to a transaction body. Carries nothing of its
/// own beyond a marker; all shared-memory access happens through ordinary
/// reads and writes of segment bytes, arbitrated transparently by the page
/// fault handler.
pub struct Txn<'a> {
    _segments: &'a [&'a Segment],
}

/// Run `body` as a transaction over `segments`, retrying on conflict until
/// it either succeeds or returns a non-retryable error.
///
/// `segments` must list every segment `body` (and anything it calls,
/// including further nested `transaction()` calls) might read or write.
/// `name` must match between a transaction and any nested transaction
/// opened and closed entirely within it; mismatched nesting is a logic
/// error in the caller, surfaced as [`StmError::Stack`].
pub fn transaction<F, R>(segments: &[&Segment], name: &str, mut body: F) -> Result<R, StmError>
where
    F: FnMut(&mut Txn<'_>) -> Result<R, StmError>,
{
    let is_outermost = NAME_STACK.with(|s| s.borrow().is_empty());

    if !is_outermost {
        return run_nested(segments, name, &mut body);
    }

    let mut sorted: Vec<&Segment> = segments.to_vec();
    sorted.sort_by_key(|s| s.inode());

    let mut delay = MIN_DELAY;
    loop {
        match run_outermost(&sorted, name, &mut body) {
            Ok(r) => return Ok(r),
            Err(Retryable::Retry) => {
                log::debug!("transaction {name:?} conflicted, retrying after {delay:?}");
                std::thread::sleep(delay);
                delay += delay / 4;
                continue;
            }
            Err(Retryable::Fatal(e)) => {
                log::error!("transaction {name:?} failed: {e}");
                return Err(e);
            }
        }
    }
}

enum Retryable {
    Retry,
    Fatal(StmError),
}

fn run_nested<F, R>(segments: &[&Segment], name: &str, body: &mut F) -> Result<R, StmError>
where
    F: FnMut(&mut Txn<'_>) -> Result<R, StmError>,
{
    NAME_STACK.with(|s| s.borrow_mut().push(name.to_string()));
    let mut txn = Txn { _segments: segments };
    let result = body(&mut txn);
    let popped = NAME_STACK.with(|s| s.borrow_mut().pop());
    if popped.as_deref() != Some(name) {
        return Err(StmError::Stack("nested transaction name mismatch on exit"));
    }
    result
}

fn run_outermost<F, R>(segments: &[&Segment], name: &str, body: &mut F) -> Result<R, Retryable>
where
    F: FnMut(&mut Txn<'_>) -> Result<R, StmError>,
{
    let transaction_id = match start(segments) {
        Ok(id) => id,
        Err(e) => return Err(Retryable::Fatal(e)),
    };
    let prior_active = snapshot_prior_active(segments, transaction_id);
    let mut state = FaultState::new(transaction_id, prior_active);

    NAME_STACK.with(|s| s.borrow_mut().push(name.to_string()));

    let outcome = fault::with_active(&mut state, || {
        panic::catch_unwind(AssertUnwindSafe(|| {
            let mut txn = Txn { _segments: segments };
            body(&mut txn)
        }))
    });

    NAME_STACK.with(|s| s.borrow_mut().pop());

    match outcome {
        Ok(Ok(value)) => match commit(segments, transaction_id, &mut state) {
            Ok(()) => Ok(value),
            Err(Retryable::Retry) => {
                abort(segments, transaction_id, &mut state);
                Err(Retryable::Retry)
            }
            Err(fatal) => {
                abort(segments, transaction_id, &mut state);
                Err(fatal)
            }
        },
        Ok(Err(e)) => {
            abort(segments, transaction_id, &mut state);
            Err(Retryable::Fatal(e))
        }
        Err(payload) => {
            abort(segments, transaction_id, &mut state);
            match payload.downcast::<StmUnwind>() {
                Ok(unwind) => match *unwind {
                    StmUnwind::Retry => Err(Retryable::Retry),
                    StmUnwind::Fatal(e) => Err(Retryable::Fatal(e)),
                },
                Err(payload) => panic::resume_unwind(payload),
            }
        }
    }
}

/// Assign a transaction id, publish it in every segment's active-transaction
/// table, and drop every segment to `PROT_NONE` so the fault handler sees
/// the first touch of each page.
///
/// Steps 1-5 of spec.md §4.E run under each segment's spinlock: claiming the
/// next id and publishing it into the active-transaction array must look
/// atomic to every other process racing to start a transaction on the same
/// segment, even though the two operations together aren't a single CAS.
fn start(segments: &[&Segment]) -> Result<TransactionId, StmError> {
    let mut transaction_id = None;
    for segment in segments {
        let id = unsafe {
            let mut meta = segment.metadata()?;
            let header = meta.header_mut();
            header.spinlock().lock();
            let id = transaction_id
                .unwrap_or_else(|| platform::atomic_increment_nonzero(as_atomic(&mut header.next_transaction_id)));
            let registered = metadata::add_active_transaction(header, id);
            header.spinlock().unlock();
            registered?;
            id
        };
        transaction_id = Some(id);
        unsafe {
            platform::mprotect(segment.base(), segment.size() as usize, platform::Protection::None)?;
        }
    }
    transaction_id.ok_or(StmError::Other("transaction() called with no segments"))
}

fn as_atomic(x: &mut u32) -> &std::sync::atomic::AtomicU32 {
    unsafe { &*(x as *mut u32 as *const std::sync::atomic::AtomicU32) }
}

fn snapshot_prior_active(segments: &[&Segment], transaction_id: TransactionId) -> Vec<TransactionId> {
    let mut all = Vec::new();
    for segment in segments {
        if let Ok(meta) = unsafe { segment.metadata() } {
            all.extend(metadata::snapshot_active_transactions(meta.header(), transaction_id));
        }
    }
    all
}

/// Phase one of commit: for every snapshot taken during the transaction,
/// confirm no other transaction completed a conflicting write and no other
/// transaction currently owns the page, then claim ownership. A page whose
/// live bytes differ from its pre-image is dirty; its current bytes are
/// copied into the snapshot's own buffer (overwriting the now-useless
/// pre-image) to serve as write-back scratch, since phase two's remap to a
/// shared mapping is about to make the transaction's private copy
/// unreadable.
///
/// Phase two remaps each segment back to a shared mapping and, for every
/// dirty snapshot, copies its scratch bytes over the page (which now writes
/// through to the shared file-backed mapping), then releases ownership.
fn commit(segments: &[&Segment], transaction_id: TransactionId, state: &mut FaultState) -> Result<(), Retryable> {
    let _signal_mask = platform::block_all_signals().map_err(Retryable::Fatal)?;

    let by_segment = group_snapshot_indices_by_segment(segments, state);

    for (segment, indices) in &by_segment {
        for &idx in indices {
            let mut meta = unsafe { segment.metadata() }.map_err(Retryable::Fatal)?;
            let page_index = state.snapshots[idx].page_index;
            let completed_at_capture = state.snapshots[idx].completed_transaction;

            let entry = *meta.page_entry(page_index);
            if completed_at_capture != entry.completed_transaction {
                return Err(Retryable::Retry);
            }
            if entry.current_transaction != 0 && entry.current_transaction != transaction_id {
                return Err(Retryable::Retry);
            }

            let page_base = segment.page_base(page_index);
            let live = unsafe { std::slice::from_raw_parts(page_base, segment.page_size()) };
            if live == &*state.snapshots[idx].original_bytes {
                continue;
            }
            state.snapshots[idx].dirty = true;
            state.snapshots[idx].original_bytes.copy_from_slice(live);

            if !platform::compare_and_swap_32(
                as_atomic(&mut meta.page_entry_mut(page_index).current_transaction),
                0,
                transaction_id,
            ) {
                let entry = *meta.page_entry(page_index);
                if entry.current_transaction != transaction_id {
                    return Err(Retryable::Retry);
                }
            }
            let entry = *meta.page_entry(page_index);
            if completed_at_capture != entry.completed_transaction {
                return Err(Retryable::Retry);
            }
        }
    }

    for (segment, indices) in &by_segment {
        unsafe {
            platform::mmap_fixed_shared(
                segment.base(),
                segment.size() as usize,
                segment.fd(),
                0,
                platform::Protection::ReadWrite,
            )
            .map_err(Retryable::Fatal)?;
        }
        let mut meta = unsafe { segment.metadata() }.map_err(Retryable::Fatal)?;
        for &idx in indices {
            let snap = &state.snapshots[idx];
            if snap.dirty {
                log::trace!(
                    "commit txn={transaction_id} segment inode={} page={}",
                    segment.inode(),
                    snap.page_index
                );
                let page_base = segment.page_base(snap.page_index);
                unsafe {
                    std::ptr::copy_nonoverlapping(snap.original_bytes.as_ptr(), page_base, segment.page_size());
                }
                meta.page_entry_mut(snap.page_index).completed_transaction = transaction_id;
            }
            let entry = meta.page_entry_mut(snap.page_index);
            if entry.current_transaction == transaction_id {
                entry.current_transaction = 0;
            }
        }
        if segment.default_protection() != platform::Protection::ReadWrite {
            unsafe {
                platform::mprotect(segment.base(), segment.size() as usize, segment.default_protection())
                    .map_err(Retryable::Fatal)?;
            }
        }
        metadata::delete_active_transaction(meta.header_mut(), transaction_id);
    }

    state.snapshots.clear();
    Ok(())
}

/// Release everything this transaction claimed and restore every segment's
/// default inter-transaction protection, discarding all private changes.
fn abort(segments: &[&Segment], transaction_id: TransactionId, state: &mut FaultState) {
    for segment in segments {
        let Ok(mut meta) = (unsafe { segment.metadata() }) else { continue };
        for page_index in 0..segment.page_count() {
            let entry = meta.page_entry_mut(page_index);
            if entry.current_transaction == transaction_id {
                entry.current_transaction = 0;
            }
        }
        metadata::delete_active_transaction(meta.header_mut(), transaction_id);
        unsafe {
            let _ = platform::mmap_initial(segment.base(), segment.size() as usize, segment.fd(), segment.default_protection());
        }
    }
    state.snapshots.clear();
}

/// Indices into `state.snapshots` belonging to each segment, computed once
/// up front so phase 1 and phase 2 can both mutate `state.snapshots` by
/// index without holding any borrow of it across the loop (a `&FaultState`
/// snapshot of references would outlive the mutations phase 1 needs to make
/// to capture dirty bytes).
fn group_snapshot_indices_by_segment<'a>(
    segments: &[&'a Segment],
    state: &FaultState,
) -> Vec<(&'a Segment, Vec<usize>)> {
    segments
        .iter()
        .map(|&segment| {
            let indices: Vec<usize> = state
                .snapshots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.segment_inode == segment.inode())
                .map(|(i, _)| i)
                .collect();
            (segment, indices)
        })
        .collect()
}
