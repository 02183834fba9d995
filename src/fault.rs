//! The page-fault handler that backs optimistic locking.
//!
//! While a transaction runs, every segment it touches is mapped `PROT_NONE`.
//! The first read or write to any page raises the platform fault signal;
//! this module's handler resolves the faulting address to a segment and
//! page, checks that no other transaction already owns or has completed a
//! conflicting write to that page, snapshots the page's current bytes, and
//! remaps it `MAP_PRIVATE`/read-write so the transaction can proceed
//! against its own private copy. A conflict raises [`StmUnwind::Retry`]
//! through `std::panic::panic_any`, unwound by the retry loop in
//! [`crate::transaction`].
//!
//! Calling into more than a narrow slice of the standard library from a
//! signal handler is unsound in general (allocation can reenter a
//! non-reentrant allocator lock, for instance). This handler does allocate,
//! to grow the active transaction's snapshot list; that risk is accepted
//! the same way it is by every other STM implementation built this way,
//! and is worth calling out explicitly here rather than pretending it does
//! not exist.

use std::cell::RefCell;
use std::sync::Once;

use crate::error::StmUnwind;
use crate::metadata::PageTableEntry;
use crate::platform::{self, TransactionId};
use crate::segment::Segment;

/// One page's bytes, captured the moment a transaction first touches it.
/// Held until commit or abort.
///
/// `original_bytes` starts out as the page's pre-image, used by commit's
/// phase 1 to decide whether the page was actually modified. If it was,
/// phase 1 overwrites this same buffer in place with the page's current
/// (dirty) bytes and sets `dirty` — the buffer becomes write-back scratch,
/// since phase 2's remap to a shared mapping destroys the transaction's
/// private copy before the dirty bytes could otherwise be read back out.
pub struct PageSnapshot {
    pub segment_inode: u64,
    pub page_index: usize,
    pub original_bytes: Box<[u8]>,
    pub dirty: bool,
    pub completed_transaction: TransactionId,
}

/// Per-thread state the signal handler needs: which transaction (if any)
/// is running, which segments it can touch, and the snapshots taken so
/// far. [`crate::transaction`] owns one of these per active transaction
/// frame and installs a pointer to it here for the duration of the
/// outermost frame's run.
pub struct FaultState {
    pub transaction_id: TransactionId,
    pub prior_active: Vec<TransactionId>,
    pub snapshots: Vec<PageSnapshot>,
}

impl FaultState {
    pub fn new(transaction_id: TransactionId, prior_active: Vec<TransactionId>) -> Self {
        FaultState {
            transaction_id,
            prior_active,
            snapshots: Vec::new(),
        }
    }

    fn has_prior(&self, id: TransactionId) -> bool {
        self.prior_active.iter().any(|&p| p == id)
    }

    /// Insert a freshly-taken snapshot at its correct ascending-(segment,
    /// page) position, per spec.md §4.D step 9. Kept globally sorted rather
    /// than just per segment, since every caller that needs a single
    /// segment's snapshots (commit, abort) filters this list and a globally
    /// sorted list keeps that filtered view sorted too, with no re-sort.
    ///
    /// A duplicate (the same segment+page snapshotted twice in one
    /// transaction) is a protocol bug, not a conflict: once a page is
    /// mapped private and writable no further fault should occur on it.
    fn insert_sorted(&mut self, snapshot: PageSnapshot) -> Result<(), crate::error::StmError> {
        let key = (snapshot.segment_inode, snapshot.page_index);
        let pos = self
            .snapshots
            .partition_point(|s| (s.segment_inode, s.page_index) < key);
        if let Some(existing) = self.snapshots.get(pos) {
            if (existing.segment_inode, existing.page_index) == key {
                return Err(crate::error::StmError::Ownership {
                    page: snapshot.page_index as u64,
                });
            }
        }
        self.snapshots.insert(pos, snapshot);
        Ok(())
    }
}

thread_local! {
    static ACTIVE: RefCell<Option<*mut FaultState>> = const { RefCell::new(None) };
}

/// Install `state` as the fault handler's view of the running transaction
/// on this thread for the duration of `body`, restoring whatever was there
/// before on the way out (supports nested transaction frames, even though
/// only the outermost one actually owns pages).
pub fn with_active<R>(state: &mut FaultState, body: impl FnOnce() -> R) -> R {
    let prev = ACTIVE.with(|a| a.borrow_mut().replace(state as *mut FaultState));
    let result = body();
    ACTIVE.with(|a| *a.borrow_mut() = prev);
    result
}

static INSTALL: Once = Once::new();

/// Install the fault signal handler process-wide. Idempotent; safe to call
/// once from each thread that will start transactions, or just once from
/// the main thread before spawning workers, since `sigaction` affects the
/// whole process.
pub fn install() -> Result<(), crate::error::StmError> {
    let mut result = Ok(());
    INSTALL.call_once(|| {
        result = install_once();
    });
    result
}

fn install_once() -> Result<(), crate::error::StmError> {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handle_fault as usize;
        sa.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(platform::FAULT_SIGNAL, &sa, std::ptr::null_mut()) != 0 {
            return Err(crate::error::StmError::Signal(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

extern "C" fn handle_fault(_sig: i32, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    let addr = unsafe { (*info).si_addr() } as *const u8;

    let state_ptr = ACTIVE.with(|a| *a.borrow());
    let Some(state_ptr) = state_ptr else {
        reraise_default();
        return;
    };
    let state = unsafe { &mut *state_ptr };

    let Some(segment_ptr) = (unsafe { crate::segment::find_segment(addr) }) else {
        reraise_default();
        return;
    };
    let segment = unsafe { &*segment_ptr };

    let Some(page_index) = segment.page_index_of(addr) else {
        reraise_default();
        return;
    };
    let page_base = segment.page_base(page_index);

    match try_claim_page(segment, state, page_index) {
        Ok(completed_transaction) => {
            match remap_private_and_snapshot(segment, page_base, page_index, completed_transaction, state) {
                Ok(()) => {}
                Err(RemapOutcome::Raced) => std::panic::panic_any(StmUnwind::Retry),
                Err(RemapOutcome::Mmap(source)) => {
                    std::panic::panic_any(StmUnwind::Fatal(crate::error::StmError::Mmap {
                        requested: segment.page_size(),
                        source,
                    }));
                }
                Err(RemapOutcome::Ownership(err)) => {
                    std::panic::panic_any(StmUnwind::Fatal(err));
                }
            }
        }
        Err(ClaimOutcome::Conflict) => {
            std::panic::panic_any(StmUnwind::Retry);
        }
        Err(ClaimOutcome::AlreadyOwned) => {
            std::panic::panic_any(StmUnwind::Fatal(crate::error::StmError::Ownership {
                page: page_index as u64,
            }));
        }
    }
}

enum ClaimOutcome {
    Conflict,
    /// `current_transaction` already names this transaction at fault time —
    /// spec.md §4.D step 5 calls this out explicitly as unreachable under
    /// optimistic locking (ownership is claimed only during commit, by
    /// which point no more faults occur on this thread) and an internal
    /// error rather than a retryable conflict if it ever happens.
    AlreadyOwned,
}

enum RemapOutcome {
    /// Another transaction claimed or completed a write to this page while
    /// the remap and snapshot copy were in flight; step 10 of the protocol.
    Raced,
    Mmap(std::io::Error),
    /// The same page was snapshotted twice in one transaction: a bug in the
    /// ownership protocol, not a conflict with another transaction.
    Ownership(crate::error::StmError),
}

/// Steps 1-4 of the fault handler's ownership protocol: refuse the fault
/// if another transaction currently owns the page, and refuse it if the
/// page's last completed writer is concurrent with (or newer than) this
/// transaction.
fn try_claim_page(segment: &Segment, state: &FaultState, page_index: usize) -> Result<TransactionId, ClaimOutcome> {
    let entry = read_page_entry(segment, page_index);
    if entry.current_transaction != 0 && entry.current_transaction != state.transaction_id {
        return Err(ClaimOutcome::Conflict);
    }
    if entry.current_transaction == state.transaction_id {
        return Err(ClaimOutcome::AlreadyOwned);
    }
    if (entry.completed_transaction as i32).wrapping_sub(state.transaction_id as i32) > 0 {
        return Err(ClaimOutcome::Conflict);
    }
    if state.has_prior(entry.completed_transaction) {
        return Err(ClaimOutcome::Conflict);
    }
    Ok(entry.completed_transaction)
}

fn read_page_entry(segment: &Segment, page_index: usize) -> PageTableEntry {
    unsafe {
        let meta = match segment.metadata() {
            Ok(m) => m,
            Err(_) => return PageTableEntry { current_transaction: 0, completed_transaction: 0 },
        };
        *meta.page_entry(page_index)
    }
}

fn remap_private_and_snapshot(
    segment: &Segment,
    page_base: *mut u8,
    page_index: usize,
    completed_transaction: TransactionId,
    state: &mut FaultState,
) -> Result<(), RemapOutcome> {
    unsafe {
        platform::mmap_fixed_private(page_base, segment.page_size(), segment.fd(), (page_index * segment.page_size()) as i64)
            .map_err(|_| RemapOutcome::Mmap(std::io::Error::last_os_error()))?;
    }

    // Force copy-on-write materialization: some kernels keep a private
    // mapping tracking the shared file's pages until the first store, so a
    // read-only snapshot copy right after mmap could still observe later
    // writes by the original owner. Writing one word read from the page
    // back into the page guarantees this process's own private copy exists
    // before anything reads `page_base` below.
    unsafe {
        let first_word = (page_base as *const usize).read_volatile();
        (page_base as *mut usize).write_volatile(first_word);
    }

    let bytes = unsafe { std::slice::from_raw_parts(page_base, segment.page_size()) };
    let snapshot = PageSnapshot {
        segment_inode: segment.inode(),
        page_index,
        original_bytes: bytes.to_vec().into_boxed_slice(),
        dirty: false,
        completed_transaction,
    };
    state
        .insert_sorted(snapshot)
        .map_err(RemapOutcome::Ownership)?;

    // Re-check after the mmap + copy, in case another process claimed and
    // completed a write to this page while the remap/snapshot was in
    // flight; if so this transaction must still abort (step 10).
    let entry = read_page_entry(segment, page_index);
    if entry.current_transaction != 0 && entry.current_transaction != state.transaction_id {
        return Err(RemapOutcome::Raced);
    }
    if entry.completed_transaction != completed_transaction {
        return Err(RemapOutcome::Raced);
    }
    Ok(())
}

/// Restore default handling and re-raise: used when a fault cannot be
/// attributed to any active transaction or open segment, matching the
/// only sane outcome for an access that is simply invalid.
fn reraise_default() {
    let _ = restore_default();
}

/// Restore the platform default disposition for the fault signal. Called by
/// [`crate::close_all`] as the counterpart to [`install`].
pub fn restore_default() -> Result<(), crate::error::StmError> {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(platform::FAULT_SIGNAL, &sa, std::ptr::null_mut()) != 0 {
            return Err(crate::error::StmError::Signal(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentOpenOptions;
    use tempfile::tempdir;

    fn open_test_segment() -> (tempfile::TempDir, Segment) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.dat");
        let segment = SegmentOpenOptions::new().size(4096).open(&path).unwrap();
        (dir, segment)
    }

    #[test]
    fn claim_conflicts_with_a_page_another_transaction_currently_owns() {
        let (_dir, segment) = open_test_segment();
        unsafe {
            let mut meta = segment.metadata().unwrap();
            meta.page_entry_mut(0).current_transaction = 7;
        }
        let state = FaultState::new(9, Vec::new());
        assert!(matches!(
            try_claim_page(&segment, &state, 0),
            Err(ClaimOutcome::Conflict)
        ));
    }

    #[test]
    fn claim_conflicts_when_completed_transaction_is_concurrent_with_ours() {
        let (_dir, segment) = open_test_segment();
        unsafe {
            let mut meta = segment.metadata().unwrap();
            meta.page_entry_mut(0).completed_transaction = 5;
        }
        // id 5 was active when our transaction (id 9) started, so its write
        // is concurrent with ours even though it landed before we started.
        let state = FaultState::new(9, vec![5]);
        assert!(matches!(
            try_claim_page(&segment, &state, 0),
            Err(ClaimOutcome::Conflict)
        ));
    }

    #[test]
    fn claim_conflicts_when_completed_transaction_is_newer_than_ours() {
        let (_dir, segment) = open_test_segment();
        unsafe {
            let mut meta = segment.metadata().unwrap();
            meta.page_entry_mut(0).completed_transaction = 20;
        }
        let state = FaultState::new(9, Vec::new());
        assert!(matches!(
            try_claim_page(&segment, &state, 0),
            Err(ClaimOutcome::Conflict)
        ));
    }

    #[test]
    fn claim_succeeds_on_an_unowned_page_last_written_before_we_started() {
        let (_dir, segment) = open_test_segment();
        unsafe {
            let mut meta = segment.metadata().unwrap();
            meta.page_entry_mut(0).completed_transaction = 3;
        }
        let state = FaultState::new(9, Vec::new());
        assert!(matches!(try_claim_page(&segment, &state, 0), Ok(3)));
    }

    #[test]
    fn claim_reports_refaulting_an_already_owned_page_as_an_internal_error() {
        let (_dir, segment) = open_test_segment();
        unsafe {
            let mut meta = segment.metadata().unwrap();
            meta.page_entry_mut(0).current_transaction = 9;
        }
        let state = FaultState::new(9, Vec::new());
        assert!(matches!(
            try_claim_page(&segment, &state, 0),
            Err(ClaimOutcome::AlreadyOwned)
        ));
    }

    #[test]
    fn snapshots_stay_sorted_and_reject_a_duplicate_page() {
        let mut state = FaultState::new(1, Vec::new());
        state
            .insert_sorted(PageSnapshot {
                segment_inode: 1,
                page_index: 5,
                original_bytes: vec![0u8; 4].into_boxed_slice(),
                dirty: false,
                completed_transaction: 0,
            })
            .unwrap();
        state
            .insert_sorted(PageSnapshot {
                segment_inode: 1,
                page_index: 2,
                original_bytes: vec![0u8; 4].into_boxed_slice(),
                dirty: false,
                completed_transaction: 0,
            })
            .unwrap();
        assert_eq!(
            state.snapshots.iter().map(|s| s.page_index).collect::<Vec<_>>(),
            vec![2, 5]
        );

        let err = state.insert_sorted(PageSnapshot {
            segment_inode: 1,
            page_index: 2,
            original_bytes: vec![0u8; 4].into_boxed_slice(),
            dirty: false,
            completed_transaction: 0,
        });
        assert!(err.is_err());
    }
}
