//! Software transactional memory over shared, file-backed mmap segments.
//!
//! A [`Segment`] is a region of a file mapped into every process that opens
//! it. [`transaction`] runs a closure against one or more segments with
//! optimistic, page-granular conflict detection: the segment starts out
//! unreadable, the first touch of each page faults into a private copy, and
//! committing re-validates every touched page before publishing it back,
//! retrying the whole closure from the top on conflict. [`TxAllocator`] is a
//! buddy allocator over a segment's bytes, itself built out of ordinary
//! transactions.
//!
//! ```no_run
//! use stm_mmap::{SegmentOpenOptions, TxAllocator, InitMode, transaction};
//!
//! stm_mmap::init(stm_mmap::Verbosity::ERRORS).unwrap();
//! let segment = SegmentOpenOptions::new().size(1 << 20).open("db.dat").unwrap();
//! TxAllocator::init(&segment, InitMode::Fresh).unwrap();
//!
//! let block = TxAllocator::alloc(&segment, 64).unwrap();
//! transaction(&[&segment], "write", |_txn| {
//!     unsafe { *(segment.base().add(block as usize) as *mut u64) = 42 };
//!     Ok(())
//! }).unwrap();
//! ```

pub mod alloc;
pub mod error;
pub mod fault;
pub mod index;
pub mod metadata;
pub mod platform;
pub mod segment;
pub mod transaction;
pub mod txalloc;

pub use error::{StmError, StmUnwind};
pub use platform::{Protection, TransactionId};
pub use segment::{Segment, SegmentOpenOptions};
pub use transaction::{transaction, Txn};
pub use txalloc::{InitMode, TxAllocator};

/// Which ambient events get logged, matching the three independent bits of
/// the original's `verbose` bitmask (`1`: errors, `2`: conflicts/aborts,
/// `4`: per-commit page lists) but mapped onto the `log` crate's levels and
/// targets instead of a stderr bitmask, so a caller picks what to see with
/// an ordinary `RUST_LOG` filter rather than a bitmask passed to `init`.
///
/// `init` itself doesn't gate anything on these bits — every level is always
/// logged at its corresponding `log` level (`error!`/`debug!`/`trace!`) and
/// whether it's *seen* is entirely up to whatever logger implementation the
/// caller installs. `Verbosity` exists so callers translating from the
/// original bitmask have a direct mapping to reach for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verbosity(u8);

impl Verbosity {
    /// Bit 1: fatal errors. Always logged at `log::Level::Error` regardless
    /// of this flag; kept for parity with the original bitmask.
    pub const ERRORS: Verbosity = Verbosity(1);
    /// Bit 2: transaction conflicts and aborts, logged at `log::Level::Debug`.
    pub const CONFLICTS: Verbosity = Verbosity(2);
    /// Bit 4: the list of pages written by each commit, logged at
    /// `log::Level::Trace`.
    pub const COMMITS: Verbosity = Verbosity(4);

    pub const fn bits(self) -> u8 {
        self.0
    }
}

impl std::ops::BitOr for Verbosity {
    type Output = Verbosity;
    fn bitor(self, rhs: Verbosity) -> Verbosity {
        Verbosity(self.0 | rhs.0)
    }
}

/// Install the page-fault handler used by every [`transaction`] call.
/// Idempotent and process-wide: call once before opening any segment, from
/// whichever thread starts up first. `verbosity` is accepted for parity with
/// the original `init(verbose_bitmask)` entry point; see [`Verbosity`] for
/// how it maps onto `log` levels.
pub fn init(verbosity: Verbosity) -> Result<(), StmError> {
    log::debug!("initializing stm_mmap (verbosity bits {:#x})", verbosity.bits());
    fault::install()
}

/// Register this thread's thread-local state (open segment list, name
/// stack, fault-handler slot) so it can open segments and run transactions.
/// The thread that called [`init`] does not need to call this separately;
/// every other thread that will touch a [`Segment`] does, mirroring the
/// original's `stm_init_thread_locals()` — thread-local state is lazily
/// created by `std::thread_local!` on first use, so this is a no-op beyond
/// documenting the requirement, kept as a named call so callers porting from
/// the original have a direct equivalent to reach for.
pub fn init_thread_locals() {}

/// Close every segment in `segments` and restore the platform's default
/// disposition for the fault signal, the counterpart to [`init`].
///
/// Each segment is closed in the order given (unmapped, unlocked, and
/// dropped from the thread's registry); any segment still referenced
/// elsewhere after this call is left half torn-down from this thread's
/// point of view; callers must not retain a `&Segment` across `close_all`.
pub fn close_all(segments: Vec<Segment>) -> Result<(), StmError> {
    for segment in segments {
        segment.close();
    }
    fault::restore_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn init_is_idempotent_across_repeated_calls() {
        init(Verbosity::ERRORS | Verbosity::CONFLICTS).unwrap();
        init(Verbosity::ERRORS).unwrap();
    }

    #[test]
    fn open_write_commit_read_back_round_trip() {
        init(Verbosity::ERRORS).unwrap();
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.dat");
        let segment = SegmentOpenOptions::new().size(4096).open(&path).unwrap();

        transaction(&[&segment], "write-one", |_txn| {
            unsafe { *(segment.base() as *mut u64) = 0xdead_beef };
            Ok(())
        })
        .unwrap();

        transaction(&[&segment], "read-one", |_txn| {
            let value = unsafe { *(segment.base() as *const u64) };
            assert_eq!(value, 0xdead_beef);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn close_all_drops_every_segment() {
        init(Verbosity::ERRORS).unwrap();
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.dat");
        let segment = SegmentOpenOptions::new().size(4096).open(&path).unwrap();
        close_all(vec![segment]).unwrap();
    }
}
