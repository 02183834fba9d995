use thiserror::Error;

/// Every fallible, surfaced outcome of the STM package.
///
/// Collisions are *not* a variant here: they never reach a caller. See
/// [`StmUnwind`] for the retry signal that the fault handler and the commit
/// path use instead.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StmError {
    /// Couldn't open the backing file or its metadata sidecar.
    #[error("opening the backing file failed")]
    Open(#[source] std::io::Error),
    /// Couldn't take the advisory lock needed to guard concurrent opens.
    #[error("failed to lock the backing file for exclusive use")]
    Lock(#[source] std::io::Error),
    /// Couldn't resize the backing file or its metadata sidecar to the
    /// requested length.
    #[error("can't resize backing file: have 0x{size:x} bytes, need 0x{requested:x}")]
    ResizeFailed {
        size: u64,
        requested: u64,
        source: std::io::Error,
    },
    /// The data file has the wrong size, wrong type, or isn't page-aligned.
    #[error("data file format error: {0}")]
    DataFormat(&'static str),
    /// `mmap` failed.
    #[error("mmap failed for 0x{requested:x} bytes")]
    Mmap {
        requested: usize,
        source: std::io::Error,
    },
    /// `mprotect` failed.
    #[error("mprotect failed")]
    Mprotect(#[source] std::io::Error),
    /// Installing or restoring the fault signal handler failed.
    #[error("signal handling setup failed")]
    Signal(#[source] std::io::Error),
    /// A faulting address fell outside every open segment, or a fault
    /// arrived while no transaction was active on this thread.
    #[error("access to 0x{addr:x} is outside any open segment, or occurred outside a transaction")]
    Access { addr: usize },
    /// A page that should already belong to this transaction (or
    /// shouldn't) does not match expectations — indicates a bug in the
    /// ownership protocol, not a conflict with another transaction.
    #[error("page ownership invariant violated on page {page}")]
    Ownership { page: u64 },
    /// `start_transaction`/`commit_transaction` misuse: empty stack, name
    /// mismatch, or a `None`/empty transaction name.
    #[error("transaction stack misuse: {0}")]
    Stack(&'static str),
    /// More transactions are concurrently active on one segment than the
    /// active-transaction table has room for.
    #[error("active transaction table exhausted (capacity {capacity})")]
    TooManyActiveTransactions { capacity: usize },
    /// Miscellaneous allocator/index errors not covered above.
    #[error("{0}")]
    Other(&'static str),
}

impl From<std::io::Error> for StmError {
    fn from(e: std::io::Error) -> Self {
        StmError::Open(e)
    }
}

/// Payload unwound through the stack by [`crate::fault`]'s signal handler,
/// or raised directly by the commit path, to abort the transaction body in
/// flight and hand control back to the retry loop in
/// [`crate::transaction::transaction`].
///
/// A non-local exit from deep inside a signal handler or the commit
/// routine, back out to where the transaction was started. Rust has no
/// `setjmp`/`longjmp` in safe code, so this crate uses
/// `std::panic::panic_any` with this payload type and catches it with
/// `std::panic::catch_unwind` at the one place that is allowed to catch it.
/// See DESIGN.md for the reasoning and its limits.
#[derive(Debug)]
pub enum StmUnwind {
    /// Another transaction's completed or in-progress write conflicts with
    /// this one. Retry from the top after a backoff sleep.
    Retry,
    /// A non-recoverable error occurred while a transaction was open. The
    /// transaction has already been aborted on every segment; propagate
    /// `err` to the caller of `transaction()` instead of retrying.
    Fatal(StmError),
}
