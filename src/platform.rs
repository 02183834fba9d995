//! Platform primitives: atomics, a spinlock, page size, and the raw
//! `mmap`/`mprotect`/signal bindings the rest of the crate is built on.
//!
//! `core::sync::atomic` gives us full-barrier atomics portably, so there is
//! no per-OS atomics file to vendor; what remains platform-specific is the
//! fault signal number and the raw syscalls, both handled here with `libc`
//! and `#[cfg(...)]`.

use std::io;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crate::error::StmError;

/// 32-bit transaction id, as stored in the metadata sidecar.
pub type TransactionId = u32;

/// Full-barrier atomic increment, skipping the wrap to zero (id 0 is
/// reserved to mean "no transaction"). Mirrors `atomic_increment_32` plus
/// the wrap handling `_stm_start_transaction` performs inline.
#[inline]
pub fn atomic_increment_nonzero(counter: &AtomicU32) -> TransactionId {
    let mut id = counter.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
    if id == 0 {
        id = counter.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
    }
    id
}

/// Full-barrier compare-and-swap on a 32-bit word. Returns `true` on
/// success. Mirrors `atomic_compare_and_swap_32`.
#[inline]
pub fn compare_and_swap_32(addr: &AtomicU32, old: u32, new: u32) -> bool {
    addr.compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
}

/// A simple, busy-spinning test-and-set lock living in shared memory.
///
/// Used only briefly during transaction start to serialize "allocate a
/// transaction id" with "publish it in the active-transaction table". A
/// plain CAS loop over an `AtomicI32` with `std::hint::spin_loop` backoff,
/// portable in place of a platform spinlock primitive.
#[repr(transparent)]
pub struct SpinLock(AtomicI32);

impl SpinLock {
    pub const fn new() -> Self {
        SpinLock(AtomicI32::new(0))
    }

    pub fn lock(&self) {
        while self
            .0
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    pub fn unlock(&self) {
        self.0.store(0, Ordering::Release);
    }
}

/// Query the operating system's page size. Segments and their metadata
/// sidecars are sized and indexed in units of this value.
pub fn page_size() -> usize {
    page_size::get()
}

/// Protection mode for a mapped region, matching the subset of `PROT_*`
/// flags the package actually needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    None,
    ReadWrite,
    Read,
}

impl Protection {
    fn to_libc(self) -> i32 {
        match self {
            Protection::None => libc::PROT_NONE,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Protection::Read => libc::PROT_READ,
        }
    }
}

/// `mmap` a file shared at a fixed, already-reserved address.
///
/// # Safety
/// `addr` must be a page-aligned address obtained from a prior mapping of
/// the same length that the caller is allowed to replace (`MAP_FIXED`
/// atomically replaces any existing mapping in the range).
pub unsafe fn mmap_fixed_shared(
    addr: *mut u8,
    len: usize,
    fd: i32,
    offset: i64,
    prot: Protection,
) -> Result<*mut u8, StmError> {
    mmap_raw(
        addr,
        len,
        prot,
        libc::MAP_FIXED | libc::MAP_SHARED,
        fd,
        offset,
    )
}

/// `mmap` a single page (or run of pages) private and writable at a fixed
/// address, so subsequent writes are invisible to other processes until
/// explicitly copied back. Used by the fault handler on first touch of a page.
///
/// # Safety
/// Same requirements as [`mmap_fixed_shared`].
pub unsafe fn mmap_fixed_private(
    addr: *mut u8,
    len: usize,
    fd: i32,
    offset: i64,
) -> Result<*mut u8, StmError> {
    mmap_raw(
        addr,
        len,
        Protection::ReadWrite,
        libc::MAP_FIXED | libc::MAP_PRIVATE,
        fd,
        offset,
    )
}

/// `mmap` a file shared, letting the kernel choose the address (or honoring
/// `requested_va` via `MAP_FIXED` if it is non-null). Used once, at
/// `Segment::open` time.
///
/// # Safety
/// If `addr` is non-null, it must be page-aligned and the caller accepts
/// that any existing mapping in the range is replaced.
pub unsafe fn mmap_initial(
    addr: *mut u8,
    len: usize,
    fd: i32,
    prot: Protection,
) -> Result<*mut u8, StmError> {
    let mut flags = libc::MAP_SHARED;
    if !addr.is_null() {
        flags |= libc::MAP_FIXED;
    }
    mmap_raw(addr, len, prot, flags, fd, 0)
}

unsafe fn mmap_raw(
    addr: *mut u8,
    len: usize,
    prot: Protection,
    flags: i32,
    fd: i32,
    offset: i64,
) -> Result<*mut u8, StmError> {
    let result = libc::mmap(
        addr as *mut libc::c_void,
        len,
        prot.to_libc(),
        flags,
        fd,
        offset as libc::off_t,
    );
    if result == libc::MAP_FAILED {
        return Err(StmError::Mmap {
            requested: len,
            source: io::Error::last_os_error(),
        });
    }
    Ok(result as *mut u8)
}

/// `munmap` a previously mapped region.
///
/// # Safety
/// `addr`/`len` must describe a region currently mapped by this process,
/// and nothing may reference it afterward.
pub unsafe fn munmap(addr: *mut u8, len: usize) {
    libc::munmap(addr as *mut libc::c_void, len);
}

/// Change the protection of a mapped region in place (no remapping).
///
/// # Safety
/// `addr`/`len` must describe a region currently mapped by this process.
pub unsafe fn mprotect(addr: *mut u8, len: usize, prot: Protection) -> Result<(), StmError> {
    let result = libc::mprotect(addr as *mut libc::c_void, len, prot.to_libc());
    if result != 0 {
        return Err(StmError::Mprotect(io::Error::last_os_error()));
    }
    Ok(())
}

/// The signal delivered on an access to a `PROT_NONE` page. BSD-family
/// kernels (and Darwin) raise `SIGBUS` for a protection fault on a mapped
/// file; everything else raises `SIGSEGV`. Picked per target at compile
/// time with `cfg(target_os)`.
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "dragonfly"))]
pub const FAULT_SIGNAL: i32 = libc::SIGBUS;

#[cfg(not(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "dragonfly")))]
pub const FAULT_SIGNAL: i32 = libc::SIGSEGV;

/// Block every signal on the calling thread, returning the previous mask so
/// it can be restored. Used to bracket commit's validate+publish phases so
/// a fault signal can't interrupt a thread mid-publish.
pub fn block_all_signals() -> Result<libc::sigset_t, StmError> {
    unsafe {
        let mut blocked: libc::sigset_t = std::mem::zeroed();
        let mut saved: libc::sigset_t = std::mem::zeroed();
        libc::sigfillset(&mut blocked);
        if libc::pthread_sigmask(libc::SIG_SETMASK, &blocked, &mut saved) != 0 {
            return Err(StmError::Signal(io::Error::last_os_error()));
        }
        Ok(saved)
    }
}

/// Restore a signal mask previously returned by [`block_all_signals`].
pub fn restore_signal_mask(mask: &libc::sigset_t) -> Result<(), StmError> {
    unsafe {
        if libc::pthread_sigmask(libc::SIG_SETMASK, mask, std::ptr::null_mut()) != 0 {
            return Err(StmError::Signal(io::Error::last_os_error()));
        }
        Ok(())
    }
}
