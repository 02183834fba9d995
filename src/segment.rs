//! Opening, tracking, and closing shared memory segments.

use std::cell::RefCell;
use std::fs::{File, OpenOptions as FsOpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use memmap2::MmapRaw;

use crate::error::StmError;
use crate::metadata::{sidecar_len, MetadataView, TransactionHeader};
use crate::platform::{self, Protection};

/// Builder for opening a [`Segment`], mirroring the arguments
/// `stm_open_shared_segment` took positionally.
pub struct SegmentOpenOptions {
    size: u64,
    requested_va: *mut u8,
    default_protection: Protection,
}

impl Default for SegmentOpenOptions {
    fn default() -> Self {
        SegmentOpenOptions {
            size: 0,
            requested_va: std::ptr::null_mut(),
            default_protection: Protection::ReadWrite,
        }
    }
}

impl SegmentOpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Minimum size in bytes the backing file (and so the mapped segment)
    /// must have. The file is grown with `set_len` if it is shorter; it is
    /// never shrunk.
    pub fn size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Ask for a specific virtual address. Pass `std::ptr::null_mut()` (the
    /// default) to let the kernel choose.
    pub fn requested_va(mut self, addr: *mut u8) -> Self {
        self.requested_va = addr;
        self
    }

    /// Protection to apply to the segment between transactions (when no
    /// transaction owns the faulting thread). Transactions still get
    /// fault-driven page isolation regardless of this setting.
    pub fn default_protection(mut self, prot: Protection) -> Self {
        self.default_protection = prot;
        self
    }

    pub fn open(self, path: impl AsRef<Path>) -> Result<Segment, StmError> {
        Segment::open(path.as_ref(), self.size, self.requested_va, self.default_protection)
    }
}

/// One shared memory area together with its metadata sidecar.
///
/// Segments are reference-counted by the registry in [`SEGMENTS`], keyed by
/// the data file's inode so the commit path can always walk segments (and,
/// within a segment, pages) in a single global order regardless of which
/// order the caller happened to list them in a `transaction()` call.
pub struct Segment {
    path: PathBuf,
    file: File,
    inode: u64,
    page_size: usize,
    size: u64,
    base: *mut u8,
    metadata_file: File,
    metadata_map: MmapRaw,
    default_protection: Protection,
}

unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    fn open(
        path: &Path,
        size: u64,
        requested_va: *mut u8,
        default_protection: Protection,
    ) -> Result<Segment, StmError> {
        let file = FsOpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(StmError::Open)?;
        file.try_lock_exclusive().map_err(StmError::Lock)?;

        let metadata = file.metadata().map_err(StmError::Open)?;
        let inode = std::os::unix::fs::MetadataExt::ino(&metadata);
        let current_size = metadata.len();
        if size > current_size {
            file.set_len(size).map_err(|source| StmError::ResizeFailed {
                size: current_size,
                requested: size,
                source,
            })?;
        }
        let segment_size = current_size.max(size);
        if segment_size == 0 {
            return Err(StmError::DataFormat("segment size must be non-zero"));
        }

        let page_size = platform::page_size();
        if segment_size % page_size as u64 != 0 {
            return Err(StmError::DataFormat("segment size must be a multiple of the page size"));
        }

        let base = unsafe {
            platform::mmap_initial(requested_va, segment_size as usize, file.as_raw_fd(), default_protection)?
        };

        let metadata_path = sidecar_path(path);
        let metadata_file = FsOpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&metadata_path)
            .map_err(StmError::Open)?;
        let required = sidecar_len(segment_size, page_size);
        let metadata_current = metadata_file.metadata().map_err(StmError::Open)?.len();
        if required > metadata_current {
            metadata_file
                .set_len(required)
                .map_err(|source| StmError::ResizeFailed {
                    size: metadata_current,
                    requested: required,
                    source,
                })?;
        }
        let metadata_map = MmapRaw::map_raw(&metadata_file).map_err(|source| StmError::Mmap {
            requested: required as usize,
            source,
        })?;

        let segment = Segment {
            path: path.to_path_buf(),
            file,
            inode,
            page_size,
            size: segment_size,
            base,
            metadata_file,
            metadata_map,
            default_protection,
        };
        register(&segment);
        Ok(segment)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn inode(&self) -> u64 {
        self.inode
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn fd(&self) -> i32 {
        self.file.as_raw_fd()
    }

    pub fn default_protection(&self) -> Protection {
        self.default_protection
    }

    pub fn page_count(&self) -> usize {
        (self.size as usize) / self.page_size
    }

    /// Byte offset of `addr` within the segment, or `None` if it falls
    /// outside `[base, base + size)`.
    pub fn offset_of(&self, addr: *const u8) -> Option<u64> {
        let addr = addr as usize;
        let base = self.base as usize;
        if addr < base || addr >= base + self.size as usize {
            return None;
        }
        Some((addr - base) as u64)
    }

    pub fn page_index_of(&self, addr: *const u8) -> Option<usize> {
        self.offset_of(addr).map(|off| (off / self.page_size as u64) as usize)
    }

    pub fn page_base(&self, page_index: usize) -> *mut u8 {
        unsafe { self.base.add(page_index * self.page_size) }
    }

    /// Exclusive access to the shared metadata sidecar's typed view.
    ///
    /// # Safety
    /// The caller must not hold two `MetadataView`s over the same segment
    /// simultaneously (one process, one thread at a time touches the page
    /// table directly; cross-process synchronization is via the
    /// compare-and-swap primitives in [`crate::platform`], not Rust
    /// borrowing, since other processes mapping the same file are entirely
    /// invisible to the borrow checker).
    pub unsafe fn metadata(&self) -> Result<MetadataView<'_>, StmError> {
        let bytes = std::slice::from_raw_parts_mut(self.metadata_map.as_mut_ptr(), self.metadata_map.len());
        MetadataView::new(bytes, self.page_size)
    }

    pub unsafe fn transaction_header_ptr(&self) -> *mut TransactionHeader {
        self.metadata_map.as_mut_ptr() as *mut TransactionHeader
    }

    /// Unmap, unlock, and unlink this segment from the thread's open-segment
    /// list. Equivalent to dropping the handle; spelled out as a consuming
    /// method so closing a segment reads as an explicit action at the call
    /// site, matching `stm_close_segment`.
    pub fn close(self) {
        drop(self)
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        unregister(self.inode);
        unsafe {
            platform::munmap(self.base, self.size as usize);
        }
        let _ = FileExt::unlock(&self.file);
    }
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".metadata");
    PathBuf::from(s)
}

/// Registry entry: enough to find a segment from a faulting address without
/// holding a borrow of the `Segment` itself (the fault handler runs on an
/// alternate stack and cannot safely take locks).
struct Registration {
    inode: u64,
    base: usize,
    size: u64,
    ptr: *const Segment,
}

thread_local! {
    /// Segments opened by this thread, kept sorted by inode ascending so
    /// [`ordered`] can hand the commit path a deadlock-free walk order
    /// without re-sorting on every commit.
    static SEGMENTS: RefCell<Vec<Registration>> = const { RefCell::new(Vec::new()) };
}

fn register(seg: &Segment) {
    SEGMENTS.with(|list| {
        let mut list = list.borrow_mut();
        let entry = Registration {
            inode: seg.inode,
            base: seg.base as usize,
            size: seg.size,
            ptr: seg as *const Segment,
        };
        let pos = list.partition_point(|r| r.inode < entry.inode);
        list.insert(pos, entry);
    });
}

fn unregister(inode: u64) {
    SEGMENTS.with(|list| {
        list.borrow_mut().retain(|r| r.inode != inode);
    });
}

/// Find the currently-open segment (on this thread) whose mapping contains
/// `addr`, if any. Used by the fault handler to resolve a faulting address
/// to a `Segment` and by callers that only have a raw pointer into shared
/// memory.
///
/// # Safety
/// The returned reference's lifetime is not tied to anything; the caller
/// must not retain it past the point where the segment could be closed.
/// Safe to call from a signal handler: touches only thread-local data this
/// thread itself populated, no locks, no allocation beyond what `RefCell`
/// borrow bookkeeping already requires (the `Vec` itself is never resized
/// from signal context, only read).
pub unsafe fn find_segment(addr: *const u8) -> Option<*const Segment> {
    let addr = addr as usize;
    SEGMENTS.with(|list| {
        list.borrow()
            .iter()
            .find(|r| addr >= r.base && addr < r.base + r.size as usize)
            .map(|r| r.ptr)
    })
}

/// All segments currently open on this thread, in ascending inode order.
///
/// # Safety
/// Pointers are valid only as long as the originating `Segment`s are not
/// dropped; callers must not outlive the referenced segments.
pub unsafe fn ordered_segments() -> Vec<*const Segment> {
    SEGMENTS.with(|list| list.borrow().iter().map(|r| r.ptr).collect())
}
