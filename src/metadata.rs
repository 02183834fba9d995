//! Layout and accessors for a segment's metadata sidecar.
//!
//! Every open segment `foo.dat` has a companion `foo.dat.metadata` file,
//! shared and mmapped the same way as the data file itself. It holds two
//! things: a single [`TransactionHeader`] at the front (rounded up to a
//! whole number of pages), and one [`PageTableEntry`] per page of the data
//! segment immediately after it.

use bytemuck::{Pod, Zeroable};

use crate::error::StmError;
use crate::platform::TransactionId;

/// Upper bound on the number of transactions concurrently active on one
/// segment. Sized to match a fixed-capacity slot table rather than a
/// growable one, so the sidecar's size is a pure function of the data
/// segment's page count.
pub const MAX_ACTIVE_TRANSACTIONS: usize = 100;

/// The fixed-size control block at the start of a metadata sidecar.
///
/// `active_transactions` is a sparse, unordered set of currently-active
/// transaction ids: zero means an empty slot. `high_water` never shrinks
/// during normal operation, only on the rare full compaction triggered when
/// a delete leaves the top slot empty; it lets scans over the slot array
/// skip trailing slots that have never been used.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct TransactionHeader {
    pub next_transaction_id: u32,
    lock: u32,
    pub active_transaction_high_water: u32,
    _padding: u32,
    pub active_transactions: [u32; MAX_ACTIVE_TRANSACTIONS],
}

impl TransactionHeader {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Size of the header region within the sidecar file, rounded up to a
    /// whole number of pages so the page table that follows starts on a
    /// page boundary.
    pub fn region_size(page_size: usize) -> usize {
        let mut size = page_size;
        while size < Self::SIZE {
            size += page_size;
        }
        size
    }

    /// The spinlock briefly held while starting a transaction, to serialize
    /// "claim the next transaction id" with "publish it in the active set"
    /// across every process mapping this sidecar. `SpinLock` is
    /// `repr(transparent)` over an `AtomicI32`, the same width as `lock`, so
    /// this reinterprets the field in place rather than copying it.
    pub fn spinlock(&self) -> &crate::platform::SpinLock {
        unsafe { &*(&self.lock as *const u32 as *const crate::platform::SpinLock) }
    }
}

/// Per-page bookkeeping: which transaction currently owns the page (if
/// any), and which transaction last committed a write to it.
///
/// `current_transaction` is claimed with a compare-and-swap during the
/// commit validate phase and cleared on both commit and abort; a page with
/// `current_transaction == 0` is unowned. `completed_transaction` is the
/// value every reader compares against its own snapshot of "transactions
/// active when I started" to detect whether the page changed underneath
/// it.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct PageTableEntry {
    pub current_transaction: u32,
    pub completed_transaction: u32,
}

impl PageTableEntry {
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

/// Total length in bytes the metadata sidecar file must have for a data
/// segment of `segment_size` bytes with the given `page_size`.
pub fn sidecar_len(segment_size: u64, page_size: usize) -> u64 {
    let page_count = segment_size.div_ceil(page_size as u64);
    TransactionHeader::region_size(page_size) as u64 + page_count * PageTableEntry::SIZE as u64
}

/// View over a metadata sidecar's mapped bytes, giving typed access to the
/// header and the per-page table without copying.
pub struct MetadataView<'a> {
    bytes: &'a mut [u8],
    header_region: usize,
}

impl<'a> MetadataView<'a> {
    /// Wrap a metadata sidecar's mapped bytes. `bytes` must be at least
    /// [`sidecar_len`] long for some page count at `page_size`; callers are
    /// expected to have verified this against the file's actual size when
    /// opening the segment.
    pub fn new(bytes: &'a mut [u8], page_size: usize) -> Result<Self, StmError> {
        let header_region = TransactionHeader::region_size(page_size);
        if bytes.len() < header_region + PageTableEntry::SIZE {
            return Err(StmError::DataFormat(
                "metadata sidecar shorter than one header region plus one page table entry",
            ));
        }
        Ok(MetadataView { bytes, header_region })
    }

    pub fn header(&self) -> &TransactionHeader {
        bytemuck::from_bytes(&self.bytes[..TransactionHeader::SIZE])
    }

    pub fn header_mut(&mut self) -> &mut TransactionHeader {
        bytemuck::from_bytes_mut(&mut self.bytes[..TransactionHeader::SIZE])
    }

    /// Number of page table entries available given the sidecar's actual
    /// mapped length.
    pub fn page_table_len(&self) -> usize {
        (self.bytes.len() - self.header_region) / PageTableEntry::SIZE
    }

    pub fn page_table(&self) -> &[PageTableEntry] {
        bytemuck::cast_slice(&self.bytes[self.header_region..])
    }

    pub fn page_table_mut(&mut self) -> &mut [PageTableEntry] {
        bytemuck::cast_slice_mut(&mut self.bytes[self.header_region..])
    }

    pub fn page_entry(&self, page_index: usize) -> &PageTableEntry {
        &self.page_table()[page_index]
    }

    pub fn page_entry_mut(&mut self, page_index: usize) -> &mut PageTableEntry {
        &mut self.page_table_mut()[page_index]
    }
}

/// Find a free slot in `active_transactions` and claim it for `id`, growing
/// `active_transaction_high_water` as needed. Mirrors the original
/// add-then-retry-from-below scan: check existing slots below the high
/// water mark first, only advancing the mark when none are free.
pub fn add_active_transaction(header: &mut TransactionHeader, id: TransactionId) -> Result<(), StmError> {
    loop {
        let high_water = header.active_transaction_high_water as usize;
        if high_water >= MAX_ACTIVE_TRANSACTIONS {
            for slot in header.active_transactions.iter_mut() {
                if *slot == 0 {
                    *slot = id;
                    return Ok(());
                }
            }
            return Err(StmError::TooManyActiveTransactions {
                capacity: MAX_ACTIVE_TRANSACTIONS,
            });
        }
        for i in (0..high_water).rev() {
            if header.active_transactions[i] == 0 {
                header.active_transactions[i] = id;
                return Ok(());
            }
        }
        header.active_transactions[high_water] = id;
        header.active_transaction_high_water = (high_water + 1) as u32;
        return Ok(());
    }
}

/// Clear `id`'s slot, shrinking the high water mark if it was the topmost
/// occupied slot.
pub fn delete_active_transaction(header: &mut TransactionHeader, id: TransactionId) {
    let high_water = header.active_transaction_high_water as usize;
    for i in 0..high_water {
        if header.active_transactions[i] == id {
            header.active_transactions[i] = 0;
            if i == high_water - 1 {
                header.active_transaction_high_water = i as u32;
            }
            return;
        }
    }
}

/// Snapshot every transaction id active right now except `exclude`. Taken
/// once at transaction start and compared against the `completed_transaction`
/// of each page touched, to distinguish "this page was already being
/// written by a transaction concurrent with mine" (fine to proceed once it
/// finishes) from "this page changed after I started" (must abort).
pub fn snapshot_active_transactions(header: &TransactionHeader, exclude: TransactionId) -> Vec<TransactionId> {
    let high_water = header.active_transaction_high_water as usize;
    header.active_transactions[..high_water]
        .iter()
        .copied()
        .filter(|&id| id != 0 && id != exclude)
        .collect()
}
