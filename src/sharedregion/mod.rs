//! Shared-Region Directory
//!
//! Translates between processor-local addresses and portable pointers.
//! Each processor registers the regions it has mapped, at whatever local
//! base the mapping landed on; the same region id refers to the same bytes
//! on every processor.
//!
//! The directory is populated once during bring-up and is read-mostly
//! afterwards, so it sits behind a reader/writer lock.

pub mod srptr;

use core::mem::{align_of, size_of};
use core::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};

use heapless::Vec;
use spin::RwLock;

use crate::error::{IpcError, IpcResult};
use crate::multiproc::{ProcessorId, MAX_PROCESSORS};

pub use srptr::{PortablePtr, RegionId, SharedPtrCell};

/// Maximum number of regions per directory
pub const MAX_REGIONS: usize = 8;

bitflags::bitflags! {
    /// Set of processors able to map a region
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProcSet: u8 {
        const PROC0 = 1 << 0;
        const PROC1 = 1 << 1;
        const PROC2 = 1 << 2;
        const PROC3 = 1 << 3;
    }
}

impl ProcSet {
    /// The set holding just `id`
    pub fn of(id: ProcessorId) -> Self {
        if id.index() < MAX_PROCESSORS {
            Self::from_bits_truncate(1 << id.0)
        } else {
            Self::empty()
        }
    }

    pub fn contains_proc(&self, id: ProcessorId) -> bool {
        id.index() < MAX_PROCESSORS && self.contains(Self::of(id))
    }
}

/// Objects that may be viewed in place inside a shared region
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, valid for every bit pattern, and
/// mutated only through interior mutability (atomics), since peers on
/// other processors write the same bytes.
pub unsafe trait SharedObject: Sync {}

unsafe impl SharedObject for AtomicU32 {}
unsafe impl SharedObject for AtomicU64 {}
unsafe impl SharedObject for SharedPtrCell {}

/// One registered region
#[derive(Debug, Clone, Copy)]
pub struct RegionEntry {
    pub id: RegionId,
    /// Local base address of the mapping
    pub base: usize,
    /// Region length in bytes
    pub size: usize,
    pub mappable_by: ProcSet,
}

impl RegionEntry {
    fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr - self.base < self.size
    }

    fn overlaps(&self, base: usize, size: usize) -> bool {
        base < self.base + self.size && self.base < base + size
    }
}

/// Per-processor region directory
#[derive(Debug)]
pub struct RegionDirectory {
    local: AtomicU16,
    entries: RwLock<Vec<RegionEntry, MAX_REGIONS>>,
}

impl RegionDirectory {
    /// Create an empty directory for processor `local`
    pub const fn new(local: ProcessorId) -> Self {
        Self {
            local: AtomicU16::new(local.0),
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Processor whose mappings this directory describes
    pub fn local(&self) -> ProcessorId {
        ProcessorId(self.local.load(Ordering::Acquire))
    }

    /// Record the local id once the registry assigns it
    pub(crate) fn set_local(&self, id: ProcessorId) {
        self.local.store(id.0, Ordering::Release);
    }

    /// Register a region mapped at `base`
    ///
    /// # Safety
    ///
    /// `[base, base + size)` must stay mapped, readable and writable for as
    /// long as this directory is alive, and must only be accessed through
    /// shared objects (atomics) while other processors use it.
    pub unsafe fn register(
        &self,
        id: RegionId,
        base: *mut u8,
        size: usize,
        mappable_by: ProcSet,
    ) -> IpcResult<()> {
        let base = base as usize;
        if id == RegionId::INVALID || base == 0 || size == 0 || size > u32::MAX as usize {
            return Err(IpcError::InvalidArgument);
        }
        if base.checked_add(size).is_none() {
            return Err(IpcError::InvalidArgument);
        }

        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.id == id) {
            return Err(IpcError::AlreadyExists);
        }
        if entries.iter().any(|e| e.overlaps(base, size)) {
            return Err(IpcError::InvalidArgument);
        }
        entries
            .push(RegionEntry {
                id,
                base,
                size,
                mappable_by,
            })
            .map_err(|_| IpcError::OutOfMemory)?;

        log::debug!("sharedregion: region {} at {:#x} size {:#x}", id.0, base, size);
        Ok(())
    }

    /// Remove a region from the directory
    pub fn unregister(&self, id: RegionId) -> IpcResult<RegionEntry> {
        let mut entries = self.entries.write();
        let idx = entries
            .iter()
            .position(|e| e.id == id)
            .ok_or(IpcError::NotFound)?;
        Ok(entries.swap_remove(idx))
    }

    /// Copy of the entry for `id`
    pub fn entry(&self, id: RegionId) -> IpcResult<RegionEntry> {
        self.entries
            .read()
            .iter()
            .find(|e| e.id == id)
            .copied()
            .ok_or(IpcError::NotFound)
    }

    /// Translate a local address into a portable pointer
    ///
    /// Fails `NotFound` for addresses outside every registered region;
    /// private memory must never be handed to a shared structure.
    pub fn to_portable(&self, addr: usize) -> IpcResult<PortablePtr> {
        let entries = self.entries.read();
        let entry = entries
            .iter()
            .find(|e| e.contains(addr))
            .ok_or(IpcError::NotFound)?;
        Ok(PortablePtr::new(entry.id, (addr - entry.base) as u32))
    }

    /// Translate a portable pointer into a local address
    pub fn to_local(&self, ptr: PortablePtr) -> IpcResult<usize> {
        let entries = self.entries.read();
        let entry = entries
            .iter()
            .find(|e| e.id == ptr.region)
            .filter(|e| e.mappable_by.contains_proc(self.local()))
            .ok_or(IpcError::NotFound)?;
        if ptr.offset as usize >= entry.size {
            return Err(IpcError::OutOfRange);
        }
        Ok(entry.base + ptr.offset as usize)
    }

    /// View the shared object at `ptr`
    pub fn object<T: SharedObject>(&self, ptr: PortablePtr) -> IpcResult<&T> {
        let entry = self.entry(ptr.region)?;
        let addr = self.to_local(ptr)?;
        if ptr.offset as usize + size_of::<T>() > entry.size {
            return Err(IpcError::OutOfRange);
        }
        if addr % align_of::<T>() != 0 {
            return Err(IpcError::InvalidArgument);
        }
        // SAFETY: the range lies inside a region that `register`'s caller
        // guaranteed stays mapped while `self` lives, the address is
        // aligned, and `T` accepts any bit pattern.
        Ok(unsafe { &*(addr as *const T) })
    }

    /// Zero a block the broker reserved at `ptr`
    ///
    /// Offsets are handed out by the broker so that every processor draws
    /// from one cursor per region; this only checks that the block fits the
    /// local mapping at the requested alignment and clears it.
    pub(crate) fn claim(&self, ptr: PortablePtr, size: usize, align: usize) -> IpcResult<usize> {
        if size == 0 || !align.is_power_of_two() {
            return Err(IpcError::InvalidArgument);
        }
        let entry = self.entry(ptr.region)?;
        let addr = self.to_local(ptr)?;
        let end = (ptr.offset as usize)
            .checked_add(size)
            .ok_or(IpcError::OutOfRange)?;
        if end > entry.size {
            return Err(IpcError::OutOfRange);
        }
        if addr % align != 0 {
            log::warn!(
                "sharedregion: region {} base {:#x} breaks {}-byte alignment",
                entry.id.0,
                entry.base,
                align
            );
            return Err(IpcError::InvalidArgument);
        }

        // SAFETY: `[addr, addr + size)` lies inside the registered mapping
        // and the broker handed it to this caller alone.
        unsafe { core::ptr::write_bytes(addr as *mut u8, 0, size) };
        Ok(addr)
    }
}
