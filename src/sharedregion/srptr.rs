//! Portable pointers
//!
//! The only form of reference ever stored inside a shared structure. A
//! portable pointer names a region and a byte offset into it; each
//! processor turns it back into a local address through its own
//! [`RegionDirectory`](super::RegionDirectory).

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Shared region identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionId(pub u16);

impl RegionId {
    /// Invalid region id
    pub const INVALID: Self = Self(0xFFFF);
}

/// Cross-processor reference: (region id, offset)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortablePtr {
    pub region: RegionId,
    pub offset: u32,
}

impl PortablePtr {
    /// Wire value of the null portable pointer
    pub const INVALID_BITS: u64 = u64::MAX;

    pub const fn new(region: RegionId, offset: u32) -> Self {
        Self { region, offset }
    }

    /// Encode as a single word: region in the high half, offset in the low
    pub const fn to_bits(self) -> u64 {
        ((self.region.0 as u64) << 32) | self.offset as u64
    }

    /// Decode a word written by `to_bits`; `None` for the null pointer
    pub const fn from_bits(bits: u64) -> Option<Self> {
        if bits == Self::INVALID_BITS || (bits >> 48) != 0 {
            return None;
        }
        Some(Self {
            region: RegionId((bits >> 32) as u16),
            offset: bits as u32,
        })
    }

    /// Pointer `delta` bytes further into the same region
    pub const fn add(self, delta: u32) -> Self {
        Self {
            region: self.region,
            offset: self.offset + delta,
        }
    }
}

impl fmt::Display for PortablePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}", self.region.0, self.offset)
    }
}

/// A portable pointer slot living in shared memory
#[repr(transparent)]
#[derive(Debug)]
pub struct SharedPtrCell(AtomicU64);

impl SharedPtrCell {
    /// A slot holding the null pointer
    pub const fn null() -> Self {
        Self(AtomicU64::new(PortablePtr::INVALID_BITS))
    }

    pub fn load(&self) -> Option<PortablePtr> {
        PortablePtr::from_bits(self.0.load(Ordering::SeqCst))
    }

    pub fn store(&self, ptr: Option<PortablePtr>) {
        let bits = ptr.map_or(PortablePtr::INVALID_BITS, PortablePtr::to_bits);
        self.0.store(bits, Ordering::SeqCst);
    }
}

impl Default for SharedPtrCell {
    fn default() -> Self {
        Self::null()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_roundtrip() {
        let p = PortablePtr::new(RegionId(3), 0x1234);
        assert_eq!(p.to_bits(), 0x0003_0000_1234);
        assert_eq!(PortablePtr::from_bits(p.to_bits()), Some(p));
        assert_eq!(PortablePtr::from_bits(PortablePtr::INVALID_BITS), None);
    }

    #[test]
    fn test_cell_defaults_to_null() {
        let cell = SharedPtrCell::default();
        assert_eq!(cell.load(), None);

        let p = PortablePtr::new(RegionId(0), 64);
        cell.store(Some(p));
        assert_eq!(cell.load(), Some(p));
        cell.store(None);
        assert_eq!(cell.load(), None);
    }
}
