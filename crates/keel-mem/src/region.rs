//! Byte regions: the address ranges arenas bump through.
//!
//! A [`ByteRegion`] is a contiguous range of address space that can be
//! committed and decommitted piecewise and is released when dropped. Arenas
//! only ever talk to this trait, so the OS specifics live here.
//!
//! Two regions are provided:
//!
//! - [`VirtualRegion`]: an anonymous memory map. Reserving it costs address
//!   space only; pages become resident when touched and are handed back to
//!   the OS on decommit.
//! - [`HeapRegion`]: a fixed, zeroed heap buffer. It is fully committed from
//!   the start and never decommits.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::OnceLock;

use keel_log::{debug, trace, warn};
use memmap2::{MmapMut, MmapOptions};

use crate::error::{Error, Result};

/// Alignment of [`HeapRegion`] buffers.
const HEAP_REGION_ALIGN: usize = 4096;

/// Page size assumed when the OS cannot be asked.
const FALLBACK_PAGE_SIZE: usize = 4096;

/// Size of an OS page in bytes.
///
/// Decommits only ever release whole pages, so this is the granularity at
/// which [`VirtualRegion`] hands memory back.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

    *PAGE_SIZE.get_or_init(|| {
        #[cfg(unix)]
        {
            // SAFETY: sysconf has no preconditions.
            let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if let Ok(size) = usize::try_from(size)
                && size.is_power_of_two()
            {
                return size;
            }
        }
        FALLBACK_PAGE_SIZE
    })
}

/// A reserved range of address space with piecewise commit.
///
/// Offsets passed to [`commit`](ByteRegion::commit) and
/// [`decommit`](ByteRegion::decommit) are relative to [`base`](ByteRegion::base)
/// and the range `offset..offset + len` always lies within `0..len()`.
pub trait ByteRegion: Send {
    /// Start of the region.
    fn base(&self) -> NonNull<u8>;

    /// Reserved size in bytes.
    fn len(&self) -> usize;

    /// Returns `true` if the region is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether pages must be committed before use.
    ///
    /// A region returning `false` is treated as fully committed for its whole
    /// lifetime.
    fn lazy_commit(&self) -> bool {
        true
    }

    /// Makes `offset..offset + len` usable.
    fn commit(&mut self, offset: usize, len: usize) -> Result<()>;

    /// Returns the physical pages behind `offset..offset + len` to the OS.
    ///
    /// Bytes before `offset` must be preserved even when `offset` is not page
    /// aligned. The contents of a decommitted range are unspecified once
    /// recommitted.
    fn decommit(&mut self, offset: usize, len: usize) -> Result<()>;
}

/// An anonymous memory mapping used as a lazily committed reservation.
pub struct VirtualRegion {
    map: MmapMut,
    base: NonNull<u8>,
}

// SAFETY: `base` points into `map`, which is owned and moves with the region.
unsafe impl Send for VirtualRegion {}

impl VirtualRegion {
    /// Reserves `size` bytes of address space.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReserveFailed`] if the mapping cannot be created.
    pub fn reserve(size: usize) -> Result<Self> {
        // Without MAP_NORESERVE the kernel charges the whole range against
        // the commit limit up front.
        let mut map = MmapOptions::new()
            .len(size)
            .no_reserve_swap()
            .map_anon()
            .map_err(|e| {
                warn!("reserving {} bytes failed: {}", size, e);
                Error::ReserveFailed { size }
            })?;

        let base = NonNull::new(map.as_mut_ptr()).ok_or(Error::ReserveFailed { size })?;
        debug!("reserved {} bytes at {:p}", size, base);

        Ok(Self { map, base })
    }
}

impl ByteRegion for VirtualRegion {
    fn base(&self) -> NonNull<u8> {
        self.base
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn commit(&mut self, offset: usize, len: usize) -> Result<()> {
        debug_assert!(offset + len <= self.len());
        trace!("commit {} bytes at offset {:#x}", len, offset);

        // Anonymous pages fault in on first touch; the advice only prefetches.
        #[cfg(unix)]
        if let Err(e) = self.map.advise_range(memmap2::Advice::WillNeed, offset, len) {
            trace!("willneed advice ignored: {}", e);
        }

        Ok(())
    }

    fn decommit(&mut self, offset: usize, len: usize) -> Result<()> {
        debug_assert!(offset + len <= self.len());

        // The page holding `offset` may still hold live bytes below it; only
        // pages starting at or past `offset` are released.
        let end = offset + len;
        let start = offset.next_multiple_of(page_size()).min(end);
        if start == end {
            trace!("decommit at offset {:#x} spans no whole page", offset);
            return Ok(());
        }
        trace!("decommit {} bytes at offset {:#x}", end - start, start);

        // SAFETY: `start..end` lies past the live allocations of the arena.
        #[cfg(unix)]
        if let Err(e) = unsafe {
            self.map
                .unchecked_advise_range(memmap2::UncheckedAdvice::DontNeed, start, end - start)
        } {
            warn!("decommit of {} bytes at {:#x} failed: {}", end - start, start, e);
        }

        Ok(())
    }
}

impl Drop for VirtualRegion {
    fn drop(&mut self) {
        debug!("releasing {} bytes at {:p}", self.map.len(), self.base);
    }
}

/// A fixed heap buffer presented as an always-committed region.
pub struct HeapRegion {
    base: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer is uniquely owned by the region.
unsafe impl Send for HeapRegion {}

impl HeapRegion {
    /// Allocates a zeroed buffer of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReserveFailed`] if `size` is zero or the heap cannot
    /// satisfy the request.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::ReserveFailed { size });
        }
        let layout = Layout::from_size_align(size, HEAP_REGION_ALIGN)
            .map_err(|_| Error::ReserveFailed { size })?;

        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let base = NonNull::new(ptr).ok_or(Error::ReserveFailed { size })?;
        debug!("allocated fixed region of {} bytes at {:p}", size, base);

        Ok(Self { base, layout })
    }
}

impl ByteRegion for HeapRegion {
    fn base(&self) -> NonNull<u8> {
        self.base
    }

    fn len(&self) -> usize {
        self.layout.size()
    }

    fn lazy_commit(&self) -> bool {
        false
    }

    fn commit(&mut self, _offset: usize, _len: usize) -> Result<()> {
        Ok(())
    }

    fn decommit(&mut self, _offset: usize, _len: usize) -> Result<()> {
        Ok(())
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        // SAFETY: base was allocated with exactly this layout.
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_region_reserve_and_touch() {
        let mut region = VirtualRegion::reserve(1 << 20).unwrap();
        assert_eq!(region.len(), 1 << 20);
        assert!(region.lazy_commit());

        region.commit(0, 8192).unwrap();
        let base = region.base().as_ptr();
        unsafe {
            base.write(0xAB);
            base.add(8191).write(0xCD);
            assert_eq!(*base, 0xAB);
            assert_eq!(*base.add(8191), 0xCD);
        }
    }

    #[test]
    fn test_virtual_region_decommit_then_reuse() {
        let mut region = VirtualRegion::reserve(1 << 20).unwrap();
        region.commit(0, 1 << 20).unwrap();
        let base = region.base().as_ptr();
        unsafe { base.add(65536).write(7) };

        region.decommit(65536, 65536).unwrap();
        region.commit(65536, 65536).unwrap();
        unsafe {
            base.add(65536).write(9);
            assert_eq!(*base.add(65536), 9);
        }
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        let page = page_size();
        assert!(page.is_power_of_two());
        assert!(page >= 4096);
    }

    #[test]
    fn test_unaligned_decommit_keeps_bytes_below_offset() {
        let mut region = VirtualRegion::reserve(1 << 20).unwrap();
        let base = region.base().as_ptr();
        unsafe { std::ptr::write_bytes(base, 0xCD, 5000) };

        region.decommit(5000, 100_000).unwrap();

        let kept = unsafe { std::slice::from_raw_parts(base, 5000) };
        assert!(kept.iter().all(|&b| b == 0xCD));
    }

    #[test]
    fn test_decommit_inside_one_page_is_noop() {
        let mut region = VirtualRegion::reserve(1 << 20).unwrap();
        let base = region.base().as_ptr();
        unsafe { std::ptr::write_bytes(base, 0x11, 3000) };

        region.decommit(3000, 10).unwrap();

        let kept = unsafe { std::slice::from_raw_parts(base, 3000) };
        assert!(kept.iter().all(|&b| b == 0x11));
    }

    // Under heuristic overcommit a charged 1 TiB private mapping is refused,
    // so this only passes when the reservation is not charged.
    #[cfg(all(target_os = "linux", target_pointer_width = "64"))]
    #[test]
    fn test_reserve_is_not_charged_up_front() {
        let mode = std::fs::read_to_string("/proc/sys/vm/overcommit_memory").unwrap_or_default();
        if mode.trim() != "0" {
            return;
        }

        let region = VirtualRegion::reserve(1 << 40).unwrap();
        assert_eq!(region.len(), 1 << 40);
    }

    #[test]
    fn test_heap_region_is_fixed_and_zeroed() {
        let region = HeapRegion::new(4096).unwrap();
        assert!(!region.lazy_commit());
        assert_eq!(region.len(), 4096);
        assert_eq!(region.base().as_ptr() as usize % HEAP_REGION_ALIGN, 0);

        let bytes = unsafe { std::slice::from_raw_parts(region.base().as_ptr(), 4096) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_heap_region_rejects_zero() {
        assert_eq!(HeapRegion::new(0).err(), Some(Error::ReserveFailed { size: 0 }));
    }
}
