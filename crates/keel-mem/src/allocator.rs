//! Backend-agnostic allocation.
//!
//! [`Allocator`] is the uniform interface generic code is written against:
//! allocate, resize, free and free-all. Two backends implement it:
//!
//! - [`HeapAllocator`]: the global heap. `free` releases immediately and
//!   `free_all` does nothing, since the heap tracks nothing collectively.
//! - [`Arena`]: `free` only reclaims the most recent allocation, `free_all`
//!   resets the arena, and `resize` grows the most recent allocation in place.
//!
//! # Examples
//!
//! ```
//! use keel_mem::{Allocator, Arena, HeapAllocator};
//!
//! fn duplicate(alloc: &mut dyn Allocator, bytes: &[u8]) -> Vec<u8> {
//!     let ptr = alloc.allocate_copy(bytes).unwrap();
//!     let out = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), bytes.len()) }.to_vec();
//!     unsafe { alloc.free(ptr, bytes.len(), 1) };
//!     out
//! }
//!
//! let mut arena = Arena::new(1 << 20).unwrap();
//! assert_eq!(duplicate(&mut arena, b"abc"), b"abc");
//! assert_eq!(arena.pos(), 0);
//!
//! assert_eq!(duplicate(&mut HeapAllocator, b"xyz"), b"xyz");
//! ```

use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};

use keel_log::{trace, warn};

use crate::arena::Arena;
use crate::error::{Error, Result};

#[inline]
fn check_align(align: usize) -> Result<()> {
    if align.is_power_of_two() {
        Ok(())
    } else {
        Err(Error::InvalidAlignment { alignment: align })
    }
}

/// A memory backend.
///
/// `align` must be a power of two for every call; the provided methods and
/// both backends report [`Error::InvalidAlignment`] otherwise.
pub trait Allocator {
    /// Allocates `size` bytes aligned to `align`.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend is exhausted or `align` is invalid.
    fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<u8>>;

    /// Resizes `old` from `old_size` to `new_size` bytes.
    ///
    /// `None` behaves as [`allocate`](Allocator::allocate). Otherwise the
    /// allocation grows or shrinks in place when the backend can, and is
    /// moved (copying `min(old_size, new_size)` bytes) when it cannot. On
    /// error `old` is still valid.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend is exhausted or `align` is invalid.
    ///
    /// # Safety
    ///
    /// `old` must have been returned by this allocator with `old_size` and
    /// `align`, and must not be used after a successful call.
    unsafe fn resize(
        &mut self,
        old: Option<NonNull<u8>>,
        old_size: usize,
        new_size: usize,
        align: usize,
    ) -> Result<NonNull<u8>>;

    /// Releases `ptr`, if the backend can.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator with `size` and
    /// `align`, and must not be used afterwards.
    unsafe fn free(&mut self, ptr: NonNull<u8>, size: usize, align: usize);

    /// Releases everything the backend can release at once.
    fn free_all(&mut self);

    /// Allocates `size` zero-filled bytes.
    ///
    /// # Errors
    ///
    /// See [`allocate`](Allocator::allocate).
    fn allocate_zeroed(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        let ptr = self.allocate(size, align)?;
        // SAFETY: ptr is valid for `size` bytes.
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };
        Ok(ptr)
    }

    /// Allocates a copy of `bytes`.
    ///
    /// # Errors
    ///
    /// See [`allocate`](Allocator::allocate).
    fn allocate_copy(&mut self, bytes: &[u8]) -> Result<NonNull<u8>> {
        let ptr = self.allocate(bytes.len(), 1)?;
        // SAFETY: fresh allocation, valid for bytes.len() bytes.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len()) };
        Ok(ptr)
    }
}

impl<A: Allocator + ?Sized> Allocator for &mut A {
    fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        (**self).allocate(size, align)
    }

    unsafe fn resize(
        &mut self,
        old: Option<NonNull<u8>>,
        old_size: usize,
        new_size: usize,
        align: usize,
    ) -> Result<NonNull<u8>> {
        // SAFETY: forwarded caller contract.
        unsafe { (**self).resize(old, old_size, new_size, align) }
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>, size: usize, align: usize) {
        // SAFETY: forwarded caller contract.
        unsafe { (**self).free(ptr, size, align) }
    }

    fn free_all(&mut self) {
        (**self).free_all();
    }
}

/// The global heap as an [`Allocator`].
///
/// Zero-sized requests are served as one-byte allocations so every returned
/// pointer can be freed.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapAllocator;

impl HeapAllocator {
    fn layout(size: usize, align: usize) -> Result<Layout> {
        check_align(align)?;
        Layout::from_size_align(size.max(1), align).map_err(|_| Error::CapacityOverflow)
    }
}

impl Allocator for HeapAllocator {
    fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        let layout = Self::layout(size, align)?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc::alloc(layout) };
        NonNull::new(ptr).ok_or(Error::HeapAllocationFailed { size })
    }

    unsafe fn resize(
        &mut self,
        old: Option<NonNull<u8>>,
        old_size: usize,
        new_size: usize,
        align: usize,
    ) -> Result<NonNull<u8>> {
        let Some(old) = old else {
            return self.allocate(new_size, align);
        };

        let old_layout = Self::layout(old_size, align)?;
        // Validates that the new size is representable with this alignment.
        Self::layout(new_size, align)?;

        // SAFETY: old was allocated with old_layout (caller contract) and the
        // new size is non-zero and fits a layout of the same alignment.
        let ptr = unsafe { alloc::realloc(old.as_ptr(), old_layout, new_size.max(1)) };
        NonNull::new(ptr).ok_or(Error::HeapAllocationFailed { size: new_size })
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>, size: usize, align: usize) {
        match Self::layout(size, align) {
            // SAFETY: ptr was allocated with this layout (caller contract).
            Ok(layout) => unsafe { alloc::dealloc(ptr.as_ptr(), layout) },
            Err(e) => warn!("free of {} bytes ignored: {}", size, e),
        }
    }

    fn free_all(&mut self) {
        trace!("free_all on the heap allocator is a no-op");
    }
}

impl Allocator for Arena {
    fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        self.push_aligned(size, align)
    }

    unsafe fn resize(
        &mut self,
        old: Option<NonNull<u8>>,
        old_size: usize,
        new_size: usize,
        align: usize,
    ) -> Result<NonNull<u8>> {
        match old {
            None => self.push_aligned(new_size, align),
            // SAFETY: old is readable for old_size bytes (caller contract).
            Some(old) => unsafe { self.resize_last_aligned(old, old_size, new_size, align) },
        }
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>, size: usize, _align: usize) {
        if !self.free_last(ptr, size) {
            trace!("arena {:?}: free of a non-topmost allocation ignored", self.id());
        }
    }

    fn free_all(&mut self) {
        self.reset();
    }
}
