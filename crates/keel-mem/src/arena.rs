//! Virtual-memory bump arena.
//!
//! An [`Arena`] owns one [`ByteRegion`] and hands out memory by advancing a
//! single offset, `pos`, through it. Physical memory is committed lazily in
//! whole chunks as `pos` grows, and handed back to the OS when `pos` falls far
//! enough below the committed high end. Memory is reclaimed only in LIFO order:
//! by popping, by [`TempMark`]s, or by freeing the most recent allocation.
//!
//! # Invariants
//!
//! - `0 <= pos <= commit_pos <= size`
//! - every byte in `0..pos` is committed
//! - a fixed arena (backed by a non-lazy region) has `commit_pos == size`
//!   for its whole lifetime
//!
//! # Examples
//!
//! ```
//! use keel_mem::Arena;
//!
//! let mut arena = Arena::new(1024 * 1024).unwrap();
//!
//! let a = arena.push(3000).unwrap();
//! assert_eq!(arena.commit_pos(), 4096);
//!
//! let mark = arena.temp_begin();
//! let b = arena.push(2000).unwrap();
//! assert_eq!(arena.commit_pos(), 8192);
//!
//! arena.temp_end(mark);
//! assert_eq!(arena.push(2000).unwrap(), b);
//! assert_ne!(a, b);
//! ```

use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use keel_log::{trace, warn};

use crate::config::{ArenaConfig, DEFAULT_COMMIT_SIZE};
use crate::error::{Error, Result};
use crate::region::{ByteRegion, HeapRegion, VirtualRegion};

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArenaId(u64);

impl ArenaId {
    fn next() -> Self {
        Self(NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// A saved arena position.
///
/// Obtained from [`Arena::temp_begin`] and consumed by [`Arena::temp_end`].
/// Marks on the same arena must be released in reverse order of creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a temp mark does nothing unless released with `temp_end`"]
pub struct TempMark {
    arena: ArenaId,
    pos: usize,
}

impl TempMark {
    /// The arena this mark was taken on.
    #[must_use]
    pub const fn arena(&self) -> ArenaId {
        self.arena
    }

    /// The saved position.
    #[must_use]
    pub const fn pos(&self) -> usize {
        self.pos
    }
}

/// Arena usage statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    /// Bytes between the region base and `pos`, including padding.
    pub allocated: usize,
    /// Bytes currently committed.
    pub committed: usize,
    /// Bytes of reserved address space.
    pub reserved: usize,
    /// Highest `pos` ever reached.
    pub peak: usize,
}

/// A bump allocator over a reserved byte region.
///
/// Allocations return raw pointers that stay valid until the arena position
/// moves back below them (pop, reset, temp-mark release) or the arena is
/// dropped. Values written into the arena are never dropped.
pub struct Arena {
    id: ArenaId,
    region: Box<dyn ByteRegion>,
    size: usize,
    pos: usize,
    commit_pos: usize,
    /// Commit floor kept across decommits.
    initial_commit: usize,
    config: ArenaConfig,
    peak: usize,
}

#[inline]
fn round_up(value: usize, granularity: usize) -> usize {
    value.div_ceil(granularity).saturating_mul(granularity)
}

impl Arena {
    /// Reserves `reserve_size` bytes of address space with default commit
    /// settings.
    ///
    /// # Errors
    ///
    /// Fails if the reservation or the initial commit fails.
    pub fn new(reserve_size: usize) -> Result<Self> {
        let config = ArenaConfig::new()
            .reserve_size(reserve_size)
            .commit_size(DEFAULT_COMMIT_SIZE.min(reserve_size.max(1)));
        Self::with_config(config)
    }

    /// Creates a virtual-memory arena from `config`.
    ///
    /// # Errors
    ///
    /// Returns the validation error of `config`, [`Error::ReserveFailed`] or
    /// [`Error::CommitFailed`].
    pub fn with_config(config: ArenaConfig) -> Result<Self> {
        config.validate()?;
        let region = VirtualRegion::reserve(config.get_reserve_size())?;
        Self::from_region(Box::new(region), config)
    }

    /// Creates an arena over a fixed heap buffer of `size` bytes.
    ///
    /// The buffer is committed up front: `commit_pos == size` and pops never
    /// decommit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReserveFailed`] if the buffer cannot be allocated.
    pub fn fixed(size: usize) -> Result<Self> {
        let region = HeapRegion::new(size)?;
        Self::from_region(Box::new(region), ArenaConfig::new())
    }

    /// Creates an arena over an existing region.
    ///
    /// The reserve size of `config` is replaced by the region length and the
    /// commit chunk is clamped to it. Lazily committed regions get their
    /// initial chunk committed here.
    ///
    /// # Errors
    ///
    /// Returns the validation error of `config` or the initial commit failure.
    pub fn from_region(mut region: Box<dyn ByteRegion>, config: ArenaConfig) -> Result<Self> {
        let size = region.len();
        let config = config
            .reserve_size(size)
            .commit_size(config.get_commit_size().min(size));
        config.validate()?;

        let commit_pos = if region.lazy_commit() {
            let initial = config.get_commit_size();
            region.commit(0, initial)?;
            initial
        } else {
            size
        };

        let arena = Self {
            id: ArenaId::next(),
            region,
            size,
            pos: 0,
            commit_pos,
            initial_commit: commit_pos,
            config,
            peak: 0,
        };
        trace!("arena {:?} created: reserved {} committed {}", arena.id, size, commit_pos);
        Ok(arena)
    }

    #[must_use]
    pub const fn id(&self) -> ArenaId {
        self.id
    }

    /// Current logical offset.
    #[must_use]
    pub const fn pos(&self) -> usize {
        self.pos
    }

    /// End of the committed range.
    #[must_use]
    pub const fn commit_pos(&self) -> usize {
        self.commit_pos
    }

    /// Size of the reservation.
    #[must_use]
    pub const fn reserved(&self) -> usize {
        self.size
    }

    /// Bytes left before the reservation is exhausted (ignoring alignment).
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.size - self.pos
    }

    #[must_use]
    pub const fn config(&self) -> &ArenaConfig {
        &self.config
    }

    /// Whether this arena sits on a fully committed buffer.
    #[must_use]
    pub fn is_fixed(&self) -> bool {
        !self.region.lazy_commit()
    }

    #[must_use]
    pub const fn stats(&self) -> ArenaStats {
        ArenaStats {
            allocated: self.pos,
            committed: self.commit_pos,
            reserved: self.size,
            peak: self.peak,
        }
    }

    #[inline]
    fn base_addr(&self) -> usize {
        self.region.base().as_ptr() as usize
    }

    #[inline]
    fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset <= self.size);
        // SAFETY: offset is within the region (or one past its end).
        unsafe { self.region.base().add(offset) }
    }

    /// Returns the offset of `ptr` if it points into this arena's region.
    #[must_use]
    pub fn offset_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        (ptr.as_ptr() as usize)
            .checked_sub(self.base_addr())
            .filter(|&offset| offset <= self.size)
    }

    /// Whether `ptr..ptr + size` is the most recent allocation.
    #[must_use]
    pub fn is_last(&self, ptr: NonNull<u8>, size: usize) -> bool {
        self.offset_of(ptr)
            .and_then(|offset| offset.checked_add(size))
            .is_some_and(|end| end == self.pos)
    }

    /// Commits whole chunks until `end` is covered.
    fn ensure_committed(&mut self, end: usize) -> Result<()> {
        if end <= self.commit_pos {
            return Ok(());
        }

        let target = round_up(end, self.config.get_commit_size()).min(self.size);
        let len = target - self.commit_pos;
        if let Err(e) = self.region.commit(self.commit_pos, len) {
            warn!("arena {:?}: commit of {} bytes failed: {}", self.id, len, e);
            return Err(e);
        }

        self.commit_pos = target;
        Ok(())
    }

    /// Moves `pos` forward to `end`, committing as needed.
    fn advance_to(&mut self, end: usize, requested: usize) -> Result<()> {
        if end > self.size {
            return Err(Error::OutOfReservation {
                requested,
                available: self.size - self.pos,
            });
        }
        self.ensure_committed(end)?;
        self.pos = end;
        self.peak = self.peak.max(end);
        Ok(())
    }

    /// Allocates `size` bytes aligned to `align`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidAlignment`] if `align` is not a power of two
    /// - [`Error::OutOfReservation`] if the reservation is too small
    /// - [`Error::CommitFailed`] if the region cannot commit the pages
    ///
    /// On error `pos` is unchanged.
    pub fn push_aligned(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        if !align.is_power_of_two() {
            return Err(Error::InvalidAlignment { alignment: align });
        }

        let base = self.base_addr();
        let start = (base + self.pos)
            .checked_add(align - 1)
            .map(|addr| (addr & !(align - 1)) - base)
            .ok_or(Error::CapacityOverflow)?;
        let end = start.checked_add(size).ok_or(Error::CapacityOverflow)?;

        self.advance_to(end, size)?;
        Ok(self.ptr_at(start))
    }

    /// Allocates `size` bytes with the configured default alignment.
    ///
    /// # Errors
    ///
    /// See [`push_aligned`](Self::push_aligned).
    pub fn push(&mut self, size: usize) -> Result<NonNull<u8>> {
        self.push_aligned(size, self.config.get_alignment())
    }

    /// Allocates `size` zero-filled bytes.
    ///
    /// # Errors
    ///
    /// See [`push_aligned`](Self::push_aligned).
    pub fn push_zero(&mut self, size: usize) -> Result<NonNull<u8>> {
        let ptr = self.push(size)?;
        // SAFETY: ptr is valid for `size` freshly allocated bytes.
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };
        Ok(ptr)
    }

    /// Allocates uninitialized room for `count` values of `T`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapacityOverflow`] if the byte size overflows, or any
    /// error of [`push_aligned`](Self::push_aligned).
    pub fn push_array<T>(&mut self, count: usize) -> Result<NonNull<T>> {
        let size = size_of::<T>()
            .checked_mul(count)
            .ok_or(Error::CapacityOverflow)?;
        self.push_aligned(size, align_of::<T>()).map(NonNull::cast)
    }

    /// Copies `bytes` into the arena.
    ///
    /// # Errors
    ///
    /// See [`push_aligned`](Self::push_aligned).
    pub fn push_copy(&mut self, bytes: &[u8]) -> Result<NonNull<u8>> {
        let ptr = self.push_aligned(bytes.len(), 1)?;
        // SAFETY: fresh arena memory cannot overlap `bytes`.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len()) };
        Ok(ptr)
    }

    /// Moves `value` into the arena. It will never be dropped.
    ///
    /// # Errors
    ///
    /// See [`push_aligned`](Self::push_aligned).
    pub fn alloc<T>(&mut self, value: T) -> Result<NonNull<T>> {
        let ptr = self.push_array::<T>(1)?;
        // SAFETY: ptr is aligned and valid for one T.
        unsafe { ptr.as_ptr().write(value) };
        Ok(ptr)
    }

    /// Moves `pos` back to `target`, decommitting when far enough below the
    /// committed end.
    ///
    /// # Panics
    ///
    /// Panics if `target` is beyond the current position.
    pub fn pop_to(&mut self, target: usize) {
        assert!(
            target <= self.pos,
            "pop_to({target}) is past the current position {}",
            self.pos
        );
        self.pos = target;
        self.maybe_decommit();
    }

    /// Moves `pos` back by `amount` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `amount` is larger than the current position.
    pub fn pop(&mut self, amount: usize) {
        assert!(
            amount <= self.pos,
            "pop({amount}) would move below zero (pos is {})",
            self.pos
        );
        self.pop_to(self.pos - amount);
    }

    /// Releases every allocation.
    pub fn reset(&mut self) {
        self.pop_to(0);
    }

    fn maybe_decommit(&mut self) {
        if self.is_fixed() {
            return;
        }

        let floor = round_up(self.pos, self.config.get_commit_size())
            .max(self.initial_commit)
            .min(self.commit_pos);
        let excess = self.commit_pos - floor;
        if excess == 0 || excess < self.config.get_decommit_threshold() {
            return;
        }

        match self.region.decommit(floor, excess) {
            Ok(()) => self.commit_pos = floor,
            Err(e) => warn!("arena {:?}: decommit of {} bytes failed: {}", self.id, excess, e),
        }
    }

    /// Frees `ptr` if it is the most recent allocation of `size` bytes.
    ///
    /// Returns `false` and does nothing otherwise: only the topmost
    /// allocation can be reclaimed individually.
    pub fn free_last(&mut self, ptr: NonNull<u8>, size: usize) -> bool {
        match self.offset_of(ptr) {
            Some(offset) if self.is_last(ptr, size) => {
                self.pop_to(offset);
                true
            }
            _ => false,
        }
    }

    /// Resizes an allocation, in place when it is the most recent one.
    ///
    /// # Errors
    ///
    /// See [`push_aligned`](Self::push_aligned). On error the old allocation
    /// is untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads of `old_size` bytes.
    pub unsafe fn resize_last(
        &mut self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>> {
        // SAFETY: forwarded caller contract.
        unsafe { self.resize_last_aligned(ptr, old_size, new_size, self.config.get_alignment()) }
    }

    /// [`resize_last`](Self::resize_last) with an explicit alignment for the
    /// copy fallback.
    ///
    /// # Errors
    ///
    /// See [`push_aligned`](Self::push_aligned).
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads of `old_size` bytes.
    pub unsafe fn resize_last_aligned(
        &mut self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        align: usize,
    ) -> Result<NonNull<u8>> {
        if !align.is_power_of_two() {
            return Err(Error::InvalidAlignment { alignment: align });
        }

        if let Some(offset) = self.offset_of(ptr)
            && self.is_last(ptr, old_size)
            && (ptr.as_ptr() as usize) & (align - 1) == 0
        {
            let end = offset.checked_add(new_size).ok_or(Error::CapacityOverflow)?;
            if end > self.pos {
                self.advance_to(end, new_size - old_size)?;
            } else {
                self.pop_to(end);
            }
            return Ok(ptr);
        }

        let new_ptr = self.push_aligned(new_size, align)?;
        // SAFETY: ptr is readable for old_size bytes (caller contract) and the
        // new allocation lies past every existing one.
        unsafe {
            ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_size.min(new_size));
        }
        Ok(new_ptr)
    }

    /// Snapshots the current position.
    pub fn temp_begin(&self) -> TempMark {
        TempMark {
            arena: self.id,
            pos: self.pos,
        }
    }

    /// Rolls the arena back to `mark`.
    ///
    /// # Panics
    ///
    /// Panics if `mark` was taken on another arena, or if the arena has
    /// already been rolled back below it (marks released out of LIFO order).
    pub fn temp_end(&mut self, mark: TempMark) {
        assert_eq!(
            mark.arena, self.id,
            "temp mark of {:?} released on {:?}",
            mark.arena, self.id
        );
        assert!(
            mark.pos <= self.pos,
            "temp mark at {} released out of order (pos is {})",
            mark.pos,
            self.pos
        );
        self.pop_to(mark.pos);
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("id", &self.id)
            .field("pos", &self.pos)
            .field("commit_pos", &self.commit_pos)
            .field("size", &self.size)
            .field("fixed", &self.is_fixed())
            .finish()
    }
}
