//! Thread-local scratch arenas.
//!
//! Every thread owns a pool of two arenas for temporary work, so functions
//! can borrow throwaway memory without threading an arena through every
//! signature. Borrowing takes a [`TempMark`]; returning the [`Scratch`] guard
//! rolls the arena back, discarding everything pushed in between.
//!
//! A caller that already holds a scratch arena passes its id as an exclusion
//! when calling into code that may borrow one too. The callee then gets the
//! *other* arena, so nothing the callee pushes and releases can sit on top of
//! the caller's live data. With two slots, no call chain may need more than
//! two mutually exclusive scratch regions at once.
//!
//! # Examples
//!
//! ```
//! use keel_mem::scratch::get_scratch;
//!
//! let outer = get_scratch(&[]).unwrap();
//! let inner = get_scratch(&[outer.id()]).unwrap();
//! assert_ne!(outer.id(), inner.id());
//!
//! inner.arena().push(128).unwrap();
//! inner.release();
//! outer.release();
//! ```
//!
//! # Thread Safety
//!
//! The pool is thread-local and [`Scratch`] is `!Send`; the arenas are
//! released when the thread exits.

use std::cell::{RefCell, RefMut};
use std::rc::Rc;

use keel_log::debug;

use crate::arena::{Arena, ArenaId, TempMark};
use crate::config::ArenaConfig;
use crate::error::{Error, Result};

/// Number of scratch arenas per thread.
pub const SCRATCH_COUNT: usize = 2;

/// Default reservation of each scratch arena (256 MiB).
pub const DEFAULT_SCRATCH_RESERVE: usize = 256 * 1024 * 1024;

type Slot = Option<(ArenaId, Rc<RefCell<Arena>>)>;

struct ScratchPool {
    config: ArenaConfig,
    slots: [Slot; SCRATCH_COUNT],
}

impl ScratchPool {
    const fn new() -> Self {
        Self {
            config: ArenaConfig::new().reserve_size(DEFAULT_SCRATCH_RESERVE),
            slots: [None, None],
        }
    }

    fn acquire(&mut self, exclusions: &[ArenaId]) -> Result<Rc<RefCell<Arena>>> {
        for slot in &mut self.slots {
            match slot {
                Some((id, arena)) => {
                    if !exclusions.contains(id) {
                        return Ok(Rc::clone(arena));
                    }
                }
                None => {
                    let arena = self.config.create_arena()?;
                    debug!("scratch arena {:?} created", arena.id());
                    let arena = (arena.id(), Rc::new(RefCell::new(arena)));
                    return Ok(Rc::clone(&slot.insert(arena).1));
                }
            }
        }
        Err(Error::ScratchExhausted)
    }
}

thread_local! {
    static POOL: RefCell<ScratchPool> = const { RefCell::new(ScratchPool::new()) };
}

/// A borrowed scratch arena.
///
/// Everything pushed through [`arena`](Scratch::arena) is discarded when the
/// guard is released or dropped. Guards on the same arena must be released
/// in reverse order of acquisition.
pub struct Scratch {
    arena: Rc<RefCell<Arena>>,
    id: ArenaId,
    mark: TempMark,
}

impl Scratch {
    /// Id of the underlying pool arena, for exclusion lists.
    #[must_use]
    pub const fn id(&self) -> ArenaId {
        self.id
    }

    /// The position this guard rolls back to.
    #[must_use]
    pub const fn mark(&self) -> TempMark {
        self.mark
    }

    /// Borrows the arena.
    ///
    /// # Panics
    ///
    /// Panics if the arena is already borrowed, which happens when two live
    /// guards share an arena because an exclusion was missed.
    pub fn arena(&self) -> RefMut<'_, Arena> {
        self.arena.borrow_mut()
    }

    /// Returns the arena to the pool, rolling it back to the mark.
    pub fn release(self) {}
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if std::thread::panicking() {
            if let Ok(mut arena) = self.arena.try_borrow_mut()
                && self.mark.pos() <= arena.pos()
            {
                arena.temp_end(self.mark);
            }
            return;
        }
        self.arena.borrow_mut().temp_end(self.mark);
    }
}

/// Borrows the first scratch arena of this thread not listed in `exclusions`.
///
/// # Errors
///
/// - [`Error::ScratchExhausted`] if every pool arena is excluded
/// - the creation error if a pool arena has to be created and cannot be
///
/// # Panics
///
/// Panics if the chosen arena is currently borrowed through
/// [`Scratch::arena`].
pub fn get_scratch(exclusions: &[ArenaId]) -> Result<Scratch> {
    let arena = POOL.with(|pool| pool.borrow_mut().acquire(exclusions))?;
    let (id, mark) = {
        let arena = arena.borrow();
        (arena.id(), arena.temp_begin())
    };
    Ok(Scratch { arena, id, mark })
}

/// Runs `f` on a scratch arena and releases it afterwards.
///
/// # Errors
///
/// See [`get_scratch`].
pub fn with_scratch<R>(exclusions: &[ArenaId], f: impl FnOnce(&mut Arena) -> R) -> Result<R> {
    let scratch = get_scratch(exclusions)?;
    let result = f(&mut scratch.arena());
    Ok(result)
}

/// Sets the configuration used for scratch arenas this thread has not
/// created yet.
///
/// # Errors
///
/// Returns the validation error of `config`.
pub fn set_scratch_config(config: ArenaConfig) -> Result<()> {
    config.validate()?;
    POOL.with(|pool| pool.borrow_mut().config = config);
    Ok(())
}

/// Ids of the scratch arenas this thread has created so far.
#[must_use]
pub fn scratch_arena_ids() -> Vec<ArenaId> {
    POOL.with(|pool| {
        pool.borrow()
            .slots
            .iter()
            .filter_map(|slot| slot.as_ref().map(|(id, _)| *id))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_exclusion_yields_other_arena() {
        let first = get_scratch(&[]).unwrap();
        let second = get_scratch(&[first.id()]).unwrap();
        assert_ne!(first.id(), second.id());

        let ids = scratch_arena_ids();
        assert_eq!(ids.len(), SCRATCH_COUNT);
        assert!(ids.contains(&first.id()));
        assert!(ids.contains(&second.id()));
    }

    #[test]
    fn test_both_excluded_is_exhausted() {
        let a = get_scratch(&[]).unwrap();
        let b = get_scratch(&[a.id()]).unwrap();
        assert_eq!(
            get_scratch(&[a.id(), b.id()]).err(),
            Some(Error::ScratchExhausted)
        );
    }

    #[test]
    fn test_release_rolls_back() {
        let scratch = get_scratch(&[]).unwrap();
        let start = scratch.arena().pos();
        let id = scratch.id();

        scratch.arena().push(4096).unwrap();
        scratch.release();

        let again = get_scratch(&[]).unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(again.arena().pos(), start);
    }

    #[test]
    fn test_nested_same_arena_is_lifo() {
        let outer = get_scratch(&[]).unwrap();
        outer.arena().push(64).unwrap();
        let after_outer = outer.arena().pos();

        // No exclusion: the callee stacks on the same arena.
        let inner = get_scratch(&[]).unwrap();
        assert_eq!(inner.id(), outer.id());
        inner.arena().push(64).unwrap();
        drop(inner);

        assert_eq!(outer.arena().pos(), after_outer);
    }

    #[test]
    fn test_callee_excluding_caller() {
        fn callee(exclude: ArenaId) -> ArenaId {
            with_scratch(&[exclude], |arena| {
                arena.push(1024).unwrap();
                arena.id()
            })
            .unwrap()
        }

        let caller = get_scratch(&[]).unwrap();
        let mut caller_arena = caller.arena();
        let data = caller_arena.push_copy(b"live").unwrap();

        let used = callee(caller.id());
        assert_ne!(used, caller.id());

        let bytes = unsafe { std::slice::from_raw_parts(data.as_ptr(), 4) };
        assert_eq!(bytes, b"live");
        drop(caller_arena);
    }

    #[test]
    fn test_pools_are_per_thread() {
        let here = get_scratch(&[]).unwrap().id();
        let there = thread::spawn(|| get_scratch(&[]).unwrap().id())
            .join()
            .unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn test_config_applies_to_new_arenas() {
        thread::spawn(|| {
            let config = ArenaConfig::new().reserve_size(1 << 20).commit_size(8192);
            set_scratch_config(config).unwrap();

            let scratch = get_scratch(&[]).unwrap();
            let arena = scratch.arena();
            assert_eq!(arena.reserved(), 1 << 20);
            assert_eq!(arena.commit_pos(), 8192);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(set_scratch_config(ArenaConfig::new().alignment(5)).is_err());
    }
}
