//! Arena configuration.
//!
//! [`ArenaConfig`] is a small `Copy` value describing how an arena reserves
//! and commits memory. It doubles as a factory: [`ArenaConfig::create_arena`]
//! builds a fresh arena from it, so tables and the scratch pool can be handed
//! one config and create their arenas on demand.
//!
//! # Examples
//!
//! ```
//! use keel_mem::ArenaConfig;
//!
//! let config = ArenaConfig::new()
//!     .reserve_size(16 * 1024 * 1024)
//!     .commit_size(64 * 1024);
//!
//! let mut arena = config.create_arena().unwrap();
//! arena.push(128).unwrap();
//! assert_eq!(arena.commit_pos(), 64 * 1024);
//! ```

use crate::arena::Arena;
use crate::error::{Error, Result};

/// Default address space reserved per arena (1 GiB).
///
/// Only touched pages cost physical memory, so reservations are generous.
pub const DEFAULT_RESERVE_SIZE: usize = 1024 * 1024 * 1024;

/// Default commit chunk (4 KiB): the initial commit and the commit granularity.
pub const DEFAULT_COMMIT_SIZE: usize = 4 * 1024;

/// Default distance between `pos` and `commit_pos` that triggers a decommit.
pub const DEFAULT_DECOMMIT_THRESHOLD: usize = 64 * 1024;

/// Default alignment for untyped pushes.
pub const DEFAULT_ALIGNMENT: usize = 8;

/// How an arena reserves, commits and aligns memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaConfig {
    reserve_size: usize,
    commit_size: usize,
    decommit_threshold: usize,
    alignment: usize,
}

impl ArenaConfig {
    /// Creates a configuration with the default sizes.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            reserve_size: DEFAULT_RESERVE_SIZE,
            commit_size: DEFAULT_COMMIT_SIZE,
            decommit_threshold: DEFAULT_DECOMMIT_THRESHOLD,
            alignment: DEFAULT_ALIGNMENT,
        }
    }

    /// Sets the size of the address space reservation.
    #[must_use]
    pub const fn reserve_size(mut self, size: usize) -> Self {
        self.reserve_size = size;
        self
    }

    /// Sets the commit chunk size.
    #[must_use]
    pub const fn commit_size(mut self, size: usize) -> Self {
        self.commit_size = size;
        self
    }

    /// Sets the decommit hysteresis threshold.
    #[must_use]
    pub const fn decommit_threshold(mut self, size: usize) -> Self {
        self.decommit_threshold = size;
        self
    }

    /// Sets the default alignment of untyped pushes.
    #[must_use]
    pub const fn alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Size of the address space reservation.
    #[must_use]
    pub const fn get_reserve_size(&self) -> usize {
        self.reserve_size
    }

    /// Commit chunk size.
    #[must_use]
    pub const fn get_commit_size(&self) -> usize {
        self.commit_size
    }

    /// Decommit hysteresis threshold.
    #[must_use]
    pub const fn get_decommit_threshold(&self) -> usize {
        self.decommit_threshold
    }

    /// Default alignment of untyped pushes.
    #[must_use]
    pub const fn get_alignment(&self) -> usize {
        self.alignment
    }

    /// Checks that the configuration describes a usable arena.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidAlignment`] if `alignment` is not a power of two
    /// - [`Error::InvalidConfig`] if a size is zero or the commit chunk is
    ///   larger than the reservation
    pub fn validate(&self) -> Result<()> {
        if !self.alignment.is_power_of_two() {
            return Err(Error::InvalidAlignment {
                alignment: self.alignment,
            });
        }
        if self.reserve_size == 0 {
            return Err(Error::InvalidConfig {
                reason: "reserve size must be non-zero",
            });
        }
        if self.commit_size == 0 {
            return Err(Error::InvalidConfig {
                reason: "commit size must be non-zero",
            });
        }
        if self.commit_size > self.reserve_size {
            return Err(Error::InvalidConfig {
                reason: "commit size exceeds reserve size",
            });
        }
        Ok(())
    }

    /// Creates a new virtual-memory arena with this configuration.
    ///
    /// # Errors
    ///
    /// Returns the validation error, or the reserve/commit failure.
    pub fn create_arena(&self) -> Result<Arena> {
        Arena::with_config(*self)
    }
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ArenaConfig::default();
        assert_eq!(config.get_reserve_size(), DEFAULT_RESERVE_SIZE);
        assert_eq!(config.get_commit_size(), 4096);
        assert_eq!(config.get_decommit_threshold(), 64 * 1024);
        assert_eq!(config.get_alignment(), 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert_eq!(
            ArenaConfig::new().alignment(12).validate(),
            Err(Error::InvalidAlignment { alignment: 12 })
        );
        assert!(matches!(
            ArenaConfig::new().reserve_size(0).validate(),
            Err(Error::InvalidConfig { .. })
        ));
        assert!(matches!(
            ArenaConfig::new().commit_size(0).validate(),
            Err(Error::InvalidConfig { .. })
        ));
        assert!(matches!(
            ArenaConfig::new().reserve_size(4096).commit_size(8192).validate(),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_create_arena_uses_config() {
        let config = ArenaConfig::new().reserve_size(1 << 20).commit_size(16 * 1024);
        let arena = config.create_arena().unwrap();
        assert_eq!(arena.reserved(), 1 << 20);
        assert_eq!(arena.commit_pos(), 16 * 1024);
        assert_eq!(arena.pos(), 0);
    }

    #[test]
    fn test_create_arena_rejects_invalid_config() {
        let config = ArenaConfig::new().alignment(0);
        assert!(config.create_arena().is_err());
    }
}
