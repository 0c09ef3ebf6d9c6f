//! Error types for `keel` memory management.
//!
//! Every fallible operation in this crate reports resource exhaustion or
//! invalid input through [`Error`]. Caller-contract violations (popping past
//! zero, releasing temp marks out of order) are bugs and panic instead.

use std::fmt;

/// Errors that can occur while reserving, committing or allocating memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The OS refused to reserve address space.
    ReserveFailed {
        /// The requested reservation size.
        size: usize,
    },

    /// Committing pages inside a reservation failed.
    CommitFailed {
        /// Offset of the range from the region base.
        offset: usize,
        /// Length of the range.
        len: usize,
    },

    /// The reservation has no room left for the request.
    OutOfReservation {
        /// The requested allocation size.
        requested: usize,
        /// The bytes still available past the current position.
        available: usize,
    },

    /// Alignment is zero or not a power of two.
    InvalidAlignment {
        /// The requested alignment.
        alignment: usize,
    },

    /// An `ArenaConfig` field is out of range.
    InvalidConfig {
        /// What is wrong with the configuration.
        reason: &'static str,
    },

    /// The global heap returned null.
    HeapAllocationFailed {
        /// The requested size.
        size: usize,
    },

    /// A size computation overflowed `usize`.
    CapacityOverflow,

    /// Every scratch arena of this thread is in the exclusion list.
    ScratchExhausted,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ReserveFailed { size } => {
                write!(f, "Failed to reserve {size} bytes of address space")
            }
            Error::CommitFailed { offset, len } => {
                write!(f, "Failed to commit {len} bytes at offset {offset:#x}")
            }
            Error::OutOfReservation { requested, available } => write!(
                f,
                "Reservation exhausted: requested {requested} bytes, available {available} bytes"
            ),
            Error::InvalidAlignment { alignment } => {
                write!(f, "Invalid alignment: {alignment} is not a power of two")
            }
            Error::InvalidConfig { reason } => write!(f, "Invalid arena configuration: {reason}"),
            Error::HeapAllocationFailed { size } => {
                write!(f, "Heap allocation of {size} bytes failed")
            }
            Error::CapacityOverflow => write!(f, "Capacity overflow"),
            Error::ScratchExhausted => {
                write!(f, "All scratch arenas of this thread are excluded")
            }
        }
    }
}

impl std::error::Error for Error {}

/// Result type for `keel` memory operations.
pub type Result<T> = std::result::Result<T, Error>;
