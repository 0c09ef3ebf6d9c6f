//! `keel` memory management.
//!
//! The memory core every other part of keel allocates through:
//!
//! - **Byte regions** ([`region`]): reserved address ranges with piecewise
//!   commit and decommit
//! - **Arenas** ([`arena`]): bump allocation over a region with lazy commit,
//!   hysteretic decommit, temp marks and last-allocation resize
//! - **Allocators** ([`allocator`]): one interface over the heap and arenas
//! - **Scratch arenas** ([`scratch`]): two thread-local arenas for temporary
//!   work
//! - **Tables** ([`table`]): open-addressing hash tables that rehash by
//!   ping-ponging between two arenas
//!
//! # Examples
//!
//! ```
//! use keel_mem::{Arena, Table};
//!
//! let mut arena = Arena::new(1 << 20).unwrap();
//! let bytes = arena.push_zero(64).unwrap();
//! assert_eq!(unsafe { *bytes.as_ptr() }, 0);
//!
//! let mut table: Table<u64, u64> = Table::new().unwrap();
//! table.set(0xfeed, 1, 2).unwrap();
//! assert_eq!(table.get(0xfeed, &1), Some(&2));
//! ```

pub mod allocator;
pub mod arena;
pub mod config;
pub mod error;
pub mod region;
pub mod scratch;
pub mod table;

pub use allocator::{Allocator, HeapAllocator};
pub use arena::{Arena, ArenaId, ArenaStats, TempMark};
pub use config::ArenaConfig;
pub use error::{Error, Result};
pub use region::{ByteRegion, HeapRegion, VirtualRegion};
pub use scratch::{Scratch, get_scratch, with_scratch};
pub use table::Table;
