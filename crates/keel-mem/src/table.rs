//! Open-addressing hash table on ping-pong arenas.
//!
//! [`Table`] stores fixed-size keys and values in three parallel arrays
//! (slot hash, key, value) with linear probing. Callers supply the hash of
//! every key; the table never hashes anything itself.
//!
//! # Slot states
//!
//! | stored hash | state          |
//! |-------------|----------------|
//! | `0`         | never occupied |
//! | `1`         | removed        |
//! | `>= 2`      | occupied       |
//!
//! Caller hashes of `0` or `1` are bumped to `2`. A removed slot (tombstone)
//! keeps its probe position until the next rehash, so `remove` only lowers
//! [`len`](Table::len) while [`slots_filled`](Table::slots_filled) keeps
//! counting the tombstone. Growth is triggered by `slots_filled`, so repeated
//! add/remove cycles eventually rehash and sweep the tombstones away.
//!
//! # Memory
//!
//! The table owns two arenas. A rehash resets the inactive one, builds the
//! new arrays there, moves the live entries across and swaps roles. Peak
//! memory is one old generation plus one new generation; no third buffer is
//! ever allocated.
//!
//! # Examples
//!
//! ```
//! use keel_mem::Table;
//!
//! let mut table: Table<u32, &'static str> = Table::new().unwrap();
//! let hash = |k: u32| u64::from(k).wrapping_mul(0x9E37_79B9_7F4A_7C15);
//!
//! table.set(hash(7), 7, "seven").unwrap();
//! table.set(hash(7), 7, "SEVEN").unwrap();
//! assert_eq!(table.get(hash(7), &7), Some(&"SEVEN"));
//! assert_eq!(table.len(), 1);
//!
//! assert_eq!(table.remove(hash(7), &7), Some("SEVEN"));
//! assert_eq!(table.get(hash(7), &7), None);
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};

use keel_log::trace;

use crate::arena::{Arena, ArenaStats};
use crate::config::ArenaConfig;
use crate::error::{Error, Result};

const EMPTY: u64 = 0;
const REMOVED: u64 = 1;
const FIRST_VALID_HASH: u64 = 2;

/// Smallest capacity a table is ever built with.
pub const MIN_CAPACITY: usize = 32;

/// Default reservation of each backing arena (256 MiB).
pub const DEFAULT_TABLE_RESERVE: usize = 256 * 1024 * 1024;

// Grow once (slots_filled + 1) / capacity reaches 7 / 10.
const LOAD_NUM: usize = 7;
const LOAD_DEN: usize = 10;

#[inline]
const fn normalize(hash: u64) -> u64 {
    if hash < FIRST_VALID_HASH {
        FIRST_VALID_HASH
    } else {
        hash
    }
}

/// A linear-probing hash table over caller-hashed `Copy` keys and values.
pub struct Table<K, V> {
    arenas: [Arena; 2],
    active: usize,
    hashes: NonNull<u64>,
    keys: NonNull<K>,
    values: NonNull<V>,
    capacity: usize,
    count: usize,
    slots_filled: usize,
    _marker: PhantomData<(K, V)>,
}

// SAFETY: the arrays live in arenas owned by the table.
unsafe impl<K: Send, V: Send> Send for Table<K, V> {}

impl<K: Copy + Eq, V: Copy> Table<K, V> {
    /// Creates a table with [`MIN_CAPACITY`] slots.
    ///
    /// # Errors
    ///
    /// Fails if the backing arenas cannot be created.
    pub fn new() -> Result<Self> {
        Self::with_capacity(MIN_CAPACITY)
    }

    /// Creates a table with room for `capacity` slots (rounded up to a power
    /// of two, at least [`MIN_CAPACITY`]).
    ///
    /// # Errors
    ///
    /// Fails if the backing arenas cannot be created.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        Self::with_config(
            capacity,
            ArenaConfig::new().reserve_size(DEFAULT_TABLE_RESERVE),
        )
    }

    /// Creates a table whose two backing arenas use `config`.
    ///
    /// # Errors
    ///
    /// Fails if the arenas cannot be created or the initial arrays do not fit.
    pub fn with_config(capacity: usize, config: ArenaConfig) -> Result<Self> {
        let mut table = Self {
            arenas: [config.create_arena()?, config.create_arena()?],
            active: 0,
            hashes: NonNull::dangling(),
            keys: NonNull::dangling(),
            values: NonNull::dangling(),
            capacity: 0,
            count: 0,
            slots_filled: 0,
            _marker: PhantomData,
        };
        table.rehash(capacity)?;
        Ok(table)
    }

    /// Number of live entries.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of slots (always a power of two).
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Live entries plus tombstones.
    #[must_use]
    pub const fn slots_filled(&self) -> usize {
        self.slots_filled
    }

    /// Statistics of both backing arenas, active one first.
    #[must_use]
    pub fn arena_stats(&self) -> [ArenaStats; 2] {
        [
            self.arenas[self.active].stats(),
            self.arenas[1 - self.active].stats(),
        ]
    }

    #[inline]
    fn hash_at(&self, index: usize) -> u64 {
        debug_assert!(index < self.capacity);
        // SAFETY: index < capacity and every hash slot is initialized.
        unsafe { *self.hashes.as_ptr().add(index) }
    }

    #[inline]
    fn key_ref(&self, index: usize) -> &K {
        debug_assert!(self.hash_at(index) >= FIRST_VALID_HASH);
        // SAFETY: occupied slots have an initialized key.
        unsafe { &*self.keys.as_ptr().add(index) }
    }

    #[inline]
    fn value_ref(&self, index: usize) -> &V {
        debug_assert!(self.hash_at(index) >= FIRST_VALID_HASH);
        // SAFETY: occupied slots have an initialized value.
        unsafe { &*self.values.as_ptr().add(index) }
    }

    #[inline]
    fn is_occupied(&self, index: usize) -> bool {
        index < self.capacity && self.hash_at(index) >= FIRST_VALID_HASH
    }

    /// Finds the slot holding `key`.
    ///
    /// Probing stops at the first never-occupied slot; tombstones are
    /// skipped since entries may sit past them.
    #[must_use]
    pub fn find(&self, hash: u64, key: &K) -> Option<usize> {
        let hash = normalize(hash);
        let mask = self.capacity - 1;
        let mut index = (hash as usize) & mask;

        loop {
            match self.hash_at(index) {
                EMPTY => return None,
                stored if stored == hash && self.key_ref(index) == key => return Some(index),
                _ => index = (index + 1) & mask,
            }
        }
    }

    #[must_use]
    pub fn contains(&self, hash: u64, key: &K) -> bool {
        self.find(hash, key).is_some()
    }

    #[must_use]
    pub fn get(&self, hash: u64, key: &K) -> Option<&V> {
        self.find(hash, key).map(|index| self.value_ref(index))
    }

    pub fn get_mut(&mut self, hash: u64, key: &K) -> Option<&mut V> {
        let index = self.find(hash, key)?;
        // SAFETY: index is an occupied slot.
        Some(unsafe { &mut *self.values.as_ptr().add(index) })
    }

    /// Key stored in slot `index`, if that slot is occupied.
    #[must_use]
    pub fn key_at(&self, index: usize) -> Option<&K> {
        self.is_occupied(index).then(|| self.key_ref(index))
    }

    /// Value stored in slot `index`, if that slot is occupied.
    #[must_use]
    pub fn value_at(&self, index: usize) -> Option<&V> {
        self.is_occupied(index).then(|| self.value_ref(index))
    }

    /// Writes an entry at the first never-occupied slot of its probe chain.
    ///
    /// The caller guarantees at least one never-occupied slot exists.
    fn insert_unchecked(&mut self, hash: u64, key: K, value: V) -> usize {
        let mask = self.capacity - 1;
        let mut index = (hash as usize) & mask;
        while self.hash_at(index) != EMPTY {
            index = (index + 1) & mask;
        }

        // SAFETY: index < capacity; the arrays are valid for writes.
        unsafe {
            self.hashes.as_ptr().add(index).write(hash);
            self.keys.as_ptr().add(index).write(key);
            self.values.as_ptr().add(index).write(value);
        }
        self.count += 1;
        self.slots_filled += 1;
        index
    }

    /// Inserts an entry without looking for an existing one.
    ///
    /// Doubles the capacity first once the table would reach 70% of its
    /// slots (tombstones included). Adding a key that is already present
    /// creates a second entry that [`find`](Self::find) never reaches; use
    /// [`set`](Self::set) to overwrite instead.
    ///
    /// # Errors
    ///
    /// Fails only if a required rehash cannot allocate.
    pub fn add(&mut self, hash: u64, key: K, value: V) -> Result<usize> {
        if (self.slots_filled + 1) * LOAD_DEN >= self.capacity.saturating_mul(LOAD_NUM) {
            let next = self.capacity.checked_mul(2).ok_or(Error::CapacityOverflow)?;
            self.rehash(next)?;
        }
        Ok(self.insert_unchecked(normalize(hash), key, value))
    }

    /// Overwrites the value of `key`, or adds it.
    ///
    /// # Errors
    ///
    /// See [`add`](Self::add).
    pub fn set(&mut self, hash: u64, key: K, value: V) -> Result<usize> {
        match self.find(hash, &key) {
            Some(index) => {
                // SAFETY: index is an occupied slot.
                unsafe { self.values.as_ptr().add(index).write(value) };
                Ok(index)
            }
            None => self.add(hash, key, value),
        }
    }

    /// Removes `key`, leaving a tombstone. Returns the removed value.
    pub fn remove(&mut self, hash: u64, key: &K) -> Option<V> {
        let index = self.find(hash, key)?;
        let value = *self.value_ref(index);
        // SAFETY: index < capacity.
        unsafe { self.hashes.as_ptr().add(index).write(REMOVED) };
        self.count -= 1;
        Some(value)
    }

    /// Removes every entry and tombstone, keeping the capacity.
    pub fn clear(&mut self) {
        // SAFETY: the hash array holds `capacity` slots.
        unsafe { ptr::write_bytes(self.hashes.as_ptr(), 0, self.capacity) };
        self.count = 0;
        self.slots_filled = 0;
    }

    /// Rebuilds the table with at least `next_capacity` slots.
    ///
    /// The capacity is rounded up to a power of two, at least
    /// [`MIN_CAPACITY`] and large enough to keep the live entries under the
    /// load limit. Tombstones are dropped. On error the table is unchanged.
    ///
    /// # Errors
    ///
    /// Fails if the inactive arena cannot hold the new arrays.
    pub fn rehash(&mut self, next_capacity: usize) -> Result<()> {
        let live_floor = self.count * LOAD_DEN / LOAD_NUM + 1;
        let capacity = next_capacity
            .max(MIN_CAPACITY)
            .max(live_floor)
            .checked_next_power_of_two()
            .ok_or(Error::CapacityOverflow)?;

        let next = 1 - self.active;
        let arena = &mut self.arenas[next];
        arena.reset();
        let hashes = arena.push_array::<u64>(capacity)?;
        let keys = arena.push_array::<K>(capacity)?;
        let values = arena.push_array::<V>(capacity)?;
        // SAFETY: hashes is valid for `capacity` u64 writes.
        unsafe { ptr::write_bytes(hashes.as_ptr(), 0, capacity) };

        let old_hashes = std::mem::replace(&mut self.hashes, hashes);
        let old_keys = std::mem::replace(&mut self.keys, keys);
        let old_values = std::mem::replace(&mut self.values, values);
        let old_capacity = std::mem::replace(&mut self.capacity, capacity);
        let live = self.count;
        self.count = 0;
        self.slots_filled = 0;

        for index in 0..old_capacity {
            // SAFETY: the old arrays stay intact in the active arena until the
            // next rehash resets it; occupied slots are initialized.
            unsafe {
                let hash = *old_hashes.as_ptr().add(index);
                if hash >= FIRST_VALID_HASH {
                    let key = old_keys.as_ptr().add(index).read();
                    let value = old_values.as_ptr().add(index).read();
                    self.insert_unchecked(hash, key, value);
                }
            }
        }
        debug_assert_eq!(self.count, live);

        self.active = next;
        trace!(
            "table rehashed {} -> {} slots ({} live)",
            old_capacity, capacity, self.count
        );
        Ok(())
    }

    /// Iterates over live entries in slot order.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            table: self,
            index: 0,
        }
    }
}

impl<K, V> fmt::Debug for Table<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("count", &self.count)
            .field("slots_filled", &self.slots_filled)
            .field("capacity", &self.capacity)
            .field("active", &self.active)
            .finish()
    }
}

/// Iterator over the live entries of a [`Table`].
pub struct Iter<'a, K, V> {
    table: &'a Table<K, V>,
    index: usize,
}

impl<'a, K: Copy + Eq, V: Copy> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.table.capacity {
            let index = self.index;
            self.index += 1;
            if self.table.is_occupied(index) {
                return Some((self.table.key_ref(index), self.table.value_ref(index)));
            }
        }
        None
    }
}

impl<'a, K: Copy + Eq, V: Copy> IntoIterator for &'a Table<K, V> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> ArenaConfig {
        ArenaConfig::new().reserve_size(16 * 1024 * 1024)
    }

    fn table<K: Copy + Eq, V: Copy>() -> Table<K, V> {
        Table::with_config(MIN_CAPACITY, small_config()).unwrap()
    }

    fn h(key: u64) -> u64 {
        key.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ (key >> 7)
    }

    #[test]
    fn test_add_find_set_remove() {
        let mut t = table::<u64, u64>();
        t.add(h(1), 1, 10).unwrap();
        t.add(h(2), 2, 20).unwrap();

        assert_eq!(t.get(h(1), &1), Some(&10));
        assert_eq!(t.get(h(2), &2), Some(&20));
        assert_eq!(t.get(h(3), &3), None);

        t.set(h(1), 1, 11).unwrap();
        assert_eq!(t.get(h(1), &1), Some(&11));
        assert_eq!(t.len(), 2);

        assert_eq!(t.remove(h(1), &1), Some(11));
        assert_eq!(t.remove(h(1), &1), None);
        assert!(!t.contains(h(1), &1));
        assert_eq!(t.len(), 1);
        assert_eq!(t.slots_filled(), 2);
    }

    #[test]
    fn test_capacity_is_power_of_two() {
        let t: Table<u32, u32> = Table::with_config(100, small_config()).unwrap();
        assert_eq!(t.capacity(), 128);
        let t: Table<u32, u32> = Table::with_config(1, small_config()).unwrap();
        assert_eq!(t.capacity(), MIN_CAPACITY);
    }

    #[test]
    fn test_sentinel_hashes_are_bumped() {
        let mut t = table::<u32, u32>();
        t.add(0, 100, 1).unwrap();
        t.add(1, 200, 2).unwrap();
        t.add(2, 300, 3).unwrap();

        assert_eq!(t.get(0, &100), Some(&1));
        assert_eq!(t.get(1, &200), Some(&2));
        // All three share the normalized hash, so any sentinel finds them.
        assert_eq!(t.get(2, &100), Some(&1));
        assert_eq!(t.get(1, &300), Some(&3));
    }

    #[test]
    fn test_probe_skips_tombstones() {
        let mut t = table::<u32, u32>();
        for k in 0..8 {
            t.add(42, k, k * 10).unwrap();
        }
        for k in [1, 3, 5] {
            assert_eq!(t.remove(42, &k), Some(k * 10));
        }

        for k in [0, 2, 4, 6, 7] {
            assert_eq!(t.get(42, &k), Some(&(k * 10)));
        }
        for k in [1, 3, 5] {
            assert_eq!(t.get(42, &k), None);
        }
    }

    #[test]
    fn test_probe_wraps_around() {
        let mut t = table::<u32, u32>();
        let last = (MIN_CAPACITY - 1) as u64;
        for k in 0..4 {
            let index = t.add(last, k, k).unwrap();
            assert_eq!(index, (MIN_CAPACITY - 1 + k as usize) % MIN_CAPACITY);
        }
        assert_eq!(t.find(last, &3), Some(2));
    }

    #[test]
    fn test_duplicate_add_shadows() {
        let mut t = table::<u32, u32>();
        let first = t.add(h(9), 9, 1).unwrap();
        let second = t.add(h(9), 9, 2).unwrap();
        assert_ne!(first, second);
        assert_eq!(t.len(), 2);
        assert_eq!(t.find(h(9), &9), Some(first));
        assert_eq!(t.value_at(second), Some(&2));

        // Removing the reachable copy exposes the shadowed one.
        t.remove(h(9), &9);
        assert_eq!(t.get(h(9), &9), Some(&2));
    }

    #[test]
    fn test_growth_threshold() {
        let mut t = table::<u64, u64>();
        for k in 0..22 {
            t.add(h(k), k, k).unwrap();
        }
        assert_eq!(t.capacity(), 32);

        t.add(h(22), 22, 22).unwrap();
        assert_eq!(t.capacity(), 64);
        assert_eq!(t.len(), 23);
        for k in 0..23 {
            assert_eq!(t.get(h(k), &k), Some(&k));
        }
    }

    #[test]
    fn test_tombstones_force_rehash() {
        let mut t = table::<u64, u64>();
        for k in 0..22 {
            t.add(h(k), k, k).unwrap();
            t.remove(h(k), &k);
        }
        assert_eq!(t.len(), 0);
        assert_eq!(t.slots_filled(), 22);
        assert_eq!(t.capacity(), 32);

        t.add(h(100), 100, 1).unwrap();
        assert_eq!(t.capacity(), 64);
        assert_eq!(t.slots_filled(), 1);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_explicit_rehash_keeps_entries() {
        let mut t = table::<u64, u64>();
        for k in 0..20 {
            t.add(h(k), k, k * 2).unwrap();
        }
        t.rehash(1024).unwrap();
        assert_eq!(t.capacity(), 1024);

        // Shrinking is clamped to what the live entries need.
        t.rehash(0).unwrap();
        assert_eq!(t.capacity(), 32);
        for k in 0..20 {
            assert_eq!(t.get(h(k), &k), Some(&(k * 2)));
        }
    }

    #[test]
    fn test_rehash_ping_pongs_arenas() {
        let mut t = table::<u64, u64>();
        let before = t.arena_stats();
        t.rehash(64).unwrap();
        let after = t.arena_stats();

        // The previously active arena is now the inactive one, untouched.
        assert_eq!(after[1], before[0]);
        let bytes_64 = 64 * (8 + 8 + 8);
        assert_eq!(after[0].allocated, bytes_64);
    }

    #[test]
    fn test_memory_stays_two_generations() {
        let mut t = table::<u64, u64>();
        for k in 0..5000 {
            t.add(h(k), k, k).unwrap();
        }
        let [active, inactive] = t.arena_stats();
        let slot = 8 + 8 + 8;
        assert_eq!(active.allocated, t.capacity() * slot);
        assert_eq!(inactive.allocated, t.capacity() / 2 * slot);
    }

    #[test]
    fn test_get_mut_and_iter() {
        let mut t = table::<u32, u32>();
        for k in 0..10 {
            t.add(h(u64::from(k)), k, 0).unwrap();
        }
        *t.get_mut(h(3), &3).unwrap() = 33;
        t.remove(h(4), &4);

        let mut seen: Vec<(u32, u32)> = t.iter().map(|(k, v)| (*k, *v)).collect();
        seen.sort_unstable();
        assert_eq!(seen.len(), 9);
        assert!(seen.contains(&(3, 33)));
        assert!(!seen.iter().any(|&(k, _)| k == 4));
    }

    #[test]
    fn test_slot_accessors() {
        let mut t = table::<u32, u32>();
        let index = t.add(h(5), 5, 50).unwrap();
        assert_eq!(t.key_at(index), Some(&5));
        assert_eq!(t.value_at(index), Some(&50));
        assert_eq!(t.key_at(t.capacity()), None);

        t.remove(h(5), &5);
        assert_eq!(t.key_at(index), None);
    }

    #[test]
    fn test_clear() {
        let mut t = table::<u32, u32>();
        for k in 0..10 {
            t.add(h(u64::from(k)), k, k).unwrap();
        }
        t.remove(h(1), &1);
        t.clear();
        assert!(t.is_empty());
        assert_eq!(t.slots_filled(), 0);
        assert_eq!(t.capacity(), 32);
        assert_eq!(t.get(h(2), &2), None);
    }

    #[test]
    fn test_rehash_failure_leaves_table() {
        let config = ArenaConfig::new().reserve_size(8 * 1024);
        let mut t: Table<u64, u64> = Table::with_config(MIN_CAPACITY, config).unwrap();
        t.add(h(1), 1, 1).unwrap();

        let err = t.rehash(4096).unwrap_err();
        assert!(matches!(err, Error::OutOfReservation { .. }));
        assert_eq!(t.capacity(), 32);
        assert_eq!(t.get(h(1), &1), Some(&1));
    }

    #[test]
    fn test_struct_keys() {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        struct Point {
            x: i32,
            y: i32,
        }

        let hash = |p: Point| h(((p.x as u64) << 32) | (p.y as u32 as u64));
        let mut t = table::<Point, [u8; 3]>();
        let p = Point { x: -1, y: 7 };
        t.set(hash(p), p, *b"abc").unwrap();
        assert_eq!(t.get(hash(p), &p), Some(b"abc"));
    }
}
