// Shared helpers for keel-mem integration tests.

#![allow(dead_code)]

use keel_mem::ArenaConfig;
use std::hash::Hash;

pub const KIB: usize = 1024;
pub const MIB: usize = 1024 * KIB;

/// Hash used for table keys in tests.
pub fn hash_of<T: Hash + ?Sized>(value: &T) -> u64 {
    fxhash::hash64(value)
}

/// Arena config small enough to create many of in parallel tests.
pub fn test_config() -> ArenaConfig {
    ArenaConfig::new().reserve_size(16 * MIB)
}

/// Deterministic pseudo-random sizes in `1..=max`.
pub fn sizes(seed: u64, count: usize, max: usize) -> Vec<usize> {
    let mut state = seed;
    (0..count)
        .map(|_| {
            state = state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            (state >> 33) as usize % max + 1
        })
        .collect()
}

pub fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
