/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Keystone arithmetic.
//!
//! A keystone is a block whose height is a multiple of the keystone interval. Fork resolution only
//! looks at keystones: endorsements of a keystone, or of one of the blocks that chain up to it, are
//! what a chain is scored by.
//!
//! All functions here are pure functions of a height and the keystone interval, which must be
//! positive.

pub fn is_keystone(height: u64, keystone_interval: u64) -> bool {
    height % keystone_interval == 0
}

/// The highest keystone at or below `height`.
pub fn highest_keystone_at_or_before(height: u64, keystone_interval: u64) -> u64 {
    height - height % keystone_interval
}

/// The lowest keystone strictly above `height`.
pub fn first_keystone_after(height: u64, keystone_interval: u64) -> u64 {
    (height / keystone_interval + 1) * keystone_interval
}

/// The highest block whose endorsements still count for `keystone`.
///
/// # Panics
///
/// If `keystone` is not a keystone.
pub fn highest_block_connecting_keystone_to_next(keystone: u64, keystone_interval: u64) -> u64 {
    assert!(
        is_keystone(keystone, keystone_interval),
        "{} is not a keystone for interval {}",
        keystone,
        keystone_interval
    );
    keystone + keystone_interval + 1
}

/// Whether a chain going from `bottom` to `tip` passes into a new keystone interval.
pub fn crossed_keystone_boundary(bottom: u64, tip: u64, keystone_interval: u64) -> bool {
    bottom / keystone_interval < tip / keystone_interval
}
