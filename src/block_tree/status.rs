/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Validity and lifecycle status of a [block node](super::node::BlockNode).
//!
//! A status is a bitmask with three parts:
//! 1. A [`ValidityLevel`], an ordered ladder that only ever goes up while the node is valid.
//! 2. Failure flags ([`BlockStatus::FAILED_BLOCK`], [`BlockStatus::FAILED_POP`],
//!    [`BlockStatus::FAILED_CHILD`]). A node with any of them set is invalid whatever its level.
//! 3. Markers ([`BlockStatus::HAS_PAYLOADS`], [`BlockStatus::APPLIED`], [`BlockStatus::BOOTSTRAP`]).

use borsh::{BorshDeserialize, BorshSerialize};

/// How far a block has made it through validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValidityLevel {
    Unknown = 0,
    /// The header is valid and its parent is known.
    Tree = 1,
    /// Payloads are attached and connected on top of a connected parent.
    Connected = 2,
    /// The block has been applied, but only together with blocks of another chain.
    CanBeAppliedMaybeWithOtherChain = 3,
    /// The block has been applied as part of a single linear chain.
    CanBeApplied = 4,
}

impl ValidityLevel {
    fn from_bits(bits: u32) -> ValidityLevel {
        match bits & BlockStatus::VALIDITY_MASK {
            0 => ValidityLevel::Unknown,
            1 => ValidityLevel::Tree,
            2 => ValidityLevel::Connected,
            3 => ValidityLevel::CanBeAppliedMaybeWithOtherChain,
            _ => ValidityLevel::CanBeApplied,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct BlockStatus(u32);

impl BlockStatus {
    pub(crate) const VALIDITY_MASK: u32 = 0b111;

    /// The block itself is invalid.
    pub const FAILED_BLOCK: u32 = 1 << 3;
    /// The block's payloads failed to apply, or duplicate payloads on its chain.
    pub const FAILED_POP: u32 = 1 << 4;
    /// An ancestor of the block failed.
    pub const FAILED_CHILD: u32 = 1 << 5;
    pub const FAILED_MASK: u32 = Self::FAILED_BLOCK | Self::FAILED_POP | Self::FAILED_CHILD;

    pub const HAS_PAYLOADS: u32 = 1 << 6;
    /// The block's payload effects are currently in force.
    pub const APPLIED: u32 = 1 << 7;
    pub const BOOTSTRAP: u32 = 1 << 8;

    pub const fn new(bits: u32) -> BlockStatus {
        BlockStatus(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub fn validity(&self) -> ValidityLevel {
        ValidityLevel::from_bits(self.0)
    }

    pub fn is_valid(&self) -> bool {
        self.0 & Self::FAILED_MASK == 0
    }

    /// Whether the block is valid and has made it to at least `level`.
    pub fn is_valid_up_to(&self, level: ValidityLevel) -> bool {
        self.is_valid() && self.validity() >= level
    }

    pub fn has(&self, flags: u32) -> bool {
        self.0 & flags != 0
    }

    /// Raise the validity level to `level`. Returns false, and changes nothing, if the block has
    /// failed.
    pub(crate) fn raise_validity(&mut self, level: ValidityLevel) -> bool {
        if !self.is_valid() {
            return false;
        }
        if level > self.validity() {
            self.0 = (self.0 & !Self::VALIDITY_MASK) | level as u32;
        }
        true
    }

    /// Lower the validity level to `level`. Failure flags and markers are untouched.
    pub(crate) fn lower_validity(&mut self, level: ValidityLevel) {
        if level < self.validity() {
            self.0 = (self.0 & !Self::VALIDITY_MASK) | level as u32;
        }
    }

    pub(crate) fn set(&mut self, flags: u32) {
        self.0 |= flags;
    }

    pub(crate) fn unset(&mut self, flags: u32) {
        self.0 &= !flags;
    }
}

impl std::fmt::Debug for BlockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.validity())?;
        let names = [
            (Self::FAILED_BLOCK, "FAILED_BLOCK"),
            (Self::FAILED_POP, "FAILED_POP"),
            (Self::FAILED_CHILD, "FAILED_CHILD"),
            (Self::HAS_PAYLOADS, "HAS_PAYLOADS"),
            (Self::APPLIED, "APPLIED"),
            (Self::BOOTSTRAP, "BOOTSTRAP"),
        ];
        for (flag, name) in names {
            if self.has(flag) {
                write!(f, "|{}", name)?;
            }
        }
        Ok(())
    }
}
