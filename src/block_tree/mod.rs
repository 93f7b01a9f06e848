/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Block trees: arenas of block nodes, one per ledger level.
//!
//! # The Block Tree
//!
//! A [`BlockTree`](tree::BlockTree) keeps every known block of one ledger, rooted at a bootstrap
//! block. Most blocks in a block tree have one child; forks are the exception, and the tree keeps
//! every one of them until they are removed or finalized away.
//!
//! Each node carries a [status](status::BlockStatus): how far it has been validated, and whether it
//! (or one of its ancestors) has failed. A node that failed is never raised again until it is
//! explicitly revalidated.
//!
//! The [active chain](chain::Chain) of a tree is a dense, height-indexed window from the root to the
//! current tip.
//!
//! # Levels
//!
//! - [`HeaderTree`](header_tree::HeaderTree) is the bottom level (e.g. BTC): headers only, and the
//!   chain with the most work is the best chain.
//! - [`PopTree`](crate::pop_tree::PopTree) is every level above (e.g. VBK, ALT).
//!
//! Both implement [`ProtectingTree`](protecting::ProtectingTree), the interface a `PopTree` uses to
//! read and extend the level below it.

pub mod chain;

pub mod header_tree;

pub mod node;

pub mod protecting;

pub mod status;

pub mod tree;
