/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! What a PoP tree needs from the tree directly below it.
//!
//! Endorsements in a PoP tree point at blocks of proof in its protecting tree, and fork resolution
//! reads the protecting tree's best chain to find out when each keystone was published. Applying
//! a block also extends the protecting tree with the context headers the block carries.

use crate::block_tree::tree::{BlockTree, BlockTreeError};
use crate::types::{data_types::CryptoHash, header::Header};

pub trait ProtectingTree {
    type Header: Header;

    /// The protecting tree's nodes and best chain.
    fn blocks(&self) -> &BlockTree<Self::Header>;

    /// Take a reference on `header`, inserting it if it is not known yet.
    fn add_context_block(&mut self, header: &Self::Header) -> Result<(), BlockTreeError>;

    /// Release a reference taken by [`add_context_block`](Self::add_context_block). Blocks left
    /// without references and without children are removed.
    fn remove_context_block(&mut self, hash: &CryptoHash);

    /// Make `hash` the best tip again after a trial connect or a fork resolution run moved it. Does
    /// nothing if `hash` is no longer a valid block of the tree.
    ///
    /// Context blocks added during such a run may move the best tip for its duration. Trees that
    /// publish [`BeforeTipChange`](crate::events::Event::BeforeTipChange) report every move, so a
    /// listener sees each temporary tip followed by a change back to `hash`.
    fn restore_best_tip(&mut self, hash: &CryptoHash);
}
