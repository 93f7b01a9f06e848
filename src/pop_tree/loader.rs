/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Saving and restoring the blocks of a [`PopTree`].
//!
//! The tree itself does not persist anything. A library user saves [`StoredBlock`]s (e.g. with
//! [`PopTree::to_stored`] after each connect), and after a restart loads them back in ascending
//! height order with [`PopTree::load_block`] on a freshly bootstrapped tree, then calls
//! [`PopTree::load_tip`] to apply the chain it was on.
//!
//! In fast mode, the stored validity of a block is trusted and its payloads are not tried again.
//! The `endorsed_by` sets are rebuilt from the payload store either way.

use borsh::{BorshDeserialize, BorshSerialize};

use super::{PopTree, PopTreeError};
use crate::block_tree::{
    node::BlockNode,
    protecting::ProtectingTree,
    status::{BlockStatus, ValidityLevel},
    tree::BlockTreeError,
};
use crate::pluggables::PayloadStore;
use crate::types::{
    data_types::{BlockHeight, CryptoHash},
    header::Header,
    payloads::PayloadIds,
};

/// What needs to be persisted of one block to restore it later.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct StoredBlock<H> {
    pub header: H,
    pub height: BlockHeight,
    /// Bits of the block's [`BlockStatus`].
    pub status: u32,
    pub payload_ids: PayloadIds,
}

impl<H, P, S> PopTree<H, P, S>
where
    H: Header,
    P: ProtectingTree,
    S: PayloadStore,
{
    pub fn to_stored(&self, hash: &CryptoHash) -> Option<StoredBlock<H>> {
        self.tree.node(hash).map(|node| StoredBlock {
            header: node.header().clone(),
            height: node.height(),
            status: node.status().bits(),
            payload_ids: node.payload_ids().clone(),
        })
    }

    /// Re-insert a stored block. Its parent must already be loaded.
    ///
    /// Loading the bootstrap block again is a no-op. With `fast`, the stored validity is kept;
    /// otherwise a block with payloads is connected again if its parent is connected.
    pub fn load_block(&mut self, stored: StoredBlock<H>, fast: bool) -> Result<(), PopTreeError> {
        let hash = stored.header.hash();
        if self.tree.root().is_some_and(|root| root.hash() == hash) {
            return Ok(());
        }
        let prev = stored.header.previous_block();
        let parent = self
            .tree
            .node(&prev)
            .ok_or(BlockTreeError::UnknownParent { hash, parent: prev })?;
        if parent.height() + 1 != stored.height {
            return Err(PopTreeError::InconsistentHeight {
                hash,
                height: stored.height,
                parent_height: parent.height(),
            });
        }

        let work = parent.chain_work() + stored.header.work();
        let parent_valid = parent.is_valid();
        let mut node = BlockNode::new(stored.header, stored.height, Some(prev), work);
        let bits = stored.status & !(BlockStatus::APPLIED | BlockStatus::BOOTSTRAP);
        node.status = BlockStatus::new(bits);
        if !fast {
            node.status.lower_validity(ValidityLevel::Tree);
        }
        if !parent_valid {
            node.status.set(BlockStatus::FAILED_CHILD);
        }
        node.payload_ids = stored.payload_ids;
        node.references = 1;
        let has_payloads = node.has_payloads();
        let connected = node.is_valid_up_to(ValidityLevel::Connected);

        self.tree.insert_node(node)?;
        if let Some(node) = self.tree.node(&hash) {
            self.payloads_index.add_block(node);
        }
        self.publish_accept_header(&hash);

        if fast {
            if connected {
                self.index_endorsements(&hash)?;
            }
            return Ok(());
        }
        let parent_connected = self
            .tree
            .node(&prev)
            .is_some_and(|parent| parent.is_valid_up_to(ValidityLevel::Connected));
        if has_payloads && parent_connected {
            self.connect(&hash)?;
        }
        Ok(())
    }

    /// Apply the chain from the root to `hash` and make it the active chain. Payload commands run
    /// again, so context blocks are re-added to the protecting tree.
    pub fn load_tip(&mut self, hash: &CryptoHash) -> Result<(), PopTreeError> {
        log::debug!("{}: loading tip {}", H::NAME, hash);
        self.set_state(hash)
    }
}
