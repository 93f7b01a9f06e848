/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Index from payload id to the set of blocks that contain the payload.
//!
//! The index covers every block with attached payloads, on every branch. Duplicate checks narrow it
//! down to one chain by asking whether a containing block is an ancestor of the block being checked.

use std::collections::{HashMap, HashSet};

use crate::block_tree::{node::BlockNode, tree::BlockTree};
use crate::types::{
    data_types::{CryptoHash, PayloadId},
    header::Header,
};

#[derive(Clone, Debug, Default)]
pub struct PayloadsIndex {
    containing: HashMap<PayloadId, HashSet<CryptoHash>>,
}

impl PayloadsIndex {
    pub fn new() -> PayloadsIndex {
        PayloadsIndex::default()
    }

    /// Blocks that contain payload `id`.
    pub fn containing_blocks(&self, id: &PayloadId) -> impl Iterator<Item = &CryptoHash> {
        self.containing.get(id).into_iter().flatten()
    }

    pub fn contains(&self, id: &PayloadId) -> bool {
        self.containing.contains_key(id)
    }

    /// Number of distinct payload ids in the index.
    pub fn len(&self) -> usize {
        self.containing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containing.is_empty()
    }

    pub(crate) fn add(&mut self, id: PayloadId, containing: CryptoHash) {
        self.containing.entry(id).or_default().insert(containing);
    }

    pub(crate) fn remove(&mut self, id: &PayloadId, containing: &CryptoHash) {
        if let Some(blocks) = self.containing.get_mut(id) {
            blocks.remove(containing);
            if blocks.is_empty() {
                self.containing.remove(id);
            }
        }
    }

    pub(crate) fn add_block<H: Header>(&mut self, node: &BlockNode<H>) {
        for (_, id) in node.payload_ids().iter() {
            self.add(*id, node.hash());
        }
    }

    pub(crate) fn remove_block<H: Header>(&mut self, node: &BlockNode<H>) {
        for (_, id) in node.payload_ids().iter() {
            self.remove(id, &node.hash());
        }
    }

    /// Whether payload `id` is already contained in a strict ancestor of `hash`.
    pub fn is_stateful_duplicate<H: Header>(
        &self,
        id: &PayloadId,
        hash: &CryptoHash,
        tree: &BlockTree<H>,
    ) -> bool {
        let Some(node) = tree.node(hash) else {
            return false;
        };
        self.containing_blocks(id).any(|containing| {
            containing != hash
                && tree
                    .node(containing)
                    .is_some_and(|candidate| candidate.height() < node.height())
                && tree.is_ancestor(containing, hash)
        })
    }

    /// The first id that appears more than once in `ids`, if any.
    pub fn stateless_duplicate<'a>(ids: impl IntoIterator<Item = &'a PayloadId>) -> Option<PayloadId> {
        let mut seen = HashSet::new();
        ids.into_iter().find(|id| !seen.insert(**id)).copied()
    }
}
