/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Height-indexed view of one contiguous path through a block tree.
//!
//! A `Chain` covers heights `[start, tip]` with one hash per height, so looking a block up by height,
//! and asking whether a node is on the chain, are both O(1).

use std::collections::HashMap;

use crate::block_tree::node::BlockNode;
use crate::types::data_types::{BlockHeight, CryptoHash};

pub type NodeMap<H> = HashMap<CryptoHash, BlockNode<H>>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chain {
    start: BlockHeight,
    blocks: Vec<CryptoHash>,
}

impl Chain {
    /// An empty chain that starts at `start`.
    pub fn empty(start: BlockHeight) -> Chain {
        Chain {
            start,
            blocks: Vec::new(),
        }
    }

    /// The chain from `start` up to `tip`. If `tip` is below `start` the chain is empty.
    pub fn new<H>(start: BlockHeight, tip: &CryptoHash, nodes: &NodeMap<H>) -> Chain {
        let mut chain = Chain::empty(start);
        chain.set_tip(Some(tip), nodes);
        chain
    }

    pub fn start_height(&self) -> BlockHeight {
        self.start
    }

    pub fn first(&self) -> Option<CryptoHash> {
        self.blocks.first().copied()
    }

    pub fn tip(&self) -> Option<CryptoHash> {
        self.blocks.last().copied()
    }

    pub fn tip_height(&self) -> Option<BlockHeight> {
        if self.blocks.is_empty() {
            None
        } else {
            Some(self.start + (self.blocks.len() as u64 - 1))
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Hash of the chain's block at `height`, if the chain covers it.
    pub fn get(&self, height: BlockHeight) -> Option<CryptoHash> {
        if height < self.start {
            return None;
        }
        self.blocks.get((height - self.start) as usize).copied()
    }

    /// Whether the block `hash` at `height` is on this chain.
    pub fn contains_at(&self, hash: &CryptoHash, height: BlockHeight) -> bool {
        self.get(height).as_ref() == Some(hash)
    }

    pub fn contains<H>(&self, node: &BlockNode<H>) -> bool {
        self.contains_at(&node.hash, node.height)
    }

    /// Hashes from the first block to the tip.
    pub fn iter(&self) -> std::slice::Iter<'_, CryptoHash> {
        self.blocks.iter()
    }

    /// `(height, hash)` pairs from the first block to the tip.
    pub fn enumerate(&self) -> impl DoubleEndedIterator<Item = (BlockHeight, CryptoHash)> + '_ {
        let start = self.start;
        self.blocks
            .iter()
            .enumerate()
            .map(move |(offset, hash)| (start + offset as u64, *hash))
    }

    /// Move the tip of this chain to `tip`, rewriting only the heights above the fork between the old
    /// and new tip. `None` empties the chain.
    pub(crate) fn set_tip<H>(&mut self, tip: Option<&CryptoHash>, nodes: &NodeMap<H>) {
        let Some(mut cursor) = tip.and_then(|hash| nodes.get(hash)) else {
            self.blocks.clear();
            return;
        };
        if cursor.height < self.start {
            self.blocks.clear();
            return;
        }

        let new_len = (cursor.height - self.start) as usize + 1;
        let old_len = self.blocks.len();
        self.blocks.resize(new_len, CryptoHash::default());

        loop {
            let offset = (cursor.height - self.start) as usize;
            if offset < old_len.min(new_len) && self.blocks[offset] == cursor.hash {
                break;
            }
            self.blocks[offset] = cursor.hash;
            if offset == 0 {
                break;
            }
            match cursor.prev.as_ref().and_then(|prev| nodes.get(prev)) {
                Some(parent) => cursor = parent,
                None => {
                    // The path ends above `start`: keep only what is reachable.
                    self.blocks.drain(..offset);
                    self.start = cursor.height;
                    break;
                }
            }
        }
    }

    /// The highest block of this chain that is an ancestor of (or equal to) `hash`.
    pub fn find_fork<H>(&self, hash: &CryptoHash, nodes: &NodeMap<H>) -> Option<CryptoHash> {
        let tip_height = self.tip_height()?;
        let mut cursor = nodes.get(hash)?;
        while cursor.height > tip_height {
            cursor = nodes.get(cursor.prev.as_ref()?)?;
        }
        loop {
            if self.contains(cursor) {
                return Some(cursor.hash);
            }
            cursor = nodes.get(cursor.prev.as_ref()?)?;
        }
    }
}
