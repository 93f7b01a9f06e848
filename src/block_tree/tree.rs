/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The arena of [block nodes](BlockNode) of one ledger level.
//!
//! A `BlockTree` owns every node it creates, keyed by hash. Besides the arena it tracks:
//! - The **root**: the bootstrap block, or after finalization the lowest block still kept.
//! - The **tips**: valid nodes that have no valid child.
//! - The **active chain**: the [`Chain`] from the root to the currently selected tip.
//! - The **applied block count**: how many blocks of the tree have their payload effects in force.
//!
//! `BlockTree` only does structural bookkeeping. Choosing the active tip is the job of the tree
//! types built on top of it: [`HeaderTree`](super::header_tree::HeaderTree) picks the chain with the
//! most work, and [`PopTree`](crate::pop_tree::PopTree) moves its active chain with the
//! [state machine](crate::state_machine).

use std::collections::BTreeSet;

use crate::block_tree::{
    chain::{Chain, NodeMap},
    node::BlockNode,
    status::{BlockStatus, ValidityLevel},
};
use crate::types::{
    data_types::{BlockHeight, CryptoHash},
    header::Header,
};

/// Heights above this cannot be bootstrapped at, leaving room for relative-height arithmetic.
pub const MAX_BOOTSTRAP_HEIGHT: u64 = (i64::MAX / 2) as u64;

#[derive(Clone, Debug)]
pub struct BlockTree<H> {
    pub(crate) nodes: NodeMap<H>,
    pub(crate) root: Option<CryptoHash>,
    pub(crate) tips: BTreeSet<CryptoHash>,
    pub(crate) active_chain: Chain,
    pub(crate) applied_block_count: u64,
    pub(crate) last_finalized: Option<CryptoHash>,
}

impl<H: Header> Default for BlockTree<H> {
    fn default() -> Self {
        BlockTree::new()
    }
}

impl<H: Header> BlockTree<H> {
    pub fn new() -> BlockTree<H> {
        BlockTree {
            nodes: NodeMap::new(),
            root: None,
            tips: BTreeSet::new(),
            active_chain: Chain::empty(BlockHeight::new(0)),
            applied_block_count: 0,
            last_finalized: None,
        }
    }

    /* ↓↓↓ Queries ↓↓↓ */

    pub fn is_bootstrapped(&self) -> bool {
        self.root.is_some()
    }

    pub fn root(&self) -> Option<&BlockNode<H>> {
        self.root.as_ref().and_then(|root| self.nodes.get(root))
    }

    pub fn node(&self, hash: &CryptoHash) -> Option<&BlockNode<H>> {
        self.nodes.get(hash)
    }

    pub(crate) fn node_mut(&mut self, hash: &CryptoHash) -> Option<&mut BlockNode<H>> {
        self.nodes.get_mut(hash)
    }

    pub fn contains(&self, hash: &CryptoHash) -> bool {
        self.nodes.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &BlockNode<H>> {
        self.nodes.values()
    }

    pub fn tips(&self) -> &BTreeSet<CryptoHash> {
        &self.tips
    }

    pub fn best_chain(&self) -> &Chain {
        &self.active_chain
    }

    pub fn best_tip(&self) -> Option<&BlockNode<H>> {
        self.active_chain.tip().and_then(|tip| self.nodes.get(&tip))
    }

    pub fn applied_block_count(&self) -> u64 {
        self.applied_block_count
    }

    pub fn last_finalized(&self) -> Option<&BlockNode<H>> {
        self.last_finalized.as_ref().and_then(|hash| self.nodes.get(hash))
    }

    /// Hash of the ancestor of `hash` at `height` (the block itself if `height` is its own).
    pub fn ancestor_at(&self, hash: &CryptoHash, height: BlockHeight) -> Option<CryptoHash> {
        let mut cursor = self.nodes.get(hash)?;
        if height > cursor.height {
            return None;
        }
        if self.active_chain.contains(cursor) {
            return self.active_chain.get(height);
        }
        while cursor.height > height {
            cursor = self.nodes.get(cursor.prev.as_ref()?)?;
            if self.active_chain.contains(cursor) {
                return self.active_chain.get(height);
            }
        }
        Some(cursor.hash)
    }

    /// Whether `ancestor` is `descendant` or one of its ancestors.
    pub fn is_ancestor(&self, ancestor: &CryptoHash, descendant: &CryptoHash) -> bool {
        match self.nodes.get(ancestor) {
            Some(node) => self.ancestor_at(descendant, node.height).as_ref() == Some(ancestor),
            None => false,
        }
    }

    /// Lowest common ancestor of `a` and `b`. `None` if either is unknown.
    pub fn find_fork(&self, a: &CryptoHash, b: &CryptoHash) -> Option<CryptoHash> {
        let mut a = self.nodes.get(a)?;
        let mut b = self.nodes.get(b)?;
        while a.height > b.height {
            a = self.nodes.get(a.prev.as_ref()?)?;
        }
        while b.height > a.height {
            b = self.nodes.get(b.prev.as_ref()?)?;
        }
        while a.hash != b.hash {
            a = self.nodes.get(a.prev.as_ref()?)?;
            b = self.nodes.get(b.prev.as_ref()?)?;
        }
        Some(a.hash)
    }

    /// Every descendant of `hash`, parents before children. `hash` itself is not included.
    pub fn descendants(&self, hash: &CryptoHash) -> Vec<CryptoHash> {
        let mut found = Vec::new();
        let mut stack: Vec<CryptoHash> = match self.nodes.get(hash) {
            Some(node) => node.next.iter().rev().copied().collect(),
            None => return found,
        };
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.get(&current) {
                stack.extend(node.next.iter().rev().copied());
            }
            found.push(current);
        }
        found
    }

    /* ↓↓↓ Structure ↓↓↓ */

    /// Create the first node of this tree at `height`. The node is valid, applied, and becomes the
    /// single-block active chain.
    pub fn bootstrap(&mut self, header: H, height: BlockHeight) -> Result<CryptoHash, BlockTreeError> {
        if self.is_bootstrapped() {
            return Err(BlockTreeError::AlreadyBootstrapped);
        }
        if height.int() > MAX_BOOTSTRAP_HEIGHT {
            return Err(BlockTreeError::BootstrapHeightOutOfRange { height });
        }

        let work = header.work();
        let mut node = BlockNode::new(header, height, None, work);
        node.status.raise_validity(ValidityLevel::CanBeApplied);
        node.status.set(BlockStatus::APPLIED | BlockStatus::BOOTSTRAP);
        node.ever_applied = true;
        node.references = 1;
        let hash = node.hash;

        self.nodes.insert(hash, node);
        self.root = Some(hash);
        self.tips.insert(hash);
        self.active_chain = Chain::new(height, &hash, &self.nodes);
        self.applied_block_count = 1;
        Ok(hash)
    }

    /// Accept a header whose parent is already in the tree.
    ///
    /// Accepting the bootstrap header again succeeds without changing anything. A header below a
    /// failed ancestor is still recorded, with [`BlockStatus::FAILED_CHILD`], and the call returns
    /// [`BlockTreeError::BadChain`].
    pub fn accept_header(&mut self, header: H) -> Result<CryptoHash, BlockTreeError> {
        let hash = header.hash();
        if self.root == Some(hash) {
            return Ok(hash);
        }
        let hash = self.insert_header(header)?;
        let node = self
            .nodes
            .get_mut(&hash)
            .ok_or(BlockTreeError::UnknownBlock { hash })?;
        node.references += 1;
        if !node.is_valid() {
            return Err(BlockTreeError::BadChain { hash });
        }
        Ok(hash)
    }

    /// Insert a new node for `header` without taking a reference on it.
    pub(crate) fn insert_header(&mut self, header: H) -> Result<CryptoHash, BlockTreeError> {
        if !self.is_bootstrapped() {
            return Err(BlockTreeError::NotBootstrapped);
        }
        let hash = header.hash();
        if self.nodes.contains_key(&hash) {
            return Err(BlockTreeError::DuplicateHeader { hash });
        }
        let parent_hash = header.previous_block();
        let parent = self
            .nodes
            .get_mut(&parent_hash)
            .ok_or(BlockTreeError::UnknownParent {
                hash,
                parent: parent_hash,
            })?;

        let work = parent.chain_work + header.work();
        let mut node = BlockNode::new(header, parent.height + 1, Some(parent_hash), work);
        node.status.raise_validity(ValidityLevel::Tree);
        if !parent.is_valid() {
            node.status.set(BlockStatus::FAILED_CHILD);
        }
        parent.next.insert(hash);

        self.nodes.insert(hash, node);
        self.update_tip(&hash);
        Ok(hash)
    }

    /// Re-evaluate whether `hash` and its parent are tips.
    pub(crate) fn update_tip(&mut self, hash: &CryptoHash) {
        self.refresh_tip(hash);
        if let Some(prev) = self.nodes.get(hash).and_then(|node| node.prev) {
            self.refresh_tip(&prev);
        }
    }

    fn refresh_tip(&mut self, hash: &CryptoHash) {
        let is_tip = match self.nodes.get(hash) {
            Some(node) => {
                node.is_valid()
                    && !node
                        .next
                        .iter()
                        .any(|child| self.nodes.get(child).is_some_and(|c| c.is_valid()))
            }
            None => false,
        };
        if is_tip {
            self.tips.insert(*hash);
        } else {
            self.tips.remove(hash);
        }
    }

    /// Move the active chain's tip to `hash`. Only the active chain window changes.
    pub(crate) fn set_active_tip(&mut self, hash: &CryptoHash) {
        self.active_chain.set_tip(Some(hash), &self.nodes);
    }

    /// Set failure flag `reason` on `hash` and [`BlockStatus::FAILED_CHILD`] on all of its descendants.
    /// Returns the hashes whose status changed.
    ///
    /// # Panics
    ///
    /// If `reason` is not a failure flag, or if `hash` is applied.
    pub(crate) fn invalidate_subtree(&mut self, hash: &CryptoHash, reason: u32) -> Vec<CryptoHash> {
        assert!(
            reason & BlockStatus::FAILED_MASK == reason && reason != 0,
            "invalidation reason must be a failure flag"
        );
        let Some(node) = self.nodes.get_mut(hash) else {
            return Vec::new();
        };
        assert!(!node.is_applied(), "cannot invalidate an applied block {}", hash);
        node.status.set(reason);

        let mut changed = vec![*hash];
        for descendant in self.descendants(hash) {
            if let Some(node) = self.nodes.get_mut(&descendant) {
                if !node.status.has(BlockStatus::FAILED_CHILD) {
                    node.status.set(BlockStatus::FAILED_CHILD);
                    changed.push(descendant);
                }
                self.tips.remove(&descendant);
            }
        }
        self.update_tip(hash);
        changed
    }

    /// Clear failure flag `reason` from `hash`, and [`BlockStatus::FAILED_CHILD`] from every descendant
    /// that has no other failed ancestor. Returns the hashes whose status changed.
    pub(crate) fn revalidate_subtree(&mut self, hash: &CryptoHash, reason: u32) -> Vec<CryptoHash> {
        let Some(node) = self.nodes.get_mut(hash) else {
            return Vec::new();
        };
        if !node.status.has(reason) {
            return Vec::new();
        }
        node.status.unset(reason);
        let mut changed = vec![*hash];
        if !node.is_valid() {
            return changed;
        }

        let mut stack: Vec<CryptoHash> = node.next.iter().copied().collect();
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get_mut(&current) else {
                continue;
            };
            if node.status.has(BlockStatus::FAILED_CHILD) {
                node.status.unset(BlockStatus::FAILED_CHILD);
                changed.push(current);
            }
            if node.is_valid() {
                stack.extend(node.next.iter().copied());
            }
        }
        for hash in &changed {
            self.refresh_tip(hash);
        }
        self.update_tip(hash);
        changed
    }

    /// Detach `hash` and every descendant from the tree, and return the removed nodes (root of the
    /// removed subtree first).
    ///
    /// Fails if `hash` is the root, or if any node of the subtree is applied.
    pub(crate) fn remove_subtree(
        &mut self,
        hash: &CryptoHash,
    ) -> Result<Vec<BlockNode<H>>, BlockTreeError> {
        let node = self
            .nodes
            .get(hash)
            .ok_or(BlockTreeError::UnknownBlock { hash: *hash })?;
        if self.root == Some(*hash) {
            return Err(BlockTreeError::RemoveRoot { hash: *hash });
        }
        let parent = node.prev;
        let mut subtree = vec![*hash];
        subtree.extend(self.descendants(hash));
        if let Some(applied) = subtree
            .iter()
            .find(|member| self.nodes.get(*member).is_some_and(|node| node.is_applied()))
        {
            return Err(BlockTreeError::SubtreeApplied {
                hash: *hash,
                applied: *applied,
            });
        }

        if let Some(parent) = parent.as_ref().and_then(|parent| self.nodes.get_mut(parent)) {
            parent.next.remove(hash);
        }
        let mut removed = Vec::with_capacity(subtree.len());
        for hash in subtree {
            self.tips.remove(&hash);
            if let Some(node) = self.nodes.remove(&hash) {
                removed.push(node);
            }
        }
        if let Some(parent) = parent {
            self.refresh_tip(&parent);
        }
        Ok(removed)
    }

    /// Mark `hash` and its ancestors final, drop every branch that does not contain `hash`, and
    /// deallocate active chain blocks more than `preserve` blocks below it. Returns the removed nodes.
    ///
    /// # Panics
    ///
    /// If `hash` is not on the active chain.
    pub(crate) fn finalize(&mut self, hash: &CryptoHash, preserve: u64) -> Vec<BlockNode<H>> {
        let final_height = match self.nodes.get(hash) {
            Some(node) if self.active_chain.contains(node) => node.height,
            _ => panic!("finalized block {} must be on the active chain", hash),
        };
        let root_height = self.active_chain.start_height();

        let mut cursor = Some(*hash);
        while let Some(current) = cursor {
            match self.nodes.get_mut(&current) {
                Some(node) if !node.finalized => {
                    node.finalized = true;
                    cursor = node.prev;
                }
                _ => break,
            }
        }

        // Drop branches that fork off below the final block.
        let mut removed = Vec::new();
        let chain: Vec<(BlockHeight, CryptoHash)> = self
            .active_chain
            .enumerate()
            .take_while(|(height, _)| *height < final_height)
            .collect();
        for (height, on_chain) in &chain {
            let keep = self.active_chain.get(*height + 1);
            let forks: Vec<CryptoHash> = match self.nodes.get(on_chain) {
                Some(node) => node.next.iter().filter(|c| Some(**c) != keep).copied().collect(),
                None => continue,
            };
            for fork in forks {
                if let Ok(nodes) = self.remove_subtree(&fork) {
                    removed.extend(nodes);
                }
            }
        }

        // Deallocate old blocks; the lowest kept block becomes the new root.
        let new_root_height = final_height
            .int()
            .saturating_sub(preserve)
            .max(root_height.int());
        let new_root_height = BlockHeight::new(new_root_height);
        if new_root_height > root_height {
            for (height, old) in &chain {
                if *height >= new_root_height {
                    break;
                }
                self.tips.remove(old);
                if let Some(node) = self.nodes.remove(old) {
                    if node.is_applied() {
                        self.applied_block_count -= 1;
                    }
                    removed.push(node);
                }
            }
            let new_root = self.active_chain.get(new_root_height);
            if let Some(node) = new_root.as_ref().and_then(|root| self.nodes.get_mut(root)) {
                node.prev = None;
                node.status.set(BlockStatus::BOOTSTRAP);
            }
            self.root = new_root;
            if let Some(tip) = self.active_chain.tip() {
                self.active_chain = Chain::new(new_root_height, &tip, &self.nodes);
            }
        }

        self.last_finalized = Some(*hash);
        removed
    }

    /// Insert an already-built node, e.g. one restored from storage. The parent must be present.
    pub(crate) fn insert_node(&mut self, node: BlockNode<H>) -> Result<(), BlockTreeError> {
        let hash = node.hash;
        if self.nodes.contains_key(&hash) {
            return Err(BlockTreeError::DuplicateHeader { hash });
        }
        match node.prev {
            Some(prev) => match self.nodes.get_mut(&prev) {
                Some(parent) => {
                    parent.next.insert(hash);
                }
                None => return Err(BlockTreeError::UnknownParent { hash, parent: prev }),
            },
            None => return Err(BlockTreeError::AlreadyBootstrapped),
        }
        self.nodes.insert(hash, node);
        self.update_tip(&hash);
        Ok(())
    }
}

/// Structural errors of a [`BlockTree`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockTreeError {
    #[error("the tree has not been bootstrapped")]
    NotBootstrapped,

    #[error("the tree is already bootstrapped")]
    AlreadyBootstrapped,

    #[error("bootstrap height {height} is too large")]
    BootstrapHeightOutOfRange { height: BlockHeight },

    #[error("block {hash} has unknown parent {parent}")]
    UnknownParent { hash: CryptoHash, parent: CryptoHash },

    #[error("block {hash} is already in the tree")]
    DuplicateHeader { hash: CryptoHash },

    #[error("block {hash} has a failed ancestor")]
    BadChain { hash: CryptoHash },

    #[error("block {hash} is not in the tree")]
    UnknownBlock { hash: CryptoHash },

    #[error("cannot remove root block {hash}")]
    RemoveRoot { hash: CryptoHash },

    #[error("cannot remove subtree {hash}: block {applied} is applied")]
    SubtreeApplied { hash: CryptoHash, applied: CryptoHash },
}

impl BlockTreeError {
    /// Machine-readable code of this error.
    pub fn code(&self) -> &'static str {
        match self {
            BlockTreeError::NotBootstrapped => "not-bootstrapped",
            BlockTreeError::AlreadyBootstrapped => "already-bootstrapped",
            BlockTreeError::BootstrapHeightOutOfRange { .. } => "bad-bootstrap-height",
            BlockTreeError::UnknownParent { .. } => "bad-prev-block",
            BlockTreeError::DuplicateHeader { .. } => "duplicate-header",
            BlockTreeError::BadChain { .. } => "bad-chain",
            BlockTreeError::UnknownBlock { .. } => "unknown-block",
            BlockTreeError::RemoveRoot { .. } => "remove-root",
            BlockTreeError::SubtreeApplied { .. } => "subtree-applied",
        }
    }
}
