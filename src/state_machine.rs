/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Moves the applied state of a PoP tree from one block to another.
//!
//! "Applied" blocks are those whose payload [commands](crate::commands) are currently in force. The
//! applied blocks always form one path that starts at the root. To make a block `to` the top of that
//! path, the state machine:
//! 1. Finds the fork point between the current top `from` and `to`.
//! 2. Unapplies blocks from `from` down to the fork point, highest first.
//! 3. Applies blocks from the fork point up to `to`, lowest first.
//!
//! If any block fails to apply, the blocks applied so far by the call are unapplied again, the failed
//! block is invalidated with [`BlockStatus::FAILED_POP`], and the original state is restored. Every
//! operation here either completes or leaves the applied set as it found it.
//!
//! The commands executed for each applied block are kept in [`AppliedCommands`], so unapplying never
//! has to go back to the payload store.

use std::collections::HashMap;

use crate::block_tree::{
    node::BlockNode,
    protecting::ProtectingTree,
    status::{BlockStatus, ValidityLevel},
    tree::BlockTree,
};
use crate::commands::{Command, CommandError};
use crate::config::PopParams;
use crate::pluggables::{PayloadStore, PayloadStoreError};
use crate::types::{data_types::CryptoHash, header::Header};

/// The commands each applied block executed, in execution order.
pub type AppliedCommands<G> = HashMap<CryptoHash, Vec<Command<G>>>;

pub struct PopStateMachine<'a, H, P: ProtectingTree, S> {
    tree: &'a mut BlockTree<H>,
    protecting: &'a mut P,
    store: &'a S,
    params: &'a PopParams,
    applied: &'a mut AppliedCommands<P::Header>,
}

impl<'a, H, P, S> PopStateMachine<'a, H, P, S>
where
    H: Header,
    P: ProtectingTree,
    S: PayloadStore,
{
    pub fn new(
        tree: &'a mut BlockTree<H>,
        protecting: &'a mut P,
        store: &'a S,
        params: &'a PopParams,
        applied: &'a mut AppliedCommands<P::Header>,
    ) -> Self {
        Self {
            tree,
            protecting,
            store,
            params,
            applied,
        }
    }

    pub fn tree(&self) -> &BlockTree<H> {
        &*self.tree
    }

    pub fn protecting(&self) -> &P {
        &*self.protecting
    }

    pub(crate) fn protecting_mut(&mut self) -> &mut P {
        &mut *self.protecting
    }

    /// Commands of the payloads attached to `hash`, in application order.
    pub fn load_commands(&self, hash: &CryptoHash) -> Result<Vec<Command<P::Header>>, ApplyError> {
        let node = self
            .tree
            .node(hash)
            .ok_or(ApplyError::UnknownBlock { hash: *hash })?;
        node.payload_ids()
            .iter()
            .map(|(kind, id)| {
                self.store
                    .payload::<P::Header>(kind, id)
                    .map(|payload| Command::from_payload(payload, *hash))
                    .map_err(|source| ApplyError::Store {
                        hash: *hash,
                        source,
                    })
            })
            .collect()
    }

    /// Execute the commands of block `hash`, whose parent must be the top of the applied path.
    ///
    /// On a command failure the commands executed so far are unexecuted and the block (with its
    /// subtree) is invalidated with [`BlockStatus::FAILED_POP`].
    ///
    /// # Panics
    ///
    /// If `hash` is already applied, its parent is not applied, or one of its children is applied.
    pub fn apply_block(&mut self, hash: &CryptoHash) -> Result<(), ApplyError> {
        let node = self
            .tree
            .node(hash)
            .ok_or(ApplyError::UnknownBlock { hash: *hash })?;
        assert!(!node.is_applied(), "block {} is already applied", hash);
        let parent = node
            .prev()
            .and_then(|prev| self.tree.node(&prev))
            .filter(|parent| parent.is_applied());
        let Some(parent) = parent else {
            panic!("block {} cannot be applied: its parent is not applied", hash)
        };
        assert!(
            node.children()
                .all(|child| self.tree.node(child).map_or(true, |child| !child.is_applied())),
            "block {} cannot be applied: one of its children is applied",
            hash
        );
        if !node.is_valid() {
            return Err(ApplyError::InvalidBlock { hash: *hash });
        }
        if !node.has_payloads() {
            return Err(ApplyError::MissingPayloads { hash: *hash });
        }
        let parent_can_be_applied = parent.is_valid_up_to(ValidityLevel::CanBeApplied);
        let height = node.height();

        let commands = self.load_commands(hash)?;
        for (executed, command) in commands.iter().enumerate() {
            if let Err(source) = command.execute(&mut *self.tree, &mut *self.protecting, self.params) {
                for done in commands[..executed].iter().rev() {
                    done.unexecute(&mut *self.tree, &mut *self.protecting);
                }
                log::debug!("{}: block {} failed to apply: {}", H::NAME, hash, source);
                self.tree.invalidate_subtree(hash, BlockStatus::FAILED_POP);
                return Err(ApplyError::BadCommand {
                    hash: *hash,
                    source,
                });
            }
        }

        // A block is known to apply on its own chain only if everything applied below it is that
        // chain.
        let linear_height = self
            .tree
            .root()
            .map(|root| root.height() + self.tree.applied_block_count());
        let level = if parent_can_be_applied && linear_height == Some(height) {
            ValidityLevel::CanBeApplied
        } else {
            ValidityLevel::CanBeAppliedMaybeWithOtherChain
        };
        if let Some(node) = self.tree.node_mut(hash) {
            node.status.raise_validity(level);
            node.status.set(BlockStatus::APPLIED);
            node.ever_applied = true;
        }
        self.tree.applied_block_count += 1;
        self.applied.insert(*hash, commands);
        Ok(())
    }

    /// Unexecute the commands of block `hash`, highest command first.
    ///
    /// # Panics
    ///
    /// If `hash` is unknown, not applied, the root, or has an applied child.
    pub fn unapply_block(&mut self, hash: &CryptoHash) {
        let node = match self.tree.node(hash) {
            Some(node) => node,
            None => panic!("cannot unapply unknown block {}", hash),
        };
        assert!(node.is_applied(), "block {} is not applied", hash);
        assert!(!node.is_bootstrap(), "cannot unapply root block {}", hash);
        assert!(
            node.children()
                .all(|child| self.tree.node(child).map_or(true, |child| !child.is_applied())),
            "block {} cannot be unapplied: one of its children is applied",
            hash
        );

        let commands = self.applied.remove(hash).unwrap_or_default();
        for command in commands.iter().rev() {
            command.unexecute(&mut *self.tree, &mut *self.protecting);
        }
        if let Some(node) = self.tree.node_mut(hash) {
            node.status.unset(BlockStatus::APPLIED);
        }
        self.tree.applied_block_count -= 1;
    }

    /// Unapply blocks from `from` down towards `to` (exclusive) while `predicate` holds for the next
    /// block to unapply. Returns the block at which it stopped.
    pub fn unapply_while<F>(&mut self, from: &CryptoHash, to: &CryptoHash, predicate: F) -> CryptoHash
    where
        F: Fn(&BlockNode<H>) -> bool,
    {
        assert!(
            self.tree.is_ancestor(to, from),
            "block {} is not an ancestor of {}",
            to,
            from
        );
        let mut cursor = *from;
        while cursor != *to {
            let Some(node) = self.tree.node(&cursor) else {
                break;
            };
            if !predicate(node) {
                break;
            }
            let prev = node.prev();
            self.unapply_block(&cursor);
            match prev {
                Some(prev) => cursor = prev,
                None => break,
            }
        }
        cursor
    }

    /// Unapply every block from `from` down to `to` (exclusive).
    pub fn unapply(&mut self, from: &CryptoHash, to: &CryptoHash) {
        self.unapply_while(from, to, |_| true);
    }

    /// Apply every block from `from` (exclusive) up to `to`. If any block fails, the blocks applied by
    /// this call are unapplied before the error is returned.
    ///
    /// # Panics
    ///
    /// If `from` is not an applied ancestor of `to`.
    pub fn apply(&mut self, from: &CryptoHash, to: &CryptoHash) -> Result<(), ApplyError> {
        if from == to {
            return Ok(());
        }
        assert!(
            self.tree.is_ancestor(from, to),
            "block {} is not an ancestor of {}",
            from,
            to
        );

        let mut path = Vec::new();
        let mut cursor = *to;
        while cursor != *from {
            path.push(cursor);
            match self.tree.node(&cursor).and_then(|node| node.prev()) {
                Some(prev) => cursor = prev,
                None => break,
            }
        }

        let mut top = *from;
        for hash in path.iter().rev() {
            if let Err(err) = self.apply_block(hash) {
                self.unapply(&top, from);
                return Err(err);
            }
            top = *hash;
        }
        Ok(())
    }

    /// Move the top of the applied path from `from` to `to`.
    ///
    /// # Panics
    ///
    /// If `from` and `to` have no common ancestor, or the original state cannot be restored after a
    /// failure.
    pub fn set_state(&mut self, from: &CryptoHash, to: &CryptoHash) -> Result<(), ApplyError> {
        let Some(fork) = self.tree.find_fork(from, to) else {
            panic!("blocks {} and {} have no common ancestor", from, to)
        };
        self.unapply(from, &fork);
        if let Err(err) = self.apply(&fork, to) {
            if let Err(restore) = self.apply(&fork, from) {
                panic!(
                    "{}: failed to restore state {} after a failed state change: {}",
                    H::NAME,
                    from,
                    restore
                );
            }
            return Err(err);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    #[error("block {hash} is not in the tree")]
    UnknownBlock { hash: CryptoHash },

    #[error("block {hash} is invalid")]
    InvalidBlock { hash: CryptoHash },

    #[error("payloads of block {hash} have not been attached")]
    MissingPayloads { hash: CryptoHash },

    #[error("block {hash} failed to apply: {source}")]
    BadCommand {
        hash: CryptoHash,
        source: CommandError,
    },

    #[error("payloads of block {hash} could not be loaded: {source}")]
    Store {
        hash: CryptoHash,
        source: PayloadStoreError,
    },
}

impl ApplyError {
    pub fn code(&self) -> &'static str {
        match self {
            ApplyError::UnknownBlock { .. } => "unknown-block",
            ApplyError::InvalidBlock { .. } => "invalid-block",
            ApplyError::MissingPayloads { .. } => "missing-payloads",
            ApplyError::BadCommand { source, .. } => source.code(),
            ApplyError::Store { source, .. } => source.code(),
        }
    }

    /// The block the error is about.
    pub fn block(&self) -> CryptoHash {
        match self {
            ApplyError::UnknownBlock { hash }
            | ApplyError::InvalidBlock { hash }
            | ApplyError::MissingPayloads { hash }
            | ApplyError::BadCommand { hash, .. }
            | ApplyError::Store { hash, .. } => *hash,
        }
    }
}
