/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The PoP-aware block tree of a protected ledger.
//!
//! A [`PopTree`] keeps the headers of one ledger (e.g. an altchain, or VBK) together with the PoP
//! payloads its blocks carry, and it tracks a protecting tree `P` that the payloads point into. It
//! is what a node of the protected ledger talks to:
//! 1. Headers come in through [`accept_header`](PopTree::accept_header).
//! 2. Payloads come in through [`attach_payloads`](PopTree::attach_payloads), and a block whose
//!    parent is connected is then [connected](PopTree::connect): its payloads are tried against
//!    its own chain, and the block is either connected or marked as failed.
//! 3. The active chain moves through [`set_state`](PopTree::set_state), or through
//!    [`compare_pop_score`](PopTree::compare_pop_score) when the node wants PoP fork resolution to
//!    decide between its current tip and a candidate.
//! 4. Old blocks are dropped with [`finalize_block`](PopTree::finalize_block).
//!
//! `PopTree` is itself a [`ProtectingTree`], so trees stack: an ALT `PopTree` can be protected by a
//! VBK `PopTree`, which is in turn protected by a BTC [`HeaderTree`](crate::block_tree::header_tree::HeaderTree).
//!
//! ## Events
//!
//! If an event publisher is set, every change is published as an [`Event`], which an
//! [`EventBus`](crate::event_bus::EventBus) can log or pass to handlers.

pub mod loader;

use std::collections::BTreeSet;
use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::block_tree::{
    chain::Chain,
    node::BlockNode,
    protecting::ProtectingTree,
    status::{BlockStatus, ValidityLevel},
    tree::{BlockTree, BlockTreeError},
};
use crate::commands::Command;
use crate::config::{ConfigError, PopParams};
use crate::events::*;
use crate::fork_resolution::{self, CancellationToken, ForkResolution};
use crate::payloads_index::PayloadsIndex;
use crate::pluggables::{PayloadStore, PayloadStoreError};
use crate::state_machine::{AppliedCommands, ApplyError, PopStateMachine};
use crate::types::{
    data_types::{BlockHeight, CryptoHash, PayloadId},
    header::Header,
    payloads::{Endorsement, Payload, PayloadIds, PayloadKind, PopData},
};

pub struct PopTree<H, P: ProtectingTree, S> {
    tree: BlockTree<H>,
    protecting: P,
    store: S,
    payloads_index: PayloadsIndex,
    applied: AppliedCommands<P::Header>,
    params: PopParams,
    event_publisher: Option<Sender<Event>>,
}

impl<H, P, S> PopTree<H, P, S>
where
    H: Header,
    P: ProtectingTree,
    S: PayloadStore,
{
    /// Create an empty tree over `protecting`, keeping payload bodies in `store`.
    pub fn new(params: PopParams, protecting: P, store: S) -> Result<Self, PopTreeError> {
        params.validate()?;
        Ok(Self {
            tree: BlockTree::new(),
            protecting,
            store,
            payloads_index: PayloadsIndex::new(),
            applied: AppliedCommands::new(),
            params,
            event_publisher: None,
        })
    }

    pub fn set_event_publisher(&mut self, event_publisher: Sender<Event>) {
        self.event_publisher = Some(event_publisher);
    }

    /* ↓↓↓ Accessors ↓↓↓ */

    pub fn blocks(&self) -> &BlockTree<H> {
        &self.tree
    }

    pub fn protecting(&self) -> &P {
        &self.protecting
    }

    /// The protecting tree, e.g. to feed it headers directly.
    pub fn protecting_mut(&mut self) -> &mut P {
        &mut self.protecting
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn payloads_index(&self) -> &PayloadsIndex {
        &self.payloads_index
    }

    pub fn params(&self) -> &PopParams {
        &self.params
    }

    /* ↓↓↓ Queries ↓↓↓ */

    pub fn node(&self, hash: &CryptoHash) -> Option<&BlockNode<H>> {
        self.tree.node(hash)
    }

    pub fn tips(&self) -> &BTreeSet<CryptoHash> {
        self.tree.tips()
    }

    pub fn best_chain(&self) -> &Chain {
        self.tree.best_chain()
    }

    pub fn best_tip(&self) -> Option<&BlockNode<H>> {
        self.tree.best_tip()
    }

    pub fn find_fork(&self, a: &CryptoHash, b: &CryptoHash) -> Option<CryptoHash> {
        self.tree.find_fork(a, b)
    }

    pub fn ancestor_at(&self, hash: &CryptoHash, height: BlockHeight) -> Option<CryptoHash> {
        self.tree.ancestor_at(hash, height)
    }

    /// Connected descendants of `hash` that have no connected child, i.e. the candidates a node may
    /// want to compare against its active chain after `hash` was connected.
    pub fn connected_tips_after(&self, hash: &CryptoHash) -> Vec<CryptoHash> {
        let connected = |hash: &CryptoHash| {
            self.tree
                .node(hash)
                .is_some_and(|node| node.is_valid_up_to(ValidityLevel::Connected))
        };
        let mut candidates = vec![*hash];
        candidates.extend(self.tree.descendants(hash));
        candidates
            .into_iter()
            .filter(|candidate| connected(candidate))
            .filter(|candidate| match self.tree.node(candidate) {
                Some(node) => !node.children().any(|child| connected(child)),
                None => false,
            })
            .collect()
    }

    /// Sum of the estimated sizes of the payloads attached to `hash`.
    pub fn estimate_payloads_size(&self, hash: &CryptoHash) -> Result<usize, PopTreeError> {
        let node = self
            .tree
            .node(hash)
            .ok_or(PopTreeError::UnknownBlock { hash: *hash })?;
        let mut size = 0;
        for (kind, id) in node.payload_ids().iter() {
            let payload = self.store.payload::<P::Header>(kind, id)?;
            size += Command::from_payload(payload, *hash).estimate_size();
        }
        Ok(size)
    }

    /* ↓↓↓ Structure ↓↓↓ */

    pub fn bootstrap(&mut self, header: H, height: BlockHeight) -> Result<CryptoHash, PopTreeError> {
        let hash = self.tree.bootstrap(header, height)?;
        log::debug!("{}: bootstrapped at {} with block {}", H::NAME, height, hash);
        self.publish_accept_header(&hash);
        Ok(hash)
    }

    pub fn accept_header(&mut self, header: H) -> Result<CryptoHash, PopTreeError> {
        let hash = self.tree.accept_header(header)?;
        self.publish_accept_header(&hash);
        Ok(hash)
    }

    /// Record `pop_data` as the payloads of block `hash`. The bodies go to the payload store, the
    /// block keeps their ids.
    ///
    /// Fails without changing anything if the block already has payloads, is the bootstrap block,
    /// is applied, is not tree-valid, or if a payload appears twice in `pop_data` or already on the
    /// block's chain.
    pub fn attach_payloads(
        &mut self,
        hash: &CryptoHash,
        pop_data: PopData<P::Header>,
    ) -> Result<(), PopTreeError> {
        let node = self
            .tree
            .node(hash)
            .ok_or(PopTreeError::UnknownBlock { hash: *hash })?;
        if node.has_payloads() {
            return Err(PopTreeError::AlreadyHasPayloads { hash: *hash });
        }
        if node.is_bootstrap() {
            return Err(PopTreeError::PayloadsOnBootstrap { hash: *hash });
        }
        if node.is_applied() {
            return Err(PopTreeError::PayloadsOnAppliedBlock { hash: *hash });
        }
        if !node.is_valid_up_to(ValidityLevel::Tree) {
            return Err(PopTreeError::NotTreeValid { hash: *hash });
        }

        let payloads = pop_data.into_payloads();
        let ids: Vec<PayloadId> = payloads.iter().map(|payload| payload.id()).collect();
        if let Some(id) = PayloadsIndex::stateless_duplicate(&ids) {
            return Err(PopTreeError::DuplicatePayload { id, hash: *hash });
        }
        if let Some(id) = ids
            .iter()
            .find(|id| self.payloads_index.is_stateful_duplicate(id, hash, &self.tree))
        {
            return Err(PopTreeError::DuplicatePayload { id: *id, hash: *hash });
        }

        for payload in &payloads {
            self.store.put_payload(payload)?;
        }
        if let Some(node) = self.tree.node_mut(hash) {
            for payload in &payloads {
                node.payload_ids.push(payload.kind(), payload.id());
            }
            node.status.set(BlockStatus::HAS_PAYLOADS);
        }
        for id in ids {
            self.payloads_index.add(id, *hash);
        }
        log::debug!(
            "{}: attached {} payloads to block {}",
            H::NAME,
            payloads.len(),
            hash
        );
        Ok(())
    }

    /// Try to connect block `hash`, and then every descendant with payloads that was waiting on it.
    ///
    /// Connecting a block applies it on its own chain and goes back to the active tip. The protecting
    /// tree is restored to its best tip afterwards, but the context blocks of the trial may have
    /// moved it in between, and its listeners see those moves as a pair of tip changes.
    ///
    /// Returns `Ok(true)` if `hash` is connected, and `Ok(false)` if its payloads do not apply on its
    /// chain, in which case it is marked with [`BlockStatus::FAILED_POP`].
    pub fn connect(&mut self, hash: &CryptoHash) -> Result<bool, PopTreeError> {
        let node = self
            .tree
            .node(hash)
            .ok_or(PopTreeError::UnknownBlock { hash: *hash })?;
        if node.is_valid_up_to(ValidityLevel::Connected) {
            return Ok(true);
        }
        if !node.is_valid() {
            return Ok(false);
        }
        if !node.has_payloads() {
            return Err(PopTreeError::MissingPayloads { hash: *hash });
        }
        let parent_connected = node
            .prev()
            .and_then(|prev| self.tree.node(&prev))
            .is_some_and(|parent| parent.is_valid_up_to(ValidityLevel::Connected));
        if !parent_connected {
            return Err(PopTreeError::ParentNotConnected { hash: *hash });
        }

        let connected = self.connect_one(hash)?;
        if !connected {
            return Ok(false);
        }

        let mut stack = self.waiting_children(hash);
        while let Some(child) = stack.pop() {
            if self.connect_one(&child)? {
                stack.extend(self.waiting_children(&child));
            }
        }
        Ok(true)
    }

    /// Accept a header together with its payloads, and connect it if its parent is connected.
    /// Returns whether the block is connected.
    pub fn accept_block(
        &mut self,
        header: H,
        pop_data: PopData<P::Header>,
    ) -> Result<bool, PopTreeError> {
        let hash = header.hash();
        if !self.tree.contains(&hash) {
            self.accept_header(header)?;
        }
        self.attach_payloads(&hash, pop_data)?;
        let parent_connected = self
            .tree
            .node(&hash)
            .and_then(|node| node.prev())
            .and_then(|prev| self.tree.node(&prev))
            .is_some_and(|parent| parent.is_valid_up_to(ValidityLevel::Connected));
        if parent_connected {
            self.connect(&hash)
        } else {
            Ok(false)
        }
    }

    /// Detach every payload from block `hash`. The block and its connected descendants go back to
    /// tree-valid, and a [`BlockStatus::FAILED_POP`] on the block is cleared. So is the one on any
    /// descendant that only failed for repeating a payload of `hash`.
    pub fn remove_payloads(&mut self, hash: &CryptoHash) -> Result<(), PopTreeError> {
        let node = self
            .tree
            .node(hash)
            .ok_or(PopTreeError::UnknownBlock { hash: *hash })?;
        if node.is_bootstrap() {
            return Err(PopTreeError::PayloadsOnBootstrap { hash: *hash });
        }
        if !node.has_payloads() {
            return Ok(());
        }
        let mut affected = vec![*hash];
        affected.extend(self.tree.descendants(hash));
        if let Some(applied) = affected
            .iter()
            .find(|member| self.tree.node(member).is_some_and(|node| node.is_applied()))
        {
            return Err(PopTreeError::PayloadsOnAppliedBlock { hash: *applied });
        }

        for member in &affected {
            self.disconnect(member);
        }
        let ids = match self.tree.node_mut(hash) {
            Some(node) => {
                node.status.unset(BlockStatus::HAS_PAYLOADS);
                std::mem::take(&mut node.payload_ids)
            }
            None => PayloadIds::default(),
        };
        for (_, id) in ids.iter() {
            self.payloads_index.remove(id, hash);
        }
        self.revalidate_subtree(hash, BlockStatus::FAILED_POP);

        // Descendants that failed for repeating one of the removed payloads may connect again.
        let mut repeaters: Vec<CryptoHash> = ids
            .iter()
            .flat_map(|(_, id)| self.payloads_index.containing_blocks(id).copied())
            .filter(|block| block != hash && self.tree.is_ancestor(hash, block))
            .collect();
        repeaters.sort();
        repeaters.dedup();
        for block in repeaters {
            let still_duplicate = self.tree.node(&block).map_or(true, |node| {
                node.payload_ids()
                    .iter()
                    .any(|(_, id)| self.payloads_index.is_stateful_duplicate(id, &block, &self.tree))
            });
            if !still_duplicate {
                self.revalidate_subtree(&block, BlockStatus::FAILED_POP);
            }
        }
        log::debug!("{}: removed payloads of block {}", H::NAME, hash);
        Ok(())
    }

    /// Remove block `hash` and all of its descendants from the tree, with their index entries.
    ///
    /// Fails if `hash` is the root, or if any block of the subtree is applied.
    pub fn remove_subtree(&mut self, hash: &CryptoHash) -> Result<(), PopTreeError> {
        let removed = self.tree.remove_subtree(hash)?;
        for node in &removed {
            self.forget(node);
            Event::publish(
                &self.event_publisher,
                Event::RemoveBlock(RemoveBlockEvent {
                    timestamp: SystemTime::now(),
                    chain: H::NAME,
                    block: node.hash(),
                    height: node.height(),
                }),
            );
        }
        Ok(())
    }

    /// Mark block `hash` failed with `reason`, and its descendants with
    /// [`BlockStatus::FAILED_CHILD`]. If the block is on the active chain, the active chain first
    /// moves to its parent.
    pub fn invalidate_subtree(&mut self, hash: &CryptoHash, reason: u32) -> Result<(), PopTreeError> {
        if reason == 0 || reason & BlockStatus::FAILED_MASK != reason {
            return Err(PopTreeError::BadInvalidationReason { reason });
        }
        let node = self
            .tree
            .node(hash)
            .ok_or(PopTreeError::UnknownBlock { hash: *hash })?;
        if node.is_bootstrap() {
            return Err(PopTreeError::InvalidateRoot { hash: *hash });
        }
        if node.is_applied() {
            if let Some(parent) = node.prev() {
                self.move_active_chain(&parent)?;
            }
        }

        let changed = self.tree.invalidate_subtree(hash, reason);
        if !changed.is_empty() {
            log::debug!(
                "{}: invalidated block {} and {} descendants",
                H::NAME,
                hash,
                changed.len() - 1
            );
            Event::publish(
                &self.event_publisher,
                Event::InvalidateBlock(InvalidateBlockEvent {
                    timestamp: SystemTime::now(),
                    chain: H::NAME,
                    block: *hash,
                    reason,
                }),
            );
        }
        Ok(())
    }

    /// Clear failure flag `reason` from block `hash`, and [`BlockStatus::FAILED_CHILD`] from the
    /// descendants that have no other failed ancestor.
    pub fn revalidate_subtree(&mut self, hash: &CryptoHash, reason: u32) {
        let changed = self.tree.revalidate_subtree(hash, reason);
        if !changed.is_empty() {
            Event::publish(
                &self.event_publisher,
                Event::RevalidateBlock(RevalidateBlockEvent {
                    timestamp: SystemTime::now(),
                    chain: H::NAME,
                    block: *hash,
                    reason,
                }),
            );
        }
    }

    /* ↓↓↓ Active chain ↓↓↓ */

    /// Make block `hash` the tip of the active chain, applying and unapplying payloads on the way.
    /// If any block on the way fails to apply, the active chain stays where it was.
    pub fn set_state(&mut self, hash: &CryptoHash) -> Result<(), PopTreeError> {
        let node = self
            .tree
            .node(hash)
            .ok_or(PopTreeError::UnknownBlock { hash: *hash })?;
        if !node.is_valid_up_to(ValidityLevel::Connected) {
            return Err(PopTreeError::NotConnected { hash: *hash });
        }
        if let Some(finalized) = self.tree.last_finalized() {
            if !self.tree.is_ancestor(&finalized.hash(), hash) {
                return Err(PopTreeError::ReorgBelowFinalized {
                    hash: *hash,
                    finalized: finalized.hash(),
                });
            }
        }
        self.move_active_chain(hash)
    }

    /// Run PoP fork resolution between the active chain and the chain ending at `candidate`, and make
    /// `candidate` the active tip if it wins. A valid candidate must be connected; invalid candidates
    /// always lose.
    pub fn compare_pop_score(
        &mut self,
        candidate: &CryptoHash,
        cancel: &CancellationToken,
    ) -> Result<ForkResolution, PopTreeError> {
        let node = self
            .tree
            .node(candidate)
            .ok_or(PopTreeError::UnknownBlock { hash: *candidate })?;
        if node.is_valid() && !node.is_valid_up_to(ValidityLevel::Connected) {
            return Err(PopTreeError::NotConnected { hash: *candidate });
        }
        let Some(current) = self.tree.best_chain().tip() else {
            return Err(BlockTreeError::NotBootstrapped.into());
        };

        let outcome = {
            let mut state_machine = PopStateMachine::new(
                &mut self.tree,
                &mut self.protecting,
                &self.store,
                &self.params,
                &mut self.applied,
            );
            fork_resolution::compare_pop_score(&mut state_machine, &self.params, candidate, cancel)
        };

        match outcome {
            ForkResolution::CandidateWins => self.set_active_tip(candidate),
            ForkResolution::Cancelled => {
                log::warn!("{}: fork resolution against {} was cancelled", H::NAME, candidate)
            }
            _ => {}
        }
        Event::publish(
            &self.event_publisher,
            Event::ForkResolution(ForkResolutionEvent {
                timestamp: SystemTime::now(),
                chain: H::NAME,
                current,
                candidate: *candidate,
                outcome,
            }),
        );
        Ok(outcome)
    }

    /// Finalize block `hash`: it and its ancestors can no longer be reorganized away, branches that do
    /// not contain it are removed, and blocks more than
    /// [`preserve_blocks_behind_final`](PopParams::preserve_blocks_behind_final) below it are
    /// deallocated.
    pub fn finalize_block(&mut self, hash: &CryptoHash) -> Result<(), PopTreeError> {
        let node = self
            .tree
            .node(hash)
            .ok_or(PopTreeError::UnknownBlock { hash: *hash })?;
        if !self.tree.best_chain().contains(node) {
            return Err(PopTreeError::NotOnActiveChain { hash: *hash });
        }
        let height = node.height();

        let removed = self
            .tree
            .finalize(hash, self.params.preserve_blocks_behind_final);
        for node in &removed {
            self.forget(node);
            Event::publish(
                &self.event_publisher,
                Event::RemoveBlock(RemoveBlockEvent {
                    timestamp: SystemTime::now(),
                    chain: H::NAME,
                    block: node.hash(),
                    height: node.height(),
                }),
            );
        }
        log::debug!(
            "{}: finalized block {} at {}, {} blocks removed",
            H::NAME,
            hash,
            height,
            removed.len()
        );
        Event::publish(
            &self.event_publisher,
            Event::FinalizeBlock(FinalizeBlockEvent {
                timestamp: SystemTime::now(),
                chain: H::NAME,
                block: *hash,
                height,
            }),
        );
        Ok(())
    }

    /* ↓↓↓ Helpers ↓↓↓ */

    fn state_machine(&mut self) -> PopStateMachine<'_, H, P, S> {
        PopStateMachine::new(
            &mut self.tree,
            &mut self.protecting,
            &self.store,
            &self.params,
            &mut self.applied,
        )
    }

    /// Move the applied state and the active chain to `hash`.
    fn move_active_chain(&mut self, hash: &CryptoHash) -> Result<(), PopTreeError> {
        let Some(current) = self.tree.best_chain().tip() else {
            return Err(BlockTreeError::NotBootstrapped.into());
        };
        if current == *hash {
            return Ok(());
        }
        self.state_machine().set_state(&current, hash)?;
        self.set_active_tip(hash);
        Ok(())
    }

    fn set_active_tip(&mut self, hash: &CryptoHash) {
        if let Some(node) = self.tree.node(hash) {
            Event::publish(
                &self.event_publisher,
                Event::BeforeTipChange(BeforeTipChangeEvent {
                    timestamp: SystemTime::now(),
                    chain: H::NAME,
                    old_tip: self.tree.best_chain().tip(),
                    new_tip: *hash,
                    height: node.height(),
                }),
            );
        }
        self.tree.set_active_tip(hash);
    }

    /// Connect one block whose parent is connected.
    fn connect_one(&mut self, hash: &CryptoHash) -> Result<bool, PopTreeError> {
        let Some(node) = self.tree.node(hash) else {
            return Ok(false);
        };
        let duplicate = node
            .payload_ids()
            .iter()
            .map(|(_, id)| *id)
            .find(|id| self.payloads_index.is_stateful_duplicate(id, hash, &self.tree));
        if let Some(id) = duplicate {
            self.tree.invalidate_subtree(hash, BlockStatus::FAILED_POP);
            self.publish_connect_failed(hash, format!("payload {} is already on the chain", id));
            return Ok(false);
        }

        // Trial: apply the block on its own chain, then go back to the active chain.
        let Some(active) = self.tree.best_chain().tip() else {
            return Err(BlockTreeError::NotBootstrapped.into());
        };
        let protecting_tip = self.protecting.blocks().best_chain().tip();
        let mut state_machine = self.state_machine();
        let trial = state_machine.set_state(&active, hash);
        if trial.is_ok() {
            if let Err(err) = state_machine.set_state(hash, &active) {
                panic!(
                    "{}: failed to return to active tip {} after connecting {}: {}",
                    H::NAME,
                    active,
                    hash,
                    err
                );
            }
        }
        if let Some(tip) = protecting_tip {
            self.protecting.restore_best_tip(&tip);
        }

        match trial {
            Ok(()) => {}
            Err(err @ (ApplyError::BadCommand { .. } | ApplyError::InvalidBlock { .. })) => {
                self.publish_connect_failed(hash, err.to_string());
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        }

        if let Some(node) = self.tree.node_mut(hash) {
            node.status.raise_validity(ValidityLevel::Connected);
        }
        self.index_endorsements(hash)?;

        if let Some(node) = self.tree.node(hash) {
            log::debug!("{}: connected block {} at {}", H::NAME, hash, node.height());
            Event::publish(
                &self.event_publisher,
                Event::BlockConnected(BlockConnectedEvent {
                    timestamp: SystemTime::now(),
                    chain: H::NAME,
                    block: *hash,
                    height: node.height(),
                }),
            );
        }
        Ok(true)
    }

    /// Children of `hash` that carry payloads and wait to be connected.
    fn waiting_children(&self, hash: &CryptoHash) -> Vec<CryptoHash> {
        let Some(node) = self.tree.node(hash) else {
            return Vec::new();
        };
        node.children()
            .filter(|child| {
                self.tree.node(child).is_some_and(|child| {
                    child.has_payloads()
                        && child.is_valid()
                        && !child.is_valid_up_to(ValidityLevel::Connected)
                })
            })
            .copied()
            .collect()
    }

    /// Record the endorsements contained in block `hash` in the `endorsed_by` sets of the blocks
    /// they endorse.
    pub(crate) fn index_endorsements(&mut self, hash: &CryptoHash) -> Result<(), PopTreeError> {
        let Some(node) = self.tree.node(hash) else {
            return Ok(());
        };
        let mut endorsements = Vec::with_capacity(node.payload_ids().endorsements.len());
        for id in &node.payload_ids().endorsements {
            match self.store.payload::<P::Header>(PayloadKind::Endorsement, id)? {
                Payload::Endorsement(proof) => {
                    endorsements.push(Endorsement::from_proof(&proof, *hash))
                }
                Payload::ProtectingBlock(_) => {
                    return Err(PayloadStoreError::KindMismatch {
                        expected: PayloadKind::Endorsement,
                        id: *id,
                    }
                    .into())
                }
            }
        }
        for endorsement in &endorsements {
            if let Some(endorsed) = self.tree.node_mut(&endorsement.endorsed) {
                endorsed.endorsed_by.insert(endorsement.clone());
            }
        }
        if let Some(node) = self.tree.node_mut(hash) {
            node.containing_endorsements = endorsements;
        }
        Ok(())
    }

    /// Undo what connecting block `hash` recorded: its endorsements leave the `endorsed_by` sets, and
    /// its validity goes back to tree-valid.
    fn disconnect(&mut self, hash: &CryptoHash) {
        let Some(node) = self.tree.node_mut(hash) else {
            return;
        };
        let endorsements = std::mem::take(&mut node.containing_endorsements);
        node.status.lower_validity(ValidityLevel::Tree);
        for endorsement in &endorsements {
            if let Some(endorsed) = self.tree.node_mut(&endorsement.endorsed) {
                endorsed.endorsed_by.remove(endorsement);
            }
        }
    }

    /// Drop the index entries of a node that was removed from the tree.
    fn forget(&mut self, node: &BlockNode<H>) {
        self.payloads_index.remove_block(node);
        self.applied.remove(&node.hash());
        for endorsement in node.containing_endorsements() {
            if let Some(endorsed) = self.tree.node_mut(&endorsement.endorsed) {
                endorsed.endorsed_by.remove(endorsement);
            }
        }
    }

    fn publish_accept_header(&self, hash: &CryptoHash) {
        if let Some(node) = self.tree.node(hash) {
            Event::publish(
                &self.event_publisher,
                Event::AcceptHeader(AcceptHeaderEvent {
                    timestamp: SystemTime::now(),
                    chain: H::NAME,
                    block: *hash,
                    height: node.height(),
                }),
            );
        }
    }

    fn publish_connect_failed(&self, hash: &CryptoHash, reason: String) {
        log::debug!("{}: block {} failed to connect: {}", H::NAME, hash, reason);
        if let Some(node) = self.tree.node(hash) {
            Event::publish(
                &self.event_publisher,
                Event::BlockConnectFailed(BlockConnectFailedEvent {
                    timestamp: SystemTime::now(),
                    chain: H::NAME,
                    block: *hash,
                    height: node.height(),
                    reason,
                }),
            );
        }
    }
}

impl<H, P, S> ProtectingTree for PopTree<H, P, S>
where
    H: Header,
    P: ProtectingTree,
    S: PayloadStore,
{
    type Header = H;

    fn blocks(&self) -> &BlockTree<H> {
        &self.tree
    }

    fn add_context_block(&mut self, header: &H) -> Result<(), BlockTreeError> {
        let hash = header.hash();
        if let Some(node) = self.tree.node_mut(&hash) {
            node.references += 1;
            return Ok(());
        }
        self.tree.insert_header(header.clone())?;
        let valid = match self.tree.node_mut(&hash) {
            Some(node) => {
                node.references = 1;
                node.is_valid()
            }
            None => false,
        };
        if !valid {
            if let Err(err) = self.tree.remove_subtree(&hash) {
                log::warn!("{}: could not drop unusable context block {}: {}", H::NAME, hash, err);
            }
            return Err(BlockTreeError::BadChain { hash });
        }
        self.publish_accept_header(&hash);
        Ok(())
    }

    fn remove_context_block(&mut self, hash: &CryptoHash) {
        let mut cursor = Some(*hash);
        let mut released = true;
        while let Some(current) = cursor {
            let Some(node) = self.tree.node_mut(&current) else {
                break;
            };
            if released {
                node.references = node.references.saturating_sub(1);
                released = false;
            }
            let in_use = node.references > 0
                || node.children().next().is_some()
                || node.is_bootstrap()
                || node.is_applied()
                || node.has_payloads();
            if in_use {
                break;
            }
            let prev = node.prev();
            if self.remove_subtree(&current).is_err() {
                break;
            }
            cursor = prev;
        }
    }

    fn restore_best_tip(&mut self, hash: &CryptoHash) {
        if self.tree.best_chain().tip() == Some(*hash) {
            return;
        }
        if let Err(err) = self.set_state(hash) {
            log::warn!("{}: could not restore best tip {}: {}", H::NAME, hash, err);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PopTreeError {
    #[error(transparent)]
    Tree(#[from] BlockTreeError),

    #[error(transparent)]
    Store(#[from] PayloadStoreError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("block {hash} is not in the tree")]
    UnknownBlock { hash: CryptoHash },

    #[error("block {hash} already has payloads")]
    AlreadyHasPayloads { hash: CryptoHash },

    #[error("block {hash} is not a valid block of the tree")]
    NotTreeValid { hash: CryptoHash },

    #[error("bootstrap block {hash} cannot carry payloads")]
    PayloadsOnBootstrap { hash: CryptoHash },

    #[error("payloads of applied block {hash} cannot change")]
    PayloadsOnAppliedBlock { hash: CryptoHash },

    #[error("payload {id} of block {hash} is a duplicate")]
    DuplicatePayload { id: PayloadId, hash: CryptoHash },

    #[error("block {hash} has no payloads to connect")]
    MissingPayloads { hash: CryptoHash },

    #[error("parent of block {hash} is not connected")]
    ParentNotConnected { hash: CryptoHash },

    #[error("block {hash} is not connected")]
    NotConnected { hash: CryptoHash },

    #[error("block {hash} does not contain finalized block {finalized}")]
    ReorgBelowFinalized { hash: CryptoHash, finalized: CryptoHash },

    #[error("block {hash} is not on the active chain")]
    NotOnActiveChain { hash: CryptoHash },

    #[error("{reason:#b} is not a failure flag")]
    BadInvalidationReason { reason: u32 },

    #[error("root block {hash} cannot be invalidated")]
    InvalidateRoot { hash: CryptoHash },

    #[error("stored block {hash} at {height} does not follow its parent at {parent_height}")]
    InconsistentHeight {
        hash: CryptoHash,
        height: BlockHeight,
        parent_height: BlockHeight,
    },
}

impl PopTreeError {
    /// Machine-readable code of this error.
    pub fn code(&self) -> &'static str {
        match self {
            PopTreeError::Tree(err) => err.code(),
            PopTreeError::Store(err) => err.code(),
            PopTreeError::Apply(err) => err.code(),
            PopTreeError::Config(_) => "bad-config",
            PopTreeError::UnknownBlock { .. } => "unknown-block",
            PopTreeError::AlreadyHasPayloads { .. } => "already-has-payloads",
            PopTreeError::NotTreeValid { .. } => "not-tree-valid",
            PopTreeError::PayloadsOnBootstrap { .. } => "payloads-on-bootstrap",
            PopTreeError::PayloadsOnAppliedBlock { .. } => "payloads-on-applied-block",
            PopTreeError::DuplicatePayload { .. } => "duplicate-payload",
            PopTreeError::MissingPayloads { .. } => "missing-payloads",
            PopTreeError::ParentNotConnected { .. } => "parent-not-connected",
            PopTreeError::NotConnected { .. } => "not-connected",
            PopTreeError::ReorgBelowFinalized { .. } => "reorg-below-finalized",
            PopTreeError::NotOnActiveChain { .. } => "not-on-active-chain",
            PopTreeError::BadInvalidationReason { .. } => "bad-invalidation-reason",
            PopTreeError::InvalidateRoot { .. } => "invalidate-root",
            PopTreeError::InconsistentHeight { .. } => "inconsistent-height",
        }
    }
}
