/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! In-memory record of one block header and everything a tree tracks about it.
//!
//! Parent and child links are stored as hashes. The owning [`BlockTree`](super::tree::BlockTree) is
//! the only place nodes live; everything else looks them up by hash.

use std::collections::{BTreeSet, HashSet};

use crate::block_tree::status::{BlockStatus, ValidityLevel};
use crate::types::{
    data_types::{BlockHeight, ChainWork, CryptoHash, PayloadId, Timestamp},
    header::Header,
    payloads::{Endorsement, PayloadIds},
};

#[derive(Clone, Debug)]
pub struct BlockNode<H> {
    pub(crate) header: H,
    pub(crate) hash: CryptoHash,
    pub(crate) height: BlockHeight,
    pub(crate) prev: Option<CryptoHash>,
    pub(crate) next: BTreeSet<CryptoHash>,
    pub(crate) status: BlockStatus,
    pub(crate) chain_work: ChainWork,
    pub(crate) payload_ids: PayloadIds,
    /// Endorsements of this block contained in connected blocks anywhere in the tree.
    pub(crate) endorsed_by: HashSet<Endorsement>,
    /// Endorsements contained in this block that it contributed to other nodes' `endorsed_by`.
    pub(crate) containing_endorsements: Vec<Endorsement>,
    /// Endorsements contained in this block whose effects are currently applied.
    pub(crate) applied_endorsements: Vec<PayloadId>,
    /// Number of holders (direct acceptance or context payloads in a tree above) keeping this node.
    pub(crate) references: u32,
    pub(crate) ever_applied: bool,
    pub(crate) finalized: bool,
}

impl<H: Header> BlockNode<H> {
    pub(crate) fn new(
        header: H,
        height: BlockHeight,
        prev: Option<CryptoHash>,
        chain_work: ChainWork,
    ) -> BlockNode<H> {
        BlockNode {
            hash: header.hash(),
            header,
            height,
            prev,
            next: BTreeSet::new(),
            status: BlockStatus::default(),
            chain_work,
            payload_ids: PayloadIds::default(),
            endorsed_by: HashSet::new(),
            containing_endorsements: Vec::new(),
            applied_endorsements: Vec::new(),
            references: 0,
            ever_applied: false,
            finalized: false,
        }
    }

    pub fn header(&self) -> &H {
        &self.header
    }

    pub fn hash(&self) -> CryptoHash {
        self.hash
    }

    pub fn height(&self) -> BlockHeight {
        self.height
    }

    pub fn timestamp(&self) -> Timestamp {
        self.header.timestamp()
    }

    /// Hash of the parent node, or `None` for the root.
    pub fn prev(&self) -> Option<CryptoHash> {
        self.prev
    }

    pub fn children(&self) -> impl Iterator<Item = &CryptoHash> {
        self.next.iter()
    }

    pub fn status(&self) -> BlockStatus {
        self.status
    }

    pub fn chain_work(&self) -> ChainWork {
        self.chain_work
    }

    pub fn is_valid(&self) -> bool {
        self.status.is_valid()
    }

    pub fn is_valid_up_to(&self, level: ValidityLevel) -> bool {
        self.status.is_valid_up_to(level)
    }

    pub fn is_connected(&self) -> bool {
        self.is_valid_up_to(ValidityLevel::Connected)
    }

    pub fn has_payloads(&self) -> bool {
        self.status.has(BlockStatus::HAS_PAYLOADS)
    }

    pub fn is_applied(&self) -> bool {
        self.status.has(BlockStatus::APPLIED)
    }

    pub fn is_bootstrap(&self) -> bool {
        self.status.has(BlockStatus::BOOTSTRAP)
    }

    /// Whether this block's payloads were applied at least once since it entered the tree. Blocks
    /// restored by a fast load keep their stored validity but have not been applied yet.
    pub fn was_ever_applied(&self) -> bool {
        self.ever_applied
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn payload_ids(&self) -> &PayloadIds {
        &self.payload_ids
    }

    pub fn endorsed_by(&self) -> impl Iterator<Item = &Endorsement> {
        self.endorsed_by.iter()
    }

    pub fn containing_endorsements(&self) -> &[Endorsement] {
        &self.containing_endorsements
    }

    pub fn applied_endorsements(&self) -> &[PayloadId] {
        &self.applied_endorsements
    }

    pub fn references(&self) -> u32 {
        self.references
    }
}
