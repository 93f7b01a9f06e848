/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Payloads that PoP blocks carry, and the records the block tree derives from them.
//!
//! A block tree never owns payload bodies. Nodes keep only [`PayloadId`]s, partitioned by
//! [`PayloadKind`]; the bodies live in a [`PayloadStore`](crate::pluggables::PayloadStore).

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    data_types::{CryptoHash, PayloadId},
    header::Header,
};

/// The closed set of payload kinds a PoP block can carry.
///
/// Within a block, payloads are applied kind by kind in the order of [`PayloadKind::ALL`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub enum PayloadKind {
    /// A header of the protecting tree, carried as context so that endorsements can point into it.
    ProtectingBlock,
    /// An [`EndorsementProof`] of a block of this tree.
    Endorsement,
}

impl PayloadKind {
    pub const ALL: [PayloadKind; 2] = [PayloadKind::ProtectingBlock, PayloadKind::Endorsement];

    /// Byte that prefixes this kind's ids and store keys.
    pub const fn tag(&self) -> u8 {
        match self {
            PayloadKind::ProtectingBlock => 0,
            PayloadKind::Endorsement => 1,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            PayloadKind::ProtectingBlock => "protecting-block",
            PayloadKind::Endorsement => "endorsement",
        }
    }
}

/// Proof, found in the protecting tree, that a block of this tree was published there.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct EndorsementProof {
    /// Hash of the endorsed block in this tree.
    pub endorsed: CryptoHash,
    /// Hash of the protecting tree block that contains the proof.
    pub block_of_proof: CryptoHash,
    /// Opaque data identifying who gets paid for this endorsement.
    pub payout_info: Vec<u8>,
}

impl EndorsementProof {
    pub fn new(endorsed: CryptoHash, block_of_proof: CryptoHash, payout_info: Vec<u8>) -> Self {
        Self {
            endorsed,
            block_of_proof,
            payout_info,
        }
    }

    pub fn id(&self) -> PayloadId {
        payload_id(PayloadKind::Endorsement, &self.try_to_vec().unwrap())
    }
}

/// An endorsement as recorded in the tree: an [`EndorsementProof`] together with the block that
/// contains it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endorsement {
    pub id: PayloadId,
    pub endorsed: CryptoHash,
    pub containing: CryptoHash,
    pub block_of_proof: CryptoHash,
}

impl Endorsement {
    pub fn from_proof(proof: &EndorsementProof, containing: CryptoHash) -> Endorsement {
        Endorsement {
            id: proof.id(),
            endorsed: proof.endorsed,
            containing,
            block_of_proof: proof.block_of_proof,
        }
    }
}

/// A payload body, as kept in the payload store.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum Payload<G> {
    ProtectingBlock(G),
    Endorsement(EndorsementProof),
}

impl<G: Header> Payload<G> {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::ProtectingBlock(_) => PayloadKind::ProtectingBlock,
            Payload::Endorsement(_) => PayloadKind::Endorsement,
        }
    }

    pub fn id(&self) -> PayloadId {
        match self {
            Payload::ProtectingBlock(header) => {
                payload_id(PayloadKind::ProtectingBlock, &header.try_to_vec().unwrap())
            }
            Payload::Endorsement(proof) => proof.id(),
        }
    }
}

fn payload_id(kind: PayloadKind, body: &[u8]) -> PayloadId {
    let mut bytes = Vec::with_capacity(body.len() + 1);
    bytes.push(kind.tag());
    bytes.extend_from_slice(body);
    PayloadId::new(CryptoHash::digest(&bytes).bytes())
}

/// The payload set of one block, as handed to
/// [`attach_payloads`](crate::pop_tree::PopTree::attach_payloads).
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PopData<G> {
    pub protecting_blocks: Vec<G>,
    pub endorsements: Vec<EndorsementProof>,
}

impl<G: Header> PopData<G> {
    pub fn new(protecting_blocks: Vec<G>, endorsements: Vec<EndorsementProof>) -> Self {
        Self {
            protecting_blocks,
            endorsements,
        }
    }

    pub fn empty() -> Self {
        Self {
            protecting_blocks: Vec::new(),
            endorsements: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.protecting_blocks.is_empty() && self.endorsements.is_empty()
    }

    /// Every payload of this set, in application order.
    pub fn into_payloads(self) -> Vec<Payload<G>> {
        self.protecting_blocks
            .into_iter()
            .map(Payload::ProtectingBlock)
            .chain(self.endorsements.into_iter().map(Payload::Endorsement))
            .collect()
    }
}

/// Payload ids attached to one block, partitioned by kind.
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PayloadIds {
    pub protecting_blocks: Vec<PayloadId>,
    pub endorsements: Vec<PayloadId>,
}

impl PayloadIds {
    pub fn of_kind(&self, kind: PayloadKind) -> &Vec<PayloadId> {
        match kind {
            PayloadKind::ProtectingBlock => &self.protecting_blocks,
            PayloadKind::Endorsement => &self.endorsements,
        }
    }

    pub(crate) fn push(&mut self, kind: PayloadKind, id: PayloadId) {
        match kind {
            PayloadKind::ProtectingBlock => self.protecting_blocks.push(id),
            PayloadKind::Endorsement => self.endorsements.push(id),
        }
    }

    /// Every id with its kind, in application order.
    pub fn iter(&self) -> impl Iterator<Item = (PayloadKind, &PayloadId)> + '_ {
        PayloadKind::ALL
            .into_iter()
            .flat_map(move |kind| self.of_kind(kind).iter().map(move |id| (kind, id)))
    }

    pub fn len(&self) -> usize {
        self.protecting_blocks.len() + self.endorsements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
