/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Commands: the replayable effects of payloads.
//!
//! Every payload attached to a block turns into one [`Command`] when the block is applied. The set of
//! commands is closed, one variant per [`PayloadKind`], and each variant knows how to
//! [execute](Command::execute) and [unexecute](Command::unexecute) itself. Executing a command and
//! then unexecuting it leaves the trees exactly as they were.

use borsh::BorshSerialize;

use crate::block_tree::{
    protecting::ProtectingTree,
    tree::{BlockTree, BlockTreeError},
};
use crate::config::PopParams;
use crate::types::{
    data_types::{BlockHeight, CryptoHash, PayloadId},
    header::Header,
    payloads::{Endorsement, Payload, PayloadKind},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command<G> {
    /// Take a reference on a header in the protecting tree, inserting it if needed.
    AddProtectingBlock(G),
    /// Record an endorsement of an ancestor of the containing block as applied.
    AddEndorsement(Endorsement),
}

impl<G: Header> Command<G> {
    /// The command for `payload`, attached to block `containing`.
    pub fn from_payload(payload: Payload<G>, containing: CryptoHash) -> Command<G> {
        match payload {
            Payload::ProtectingBlock(header) => Command::AddProtectingBlock(header),
            Payload::Endorsement(proof) => {
                Command::AddEndorsement(Endorsement::from_proof(&proof, containing))
            }
        }
    }

    pub fn kind(&self) -> PayloadKind {
        match self {
            Command::AddProtectingBlock(_) => PayloadKind::ProtectingBlock,
            Command::AddEndorsement(_) => PayloadKind::Endorsement,
        }
    }

    /// Serialized size, in bytes, of what the command carries.
    pub fn estimate_size(&self) -> usize {
        match self {
            Command::AddProtectingBlock(header) => header.try_to_vec().map(|bytes| bytes.len()).unwrap_or(0),
            // id, endorsed, containing and block of proof.
            Command::AddEndorsement(_) => 4 * 32,
        }
    }

    pub(crate) fn execute<H, P>(
        &self,
        tree: &mut BlockTree<H>,
        protecting: &mut P,
        params: &PopParams,
    ) -> Result<(), CommandError>
    where
        H: Header,
        P: ProtectingTree<Header = G>,
    {
        match self {
            Command::AddProtectingBlock(header) => protecting
                .add_context_block(header)
                .map_err(|source| CommandError::ProtectingBlockRejected {
                    hash: header.hash(),
                    source,
                }),

            Command::AddEndorsement(endorsement) => {
                let containing = tree.node(&endorsement.containing).ok_or(
                    CommandError::UnknownContainingBlock {
                        id: endorsement.id,
                        containing: endorsement.containing,
                    },
                )?;
                let endorsed = tree.node(&endorsement.endorsed).ok_or(
                    CommandError::UnknownEndorsedBlock {
                        id: endorsement.id,
                        endorsed: endorsement.endorsed,
                    },
                )?;
                if endorsed.height() >= containing.height()
                    || !tree.is_ancestor(&endorsement.endorsed, &endorsement.containing)
                {
                    return Err(CommandError::EndorsedNotAncestor {
                        id: endorsement.id,
                        endorsed: endorsement.endorsed,
                        containing: endorsement.containing,
                    });
                }
                let age = containing.height() - endorsed.height();
                if age > params.endorsement_settlement_interval {
                    return Err(CommandError::Expired {
                        id: endorsement.id,
                        endorsed_height: endorsed.height(),
                        containing_height: containing.height(),
                    });
                }
                let proven = protecting
                    .blocks()
                    .node(&endorsement.block_of_proof)
                    .is_some_and(|node| node.is_valid());
                if !proven {
                    return Err(CommandError::UnknownBlockOfProof {
                        id: endorsement.id,
                        block_of_proof: endorsement.block_of_proof,
                    });
                }

                if let Some(containing) = tree.node_mut(&endorsement.containing) {
                    containing.applied_endorsements.push(endorsement.id);
                }
                Ok(())
            }
        }
    }

    pub(crate) fn unexecute<H, P>(&self, tree: &mut BlockTree<H>, protecting: &mut P)
    where
        H: Header,
        P: ProtectingTree<Header = G>,
    {
        match self {
            Command::AddProtectingBlock(header) => protecting.remove_context_block(&header.hash()),

            Command::AddEndorsement(endorsement) => {
                if let Some(containing) = tree.node_mut(&endorsement.containing) {
                    if let Some(position) = containing
                        .applied_endorsements
                        .iter()
                        .rposition(|id| *id == endorsement.id)
                    {
                        containing.applied_endorsements.remove(position);
                    }
                }
            }
        }
    }
}

/// Why a command could not be executed. Recorded as the reason a block failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("protecting block {hash} rejected: {source}")]
    ProtectingBlockRejected {
        hash: CryptoHash,
        source: BlockTreeError,
    },

    #[error("endorsement {id}: containing block {containing} is unknown")]
    UnknownContainingBlock { id: PayloadId, containing: CryptoHash },

    #[error("endorsement {id}: endorsed block {endorsed} is unknown")]
    UnknownEndorsedBlock { id: PayloadId, endorsed: CryptoHash },

    #[error("endorsement {id}: endorsed block {endorsed} is not an ancestor of {containing}")]
    EndorsedNotAncestor {
        id: PayloadId,
        endorsed: CryptoHash,
        containing: CryptoHash,
    },

    #[error("endorsement {id}: endorsed block at {endorsed_height} is too old for a block at {containing_height}")]
    Expired {
        id: PayloadId,
        endorsed_height: BlockHeight,
        containing_height: BlockHeight,
    },

    #[error("endorsement {id}: block of proof {block_of_proof} is not a valid protecting block")]
    UnknownBlockOfProof {
        id: PayloadId,
        block_of_proof: CryptoHash,
    },
}

impl CommandError {
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::ProtectingBlockRejected { .. } => "bad-protecting-block",
            CommandError::UnknownContainingBlock { .. } => "unknown-containing-block",
            CommandError::UnknownEndorsedBlock { .. } => "unknown-endorsed-block",
            CommandError::EndorsedNotAncestor { .. } => "endorsed-not-ancestor",
            CommandError::Expired { .. } => "expired-endorsement",
            CommandError::UnknownBlockOfProof { .. } => "unknown-block-of-proof",
        }
    }
}
