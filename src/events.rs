/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of block tree events for event handling and logging.
//!
//! Every event names the ledger of the tree that emitted it (e.g. "ALT") in its `chain` field.
//! Except for [`BeforeTipChange`](Event::BeforeTipChange), an event indicates that the action it
//! describes has been completed.

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::fork_resolution::ForkResolution;
use crate::types::data_types::{BlockHeight, CryptoHash};

pub enum Event {
    // Events that change the structure of a tree.
    AcceptHeader(AcceptHeaderEvent),
    RemoveBlock(RemoveBlockEvent),
    FinalizeBlock(FinalizeBlockEvent),
    // Events that change the validity of blocks.
    BlockConnected(BlockConnectedEvent),
    BlockConnectFailed(BlockConnectFailedEvent),
    InvalidateBlock(InvalidateBlockEvent),
    RevalidateBlock(RevalidateBlockEvent),
    // Events that change, or decide on, the active chain.
    BeforeTipChange(BeforeTipChangeEvent),
    ForkResolution(ForkResolutionEvent),
}

impl Event {
    pub(crate) fn publish(event_publisher: &Option<Sender<Event>>, event: Event) {
        if let Some(event_publisher) = event_publisher {
            // Nobody listening is not an error for the tree.
            let _ = event_publisher.send(event);
        }
    }
}

pub struct AcceptHeaderEvent {
    pub timestamp: SystemTime,
    pub chain: &'static str,
    pub block: CryptoHash,
    pub height: BlockHeight,
}

pub struct RemoveBlockEvent {
    pub timestamp: SystemTime,
    pub chain: &'static str,
    pub block: CryptoHash,
    pub height: BlockHeight,
}

pub struct FinalizeBlockEvent {
    pub timestamp: SystemTime,
    pub chain: &'static str,
    pub block: CryptoHash,
    pub height: BlockHeight,
}

pub struct BlockConnectedEvent {
    pub timestamp: SystemTime,
    pub chain: &'static str,
    pub block: CryptoHash,
    pub height: BlockHeight,
}

pub struct BlockConnectFailedEvent {
    pub timestamp: SystemTime,
    pub chain: &'static str,
    pub block: CryptoHash,
    pub height: BlockHeight,
    /// Human-readable reason, e.g. the command that failed.
    pub reason: String,
}

pub struct InvalidateBlockEvent {
    pub timestamp: SystemTime,
    pub chain: &'static str,
    pub block: CryptoHash,
    /// The failure flag that was set, see [`BlockStatus`](crate::block_tree::status::BlockStatus).
    pub reason: u32,
}

pub struct RevalidateBlockEvent {
    pub timestamp: SystemTime,
    pub chain: &'static str,
    pub block: CryptoHash,
    /// The failure flag that was cleared.
    pub reason: u32,
}

pub struct BeforeTipChangeEvent {
    pub timestamp: SystemTime,
    pub chain: &'static str,
    pub old_tip: Option<CryptoHash>,
    pub new_tip: CryptoHash,
    pub height: BlockHeight,
}

pub struct ForkResolutionEvent {
    pub timestamp: SystemTime,
    pub chain: &'static str,
    pub current: CryptoHash,
    pub candidate: CryptoHash,
    pub outcome: ForkResolution,
}
