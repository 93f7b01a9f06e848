/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Header-only block tree with cumulative-work fork choice.
//!
//! This is the tree kept for the protecting chain: blocks carry no payloads, and the best chain is
//! always the valid chain with the most cumulative work. Ties keep the current best chain.

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::block_tree::{
    chain::Chain,
    node::BlockNode,
    protecting::ProtectingTree,
    tree::{BlockTree, BlockTreeError},
};
use crate::events::{AcceptHeaderEvent, BeforeTipChangeEvent, Event, RemoveBlockEvent};
use crate::types::{
    data_types::{BlockHeight, CryptoHash},
    header::Header,
};

pub struct HeaderTree<H> {
    tree: BlockTree<H>,
    event_publisher: Option<Sender<Event>>,
}

impl<H: Header> Default for HeaderTree<H> {
    fn default() -> Self {
        HeaderTree::new()
    }
}

impl<H: Header> HeaderTree<H> {
    pub fn new() -> HeaderTree<H> {
        HeaderTree {
            tree: BlockTree::new(),
            event_publisher: None,
        }
    }

    pub fn set_event_publisher(&mut self, event_publisher: Sender<Event>) {
        self.event_publisher = Some(event_publisher);
    }

    pub fn bootstrap(&mut self, header: H, height: BlockHeight) -> Result<CryptoHash, BlockTreeError> {
        self.tree.bootstrap(header, height)
    }

    /// Accept `header` and switch the best chain to it if it has more work than the current tip.
    pub fn accept_header(&mut self, header: H) -> Result<CryptoHash, BlockTreeError> {
        let hash = self.tree.accept_header(header)?;
        self.publish_accept_header(&hash);
        self.try_select_best(&hash);
        Ok(hash)
    }

    pub fn best_chain(&self) -> &Chain {
        self.tree.best_chain()
    }

    pub fn node(&self, hash: &CryptoHash) -> Option<&BlockNode<H>> {
        self.tree.node(hash)
    }

    fn try_select_best(&mut self, candidate: &CryptoHash) {
        let Some(candidate) = self.tree.node(candidate).filter(|node| node.is_valid()) else {
            return;
        };
        let better = match self.tree.best_tip() {
            Some(tip) => candidate.chain_work() > tip.chain_work(),
            None => true,
        };
        if better {
            let candidate = candidate.hash();
            self.switch_tip(&candidate);
        }
    }

    /// Pick the tip with the most work after the best chain lost blocks. `last_reported` is the tip
    /// that listeners last heard about.
    fn select_best_from_tips(&mut self, last_reported: Option<CryptoHash>) {
        let best = self
            .tree
            .tips()
            .iter()
            .filter_map(|tip| self.tree.node(tip))
            .filter(|node| node.is_valid())
            .max_by_key(|node| node.chain_work())
            .map(|node| node.hash());
        if let Some(best) = best {
            if last_reported != Some(best) {
                self.publish_tip_change(last_reported, &best);
            }
            if self.tree.best_chain().tip() != Some(best) {
                self.tree.set_active_tip(&best);
            }
        }
    }

    fn switch_tip(&mut self, new_tip: &CryptoHash) {
        self.publish_tip_change(self.tree.best_chain().tip(), new_tip);
        self.tree.set_active_tip(new_tip);
    }

    fn publish_tip_change(&self, old_tip: Option<CryptoHash>, new_tip: &CryptoHash) {
        if let Some(node) = self.tree.node(new_tip) {
            Event::publish(
                &self.event_publisher,
                Event::BeforeTipChange(BeforeTipChangeEvent {
                    timestamp: SystemTime::now(),
                    chain: H::NAME,
                    old_tip,
                    new_tip: *new_tip,
                    height: node.height(),
                }),
            );
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
}

impl<H: Header> ProtectingTree for HeaderTree<H> {
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
            // The block never becomes part of the tree if it cannot be used.
            if let Err(err) = self.tree.remove_subtree(&hash) {
                log::warn!("{}: could not drop unusable context block {}: {}", H::NAME, hash, err);
            }
            return Err(BlockTreeError::BadChain { hash });
        }
        self.publish_accept_header(&hash);
        self.try_select_best(&hash);
        Ok(())
    }

    fn remove_context_block(&mut self, hash: &CryptoHash) {
        let last_reported = self.tree.best_chain().tip();
        let mut cursor = Some(*hash);
        let mut released = true;
        let mut best_chain_changed = false;
        while let Some(current) = cursor {
            let Some(node) = self.tree.node_mut(&current) else {
                break;
            };
            if released {
                node.references = node.references.saturating_sub(1);
                released = false;
            }
            if node.references > 0 || node.children().next().is_some() || node.is_bootstrap() {
                break;
            }
            let (prev, height) = (node.prev(), node.height());
            if self.tree.best_chain().contains_at(&current, height) {
                if let Some(prev) = prev {
                    self.tree.set_active_tip(&prev);
                    best_chain_changed = true;
                }
            }
            if self.tree.remove_subtree(&current).is_err() {
                break;
            }
            Event::publish(
                &self.event_publisher,
                Event::RemoveBlock(RemoveBlockEvent {
                    timestamp: SystemTime::now(),
                    chain: H::NAME,
                    block: current,
                    height,
                }),
            );
            cursor = prev;
        }
        if best_chain_changed {
            self.select_best_from_tips(last_reported);
        }
    }

    fn restore_best_tip(&mut self, hash: &CryptoHash) {
        let valid = self.tree.node(hash).is_some_and(|node| node.is_valid());
        if valid && self.tree.best_chain().tip() != Some(*hash) {
            self.switch_tip(hash);
        }
    }
}
