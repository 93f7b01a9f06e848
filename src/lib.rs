/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Proof-of-Proof (PoP) block trees.
//!
//! A PoP ledger ("protected") is secured by publishing endorsements of its blocks in another ledger
//! ("protecting"). This crate keeps the block trees of such ledgers, applies the payloads their blocks
//! carry atomically, and resolves forks by how early each chain's keystones were published in the
//! protecting ledger.
//!
//! The main type is [`PopTree`](pop_tree::PopTree). Protecting trees are plugged in through the
//! [`ProtectingTree`](block_tree::protecting::ProtectingTree) trait, payload bodies through the
//! [`PayloadStore`](pluggables::PayloadStore) trait.

pub mod block_tree;

pub mod commands;

pub mod config;

pub mod event_bus;

pub mod events;

pub mod fork_resolution;

pub mod keystone;

pub(crate) mod logging;

pub mod payloads_index;

pub mod pluggables;

pub mod pop_tree;

pub mod state_machine;

pub mod types;
