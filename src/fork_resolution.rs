/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! PoP fork resolution: deciding whether a candidate chain is heavier than the active chain.
//!
//! # Scoring
//!
//! Both chains are scored from their fork point up. For every keystone after the fork, each chain
//! gets a [`KeystoneContext`]: the height, on the protecting tree's best chain, of the earliest proof
//! that the keystone (or a block that chains up to it) was published there. Keystone by keystone, the
//! chain that published earlier earns the top score of the lookup table, and the other one earns a
//! score that decays with how much later it published.
//!
//! A chain stops earning once its publications drift more than the finality delay behind, either
//! behind the other chain or between two of its own consecutive keystones.
//!
//! # Orchestration
//!
//! To read the candidate's endorsements, its blocks must be applied. [`compare_pop_score`] applies
//! the candidate on top of the fork point (next to the active chain), scores both chains, and then
//! unapplies whichever chain lost. A candidate that simply extends the active chain wins as soon as
//! it applies; chains that do not reach a new keystone interval are equal.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};
use std::sync::{
    atomic::{AtomicBool, Ordering as AtomicOrdering},
    Arc,
};

use crate::block_tree::{
    chain::Chain,
    protecting::ProtectingTree,
    status::ValidityLevel,
    tree::BlockTree,
};
use crate::config::PopParams;
use crate::keystone::{
    crossed_keystone_boundary, first_keystone_after, highest_block_connecting_keystone_to_next,
    highest_keystone_at_or_before,
};
use crate::pluggables::PayloadStore;
use crate::state_machine::PopStateMachine;
use crate::types::{
    data_types::{BlockHeight, CryptoHash, Timestamp},
    header::Header,
};

/// Outcome of comparing the active chain ("current") with a candidate chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForkResolution {
    CurrentWins,
    CandidateWins,
    /// Neither chain is heavier. The caller decides with its own tie-break.
    Equal,
    /// The comparison was cancelled. Nothing changed, so the current chain is kept.
    Cancelled,
}

impl ForkResolution {
    /// Positive if the current chain stays, negative if the candidate wins, zero if equal.
    pub fn as_int(&self) -> i32 {
        match self {
            ForkResolution::CurrentWins | ForkResolution::Cancelled => 1,
            ForkResolution::CandidateWins => -1,
            ForkResolution::Equal => 0,
        }
    }

    fn from_score(score: i64) -> ForkResolution {
        match score.cmp(&0) {
            Ordering::Greater => ForkResolution::CurrentWins,
            Ordering::Less => ForkResolution::CandidateWins,
            Ordering::Equal => ForkResolution::Equal,
        }
    }
}

/// Lets another thread ask a running comparison to stop.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> CancellationToken {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, AtomicOrdering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(AtomicOrdering::SeqCst)
    }
}

/// The protecting blocks that carry proofs for one keystone of a chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtoKeystoneContext {
    pub keystone_height: BlockHeight,
    pub keystone_timestamp: Timestamp,
    pub blocks_of_proof: BTreeSet<CryptoHash>,
}

/// When a keystone of a chain was first published in the protecting tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeystoneContext {
    pub keystone_height: BlockHeight,
    /// Protecting tree height of the earliest publication. `None` if the keystone has none.
    pub earliest_publication: Option<BlockHeight>,
}

impl KeystoneContext {
    pub fn new(keystone_height: u64, earliest_publication: Option<u64>) -> KeystoneContext {
        KeystoneContext {
            keystone_height: BlockHeight::new(keystone_height),
            earliest_publication: earliest_publication.map(BlockHeight::new),
        }
    }
}

/// Collect, for every keystone of `segment` past its first block, the protecting blocks on
/// `protecting_best` that prove endorsements of the keystone or of the blocks that chain up to it.
///
/// Only endorsements contained in `segment` itself count.
pub fn proto_keystone_contexts<H: Header, G: Header>(
    segment: &Chain,
    tree: &BlockTree<H>,
    protecting: &BlockTree<G>,
    keystone_interval: u64,
) -> Vec<ProtoKeystoneContext> {
    let Some(tip_height) = segment.tip_height() else {
        return Vec::new();
    };
    let first = first_keystone_after(segment.start_height().int(), keystone_interval);
    let last = highest_keystone_at_or_before(tip_height.int(), keystone_interval);
    let protecting_best = protecting.best_chain();

    let mut contexts = Vec::new();
    let mut keystone = first;
    while keystone <= last {
        let Some(keystone_node) = segment
            .get(BlockHeight::new(keystone))
            .and_then(|hash| tree.node(&hash))
        else {
            break;
        };
        let mut context = ProtoKeystoneContext {
            keystone_height: BlockHeight::new(keystone),
            keystone_timestamp: keystone_node.timestamp(),
            blocks_of_proof: BTreeSet::new(),
        };

        let highest = highest_block_connecting_keystone_to_next(keystone, keystone_interval)
            .min(tip_height.int());
        for height in keystone..=highest {
            let Some(node) = segment
                .get(BlockHeight::new(height))
                .and_then(|hash| tree.node(&hash))
            else {
                continue;
            };
            for endorsement in node.endorsed_by() {
                let contained_in_segment = tree
                    .node(&endorsement.containing)
                    .is_some_and(|containing| segment.contains(containing));
                let proven_on_best_chain = protecting
                    .node(&endorsement.block_of_proof)
                    .is_some_and(|proof| protecting_best.contains(proof));
                if contained_in_segment && proven_on_best_chain {
                    context.blocks_of_proof.insert(endorsement.block_of_proof);
                }
            }
        }

        contexts.push(context);
        keystone += keystone_interval;
    }
    contexts
}

/// Reduce each proto context to its earliest publication height.
///
/// With time adjustment enabled, a proof whose protecting block is older than the keystone counts
/// as published at the first block of the protecting best chain that is not older than the keystone.
pub fn keystone_contexts<G: Header>(
    protos: &[ProtoKeystoneContext],
    protecting: &BlockTree<G>,
    params: &PopParams,
) -> Vec<KeystoneContext> {
    let protecting_best = protecting.best_chain();
    protos
        .iter()
        .map(|proto| {
            let mut earliest: Option<BlockHeight> = None;
            for block_of_proof in &proto.blocks_of_proof {
                let Some(proof) = protecting.node(block_of_proof) else {
                    continue;
                };
                if earliest.is_some_and(|earliest| proof.height() >= earliest) {
                    continue;
                }
                if !params.enable_time_adjustment || proof.timestamp() >= proto.keystone_timestamp {
                    earliest = Some(proof.height());
                    continue;
                }
                let adjusted = protecting_best
                    .enumerate()
                    .skip_while(|(height, _)| *height <= proof.height())
                    .take_while(|(height, _)| earliest.map_or(true, |earliest| *height < earliest))
                    .find(|(_, hash)| {
                        protecting
                            .node(hash)
                            .is_some_and(|node| node.timestamp() >= proto.keystone_timestamp)
                    })
                    .map(|(height, _)| height);
                if adjusted.is_some() {
                    earliest = adjusted;
                }
            }
            KeystoneContext {
                keystone_height: proto.keystone_height,
                earliest_publication: earliest,
            }
        })
        .collect()
}

/// Whether `publication` is more than `finality_delay` protecting blocks after `base`. A missing
/// publication is later than any present one.
pub fn publication_violates_finality(
    publication: Option<BlockHeight>,
    base: Option<BlockHeight>,
    finality_delay: u64,
) -> bool {
    match (publication, base) {
        (Some(publication), Some(base)) => {
            publication > base && publication - base > finality_delay
        }
        (None, Some(_)) => true,
        _ => false,
    }
}

/// Drop every context after the first pair of consecutive keystones whose publications are more
/// than `finality_delay` apart.
pub fn truncate_at_finality_gap(contexts: &mut Vec<KeystoneContext>, finality_delay: u64) {
    let gap = contexts.windows(2).position(|pair| {
        publication_violates_finality(
            pair[1].earliest_publication,
            pair[0].earliest_publication,
            finality_delay,
        )
    });
    if let Some(gap) = gap {
        contexts.truncate(gap + 1);
    }
}

/// Score chain `a` against chain `b`. Positive if `a` is heavier, negative if `b` is, zero if equal.
///
/// Both lists must be truncated with [`truncate_at_finality_gap`] and hold one context per keystone.
///
/// # Panics
///
/// If both lists are non-empty and start at different keystones.
pub fn compare_keystone_contexts(
    a: &[KeystoneContext],
    b: &[KeystoneContext],
    params: &PopParams,
) -> i64 {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => return 0,
        (true, false) => return -1,
        (false, true) => return 1,
        (false, false) => {}
    }
    let first = a[0].keystone_height;
    assert_eq!(
        first, b[0].keystone_height,
        "keystone context lists must start at the same keystone"
    );
    let keystone_interval = params.keystone_interval;
    let last = a[a.len() - 1]
        .keystone_height
        .max(b[b.len() - 1].keystone_height);
    let at = |list: &[KeystoneContext], keystone: BlockHeight| {
        list.get(((keystone - first) / keystone_interval) as usize).copied()
    };
    let score = |publication: Option<BlockHeight>, earliest: Option<BlockHeight>| {
        match (publication, earliest) {
            (Some(publication), Some(earliest)) => params.lookup_score(publication - earliest),
            _ => 0,
        }
    };

    let (mut a_score, mut b_score) = (0u64, 0u64);
    let (mut a_outside_finality, mut b_outside_finality) = (false, false);
    let mut keystone = first;
    while keystone <= last {
        let a_context = if a_outside_finality { None } else { at(a, keystone) };
        let b_context = if b_outside_finality { None } else { at(b, keystone) };

        match (a_context, b_context) {
            (None, None) => {
                if a_outside_finality && b_outside_finality {
                    break;
                }
            }
            (None, Some(_)) => {
                b_score += params.lookup_score(0);
                a_outside_finality = true;
            }
            (Some(_), None) => {
                a_score += params.lookup_score(0);
                b_outside_finality = true;
            }
            (Some(a_context), Some(b_context)) => {
                let a_publication = a_context.earliest_publication;
                let b_publication = b_context.earliest_publication;
                let earliest = match (a_publication, b_publication) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                a_score += score(a_publication, earliest);
                b_score += score(b_publication, earliest);

                if publication_violates_finality(a_publication, b_publication, params.finality_delay)
                {
                    a_outside_finality = true;
                }
                if publication_violates_finality(b_publication, a_publication, params.finality_delay)
                {
                    b_outside_finality = true;
                }
                if a_outside_finality && b_outside_finality {
                    break;
                }
            }
        }
        keystone += keystone_interval;
    }

    a_score as i64 - b_score as i64
}

/// Keystone contexts of the chain from `fork_height` to `tip`, truncated at the first finality gap.
fn chain_keystone_contexts<H: Header, G: Header>(
    tree: &BlockTree<H>,
    protecting: &BlockTree<G>,
    fork_height: BlockHeight,
    tip: &CryptoHash,
    params: &PopParams,
) -> Vec<KeystoneContext> {
    let segment = Chain::new(fork_height, tip, &tree.nodes);
    let protos = proto_keystone_contexts(&segment, tree, protecting, params.keystone_interval);
    let mut contexts = keystone_contexts(&protos, protecting, params);
    truncate_at_finality_gap(&mut contexts, params.finality_delay);
    contexts
}

/// Compare the active chain of the state machine's tree with the chain ending at `candidate`.
///
/// When this returns, exactly one of the two chains is applied: the candidate's if the result is
/// [`ForkResolution::CandidateWins`], the active chain's otherwise. The caller is responsible for
/// moving the tree's active chain window to the candidate when it wins.
pub fn compare_pop_score<H, P, S>(
    state_machine: &mut PopStateMachine<'_, H, P, S>,
    params: &PopParams,
    candidate: &CryptoHash,
    cancel: &CancellationToken,
) -> ForkResolution
where
    H: Header,
    P: ProtectingTree,
    S: PayloadStore,
{
    let tree = state_machine.tree();
    let Some(current) = tree.best_tip() else {
        return ForkResolution::CurrentWins;
    };
    let (current_hash, current_height) = (current.hash(), current.height());
    let Some(candidate_node) = tree.node(candidate) else {
        log::warn!("{}: fork resolution with unknown candidate {}", H::NAME, candidate);
        return ForkResolution::CurrentWins;
    };
    let candidate_height = candidate_node.height();

    if !candidate_node.is_valid() || tree.best_chain().contains(candidate_node) {
        return ForkResolution::CurrentWins;
    }
    if !candidate_node.is_valid_up_to(ValidityLevel::Connected) {
        log::debug!("{}: candidate {} is not connected", H::NAME, candidate);
        return ForkResolution::CurrentWins;
    }
    if let Some(finalized) = tree.last_finalized() {
        if !tree.is_ancestor(&finalized.hash(), candidate) {
            log::debug!("{}: candidate {} does not contain the finalized block", H::NAME, candidate);
            return ForkResolution::CurrentWins;
        }
    }

    let original_protecting_tip = state_machine.protecting().blocks().best_chain().tip();
    let restore_protecting_tip = |state_machine: &mut PopStateMachine<'_, H, P, S>| {
        if let Some(tip) = original_protecting_tip {
            state_machine.protecting_mut().restore_best_tip(&tip);
        }
    };

    // A candidate that extends the active chain only has to apply.
    if tree.is_ancestor(&current_hash, candidate) {
        return match state_machine.apply(&current_hash, candidate) {
            Ok(()) => ForkResolution::CandidateWins,
            Err(err) => {
                log::debug!("{}: candidate {} does not apply: {}", H::NAME, candidate, err);
                restore_protecting_tip(state_machine);
                ForkResolution::CurrentWins
            }
        };
    }

    let Some(fork) = tree.find_fork(&current_hash, candidate) else {
        panic!("{}: blocks {} and {} have no common ancestor", H::NAME, current_hash, candidate)
    };
    let fork_height = match tree.node(&fork) {
        Some(node) => node.height(),
        None => return ForkResolution::CurrentWins,
    };
    let keystone_interval = params.keystone_interval;
    let current_crossed =
        crossed_keystone_boundary(fork_height.int(), current_height.int(), keystone_interval);
    let candidate_crossed =
        crossed_keystone_boundary(fork_height.int(), candidate_height.int(), keystone_interval);
    if !current_crossed && !candidate_crossed {
        return ForkResolution::Equal;
    }
    if cancel.is_cancelled() {
        return ForkResolution::Cancelled;
    }

    // Blocks restored from storage carry their stored validity but were never applied here.
    let mut never_applied = HashSet::new();
    let mut cursor = tree.node(candidate);
    while let Some(node) = cursor.filter(|node| node.height() > fork_height) {
        if !node.was_ever_applied() {
            never_applied.insert(node.hash());
        }
        cursor = node.prev().and_then(|prev| tree.node(&prev));
    }

    // Apply the candidate next to the active chain, so that both chains' endorsements are in force.
    if let Err(err) = state_machine.apply(&fork, candidate) {
        log::debug!("{}: candidate {} does not apply: {}", H::NAME, candidate, err);
        restore_protecting_tip(state_machine);
        return ForkResolution::CurrentWins;
    }

    let abandon = |state_machine: &mut PopStateMachine<'_, H, P, S>| {
        state_machine.unapply(candidate, &fork);
        restore_protecting_tip(state_machine);
        ForkResolution::Cancelled
    };

    if cancel.is_cancelled() {
        return abandon(state_machine);
    }
    let current_contexts = chain_keystone_contexts(
        state_machine.tree(),
        state_machine.protecting().blocks(),
        fork_height,
        &current_hash,
        params,
    );
    if cancel.is_cancelled() {
        return abandon(state_machine);
    }
    let candidate_contexts = chain_keystone_contexts(
        state_machine.tree(),
        state_machine.protecting().blocks(),
        fork_height,
        candidate,
        params,
    );
    if cancel.is_cancelled() {
        return abandon(state_machine);
    }

    let score = compare_keystone_contexts(&current_contexts, &candidate_contexts, params);
    log::debug!(
        "{}: pop score of {} against {} is {}",
        H::NAME,
        current_hash,
        candidate,
        score
    );

    if score >= 0 {
        state_machine.unapply(candidate, &fork);
        restore_protecting_tip(state_machine);
        return ForkResolution::from_score(score);
    }

    // The candidate won. Blocks that were only ever applied alongside the current chain, or never
    // applied before this comparison, must prove they apply on their own.
    let validated = state_machine.unapply_while(candidate, &fork, |node| {
        !node.is_valid_up_to(ValidityLevel::CanBeApplied) || never_applied.contains(&node.hash())
    });
    state_machine.unapply(&current_hash, &fork);
    if let Err(err) = state_machine.apply(&validated, candidate) {
        log::debug!("{}: candidate {} does not apply on its own: {}", H::NAME, candidate, err);
        state_machine.unapply(&validated, &fork);
        if let Err(restore) = state_machine.apply(&fork, &current_hash) {
            panic!(
                "{}: failed to restore chain {} after fork resolution: {}",
                H::NAME,
                current_hash,
                restore
            );
        }
        restore_protecting_tip(state_machine);
        return ForkResolution::CurrentWins;
    }
    ForkResolution::CandidateWins
}
