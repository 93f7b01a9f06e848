//! Builders for the headers and chains the tests run on.
//!
//! ALT trees in these tests are protected directly by a BTC [`HeaderTree`]. ALT block timestamps are
//! their heights, BTC block timestamps are `1000 +` their heights, so every BTC block is younger than
//! every ALT block unless a test says otherwise.

use pop_rs::{
    block_tree::{header_tree::HeaderTree, node::BlockNode},
    config::PopParams,
    pop_tree::PopTree,
    types::{
        data_types::{BlockHeight, CryptoHash, Timestamp},
        header::{AltBlock, BtcBlock},
        payloads::{EndorsementProof, PopData},
    },
};

use crate::common::mem_store::MemStore;

pub(crate) type AltTree = PopTree<AltBlock, HeaderTree<BtcBlock>, MemStore>;

pub(crate) const BTC_TIME_OFFSET: u64 = 1000;

pub(crate) fn btc_genesis() -> BtcBlock {
    BtcBlock::new(
        CryptoHash::default(),
        CryptoHash::default(),
        Timestamp::new(BTC_TIME_OFFSET),
        1,
        0,
    )
}

pub(crate) fn btc_child(parent: &BtcBlock, difficulty: u64, nonce: u64) -> BtcBlock {
    BtcBlock::new(
        parent.hash,
        CryptoHash::digest(&nonce.to_le_bytes()),
        Timestamp::new(parent.timestamp.secs() + 1),
        difficulty,
        nonce,
    )
}

/// Genesis and `len` more BTC blocks of difficulty 1. `chain[i]` is at height `i`.
pub(crate) fn btc_chain(len: usize) -> Vec<BtcBlock> {
    let mut chain = vec![btc_genesis()];
    for _ in 0..len {
        let next = btc_child(chain.last().unwrap(), 1, 0);
        chain.push(next);
    }
    chain
}

/// A header tree bootstrapped with `chain[0]` at height 0 that accepted the rest of `chain`.
pub(crate) fn btc_tree(chain: &[BtcBlock]) -> HeaderTree<BtcBlock> {
    let mut tree = HeaderTree::new();
    tree.bootstrap(chain[0].clone(), BlockHeight::new(0)).unwrap();
    for block in &chain[1..] {
        tree.accept_header(block.clone()).unwrap();
    }
    tree
}

pub(crate) fn alt_genesis() -> AltBlock {
    AltBlock::new(CryptoHash::default(), BlockHeight::new(0), Timestamp::new(0), 0)
}

pub(crate) fn alt_child(parent: &AltBlock, nonce: u64) -> AltBlock {
    AltBlock::new(
        parent.hash,
        parent.height + 1,
        Timestamp::new(parent.timestamp.secs() + 1),
        nonce,
    )
}

/// A bootstrapped ALT tree over a BTC tree of `btc_len + 1` blocks. Also returns the BTC chain and a
/// handle on the tree's payload store.
pub(crate) fn alt_tree(params: PopParams, btc_len: usize) -> (AltTree, Vec<BtcBlock>, MemStore) {
    let btc = btc_chain(btc_len);
    let store = MemStore::new();
    let mut tree = PopTree::new(params, btc_tree(&btc), store.clone()).unwrap();
    tree.bootstrap(alt_genesis(), BlockHeight::new(0)).unwrap();
    (tree, btc, store)
}

pub(crate) fn endorsement(endorsed: &AltBlock, block_of_proof: &BtcBlock, payout: u64) -> EndorsementProof {
    EndorsementProof::new(endorsed.hash, block_of_proof.hash, payout.to_le_bytes().to_vec())
}

/// Build and connect `len` blocks on top of `fork`.
///
/// For every `(height, proof)` in `endorsements`, the block at `height + 1` carries an endorsement
/// of the block at `height`, proven in `proof`. `nonce` tells competing chains apart.
pub(crate) fn build_chain(
    tree: &mut AltTree,
    fork: &AltBlock,
    len: usize,
    nonce: u64,
    endorsements: &[(u64, &BtcBlock)],
) -> Vec<AltBlock> {
    let mut blocks: Vec<AltBlock> = Vec::with_capacity(len);
    let mut parent = fork.clone();
    for _ in 0..len {
        let block = alt_child(&parent, nonce);
        let proofs = endorsements
            .iter()
            .filter(|(height, _)| *height + 1 == block.height.int())
            .map(|(_, proof)| endorsement(&parent, proof, nonce))
            .collect();
        let connected = tree
            .accept_block(block.clone(), PopData::new(Vec::new(), proofs))
            .unwrap();
        assert!(connected, "block at {} did not connect", block.height);
        parent = block.clone();
        blocks.push(block);
    }
    blocks
}

/// Hashes of every applied block of `tree`.
pub(crate) fn applied_blocks(tree: &AltTree) -> Vec<CryptoHash> {
    let mut applied: Vec<CryptoHash> = tree
        .blocks()
        .nodes()
        .filter(|node| node.is_applied())
        .map(BlockNode::hash)
        .collect();
    applied.sort();
    applied
}
