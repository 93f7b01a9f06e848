use std::sync::mpsc;

use log::LevelFilter;
use pop_rs::{
    block_tree::{
        header_tree::HeaderTree,
        status::{BlockStatus, ValidityLevel},
    },
    config::PopParams,
    events::Event,
    fork_resolution::{CancellationToken, ForkResolution},
    pluggables::payload_key,
    pop_tree::{loader::StoredBlock, PopTree},
    types::{
        data_types::{BlockHeight, CryptoHash, Timestamp},
        header::{AltBlock, BtcBlock, Header, VbkBlock},
        payloads::{EndorsementProof, PayloadKind, PopData},
    },
};

mod common;

use crate::common::{
    builders::{
        alt_child, alt_genesis, alt_tree, applied_blocks, btc_chain, btc_child, btc_tree,
        build_chain, endorsement,
    },
    logging::setup_logger,
    mem_store::MemStore,
};

type VbkTree = PopTree<VbkBlock, HeaderTree<BtcBlock>, MemStore>;

fn vbk_genesis() -> VbkBlock {
    VbkBlock::new(CryptoHash::default(), BlockHeight::new(0), Timestamp::new(500), 1, 0)
}

fn vbk_child(parent: &VbkBlock) -> VbkBlock {
    VbkBlock::new(
        parent.hash,
        parent.height + 1,
        Timestamp::new(parent.timestamp.secs() + 1),
        1,
        0,
    )
}

#[test]
fn connect_empty_payloads_test() {
    setup_logger(LevelFilter::Debug);

    let (mut tree, _, _) = alt_tree(PopParams::altchain(), 10);
    let genesis = alt_genesis();
    let h1 = alt_child(&genesis, 0);

    tree.accept_header(h1.clone()).unwrap();
    tree.attach_payloads(&h1.hash, PopData::empty()).unwrap();
    assert!(tree.connect(&h1.hash).unwrap());

    let node = tree.node(&h1.hash).unwrap();
    assert!(node.is_valid_up_to(ValidityLevel::Connected));
    assert!(node.has_payloads());

    // Connecting tries the block, but the active chain stays where it was.
    assert!(!node.is_applied());
    assert_eq!(tree.best_chain().tip(), Some(genesis.hash));
    assert_eq!(tree.connected_tips_after(&genesis.hash), vec![h1.hash]);
}

#[test]
fn attach_payloads_errors_test() {
    setup_logger(LevelFilter::Debug);

    let (mut tree, btc, _) = alt_tree(PopParams::altchain(), 10);
    let genesis = alt_genesis();
    let h1 = alt_child(&genesis, 0);
    let h2 = alt_child(&h1, 0);
    let sibling = alt_child(&genesis, 1);
    let endorsement = endorsement(&genesis, &btc[1], 0);

    let err = tree
        .attach_payloads(&h1.hash, PopData::empty())
        .unwrap_err();
    assert_eq!(err.code(), "unknown-block");

    let err = tree
        .attach_payloads(&genesis.hash, PopData::empty())
        .unwrap_err();
    assert_eq!(err.code(), "payloads-on-bootstrap");

    log::debug!("Attaching the same endorsement twice to one block.");
    tree.accept_header(h1.clone()).unwrap();
    let twice = PopData::new(Vec::new(), vec![endorsement.clone(), endorsement.clone()]);
    let err = tree.attach_payloads(&h1.hash, twice).unwrap_err();
    assert_eq!(err.code(), "duplicate-payload");
    assert!(!tree.node(&h1.hash).unwrap().has_payloads());

    let once = PopData::new(Vec::new(), vec![endorsement.clone()]);
    tree.attach_payloads(&h1.hash, once.clone()).unwrap();
    let err = tree.attach_payloads(&h1.hash, once.clone()).unwrap_err();
    assert_eq!(err.code(), "already-has-payloads");

    log::debug!("Attaching an endorsement that is already on the chain.");
    tree.accept_header(h2.clone()).unwrap();
    let err = tree.attach_payloads(&h2.hash, once.clone()).unwrap_err();
    assert_eq!(err.code(), "duplicate-payload");

    // The same endorsement on another branch is not a duplicate.
    tree.accept_header(sibling.clone()).unwrap();
    tree.attach_payloads(&sibling.hash, once).unwrap();
    let containing: Vec<_> = tree
        .payloads_index()
        .containing_blocks(&endorsement.id())
        .collect();
    assert_eq!(containing.len(), 2);
}

#[test]
fn connect_failure_test() {
    setup_logger(LevelFilter::Debug);

    let (mut tree, btc, _) = alt_tree(PopParams::altchain(), 10);
    let (publisher, subscriber) = mpsc::channel();
    tree.set_event_publisher(publisher);

    let genesis = alt_genesis();
    let h1 = alt_child(&genesis, 0);
    let h2 = alt_child(&h1, 0);
    let unknown_proof = btc_child(&btc[10], 1, 99);

    log::debug!("Connecting a block whose endorsement is proven in an unknown BTC block.");
    let pop_data = PopData::new(Vec::new(), vec![endorsement(&genesis, &unknown_proof, 0)]);
    assert!(!tree.accept_block(h1.clone(), pop_data).unwrap());

    let node = tree.node(&h1.hash).unwrap();
    assert!(!node.is_valid());
    assert!(node.status().has(BlockStatus::FAILED_POP));
    assert!(node.has_payloads());
    assert_eq!(tree.tips().iter().copied().collect::<Vec<_>>(), vec![genesis.hash]);

    let failed = subscriber.try_iter().any(|event| match event {
        Event::BlockConnectFailed(event) => {
            event.block == h1.hash && event.reason.contains("block of proof")
        }
        _ => false,
    });
    assert!(failed);

    // Headers below a failed block are kept, marked as failed.
    let err = tree.accept_header(h2.clone()).unwrap_err();
    assert_eq!(err.code(), "bad-chain");
    assert!(tree
        .node(&h2.hash)
        .unwrap()
        .status()
        .has(BlockStatus::FAILED_CHILD));

    log::debug!("Connecting a block whose protecting block does not connect.");
    let sibling = alt_child(&genesis, 1);
    let orphan_btc = btc_child(&unknown_proof, 1, 100);
    let pop_data = PopData::new(vec![orphan_btc], Vec::new());
    assert!(!tree.accept_block(sibling.clone(), pop_data).unwrap());
    assert!(tree
        .node(&sibling.hash)
        .unwrap()
        .status()
        .has(BlockStatus::FAILED_POP));
}

#[test]
fn connect_cascade_test() {
    setup_logger(LevelFilter::Debug);

    let (mut tree, _, _) = alt_tree(PopParams::altchain(), 10);
    let genesis = alt_genesis();
    let a1 = alt_child(&genesis, 0);
    let a2 = alt_child(&a1, 0);
    let a3 = alt_child(&a2, 0);

    for header in [&a1, &a2, &a3] {
        tree.accept_header(header.clone()).unwrap();
    }
    let err = tree.connect(&a1.hash).unwrap_err();
    assert_eq!(err.code(), "missing-payloads");

    // Blocks whose parent is not connected wait.
    assert!(!tree.accept_block(a2.clone(), PopData::empty()).unwrap());
    assert!(!tree.accept_block(a3.clone(), PopData::empty()).unwrap());
    let err = tree.connect(&a2.hash).unwrap_err();
    assert_eq!(err.code(), "parent-not-connected");

    log::debug!("Connecting the lowest block connects the ones waiting on it.");
    assert!(tree.accept_block(a1.clone(), PopData::empty()).unwrap());
    for header in [&a1, &a2, &a3] {
        assert!(tree.node(&header.hash).unwrap().is_connected());
    }
    assert_eq!(tree.connected_tips_after(&genesis.hash), vec![a3.hash]);
}

#[test]
fn set_state_round_trip_test() {
    setup_logger(LevelFilter::Debug);

    let (mut tree, btc, _) = alt_tree(PopParams::altchain(), 10);
    let genesis = alt_genesis();
    let a = build_chain(&mut tree, &genesis, 4, 0, &[(2, &btc[3])]);
    let b = build_chain(&mut tree, &a[0], 2, 1, &[]);

    tree.set_state(&a[3].hash).unwrap();
    let on_a = applied_blocks(&tree);
    assert_eq!(on_a.len(), 5);
    assert_eq!(tree.blocks().applied_block_count(), 5);
    assert_eq!(tree.best_chain().tip(), Some(a[3].hash));
    assert_eq!(tree.node(&a[2].hash).unwrap().applied_endorsements().len(), 1);
    assert_eq!(tree.node(&a[1].hash).unwrap().endorsed_by().count(), 1);

    log::debug!("Switching to the fork and back.");
    tree.set_state(&b[1].hash).unwrap();
    let mut on_b = vec![genesis.hash, a[0].hash, b[0].hash, b[1].hash];
    on_b.sort();
    assert_eq!(applied_blocks(&tree), on_b);
    assert_eq!(tree.best_chain().tip(), Some(b[1].hash));
    assert!(tree.node(&a[2].hash).unwrap().applied_endorsements().is_empty());

    tree.set_state(&a[3].hash).unwrap();
    assert_eq!(applied_blocks(&tree), on_a);
    assert_eq!(tree.best_chain().tip(), Some(a[3].hash));
    assert_eq!(tree.node(&a[2].hash).unwrap().applied_endorsements().len(), 1);

    // Blocks that were applied on their own chain are known to apply.
    assert!(tree
        .node(&b[1].hash)
        .unwrap()
        .is_valid_up_to(ValidityLevel::CanBeApplied));
}

#[test]
fn set_state_atomicity_test() {
    setup_logger(LevelFilter::Debug);

    let (mut tree, btc, store) = alt_tree(PopParams::altchain(), 10);
    let genesis = alt_genesis();
    let a = build_chain(&mut tree, &genesis, 4, 0, &[]);
    let b = build_chain(&mut tree, &a[0], 2, 1, &[(2, &btc[1])]);
    tree.set_state(&a[3].hash).unwrap();
    let before = applied_blocks(&tree);

    log::debug!("Losing the body of the endorsement in the fork's tip.");
    let id = endorsement(&b[0], &btc[1], 1).id();
    store.delete(&payload_key(PayloadKind::Endorsement, &id));

    let err = tree.set_state(&b[1].hash).unwrap_err();
    assert_eq!(err.code(), "payload-not-found");
    assert_eq!(applied_blocks(&tree), before);
    assert_eq!(tree.best_chain().tip(), Some(a[3].hash));
    assert!(tree.node(&b[1].hash).unwrap().is_valid());
}

#[test]
fn remove_subtree_test() {
    setup_logger(LevelFilter::Debug);

    let (mut tree, btc, _) = alt_tree(PopParams::altchain(), 10);
    let genesis = alt_genesis();
    let a = build_chain(&mut tree, &genesis, 2, 0, &[(1, &btc[2])]);
    tree.set_state(&a[0].hash).unwrap();
    let id = endorsement(&a[0], &btc[2], 0).id();
    assert_eq!(tree.node(&a[0].hash).unwrap().endorsed_by().count(), 1);
    assert!(tree.payloads_index().contains(&id));

    let err = tree.remove_subtree(&a[0].hash).unwrap_err();
    assert_eq!(err.code(), "subtree-applied");
    let err = tree.remove_subtree(&genesis.hash).unwrap_err();
    assert_eq!(err.code(), "remove-root");
    assert_eq!(tree.blocks().len(), 3);

    log::debug!("Removing a leaf that is not applied.");
    tree.remove_subtree(&a[1].hash).unwrap();
    assert!(tree.node(&a[1].hash).is_none());
    assert!(tree.tips().contains(&a[0].hash));
    assert_eq!(tree.node(&a[0].hash).unwrap().endorsed_by().count(), 0);
    assert!(!tree.payloads_index().contains(&id));
}

#[test]
fn invalidate_and_revalidate_test() {
    setup_logger(LevelFilter::Debug);

    let (mut tree, _, _) = alt_tree(PopParams::altchain(), 10);
    let genesis = alt_genesis();
    let a = build_chain(&mut tree, &genesis, 4, 0, &[]);
    tree.set_state(&a[3].hash).unwrap();

    let err = tree
        .invalidate_subtree(&a[2].hash, BlockStatus::APPLIED)
        .unwrap_err();
    assert_eq!(err.code(), "bad-invalidation-reason");
    let err = tree
        .invalidate_subtree(&genesis.hash, BlockStatus::FAILED_BLOCK)
        .unwrap_err();
    assert_eq!(err.code(), "invalidate-root");

    log::debug!("Invalidating a block on the active chain.");
    tree.invalidate_subtree(&a[2].hash, BlockStatus::FAILED_BLOCK)
        .unwrap();
    assert_eq!(tree.best_chain().tip(), Some(a[1].hash));
    let invalidated = tree.node(&a[2].hash).unwrap();
    assert!(!invalidated.is_valid());
    assert!(!invalidated.is_applied());
    assert!(invalidated.status().has(BlockStatus::FAILED_BLOCK));
    assert!(tree
        .node(&a[3].hash)
        .unwrap()
        .status()
        .has(BlockStatus::FAILED_CHILD));
    assert_eq!(tree.tips().iter().copied().collect::<Vec<_>>(), vec![a[1].hash]);

    let err = tree.set_state(&a[3].hash).unwrap_err();
    assert_eq!(err.code(), "not-connected");

    log::debug!("Revalidating it.");
    tree.revalidate_subtree(&a[2].hash, BlockStatus::FAILED_BLOCK);
    assert!(tree.node(&a[2].hash).unwrap().is_valid());
    assert!(tree.node(&a[3].hash).unwrap().is_valid());
    assert_eq!(tree.tips().iter().copied().collect::<Vec<_>>(), vec![a[3].hash]);
    tree.set_state(&a[3].hash).unwrap();
    assert_eq!(tree.best_chain().tip(), Some(a[3].hash));
}

#[test]
fn remove_payloads_test() {
    setup_logger(LevelFilter::Debug);

    let (mut tree, btc, _) = alt_tree(PopParams::altchain(), 10);
    let genesis = alt_genesis();
    let h1 = alt_child(&genesis, 0);
    let unknown_proof = btc_child(&btc[10], 1, 99);
    let bad = endorsement(&genesis, &unknown_proof, 0);

    let pop_data = PopData::new(Vec::new(), vec![bad.clone()]);
    assert!(!tree.accept_block(h1.clone(), pop_data).unwrap());
    assert!(tree.payloads_index().contains(&bad.id()));

    log::debug!("Removing the payloads that made the block fail.");
    tree.remove_payloads(&h1.hash).unwrap();
    let node = tree.node(&h1.hash).unwrap();
    assert!(node.is_valid());
    assert!(!node.has_payloads());
    assert!(node.payload_ids().is_empty());
    assert_eq!(node.status().validity(), ValidityLevel::Tree);
    assert!(!tree.payloads_index().contains(&bad.id()));

    tree.attach_payloads(&h1.hash, PopData::empty()).unwrap();
    assert!(tree.connect(&h1.hash).unwrap());

    tree.set_state(&h1.hash).unwrap();
    let err = tree.remove_payloads(&h1.hash).unwrap_err();
    assert_eq!(err.code(), "payloads-on-applied-block");
}

#[test]
fn repeated_payload_test() {
    setup_logger(LevelFilter::Debug);

    let (mut tree, btc, _) = alt_tree(PopParams::altchain(), 10);
    let (publisher, subscriber) = mpsc::channel();
    tree.set_event_publisher(publisher);

    let genesis = alt_genesis();
    let a1 = alt_child(&genesis, 0);
    let a2 = alt_child(&a1, 0);
    let repeated = endorsement(&genesis, &btc[1], 0);

    log::debug!("Attaching the same endorsement to a block and to its parent.");
    tree.accept_header(a1.clone()).unwrap();
    tree.accept_header(a2.clone()).unwrap();
    tree.attach_payloads(&a2.hash, PopData::new(Vec::new(), vec![repeated.clone()]))
        .unwrap();
    tree.attach_payloads(&a1.hash, PopData::new(Vec::new(), vec![repeated.clone()]))
        .unwrap();

    assert!(tree.connect(&a1.hash).unwrap());
    let node = tree.node(&a2.hash).unwrap();
    assert!(node.status().has(BlockStatus::FAILED_POP));
    assert!(!node.is_connected());
    let failed = subscriber.try_iter().any(|event| match event {
        Event::BlockConnectFailed(event) => {
            event.block == a2.hash && event.reason.contains("already on the chain")
        }
        _ => false,
    });
    assert!(failed);

    log::debug!("Removing the parent's copy gives the child another chance.");
    tree.remove_payloads(&a1.hash).unwrap();
    let node = tree.node(&a2.hash).unwrap();
    assert!(node.is_valid());
    assert_eq!(node.status().validity(), ValidityLevel::Tree);
    assert_eq!(
        tree.payloads_index()
            .containing_blocks(&repeated.id())
            .copied()
            .collect::<Vec<_>>(),
        vec![a2.hash]
    );

    tree.attach_payloads(&a1.hash, PopData::empty()).unwrap();
    assert!(tree.connect(&a1.hash).unwrap());
    assert!(tree.node(&a2.hash).unwrap().is_connected());
    tree.set_state(&a2.hash).unwrap();
    assert_eq!(applied_blocks(&tree).len(), 3);
}

#[test]
fn expired_endorsement_test() {
    setup_logger(LevelFilter::Debug);

    let params = PopParams::builder()
        .keystone_interval(5)
        .finality_delay(100)
        .endorsement_settlement_interval(2)
        .preserve_blocks_behind_final(2)
        .build();
    let (mut tree, btc, _) = alt_tree(params, 10);
    let (publisher, subscriber) = mpsc::channel();
    tree.set_event_publisher(publisher);

    let genesis = alt_genesis();
    let a = build_chain(&mut tree, &genesis, 2, 0, &[]);

    log::debug!("Endorsing the genesis block three blocks later.");
    let a3 = alt_child(&a[1], 0);
    let pop_data = PopData::new(Vec::new(), vec![endorsement(&genesis, &btc[1], 0)]);
    assert!(!tree.accept_block(a3.clone(), pop_data).unwrap());
    assert!(tree
        .node(&a3.hash)
        .unwrap()
        .status()
        .has(BlockStatus::FAILED_POP));
    let expired = subscriber.try_iter().any(|event| match event {
        Event::BlockConnectFailed(event) => {
            event.block == a3.hash && event.reason.contains("is too old for a block at")
        }
        _ => false,
    });
    assert!(expired);

    // Within the settlement interval, the same endorsement is fine.
    let b3 = alt_child(&a[1], 1);
    let pop_data = PopData::new(Vec::new(), vec![endorsement(&a[0], &btc[1], 0)]);
    assert!(tree.accept_block(b3.clone(), pop_data).unwrap());
}

#[test]
fn endorsed_not_ancestor_test() {
    setup_logger(LevelFilter::Debug);

    let (mut tree, btc, _) = alt_tree(PopParams::altchain(), 10);
    let (publisher, subscriber) = mpsc::channel();
    tree.set_event_publisher(publisher);

    let genesis = alt_genesis();
    let s1 = alt_child(&genesis, 1);
    assert!(tree.accept_block(s1.clone(), PopData::empty()).unwrap());
    let a = build_chain(&mut tree, &genesis, 1, 0, &[]);

    log::debug!("Endorsing a block of a sibling chain.");
    let a2 = alt_child(&a[0], 0);
    let pop_data = PopData::new(Vec::new(), vec![endorsement(&s1, &btc[2], 0)]);
    assert!(!tree.accept_block(a2.clone(), pop_data).unwrap());
    assert!(tree
        .node(&a2.hash)
        .unwrap()
        .status()
        .has(BlockStatus::FAILED_POP));

    log::debug!("Endorsing a block at the same height.");
    let b2 = alt_child(&a[0], 1);
    let pop_data = PopData::new(Vec::new(), vec![endorsement(&a2, &btc[2], 0)]);
    assert!(!tree.accept_block(b2.clone(), pop_data).unwrap());

    let reasons: Vec<(CryptoHash, String)> = subscriber
        .try_iter()
        .filter_map(|event| match event {
            Event::BlockConnectFailed(event) => Some((event.block, event.reason)),
            _ => None,
        })
        .collect();
    assert_eq!(reasons.len(), 2);
    assert!(reasons
        .iter()
        .all(|(_, reason)| reason.contains("is not an ancestor of")));
    assert_eq!(reasons[0].0, a2.hash);
    assert_eq!(reasons[1].0, b2.hash);
}

#[test]
fn trial_connect_protecting_tip_test() {
    setup_logger(LevelFilter::Debug);

    let btc = btc_chain(3);
    let mut protecting = btc_tree(&btc);
    let (publisher, subscriber) = mpsc::channel();
    protecting.set_event_publisher(publisher);
    let mut tree = PopTree::new(PopParams::altchain(), protecting, MemStore::new()).unwrap();
    let genesis = alt_genesis();
    tree.bootstrap(genesis.clone(), BlockHeight::new(0)).unwrap();

    log::debug!("Connecting a block whose BTC header would extend the best chain.");
    let new_btc = btc_child(&btc[3], 1, 5);
    let a1 = alt_child(&genesis, 0);
    assert!(tree
        .accept_block(a1.clone(), PopData::new(vec![new_btc.clone()], Vec::new()))
        .unwrap());
    assert_eq!(tree.protecting().best_chain().tip(), Some(btc[3].hash));

    // The trial moves the BTC tip and back, and listeners see both moves.
    let tip_changes: Vec<(Option<CryptoHash>, CryptoHash)> = subscriber
        .try_iter()
        .filter_map(|event| match event {
            Event::BeforeTipChange(event) => Some((event.old_tip, event.new_tip)),
            _ => None,
        })
        .collect();
    assert_eq!(
        tip_changes,
        vec![
            (Some(btc[3].hash), new_btc.hash),
            (Some(new_btc.hash), btc[3].hash)
        ]
    );
}

#[test]
fn context_blocks_test() {
    setup_logger(LevelFilter::Debug);

    let (mut tree, btc, store) = alt_tree(PopParams::altchain(), 3);
    let genesis = alt_genesis();
    let new_btc = btc_child(&btc[3], 1, 5);
    let a1 = alt_child(&genesis, 0);
    let a2 = alt_child(&a1, 0);

    log::debug!("Connecting a block that carries a BTC header.");
    let pop_data = PopData::new(vec![new_btc.clone()], Vec::new());
    assert!(tree.accept_block(a1.clone(), pop_data).unwrap());
    // Only applied blocks keep their context blocks in the protecting tree.
    assert!(tree.protecting().node(&new_btc.hash).is_none());
    assert_eq!(tree.protecting().best_chain().tip(), Some(btc[3].hash));

    let pop_data = PopData::new(Vec::new(), vec![endorsement(&a1, &new_btc, 0)]);
    assert!(tree.accept_block(a2.clone(), pop_data).unwrap());
    assert_eq!(store.len(), 2);

    tree.set_state(&a2.hash).unwrap();
    let context = tree.protecting().node(&new_btc.hash).unwrap();
    assert_eq!(context.references(), 1);
    assert_eq!(tree.protecting().best_chain().tip(), Some(new_btc.hash));

    // A BTC header (32 + 32 + 8 + 8 + 8 bytes) and an endorsement (four hashes).
    assert_eq!(tree.estimate_payloads_size(&a1.hash).unwrap(), 88);
    assert_eq!(tree.estimate_payloads_size(&a2.hash).unwrap(), 128);

    log::debug!("Unapplying the block releases its BTC header.");
    tree.set_state(&genesis.hash).unwrap();
    assert!(tree.protecting().node(&new_btc.hash).is_none());
    assert_eq!(tree.protecting().best_chain().tip(), Some(btc[3].hash));
}

#[test]
fn finalize_block_test() {
    setup_logger(LevelFilter::Debug);

    let params = PopParams::builder()
        .keystone_interval(5)
        .finality_delay(100)
        .endorsement_settlement_interval(2)
        .preserve_blocks_behind_final(2)
        .build();
    let (mut tree, _, _) = alt_tree(params, 10);
    let genesis = alt_genesis();
    let a = build_chain(&mut tree, &genesis, 8, 0, &[]);
    let b = build_chain(&mut tree, &a[0], 1, 1, &[]);
    tree.set_state(&a[7].hash).unwrap();

    log::debug!("Finalizing the block at height 5.");
    tree.finalize_block(&a[4].hash).unwrap();
    for removed in [&genesis.hash, &a[0].hash, &a[1].hash, &b[0].hash] {
        assert!(tree.node(removed).is_none());
    }
    let root = tree.blocks().root().unwrap();
    assert_eq!(root.hash(), a[2].hash);
    assert_eq!(root.prev(), None);
    assert!(root.is_bootstrap());
    assert!(tree.node(&a[4].hash).unwrap().is_finalized());
    assert!(tree.node(&a[3].hash).unwrap().is_finalized());
    assert!(!tree.node(&a[5].hash).unwrap().is_finalized());
    assert_eq!(tree.best_chain().start_height(), BlockHeight::new(3));
    assert_eq!(tree.best_chain().tip(), Some(a[7].hash));
    assert_eq!(tree.blocks().applied_block_count(), 6);

    // New blocks still apply on the shortened chain.
    let a9 = build_chain(&mut tree, &a[7], 1, 0, &[]);
    tree.set_state(&a9[0].hash).unwrap();
    assert!(tree
        .node(&a9[0].hash)
        .unwrap()
        .is_valid_up_to(ValidityLevel::CanBeApplied));

    log::debug!("Trying to reorganize the finalized block away.");
    let c = build_chain(&mut tree, &a[3], 1, 2, &[]);
    let err = tree.set_state(&c[0].hash).unwrap_err();
    assert_eq!(err.code(), "reorg-below-finalized");
    let outcome = tree
        .compare_pop_score(&c[0].hash, &CancellationToken::new())
        .unwrap();
    assert_eq!(outcome, ForkResolution::CurrentWins);
    assert_eq!(tree.best_chain().tip(), Some(a9[0].hash));

    let err = tree.finalize_block(&c[0].hash).unwrap_err();
    assert_eq!(err.code(), "not-on-active-chain");
}

#[test]
fn load_blocks_test() {
    setup_logger(LevelFilter::Debug);

    let (mut tree, btc, store) = alt_tree(PopParams::altchain(), 10);
    let genesis = alt_genesis();
    let a = build_chain(&mut tree, &genesis, 4, 0, &[(2, &btc[3])]);
    tree.set_state(&a[3].hash).unwrap();

    let stored_genesis = tree.to_stored(&genesis.hash).unwrap();
    let stored: Vec<StoredBlock<AltBlock>> = a
        .iter()
        .map(|block| tree.to_stored(&block.hash).unwrap())
        .collect();

    for fast in [true, false] {
        log::debug!("Loading stored blocks, fast: {}", fast);
        let mut loaded = PopTree::new(PopParams::altchain(), btc_tree(&btc), store.clone()).unwrap();
        loaded.bootstrap(genesis.clone(), BlockHeight::new(0)).unwrap();
        loaded.load_block(stored_genesis.clone(), fast).unwrap();
        for block in stored.iter().cloned() {
            loaded.load_block(block, fast).unwrap();
        }
        // Fast loading restores validity without applying anything.
        assert_eq!(loaded.node(&a[3].hash).unwrap().was_ever_applied(), !fast);
        loaded.load_tip(&a[3].hash).unwrap();
        assert!(a.iter().all(|block| loaded.node(&block.hash).unwrap().was_ever_applied()));

        assert_eq!(loaded.best_chain().tip(), Some(a[3].hash));
        assert_eq!(applied_blocks(&loaded), applied_blocks(&tree));
        assert_eq!(loaded.node(&a[1].hash).unwrap().endorsed_by().count(), 1);
        for block in &a {
            assert_eq!(
                loaded.node(&block.hash).unwrap().status(),
                tree.node(&block.hash).unwrap().status()
            );
        }
    }

    // Blocks must be loaded parents first.
    let mut loaded = PopTree::new(PopParams::altchain(), btc_tree(&btc), store.clone()).unwrap();
    loaded.bootstrap(genesis.clone(), BlockHeight::new(0)).unwrap();
    let err = loaded.load_block(stored[1].clone(), true).unwrap_err();
    assert_eq!(err.code(), "bad-prev-block");
    assert_eq!(stored[1].header.hash(), a[1].hash);
}

#[test]
fn stacked_trees_test() {
    setup_logger(LevelFilter::Debug);

    log::debug!("Building a VBK tree over BTC, then an ALT tree over the VBK tree.");
    let btc = btc_chain(5);
    let mut vbk: VbkTree = PopTree::new(PopParams::vbk(), btc_tree(&btc), MemStore::new()).unwrap();
    let v0 = vbk_genesis();
    let v1 = vbk_child(&v0);
    let v2 = vbk_child(&v1);
    let v3 = vbk_child(&v2);
    vbk.bootstrap(v0.clone(), BlockHeight::new(0)).unwrap();
    assert!(vbk.accept_block(v1.clone(), PopData::empty()).unwrap());
    assert!(vbk.accept_block(v2.clone(), PopData::empty()).unwrap());
    vbk.set_state(&v2.hash).unwrap();

    let mut alt = PopTree::new(PopParams::altchain(), vbk, MemStore::new()).unwrap();
    let genesis = alt_genesis();
    alt.bootstrap(genesis.clone(), BlockHeight::new(0)).unwrap();

    let a1 = alt_child(&genesis, 0);
    let a2 = alt_child(&a1, 0);
    assert!(alt
        .accept_block(a1.clone(), PopData::new(vec![v3.clone()], Vec::new()))
        .unwrap());
    assert!(alt.protecting().node(&v3.hash).is_none());

    // The endorsement is proven in the VBK header that a1 carries.
    let proof = EndorsementProof::new(a1.hash, v3.hash, Vec::new());
    assert!(alt
        .accept_block(a2.clone(), PopData::new(Vec::new(), vec![proof]))
        .unwrap());

    alt.set_state(&a2.hash).unwrap();
    let context = alt.protecting().node(&v3.hash).unwrap();
    assert_eq!(context.references(), 1);
    assert_eq!(context.status().validity(), ValidityLevel::Tree);
    assert_eq!(alt.protecting().best_chain().tip(), Some(v2.hash));

    log::debug!("Unapplying the ALT chain releases the VBK header, and nothing below it.");
    alt.set_state(&genesis.hash).unwrap();
    assert!(alt.protecting().node(&v3.hash).is_none());
    assert!(alt.protecting().node(&v2.hash).unwrap().is_applied());
    assert_eq!(alt.protecting().protecting().best_chain().tip(), Some(btc[5].hash));
}

#[test]
fn config_validation_test() {
    setup_logger(LevelFilter::Debug);

    let btc = btc_chain(2);
    let bad_params = [
        PopParams::builder().keystone_interval(0).finality_delay(100).build(),
        PopParams::builder()
            .keystone_interval(5)
            .finality_delay(100)
            .fork_resolution_lookup_table(Vec::new())
            .build(),
        PopParams::builder()
            .keystone_interval(5)
            .finality_delay(100)
            .fork_resolution_lookup_table(vec![50, 100])
            .build(),
        PopParams::builder()
            .keystone_interval(5)
            .finality_delay(100)
            .endorsement_settlement_interval(10)
            .preserve_blocks_behind_final(5)
            .build(),
    ];
    for params in bad_params {
        assert!(params.validate().is_err());
        let err = PopTree::<AltBlock, _, _>::new(params, btc_tree(&btc), MemStore::new())
            .err()
            .unwrap();
        assert_eq!(err.code(), "bad-config");
    }

    assert!(PopParams::altchain().validate().is_ok());
    assert!(PopParams::vbk().validate().is_ok());
}
