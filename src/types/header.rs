/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Block headers of the three ledgers a PoP deployment keeps trees for.
//!
//! Block trees are generic over [`Header`]. The crate provides one concrete header per ledger:
//! - [`AltBlock`]: the protected altchain.
//! - [`VbkBlock`]: the intermediate chain, protected by the protecting chain and protecting the altchain.
//! - [`BtcBlock`]: the protecting chain, whose proof-of-work anchors everything above it.
//!
//! Wire formats of real ledgers are out of scope; these headers carry only what the trees use.

use borsh::{BorshDeserialize, BorshSerialize};
pub use sha2::Sha256 as CryptoHasher;
use sha2::Digest;

use crate::types::data_types::{BlockHeight, ChainWork, CryptoHash, Timestamp};

/// Interface a block tree needs from the headers it stores.
pub trait Header: Clone + BorshSerialize + BorshDeserialize + Send + 'static {
    /// Short ledger name used in log lines and error codes, e.g. "ALT".
    const NAME: &'static str;

    fn hash(&self) -> CryptoHash;

    fn previous_block(&self) -> CryptoHash;

    fn timestamp(&self) -> Timestamp;

    /// Proof-of-work contributed by this block alone.
    fn work(&self) -> ChainWork {
        ChainWork::new(1)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct AltBlock {
    pub hash: CryptoHash,
    pub previous_block: CryptoHash,
    pub height: BlockHeight,
    pub timestamp: Timestamp,
    pub nonce: u64,
}

impl AltBlock {
    pub fn new(
        previous_block: CryptoHash,
        height: BlockHeight,
        timestamp: Timestamp,
        nonce: u64,
    ) -> AltBlock {
        AltBlock {
            hash: AltBlock::compute_hash(&previous_block, height, timestamp, nonce),
            previous_block,
            height,
            timestamp,
            nonce,
        }
    }

    pub fn compute_hash(
        previous_block: &CryptoHash,
        height: BlockHeight,
        timestamp: Timestamp,
        nonce: u64,
    ) -> CryptoHash {
        let mut hasher = CryptoHasher::new();
        hasher.update(&previous_block.try_to_vec().unwrap());
        hasher.update(&height.try_to_vec().unwrap());
        hasher.update(&timestamp.try_to_vec().unwrap());
        hasher.update(&nonce.try_to_vec().unwrap());
        CryptoHash::new(hasher.finalize().into())
    }

    pub fn is_correct(&self) -> bool {
        self.hash == AltBlock::compute_hash(&self.previous_block, self.height, self.timestamp, self.nonce)
    }
}

impl Header for AltBlock {
    const NAME: &'static str = "ALT";

    fn hash(&self) -> CryptoHash {
        self.hash
    }

    fn previous_block(&self) -> CryptoHash {
        self.previous_block
    }

    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct VbkBlock {
    pub hash: CryptoHash,
    pub previous_block: CryptoHash,
    pub height: BlockHeight,
    pub timestamp: Timestamp,
    pub difficulty: u64,
    pub nonce: u64,
}

impl VbkBlock {
    pub fn new(
        previous_block: CryptoHash,
        height: BlockHeight,
        timestamp: Timestamp,
        difficulty: u64,
        nonce: u64,
    ) -> VbkBlock {
        VbkBlock {
            hash: VbkBlock::compute_hash(&previous_block, height, timestamp, difficulty, nonce),
            previous_block,
            height,
            timestamp,
            difficulty,
            nonce,
        }
    }

    pub fn compute_hash(
        previous_block: &CryptoHash,
        height: BlockHeight,
        timestamp: Timestamp,
        difficulty: u64,
        nonce: u64,
    ) -> CryptoHash {
        let mut hasher = CryptoHasher::new();
        hasher.update(&previous_block.try_to_vec().unwrap());
        hasher.update(&height.try_to_vec().unwrap());
        hasher.update(&timestamp.try_to_vec().unwrap());
        hasher.update(&difficulty.try_to_vec().unwrap());
        hasher.update(&nonce.try_to_vec().unwrap());
        CryptoHash::new(hasher.finalize().into())
    }
}

impl Header for VbkBlock {
    const NAME: &'static str = "VBK";

    fn hash(&self) -> CryptoHash {
        self.hash
    }

    fn previous_block(&self) -> CryptoHash {
        self.previous_block
    }

    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    fn work(&self) -> ChainWork {
        ChainWork::new(self.difficulty.max(1) as u128)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BtcBlock {
    pub hash: CryptoHash,
    pub previous_block: CryptoHash,
    pub merkle_root: CryptoHash,
    pub timestamp: Timestamp,
    pub difficulty: u64,
    pub nonce: u64,
}

impl BtcBlock {
    pub fn new(
        previous_block: CryptoHash,
        merkle_root: CryptoHash,
        timestamp: Timestamp,
        difficulty: u64,
        nonce: u64,
    ) -> BtcBlock {
        BtcBlock {
            hash: BtcBlock::compute_hash(&previous_block, &merkle_root, timestamp, difficulty, nonce),
            previous_block,
            merkle_root,
            timestamp,
            difficulty,
            nonce,
        }
    }

    pub fn compute_hash(
        previous_block: &CryptoHash,
        merkle_root: &CryptoHash,
        timestamp: Timestamp,
        difficulty: u64,
        nonce: u64,
    ) -> CryptoHash {
        let mut hasher = CryptoHasher::new();
        hasher.update(&previous_block.try_to_vec().unwrap());
        hasher.update(&merkle_root.try_to_vec().unwrap());
        hasher.update(&timestamp.try_to_vec().unwrap());
        hasher.update(&difficulty.try_to_vec().unwrap());
        hasher.update(&nonce.try_to_vec().unwrap());
        CryptoHash::new(hasher.finalize().into())
    }
}

impl Header for BtcBlock {
    const NAME: &'static str = "BTC";

    fn hash(&self) -> CryptoHash {
        self.hash
    }

    fn previous_block(&self) -> CryptoHash {
        self.previous_block
    }

    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    fn work(&self) -> ChainWork {
        ChainWork::new(self.difficulty.max(1) as u128)
    }
}
