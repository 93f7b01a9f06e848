/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Parameters of a PoP tree.
//!
//! `PopParams` can be defined with the builder pattern:
//!
//! ```ignore
//! let params =
//!     PopParams::builder()
//!     .keystone_interval(5)
//!     .finality_delay(100)
//!     .endorsement_settlement_interval(50)
//!     .build();
//! ```
//!
//! or taken from one of the presets, [`PopParams::altchain`] and [`PopParams::vbk`].

use typed_builder::TypedBuilder;

/// Score a keystone publication earns, indexed by how many protecting blocks later than the
/// earliest competing publication it was made.
pub const DEFAULT_FORK_RESOLUTION_LOOKUP_TABLE: [u32; 9] = [100, 100, 95, 89, 80, 69, 56, 40, 21];

#[derive(TypedBuilder, Clone, Debug, PartialEq, Eq)]
#[builder(builder_method(doc = "
    Create a builder for building [PopParams]. On the builder call the following methods to construct
    valid [PopParams].

    Required:
    - `.keystone_interval(...)`
    - `.finality_delay(...)`

    Optional:
    - `.fork_resolution_lookup_table(...)`
    - `.endorsement_settlement_interval(...)`
    - `.preserve_blocks_behind_final(...)`
    - `.enable_time_adjustment(...)`
"))]
pub struct PopParams {
    #[builder(setter(doc = "Set the distance between keystones. Required."))]
    pub keystone_interval: u64,
    #[builder(setter(doc = "Set the maximum drift, in protecting blocks, between publications of consecutive keystones. Required."))]
    pub finality_delay: u64,
    #[builder(default = DEFAULT_FORK_RESOLUTION_LOOKUP_TABLE.to_vec(), setter(doc = "Set the non-increasing score table used by fork resolution. Optional."))]
    pub fork_resolution_lookup_table: Vec<u32>,
    #[builder(default = 50, setter(doc = "Set the maximum height difference between an endorsed block and the block containing the endorsement. Optional."))]
    pub endorsement_settlement_interval: u64,
    #[builder(default = 50, setter(doc = "Set how many blocks below a finalized block are kept in memory. Optional."))]
    pub preserve_blocks_behind_final: u64,
    #[builder(default = true, setter(doc = "Correct publication heights of proofs that predate the keystone they prove. Optional."))]
    pub enable_time_adjustment: bool,
}

impl PopParams {
    /// Parameters of a protected altchain.
    pub fn altchain() -> PopParams {
        PopParams::builder()
            .keystone_interval(5)
            .finality_delay(100)
            .build()
    }

    /// Parameters of the intermediate chain.
    pub fn vbk() -> PopParams {
        PopParams::builder()
            .keystone_interval(20)
            .finality_delay(11)
            .endorsement_settlement_interval(400)
            .preserve_blocks_behind_final(400)
            .build()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keystone_interval == 0 {
            return Err(ConfigError::ZeroKeystoneInterval);
        }
        if self.fork_resolution_lookup_table.is_empty() {
            return Err(ConfigError::EmptyLookupTable);
        }
        if self
            .fork_resolution_lookup_table
            .windows(2)
            .any(|pair| pair[1] > pair[0])
        {
            return Err(ConfigError::IncreasingLookupTable);
        }
        if self.endorsement_settlement_interval == 0 {
            return Err(ConfigError::ZeroSettlementInterval);
        }
        if self.preserve_blocks_behind_final < self.endorsement_settlement_interval {
            return Err(ConfigError::PreserveWindowTooSmall {
                preserve: self.preserve_blocks_behind_final,
                settlement: self.endorsement_settlement_interval,
            });
        }
        Ok(())
    }

    /// Score for a publication `relative_height` protecting blocks after the earliest one.
    pub(crate) fn lookup_score(&self, relative_height: u64) -> u64 {
        usize::try_from(relative_height)
            .ok()
            .and_then(|index| self.fork_resolution_lookup_table.get(index))
            .map(|score| *score as u64)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("keystone interval must be positive")]
    ZeroKeystoneInterval,

    #[error("fork resolution lookup table must not be empty")]
    EmptyLookupTable,

    #[error("fork resolution lookup table must be non-increasing")]
    IncreasingLookupTable,

    #[error("endorsement settlement interval must be positive")]
    ZeroSettlementInterval,

    #[error("preserving {preserve} blocks behind final is less than the settlement interval {settlement}")]
    PreserveWindowTooSmall { preserve: u64, settlement: u64 },
}
