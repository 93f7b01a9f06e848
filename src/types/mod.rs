/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that are used across the block trees, the state machine, and fork resolution.

pub mod data_types;

pub mod header;

pub mod payloads;
