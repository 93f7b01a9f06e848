/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via
//! [`EventBusSpec::log_events`](crate::event_bus::EventBusSpec).
//!
//! This crate logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least three values. The first three values
//! are always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//! 3. The ledger of the tree that emitted the event, e.g. `ALT`.
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how a [BlockConnected](crate::events::BlockConnectedEvent) is printed:
//!
//! ```text
//! BlockConnected, 1701329264, ALT, fNGCJyk, 42
//! ```
//!
//! In the snippet:
//! - The fourth value is the first seven characters of the Base64 encoding of the hash of the
//!   connected block.
//! - The fifth value is the height of the connected block.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use log;
use std::time::SystemTime;

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const ACCEPT_HEADER: &str = "AcceptHeader";
pub const REMOVE_BLOCK: &str = "RemoveBlock";
pub const FINALIZE_BLOCK: &str = "FinalizeBlock";

pub const BLOCK_CONNECTED: &str = "BlockConnected";
pub const BLOCK_CONNECT_FAILED: &str = "BlockConnectFailed";
pub const INVALIDATE_BLOCK: &str = "InvalidateBlock";
pub const REVALIDATE_BLOCK: &str = "RevalidateBlock";

pub const BEFORE_TIP_CHANGE: &str = "BeforeTipChange";
pub const FORK_RESOLUTION: &str = "ForkResolution";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for AcceptHeaderEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &AcceptHeaderEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                ACCEPT_HEADER,
                secs_since_unix_epoch(event.timestamp),
                event.chain,
                first_seven_base64_chars(&event.block.bytes()),
                event.height
            )
        };
        Box::new(logger)
    }
}

impl Logger for RemoveBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &RemoveBlockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                REMOVE_BLOCK,
                secs_since_unix_epoch(event.timestamp),
                event.chain,
                first_seven_base64_chars(&event.block.bytes()),
                event.height
            )
        };
        Box::new(logger)
    }
}

impl Logger for FinalizeBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &FinalizeBlockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                FINALIZE_BLOCK,
                secs_since_unix_epoch(event.timestamp),
                event.chain,
                first_seven_base64_chars(&event.block.bytes()),
                event.height
            )
        };
        Box::new(logger)
    }
}

impl Logger for BlockConnectedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &BlockConnectedEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                BLOCK_CONNECTED,
                secs_since_unix_epoch(event.timestamp),
                event.chain,
                first_seven_base64_chars(&event.block.bytes()),
                event.height
            )
        };
        Box::new(logger)
    }
}

impl Logger for BlockConnectFailedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &BlockConnectFailedEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                BLOCK_CONNECT_FAILED,
                secs_since_unix_epoch(event.timestamp),
                event.chain,
                first_seven_base64_chars(&event.block.bytes()),
                event.height,
                event.reason
            )
        };
        Box::new(logger)
    }
}

impl Logger for InvalidateBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &InvalidateBlockEvent| {
            log::info!(
                "{}, {}, {}, {}, {:#x}",
                INVALIDATE_BLOCK,
                secs_since_unix_epoch(event.timestamp),
                event.chain,
                first_seven_base64_chars(&event.block.bytes()),
                event.reason
            )
        };
        Box::new(logger)
    }
}

impl Logger for RevalidateBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &RevalidateBlockEvent| {
            log::info!(
                "{}, {}, {}, {}, {:#x}",
                REVALIDATE_BLOCK,
                secs_since_unix_epoch(event.timestamp),
                event.chain,
                first_seven_base64_chars(&event.block.bytes()),
                event.reason
            )
        };
        Box::new(logger)
    }
}

impl Logger for BeforeTipChangeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &BeforeTipChangeEvent| {
            let old_tip = match event.old_tip {
                Some(old_tip) => first_seven_base64_chars(&old_tip.bytes()),
                None => String::from("None"),
            };
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                BEFORE_TIP_CHANGE,
                secs_since_unix_epoch(event.timestamp),
                event.chain,
                old_tip,
                first_seven_base64_chars(&event.new_tip.bytes()),
                event.height
            )
        };
        Box::new(logger)
    }
}

impl Logger for ForkResolutionEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &ForkResolutionEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {:?}",
                FORK_RESOLUTION,
                secs_since_unix_epoch(event.timestamp),
                event.chain,
                first_seven_base64_chars(&event.current.bytes()),
                first_seven_base64_chars(&event.candidate.bytes()),
                event.outcome
            )
        };
        Box::new(logger)
    }
}

pub(crate) fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
