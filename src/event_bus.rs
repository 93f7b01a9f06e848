/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A thread that receives [events](crate::events) published by block trees and runs the handlers
//! registered for them.
//!
//! ## Starting an event bus
//!
//! ```ignore
//! let event_bus =
//!     EventBusSpec::builder()
//!     .log_events(true)
//!     .on_block_connected(|event| println!("connected {}", event.block))
//!     .build()
//!     .start();
//!
//! alt_tree.set_event_publisher(event_bus.publisher());
//! ```
//!
//! Dropping the [`EventBus`] handles every event still queued, then stops the thread.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::events::*;
use crate::logging::Logger;

pub type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Handlers to register on an event bus.
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building an [EventBusSpec]. Every setter is optional.

    Call `.log_events(true)` to have every event printed by the loggers in [logging](crate::logging).
"))]
pub struct EventBusSpec {
    #[builder(default = false, setter(doc = "Log every event with the default loggers. Optional."))]
    log_events: bool,
    #[builder(default, setter(transform = |handler: impl Fn(&AcceptHeaderEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<AcceptHeaderEvent>),
    doc = "Register a handler closure to be invoked after a header is accepted. Optional."))]
    on_accept_header: Option<HandlerPtr<AcceptHeaderEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RemoveBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RemoveBlockEvent>),
    doc = "Register a handler closure to be invoked after a block is removed from a tree. Optional."))]
    on_remove_block: Option<HandlerPtr<RemoveBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&FinalizeBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<FinalizeBlockEvent>),
    doc = "Register a handler closure to be invoked after a block is finalized. Optional."))]
    on_finalize_block: Option<HandlerPtr<FinalizeBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&BlockConnectedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<BlockConnectedEvent>),
    doc = "Register a handler closure to be invoked after a block is connected. Optional."))]
    on_block_connected: Option<HandlerPtr<BlockConnectedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&BlockConnectFailedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<BlockConnectFailedEvent>),
    doc = "Register a handler closure to be invoked after a block failed to connect. Optional."))]
    on_block_connect_failed: Option<HandlerPtr<BlockConnectFailedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&InvalidateBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<InvalidateBlockEvent>),
    doc = "Register a handler closure to be invoked after a block is invalidated. Optional."))]
    on_invalidate_block: Option<HandlerPtr<InvalidateBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RevalidateBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RevalidateBlockEvent>),
    doc = "Register a handler closure to be invoked after a block is revalidated. Optional."))]
    on_revalidate_block: Option<HandlerPtr<RevalidateBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&BeforeTipChangeEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<BeforeTipChangeEvent>),
    doc = "Register a handler closure to be invoked right before a tree changes its active tip. Optional."))]
    on_before_tip_change: Option<HandlerPtr<BeforeTipChangeEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ForkResolutionEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ForkResolutionEvent>),
    doc = "Register a handler closure to be invoked after two chains are compared. Optional."))]
    on_fork_resolution: Option<HandlerPtr<ForkResolutionEvent>>,
}

impl EventBusSpec {
    /// Start the event bus thread with the handlers registered here.
    pub fn start(self) -> EventBus {
        let (publisher, subscriber) = mpsc::channel();
        let (shutdown, shutdown_signal) = mpsc::channel();
        let handle = start_event_bus(EventHandlers::new(self), subscriber, shutdown_signal);
        EventBus {
            publisher,
            shutdown,
            handle: Some(handle),
        }
    }
}

/// Keeps the event bus thread alive.
pub struct EventBus {
    publisher: Sender<Event>,
    shutdown: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl EventBus {
    /// A sender that trees publish their events into.
    pub fn publisher(&self) -> Sender<Event> {
        self.publisher.clone()
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub(crate) struct EventHandlers {
    pub(crate) accept_header_handlers: Vec<HandlerPtr<AcceptHeaderEvent>>,
    pub(crate) remove_block_handlers: Vec<HandlerPtr<RemoveBlockEvent>>,
    pub(crate) finalize_block_handlers: Vec<HandlerPtr<FinalizeBlockEvent>>,
    pub(crate) block_connected_handlers: Vec<HandlerPtr<BlockConnectedEvent>>,
    pub(crate) block_connect_failed_handlers: Vec<HandlerPtr<BlockConnectFailedEvent>>,
    pub(crate) invalidate_block_handlers: Vec<HandlerPtr<InvalidateBlockEvent>>,
    pub(crate) revalidate_block_handlers: Vec<HandlerPtr<RevalidateBlockEvent>>,
    pub(crate) before_tip_change_handlers: Vec<HandlerPtr<BeforeTipChangeEvent>>,
    pub(crate) fork_resolution_handlers: Vec<HandlerPtr<ForkResolutionEvent>>,
}

impl EventHandlers {
    pub(crate) fn new(spec: EventBusSpec) -> EventHandlers {
        fn handlers<T: Logger>(log_events: bool, user: Option<HandlerPtr<T>>) -> Vec<HandlerPtr<T>> {
            let mut handlers = Vec::new();
            if log_events {
                handlers.push(T::get_logger());
            }
            handlers.extend(user);
            handlers
        }

        let log = spec.log_events;
        EventHandlers {
            accept_header_handlers: handlers(log, spec.on_accept_header),
            remove_block_handlers: handlers(log, spec.on_remove_block),
            finalize_block_handlers: handlers(log, spec.on_finalize_block),
            block_connected_handlers: handlers(log, spec.on_block_connected),
            block_connect_failed_handlers: handlers(log, spec.on_block_connect_failed),
            invalidate_block_handlers: handlers(log, spec.on_invalidate_block),
            revalidate_block_handlers: handlers(log, spec.on_revalidate_block),
            before_tip_change_handlers: handlers(log, spec.on_before_tip_change),
            fork_resolution_handlers: handlers(log, spec.on_fork_resolution),
        }
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::AcceptHeader(accept_header_event) =>
                self.accept_header_handlers.iter().for_each(|handler| handler(&accept_header_event)),

            Event::RemoveBlock(remove_block_event) =>
                self.remove_block_handlers.iter().for_each(|handler| handler(&remove_block_event)),

            Event::FinalizeBlock(finalize_block_event) =>
                self.finalize_block_handlers.iter().for_each(|handler| handler(&finalize_block_event)),

            Event::BlockConnected(block_connected_event) =>
                self.block_connected_handlers.iter().for_each(|handler| handler(&block_connected_event)),

            Event::BlockConnectFailed(block_connect_failed_event) =>
                self.block_connect_failed_handlers.iter().for_each(|handler| handler(&block_connect_failed_event)),

            Event::InvalidateBlock(invalidate_block_event) =>
                self.invalidate_block_handlers.iter().for_each(|handler| handler(&invalidate_block_event)),

            Event::RevalidateBlock(revalidate_block_event) =>
                self.revalidate_block_handlers.iter().for_each(|handler| handler(&revalidate_block_event)),

            Event::BeforeTipChange(before_tip_change_event) =>
                self.before_tip_change_handlers.iter().for_each(|handler| handler(&before_tip_change_event)),

            Event::ForkResolution(fork_resolution_event) =>
                self.fork_resolution_handlers.iter().for_each(|handler| handler(&fork_resolution_event)),
        }
    }
}

pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => {
                while let Ok(event) = event_subscriber.try_recv() {
                    event_handlers.fire_handlers(event)
                }
                return;
            }
            Err(TryRecvError::Empty) => (),
        }

        match event_subscriber.recv_timeout(POLL_INTERVAL) {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => return,
        }
    })
}
